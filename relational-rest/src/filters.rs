//! Named query refinements for collections.
//!
//! Each [`Filter`] of a [`Collection`](crate::resources::Collection) is switched on by a query
//! parameter carrying its public name. Filters run in the order they were added to the collection,
//! each refining the query produced by the one before.

use crate::context::ApiContext;
use crate::error::{Error, Result};
use crate::formatter::parse_datetime;
use crate::orm::{Predicates, QuerySet, Value};
use crate::resources::Params;
use serde_json::Value as JsonValue;
use std::fmt::Debug;

/// A predicate key which, instead of restricting the query, caps the number of results.
///
/// The cap applies after the filter's other predicates and before its ordering.
pub const LIMIT: &str = "__limit";

/// A named refinement of a collection query.
pub trait Filter: Debug + Send + Sync {
    /// The internal name of the query parameter activating this filter.
    fn name(&self) -> &str;

    /// Refine `qs` if `params` activates this filter, or return it unchanged.
    fn filter(
        &self,
        ctx: &ApiContext,
        params: &Params,
        qs: Box<dyn QuerySet>,
    ) -> Result<Box<dyn QuerySet>>;
}

/// A filter applying fixed predicates and ordering.
#[derive(Clone, Debug)]
pub struct StandardFilter {
    name: String,
    predicates: Predicates,
    order_by: Vec<String>,
}

impl StandardFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicates: Predicates::new(),
            order_by: vec![],
        }
    }

    pub fn predicate(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.insert(key.into(), value.into());
        self
    }

    /// Order the results by `fields`. A leading `-` reverses the direction.
    pub fn order_by<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.order_by = fields.into_iter().map(Into::into).collect();
        self
    }
}

impl Filter for StandardFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(
        &self,
        ctx: &ApiContext,
        params: &Params,
        qs: Box<dyn QuerySet>,
    ) -> Result<Box<dyn QuerySet>> {
        if !params.contains_key(&ctx.public_name(&self.name)) {
            return Ok(qs);
        }
        tracing::debug!("applying filter {}", self.name);
        refine(qs, self.predicates.clone(), &self.order_by)
    }
}

/// A filter whose parameter value is bound to a predicate.
///
/// The value is read as a datetime if possible, otherwise as an integer, otherwise as a float, and
/// as a plain string as a last resort.
#[derive(Clone, Debug)]
pub struct ParameterizedFilter {
    name: String,
    predicate_key: String,
    predicates: Predicates,
    order_by: Vec<String>,
}

impl ParameterizedFilter {
    /// A filter binding the value of the parameter `name` to the lookup `predicate_key`.
    pub fn new(name: impl Into<String>, predicate_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate_key: predicate_key.into(),
            predicates: Predicates::new(),
            order_by: vec![],
        }
    }

    /// A fixed predicate applied alongside the bound one.
    pub fn predicate(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.insert(key.into(), value.into());
        self
    }

    pub fn order_by<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.order_by = fields.into_iter().map(Into::into).collect();
        self
    }
}

impl Filter for ParameterizedFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(
        &self,
        ctx: &ApiContext,
        params: &Params,
        qs: Box<dyn QuerySet>,
    ) -> Result<Box<dyn QuerySet>> {
        let Some(raw) = params.get(&ctx.public_name(&self.name)) else {
            return Ok(qs);
        };
        let value = sniff(raw);
        tracing::debug!("applying filter {} with {}={value:?}", self.name, self.predicate_key);
        let mut predicates = self.predicates.clone();
        predicates.insert(self.predicate_key.clone(), value);
        refine(qs, predicates, &self.order_by)
    }
}

fn refine(
    qs: Box<dyn QuerySet>,
    mut predicates: Predicates,
    order_by: &[String],
) -> Result<Box<dyn QuerySet>> {
    let limit = predicates.remove(LIMIT);
    let mut qs = if predicates.is_empty() {
        qs
    } else {
        qs.filter(&predicates)
    };
    if let Some(limit) = limit {
        let n = match limit {
            Value::Int(n) if n >= 0 => n as usize,
            other => {
                return Err(Error::type_coercion(
                    "non-negative integer",
                    &JsonValue::String(other.to_string()),
                ))
            }
        };
        qs = qs.slice(0, Some(n));
    }
    if !order_by.is_empty() {
        qs = qs.order_by(order_by);
    }
    Ok(qs)
}

/// Read a query parameter as the most specific kind of value it looks like.
pub fn sniff(raw: &str) -> Value {
    if let Some(dt) = parse_datetime(raw) {
        return Value::DateTime(dt);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::Float(f),
        _ => Value::Text(raw.to_string()),
    }
}
