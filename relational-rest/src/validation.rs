//! Validation of incoming payloads.
//!
//! Validation walks a payload together with the resource class it is written to, before anything
//! is written. Every violation is recorded under the dotted key of the offending value (the key of
//! a nested value is prefixed with the keys of the fields leading to it), and the walk never stops
//! early, so a single pass reports everything that is wrong with a payload.
//!
//! A field value which would not change the target is never validated. This allows clients to
//! send back a representation they received, even if the stored data no longer satisfies rules
//! that were introduced after it was written.

use crate::context::ApiContext;
use crate::error::Result;
use crate::formatter::Mapping;
use crate::orm::ObjectRef;
use crate::resources::ModelResourceClass;
use derive_more::{Deref, IntoIterator};
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};

/// Validation failures, by dotted key.
///
/// Failures of resource-level validators are recorded under the key of the resource itself,
/// which is `""` for the top-level resource.
#[derive(Clone, Debug, Default, Deref, IntoIterator, PartialEq, Eq)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(message.into());
    }

    /// The failures as a wire-level mapping of keys to lists of messages.
    pub fn to_mapping(&self) -> Mapping {
        self.0
            .iter()
            .map(|(key, messages)| (key.clone(), messages.clone().into()))
            .collect()
    }
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for (key, messages) in &self.0 {
            for message in messages {
                writeln!(f, "{key}: {message}")?;
            }
        }
        Ok(())
    }
}

/// The key of `name` nested under `prefix`.
pub fn dotted(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// A rule for a single incoming value.
pub trait Validator: Send + Sync {
    /// Check `value`, describing the problem if there is one.
    fn check_value(&self, ctx: &ApiContext, value: &JsonValue) -> Result<(), String>;
}

/// A rule for a whole incoming payload.
pub trait ResourceValidator: Send + Sync {
    fn check(&self, ctx: &ApiContext, payload: &Mapping) -> Result<(), String>;
}

/// Validate `payload` as a write to an object of `class`.
///
/// `target` is the object being written, or [`None`] if the payload creates a new one.
pub async fn validate(
    ctx: &mut ApiContext,
    key: &str,
    class: &ModelResourceClass,
    target: Option<&ObjectRef>,
    payload: &Mapping,
) -> Result<ValidationErrors> {
    let mut errors = ValidationErrors::default();
    validate_into(ctx, key, class, target, payload, &mut errors).await?;
    Ok(errors)
}

/// Validate `payload`, adding failures to `errors`.
///
/// # Errors
///
/// Validation failures are recorded, not returned. This only fails if the persistence layer does.
pub fn validate_into<'a>(
    ctx: &'a mut ApiContext,
    key: &'a str,
    class: &'a ModelResourceClass,
    target: Option<&'a ObjectRef>,
    payload: &'a Mapping,
    errors: &'a mut ValidationErrors,
) -> BoxFuture<'a, Result<()>> {
    async move {
        for field in class.fields() {
            let opts = field.options();
            if opts.read_only {
                continue;
            }
            let name = field.public_name(ctx);
            let field_key = dotted(key, &name);
            match payload.get(&name) {
                Some(value) => {
                    field
                        .validate(ctx, &field_key, target, value, errors)
                        .await?
                }
                None if !opts.optional => errors.add(field_key, "this field is required"),
                None => {}
            }
        }
        for validator in class.validators() {
            if let Err(message) = validator.check(ctx, payload) {
                errors.add(key, message);
            }
        }
        Ok(())
    }
    .boxed()
}

/// The value must be present: not `null`, and not an empty string or list.
#[derive(Clone, Copy, Debug, Default)]
pub struct Required;

impl Validator for Required {
    fn check_value(&self, _ctx: &ApiContext, value: &JsonValue) -> Result<(), String> {
        let empty = match value {
            JsonValue::Null => true,
            JsonValue::String(s) => s.trim().is_empty(),
            JsonValue::Array(items) => items.is_empty(),
            _ => false,
        };
        if empty {
            Err("this field may not be blank".into())
        } else {
            Ok(())
        }
    }
}

/// Bounds on the length of a string (in characters) or a list. `null` passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Length {
    pub min: Option<usize>,
    pub max: Option<usize>,
}

impl Length {
    pub fn between(min: usize, max: usize) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn at_most(max: usize) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }
}

impl Validator for Length {
    fn check_value(&self, _ctx: &ApiContext, value: &JsonValue) -> Result<(), String> {
        let len = match value {
            JsonValue::String(s) => s.chars().count(),
            JsonValue::Array(items) => items.len(),
            JsonValue::Null => return Ok(()),
            _ => return Err("expected a string or a list".into()),
        };
        if let Some(min) = self.min {
            if len < min {
                return Err(format!("must have at least {min} elements"));
            }
        }
        if let Some(max) = self.max {
            if len > max {
                return Err(format!("must have at most {max} elements"));
            }
        }
        Ok(())
    }
}

/// Bounds on a number. Numeric strings are read as numbers. `null` passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Range {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Range {
    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }
}

impl Validator for Range {
    fn check_value(&self, _ctx: &ApiContext, value: &JsonValue) -> Result<(), String> {
        let n = match value {
            JsonValue::Null => return Ok(()),
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        let Some(n) = n else {
            return Err("expected a number".into());
        };
        if let Some(min) = self.min {
            if n < min {
                return Err(format!("must be at least {min}"));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(format!("must be at most {max}"));
            }
        }
        Ok(())
    }
}

/// The value must be one of a fixed set.
#[derive(Clone, Debug, Default)]
pub struct OneOf(pub Vec<JsonValue>);

impl Validator for OneOf {
    fn check_value(&self, _ctx: &ApiContext, value: &JsonValue) -> Result<(), String> {
        if self.0.contains(value) {
            Ok(())
        } else {
            Err(format!("{value} is not a valid choice"))
        }
    }
}

/// A string value must match a regular expression. `null` passes.
#[derive(Clone, Debug)]
pub struct Matches(pub Regex);

impl Matches {
    /// # Errors
    ///
    /// Fails if `pattern` is not a valid regular expression.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self(Regex::new(pattern)?))
    }
}

impl Validator for Matches {
    fn check_value(&self, _ctx: &ApiContext, value: &JsonValue) -> Result<(), String> {
        match value {
            JsonValue::Null => Ok(()),
            JsonValue::String(s) if self.0.is_match(s) => Ok(()),
            JsonValue::String(_) => Err(format!("does not match {}", self.0)),
            _ => Err("expected a string".into()),
        }
    }
}

/// A [`Validator`] defined by a function of the value.
pub struct FnValidator<F>(F);

/// Turn `f` into a [`Validator`].
pub fn from_fn<F>(f: F) -> FnValidator<F>
where
    F: Fn(&JsonValue) -> Result<(), String> + Send + Sync,
{
    FnValidator(f)
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&JsonValue) -> Result<(), String> + Send + Sync,
{
    fn check_value(&self, _ctx: &ApiContext, value: &JsonValue) -> Result<(), String> {
        (self.0)(value)
    }
}

impl<F> Debug for FnValidator<F> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str("FnValidator")
    }
}

/// A [`ResourceValidator`] defined by a function of the payload.
pub struct FnResourceValidator<F>(F);

/// Turn `f` into a [`ResourceValidator`].
pub fn resource_from_fn<F>(f: F) -> FnResourceValidator<F>
where
    F: Fn(&Mapping) -> Result<(), String> + Send + Sync,
{
    FnResourceValidator(f)
}

impl<F> ResourceValidator for FnResourceValidator<F>
where
    F: Fn(&Mapping) -> Result<(), String> + Send + Sync,
{
    fn check(&self, _ctx: &ApiContext, payload: &Mapping) -> Result<(), String> {
        (self.0)(payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Api;
    use crate::fields::test::schema;
    use crate::fields::{AttributeField, FieldBuilder, IterableField, SubObjectResourceField};
    use crate::init_logging;
    use crate::orm::mock::Database;
    use crate::orm::{Attr, ValueType};
    use crate::resources::{Collection, ModelResourceClass};
    use serde_json::json;
    use std::sync::Arc;

    fn api(db: &Database) -> Arc<Api> {
        Api::builder()
            .class(
                ModelResourceClass::new("author")
                    .field(
                        AttributeField::new("name", ValueType::Text)
                            .validator(Required)
                            .validator(Length::at_most(5)),
                    )
                    .field(
                        AttributeField::new("age", ValueType::Int)
                            .optional()
                            .validator(Range::between(0.0, 150.0)),
                    )
                    .field(
                        SubObjectResourceField::new("agent", "agent")
                            .optional(),
                    )
                    .field(
                        IterableField::new("books", "book")
                            .optional()
                            .natural_key(["title"]),
                    )
                    .validator(resource_from_fn(|payload: &Mapping| {
                        if payload.get("name") == Some(&json!("Nobody")) {
                            Err("nobody may write".into())
                        } else {
                            Ok(())
                        }
                    })),
            )
            .class(
                ModelResourceClass::new("agent").field(
                    AttributeField::new("name", ValueType::Text)
                        .validator(Matches::new("^[A-Z]").unwrap()),
                ),
            )
            .class(
                ModelResourceClass::new("book").field(
                    AttributeField::new("title", ValueType::Text).validator(from_fn(
                        |value: &JsonValue| match value.as_str() {
                            Some(title) if title.starts_with("The ") => Ok(()),
                            _ => Err("titles start with \"The\"".into()),
                        },
                    )),
                ),
            )
            .collection(Collection::new("authors", db.queryset("author"), "author"))
            .build()
            .unwrap()
    }

    #[async_std::test]
    async fn test_accumulates_everything() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let class = api.class("author").unwrap().clone();
        let payload = json!({
            "name": "Nobody",
            "age": "two hundred",
            "agent": {"name": "alice"},
            "books": [{"title": "The Hobbit"}, {"title": "Narnia"}],
        });
        let errors = validate(&mut ctx, "", &class, None, payload.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(
            errors.keys().cloned().collect::<Vec<_>>(),
            ["", "age", "agent.name", "books.1.title", "name"]
        );
        assert_eq!(errors[""], ["nobody may write"]);
        assert_eq!(errors["name"], ["must have at most 5 elements"]);
        // A value that can't be coerced is reported, and its validators still run.
        assert_eq!(errors["age"].len(), 2);

        let errors = validate(&mut ctx, "", &class, None, &Mapping::new())
            .await
            .unwrap();
        assert_eq!(errors["name"], ["this field is required"]);
        assert!(!errors.contains_key("age"));
    }

    #[async_std::test]
    async fn test_unchanged_values_skip_validation() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let class = api.class("author").unwrap().clone();

        // Stored before the length rule existed.
        let author = db
            .insert(
                "author",
                [
                    ("name", Attr::Value("Bartholomew".into())),
                    ("age", Attr::Value(200.into())),
                ],
            )
            .await
            .unwrap();
        let book = db
            .insert("book", [("title", Attr::Value("Narnia".into()))])
            .await
            .unwrap();
        let Attr::Many(books) = author.get("books").await.unwrap() else {
            panic!("books is not a to-many relation");
        };
        books.add(&book).await.unwrap();

        // Sending back what is stored is fine, even with coercible differences in form.
        let payload = json!({
            "name": "Bartholomew",
            "age": "200",
            "books": [{"title": "Narnia"}],
        });
        let errors = validate(&mut ctx, "", &class, Some(&author), payload.as_object().unwrap())
            .await
            .unwrap();
        assert!(errors.is_empty(), "{errors}");

        // Changing a value brings the rules back.
        let payload = json!({"name": "Bartholomew", "age": 201});
        let errors = validate(&mut ctx, "", &class, Some(&author), payload.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(errors.keys().collect::<Vec<_>>(), ["age"]);
    }

    #[test]
    fn test_dotted() {
        assert_eq!(dotted("", "name"), "name");
        assert_eq!(dotted("books.0", "title"), "books.0.title");
    }
}
