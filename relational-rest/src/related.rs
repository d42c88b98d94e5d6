//! Eager loading.
//!
//! Before a resource's backing query runs, the fields of the resource are walked once and every
//! relation they will traverse is recorded in a [`QueryPlan`]. The plan is then applied to the
//! query, so that related objects are loaded together with the rows instead of one at a time while
//! the rows are serialized.
//!
//! Paths are recorded relative to the resource being walked, through a [`Related`] accumulator.
//! Walking into a nested resource creates a child accumulator scoped under the relation leading to
//! it. Beneath a to-many relation, joins make no sense, so a child created with
//! [`sub_prefetch`](Related::sub_prefetch) turns every [`select`](Related::select) issued on it or
//! on any of its descendants into a [`prefetch`](Related::prefetch).

use crate::orm::{Aggregate, QuerySet, LOOKUP_SEP};
use itertools::Itertools;
use std::collections::BTreeSet;

/// Eager-load directives for one query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryPlan {
    select: BTreeSet<String>,
    prefetch: BTreeSet<String>,
    annotations: Vec<(String, Aggregate)>,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// A root accumulator recording into this plan.
    pub fn related(&mut self) -> Related<'_> {
        Related {
            plan: self,
            prefix: None,
            force_prefetch: false,
        }
    }

    /// Attach `aggregate` to every row under the attribute `name`.
    pub fn annotate(&mut self, name: impl Into<String>, aggregate: Aggregate) {
        let name = name.into();
        if !self.annotations.iter().any(|(existing, _)| *existing == name) {
            self.annotations.push((name, aggregate));
        }
    }

    /// Paths to load with joins.
    pub fn selected(&self) -> &BTreeSet<String> {
        &self.select
    }

    /// Paths to load with separate queries.
    pub fn prefetched(&self) -> &BTreeSet<String> {
        &self.prefetch
    }

    pub fn is_empty(&self) -> bool {
        self.select.is_empty() && self.prefetch.is_empty() && self.annotations.is_empty()
    }

    /// Apply the plan to `qs`.
    pub fn prepare(&self, qs: Box<dyn QuerySet>) -> Box<dyn QuerySet> {
        if self.is_empty() {
            return qs;
        }
        tracing::debug!(
            "eager loading {}: select [{}], prefetch [{}]",
            qs.model(),
            self.select.iter().join(", "),
            self.prefetch.iter().join(", ")
        );
        let mut qs = qs;
        if !self.select.is_empty() {
            qs = qs.select_related(&self.select.iter().cloned().collect::<Vec<_>>());
        }
        if !self.prefetch.is_empty() {
            qs = qs.prefetch_related(&self.prefetch.iter().cloned().collect::<Vec<_>>());
        }
        for (name, aggregate) in &self.annotations {
            qs = qs.annotate(name, aggregate);
        }
        qs
    }
}

/// An accumulator of relation paths, scoped under a prefix.
#[derive(Debug)]
pub struct Related<'a> {
    plan: &'a mut QueryPlan,
    prefix: Option<String>,
    force_prefetch: bool,
}

impl<'a> Related<'a> {
    fn path(&self, path: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{LOOKUP_SEP}{path}"),
            None => path.to_string(),
        }
    }

    /// Load `path` with a join, unless this accumulator is beneath a to-many relation.
    pub fn select(&mut self, path: &str) -> &mut Self {
        if self.force_prefetch {
            return self.prefetch(path);
        }
        let path = self.path(path);
        self.plan.select.insert(path);
        self
    }

    /// Load `path` with a separate query.
    pub fn prefetch(&mut self, path: &str) -> &mut Self {
        let path = self.path(path);
        self.plan.prefetch.insert(path);
        self
    }

    /// An accumulator scoped beneath the to-one relation `path`.
    ///
    /// Nothing is recorded for `path` itself. Loading a nested path loads every hop leading to it.
    pub fn sub_select(&mut self, path: &str) -> Related<'_> {
        Related {
            prefix: Some(self.path(path)),
            force_prefetch: self.force_prefetch,
            plan: &mut *self.plan,
        }
    }

    /// An accumulator scoped beneath the to-many relation `path`, which prefetches everything.
    pub fn sub_prefetch(&mut self, path: &str) -> Related<'_> {
        Related {
            prefix: Some(self.path(path)),
            force_prefetch: true,
            plan: &mut *self.plan,
        }
    }
}
