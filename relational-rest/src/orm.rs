//! Abstract interface to the persistence layer.
//!
//! Resources never talk to a database directly. Everything they need from the underlying ORM is
//! expressed by the traits in this module:
//!
//! * [`QuerySet`], an unrealized, lazily filterable/orderable/sliceable collection of persisted
//!   objects of one model.
//! * [`Object`], a single persisted (or not yet persisted) entity, whose attributes can be read
//!   and written by name.
//! * [`RelatedManager`], the to-many side of a relation hanging off an [`Object`].
//!
//! The [`mock`] module provides an in-memory implementation, which is useful for testing in
//! isolation from an actual database.

use async_trait::async_trait;
use derive_more::Display;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

pub mod mock;
mod value;

pub use value::*;

/// The attribute name under which every object exposes its primary key.
pub const PK: &str = "pk";

/// Separator between the hops of a relationship path, as in `author__name`.
pub const LOOKUP_SEP: &str = "__";

/// Errors returned by the persistence layer.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{model} matching query does not exist"))]
    DoesNotExist { model: String },

    #[snafu(display("query for {model} returned {count} objects, expected 1"))]
    MultipleObjectsReturned { model: String, count: usize },

    #[snafu(display("{model} has no attribute {attr}"))]
    UnknownAttribute { model: String, attr: String },

    #[snafu(display("type mismatch: {error}"))]
    TypeMismatch { error: String },

    #[snafu(display("integrity error: {error}"))]
    Integrity { error: String },

    #[snafu(display("unsupported operation: {error}"))]
    Unsupported { error: String },

    #[snafu(display("{error}"))]
    Backend { error: String },
}

impl Error {
    /// An error reported by the database itself.
    pub fn backend(error: impl fmt::Display) -> Self {
        Self::Backend {
            error: error.to_string(),
        }
    }

    pub fn unknown_attribute(model: impl Into<String>, attr: impl Into<String>) -> Self {
        Self::UnknownAttribute {
            model: model.into(),
            attr: attr.into(),
        }
    }

    pub fn unsupported(error: impl fmt::Display) -> Self {
        Self::Unsupported {
            error: error.to_string(),
        }
    }
}

/// A shared handle to a persisted object.
pub type ObjectRef = Arc<dyn Object>;

/// A map from lookups (`field`, `field__gte`, `relation__field__icontains`, ...) to parameters.
pub type Predicates = BTreeMap<String, Value>;

/// The value of a named attribute on an [`Object`].
#[derive(Clone, Debug)]
pub enum Attr {
    /// A scalar column.
    Value(Value),
    /// A to-one relation (foreign key or one-to-one), which may be unset.
    Object(Option<ObjectRef>),
    /// A to-many relation.
    Many(Arc<dyn RelatedManager>),
}

impl From<Value> for Attr {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Option<ObjectRef>> for Attr {
    fn from(obj: Option<ObjectRef>) -> Self {
        Self::Object(obj)
    }
}

/// The kind of a to-many relation.
///
/// The kind decides how the members of the relation can be changed, which matters when a list of
/// related objects is reconciled against an incoming payload.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// A plain many-to-many relation. Membership is stored separately from either object, so
    /// objects can be added and removed freely once they have keys.
    #[display(fmt = "many-to-many")]
    ManyToMany,
    /// The reverse side of a foreign key on the related model. Membership is the foreign key
    /// itself.
    #[display(fmt = "reverse foreign key")]
    ReverseForeignKey { nullable: bool },
    /// A many-to-many relation through an explicit intermediate model. The related objects are
    /// the intermediate rows, which cannot exist without the owner.
    #[display(fmt = "through")]
    Through,
}

impl RelationKind {
    /// Can an object leave the relation without being deleted?
    pub fn can_unlink(&self) -> bool {
        matches!(
            self,
            Self::ManyToMany | Self::ReverseForeignKey { nullable: true }
        )
    }

    /// Must a new member be linked to the owner before it is first saved?
    pub fn links_before_save(&self) -> bool {
        !matches!(self, Self::ManyToMany)
    }
}

/// An aggregate computed over a relation and attached to every row of a query.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum Aggregate {
    /// The number of objects in a to-many relation.
    #[display(fmt = "COUNT({})", _0)]
    Count(String),
}

/// A persisted entity.
///
/// Attribute writes through [`set`](Self::set) are buffered on the object and only reach the
/// database on [`save`](Self::save).
#[async_trait]
pub trait Object: Debug + Send + Sync {
    /// The name of the model this object belongs to.
    fn model(&self) -> &str;

    /// The primary key of this object, if it has been saved.
    fn pk(&self) -> Option<Value>;

    /// Read an attribute.
    ///
    /// Reading a to-one relation may hit the database unless the relation was loaded ahead of
    /// time by [`QuerySet::select_related`] or [`QuerySet::prefetch_related`].
    async fn get(&self, attr: &str) -> Result<Attr, Error>;

    /// Write an attribute.
    ///
    /// # Errors
    ///
    /// This method will fail if `attr` does not exist, if it is a to-many relation (use the
    /// [`RelatedManager`] instead), or if `value` does not fit the attribute.
    fn set(&self, attr: &str, value: Attr) -> Result<(), Error>;

    /// Create a fresh, unsaved instance of the model on the other end of the relation `attr`.
    fn new_related(&self, attr: &str) -> Result<ObjectRef, Error>;

    /// Persist this object, assigning a primary key if it doesn't have one yet.
    ///
    /// # Errors
    ///
    /// This method will fail if a to-one relation refers to an object which has not been saved.
    async fn save(&self) -> Result<(), Error>;

    /// Delete this object from the database.
    async fn delete(&self) -> Result<(), Error>;
}

/// The to-many side of a relation, bound to the object that owns it.
#[async_trait]
pub trait RelatedManager: Debug + Send + Sync {
    /// The kind of relation this manager administers.
    fn kind(&self) -> RelationKind;

    /// All objects currently in the relation.
    async fn all(&self) -> Result<Vec<ObjectRef>, Error>;

    /// Create a fresh, unsaved instance of the related model.
    fn new_object(&self) -> ObjectRef;

    /// Point `obj` at the owner without saving it.
    ///
    /// Only meaningful for relations where [`links_before_save`](RelationKind::links_before_save)
    /// holds.
    fn link(&self, obj: &ObjectRef) -> Result<(), Error>;

    /// Add a saved object to the relation.
    async fn add(&self, obj: &ObjectRef) -> Result<(), Error>;

    /// Remove an object from the relation without deleting it.
    ///
    /// # Errors
    ///
    /// This method will fail if the relation does not permit unlinking (see
    /// [`can_unlink`](RelationKind::can_unlink)).
    async fn remove(&self, obj: &ObjectRef) -> Result<(), Error>;
}

/// An unrealized query against the objects of one model.
///
/// All refinements return a new query, leaving `self` untouched, so a base query can be shared
/// and refined independently by many requests.
#[async_trait]
pub trait QuerySet: Debug + Send + Sync {
    /// The name of the model this query returns.
    fn model(&self) -> &str;

    /// An unrefined copy of this query.
    fn all(&self) -> Box<dyn QuerySet>;

    /// Restrict the query to objects matching all of `predicates`.
    fn filter(&self, predicates: &Predicates) -> Box<dyn QuerySet>;

    /// Order the results by `fields`. A leading `-` reverses the direction.
    fn order_by(&self, fields: &[String]) -> Box<dyn QuerySet>;

    /// Skip `offset` results and take at most `limit` of the rest.
    fn slice(&self, offset: usize, limit: Option<usize>) -> Box<dyn QuerySet>;

    /// Load the to-one relations at `paths` in the same query.
    fn select_related(&self, paths: &[String]) -> Box<dyn QuerySet>;

    /// Load the relations at `paths` with separate queries.
    fn prefetch_related(&self, paths: &[String]) -> Box<dyn QuerySet>;

    /// Attach the result of `aggregate` to every object under the attribute `name`.
    fn annotate(&self, name: &str, aggregate: &Aggregate) -> Box<dyn QuerySet>;

    /// Create a fresh, unsaved object of this query's model.
    fn new_object(&self) -> ObjectRef;

    /// Count the objects matching this query.
    async fn count(&self) -> Result<usize, Error>;

    /// Run the query and collect the results.
    async fn fetch(&self) -> Result<Vec<ObjectRef>, Error>;

    /// Run a query which is expected to return a single object.
    ///
    /// # Errors
    ///
    /// This method will fail with [`Error::DoesNotExist`] if no object matches and with
    /// [`Error::MultipleObjectsReturned`] if more than one does.
    async fn get(&self, predicates: &Predicates) -> Result<ObjectRef, Error>;
}

/// An extension trait for [`QuerySet`] that provides some higher-level functions.
#[async_trait]
pub trait QuerySetExt: QuerySet {
    /// Run a query which is expected to return either 0 or 1 objects.
    async fn opt(&self, predicates: &Predicates) -> Result<Option<ObjectRef>, Error>;

    /// Restrict the query to objects matching a single predicate.
    fn filter_by(&self, key: impl Into<String> + Send, value: impl Into<Value> + Send)
        -> Box<dyn QuerySet>;
}

#[async_trait]
impl<T: QuerySet + ?Sized> QuerySetExt for T {
    async fn opt(&self, predicates: &Predicates) -> Result<Option<ObjectRef>, Error> {
        match self.get(predicates).await {
            Ok(obj) => Ok(Some(obj)),
            Err(Error::DoesNotExist { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn filter_by(
        &self,
        key: impl Into<String> + Send,
        value: impl Into<Value> + Send,
    ) -> Box<dyn QuerySet> {
        self.filter(&Predicates::from([(key.into(), value.into())]))
    }
}
