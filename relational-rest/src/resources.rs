//! Addressable resources.
//!
//! A [`Resource`] handles the verbs of one node of the resource tree. The tree is rooted at a
//! [`Registrar`], whose children are the registered [`Collection`]s, whose children in turn are the
//! [`ModelResource`]s wrapping the individual objects of the collection.
//!
//! Resources are created on demand while a URI is resolved, and are cheap: everything that
//! describes how objects are represented lives in a shared [`ModelResourceClass`].

use crate::context::ApiContext;
use crate::error::{Error, Result};
use crate::formatter::Mapping;
use crate::orm::ObjectRef;
use crate::validation::ValidationErrors;
use async_trait::async_trait;
use derive_more::Display;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

mod collection;
mod model;
mod registrar;

pub use collection::{Collection, CollectionResource};
pub use model::{ModelResource, ModelResourceClass};
pub use registrar::Registrar;

/// A request verb.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
}

pub type Methods = BTreeSet<Method>;

/// Query parameters of a request.
pub type Params = BTreeMap<String, String>;

/// The path of a resource, fixed the first time it is assigned.
#[derive(Debug, Default)]
pub(crate) struct ResourcePath(OnceLock<String>);

impl ResourcePath {
    pub(crate) fn new(path: impl Into<String>) -> Self {
        Self(OnceLock::from(path.into()))
    }

    pub(crate) fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }

    pub(crate) fn set(&self, path: String) {
        // Only the first assignment counts.
        let _ = self.0.set(path);
    }
}

/// A node of the resource tree.
///
/// Every verb fails with [`Error::MethodNotAllowed`] unless the resource implements it.
#[async_trait]
pub trait Resource: Debug + Send + Sync {
    /// The absolute path of this resource, if it is addressable.
    fn resource_path(&self) -> Option<&str>;

    /// Fix the path of this resource. Later assignments are ignored.
    fn set_resource_path(&self, path: String);

    fn allowed_methods(&self) -> Methods;

    /// The name of the resource class of the object behind this resource, if there is one.
    fn class_name(&self) -> Option<&str> {
        None
    }

    /// The object behind this resource, if there is one.
    fn object(&self) -> Option<&ObjectRef> {
        None
    }

    fn not_allowed(&self, method: Method) -> Error {
        Error::MethodNotAllowed {
            method,
            allowed: self.allowed_methods().into_iter().collect(),
        }
    }

    /// Fail unless `method` is allowed on this resource.
    fn check_allowed(&self, method: Method) -> Result<()> {
        if self.allowed_methods().contains(&method) {
            Ok(())
        } else {
            Err(self.not_allowed(method))
        }
    }

    async fn get(&self, _ctx: &mut ApiContext, _params: &Params) -> Result<Mapping> {
        Err(self.not_allowed(Method::Get))
    }

    /// Create a new resource beneath this one from `payload`.
    async fn post(&self, _ctx: &mut ApiContext, _payload: &Mapping) -> Result<Arc<dyn Resource>> {
        Err(self.not_allowed(Method::Post))
    }

    async fn put(&self, _ctx: &mut ApiContext, _payload: &Mapping) -> Result<()> {
        Err(self.not_allowed(Method::Put))
    }

    async fn delete(&self, _ctx: &mut ApiContext) -> Result<()> {
        Err(self.not_allowed(Method::Delete))
    }

    /// The child of this resource at the path segment `segment`, if there is one.
    async fn child_resource(
        &self,
        _ctx: &mut ApiContext,
        _segment: &str,
    ) -> Result<Option<Arc<dyn Resource>>> {
        Ok(None)
    }

    /// Validate `payload` as a write to this resource, recording failures under `key`.
    async fn validate(
        &self,
        _ctx: &mut ApiContext,
        _key: &str,
        _payload: &Mapping,
    ) -> Result<ValidationErrors> {
        Ok(ValidationErrors::default())
    }
}
