//! Per-request state.

use crate::api::Api;
use crate::config::ApiConfig;
use crate::error::Result;
use crate::formatter::Formatter;
use crate::orm::ObjectRef;
use crate::resources::{Registrar, Resource};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use url::Url;

/// The state of a single request.
///
/// A context is created for every request by [`Api::context`] and must not be shared between
/// requests. Besides giving access to the [`Api`] configuration, it keeps
///
/// * the stack of objects currently being written, so validators and authorizers deep inside a
///   nested write can inspect the objects enclosing it,
/// * headers and an expiration time accumulated while the response is built.
#[derive(Debug)]
pub struct ApiContext {
    api: Arc<Api>,
    root: Arc<Registrar>,
    stack: Vec<ObjectRef>,
    headers: BTreeMap<String, String>,
    expires: Option<DateTime<Utc>>,
}

impl ApiContext {
    pub(crate) fn new(api: Arc<Api>) -> Self {
        let root = Arc::new(Registrar::new(api.config().base()));
        Self {
            api,
            root,
            stack: vec![],
            headers: Default::default(),
            expires: None,
        }
    }

    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }

    pub fn config(&self) -> &ApiConfig {
        self.api.config()
    }

    pub fn formatter(&self) -> &dyn Formatter {
        self.api.formatter()
    }

    /// The public key for the internal name `name`.
    pub fn public_name(&self, name: &str) -> String {
        self.formatter().public_name(name)
    }

    /// The public key under which resources report their own address.
    pub fn resource_uri_key(&self) -> String {
        self.public_name(&self.config().resource_uri_key)
    }

    /// Push `obj` onto the object stack until the returned guard is dropped.
    pub fn enter(&mut self, obj: ObjectRef) -> StackGuard<'_> {
        self.stack.push(obj);
        StackGuard { ctx: self }
    }

    /// The objects currently being written, outermost first.
    pub fn stack(&self) -> &[ObjectRef] {
        &self.stack
    }

    /// The innermost object currently being written.
    pub fn current(&self) -> Option<&ObjectRef> {
        self.stack.last()
    }

    /// The object enclosing the innermost object currently being written.
    pub fn parent(&self) -> Option<&ObjectRef> {
        self.stack.iter().rev().nth(1)
    }

    /// The root of the resource tree.
    pub fn root(&self) -> Arc<dyn Resource> {
        self.root.clone()
    }

    /// The absolute path of `path`, which is relative to the base URI.
    pub fn uri_for(&self, path: &str) -> String {
        let base = self.config().base();
        let path = path.trim_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{path}")
        }
    }

    /// Find the resource at `uri`.
    ///
    /// `uri` may be absolute (`http://example.com/api/users/1`) or just a path
    /// (`/api/users/1`). Either way, its path must start with the base URI. The tree is walked one
    /// segment at a time from the root, and every resource on the way has its path fixed.
    pub async fn resolve(&mut self, uri: &str) -> Result<Option<Arc<dyn Resource>>> {
        let path = match Url::parse(uri) {
            Ok(url) => url.path().to_string(),
            Err(_) => uri.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        let Some(rest) = path.strip_prefix(self.config().base()) else {
            tracing::debug!("{uri} is outside the API");
            return Ok(None);
        };
        if !rest.is_empty() && !rest.starts_with('/') {
            return Ok(None);
        }

        let mut resource = self.root();
        for segment in rest.split('/').filter(|segment| !segment.is_empty()) {
            let Some(child) = resource.child_resource(self, segment).await? else {
                tracing::debug!("{uri}: nothing at {segment}");
                return Ok(None);
            };
            if let Some(parent) = resource.resource_path() {
                child.set_resource_path(format!("{parent}/{segment}"));
            }
            resource = child;
        }
        Ok(Some(resource))
    }

    /// The object behind the resource at `uri`, if that is a resource of the class `class`.
    pub async fn resolve_object(&mut self, uri: &str, class: &str) -> Result<Option<ObjectRef>> {
        Ok(self.resolve(uri).await?.and_then(|resource| {
            match (resource.class_name(), resource.object()) {
                (Some(name), Some(obj)) if name == class => Some(obj.clone()),
                _ => None,
            }
        }))
    }

    /// The canonical address of `obj` as a resource of the class `class`.
    ///
    /// This is the address of the object in the first collection registered for `class`. There
    /// is none if no collection serves `class`, or if `obj` has no published key yet.
    pub async fn address_of(&self, class: &str, obj: &ObjectRef) -> Result<Option<String>> {
        let Some(collection) = self.api.canonical_collection(class) else {
            return Ok(None);
        };
        let class = self.api.class(class)?;
        let Some(key) = class.key_segment(self, obj).await? else {
            return Ok(None);
        };
        Ok(Some(self.uri_for(&format!("{}/{key}", collection.segment()))))
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Record that the response must not be cached beyond `at`. The earliest time wins.
    pub fn expire_at(&mut self, at: DateTime<Utc>) {
        self.expires = Some(match self.expires {
            Some(current) => current.min(at),
            None => at,
        });
    }

    /// Record that the response must not be cached for longer than `max_age` from now.
    pub fn expire_in(&mut self, max_age: Duration) {
        self.expire_at(Utc::now() + max_age);
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }
}

/// An object pushed onto the stack of an [`ApiContext`], popped again on drop.
///
/// The guard dereferences to the context, so the context can be used as usual while the object
/// is on the stack.
#[derive(Debug)]
pub struct StackGuard<'a> {
    ctx: &'a mut ApiContext,
}

impl<'a> Deref for StackGuard<'a> {
    type Target = ApiContext;

    fn deref(&self) -> &ApiContext {
        self.ctx
    }
}

impl<'a> DerefMut for StackGuard<'a> {
    fn deref_mut(&mut self) -> &mut ApiContext {
        self.ctx
    }
}

impl<'a> Drop for StackGuard<'a> {
    fn drop(&mut self) {
        self.ctx.stack.pop();
    }
}
