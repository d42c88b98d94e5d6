use super::{Method, Methods, Params, Resource, ResourcePath};
use crate::context::ApiContext;
use crate::error::Result;
use crate::fields::Field;
use crate::formatter::Mapping;
use crate::orm::{Aggregate, Attr, ObjectRef, Value, ValueType, PK};
use crate::related::{QueryPlan, Related};
use crate::validation::{self, ResourceValidator, ValidationErrors};
use async_trait::async_trait;
use chrono::Duration;
use derivative::Derivative;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// How objects of one kind are represented as resources.
///
/// A class is a fixed list of fields plus a few settings. It is built once, registered with an
/// [`Api`](crate::api::Api), and shared by every resource wrapping an object of its kind.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ModelResourceClass {
    name: String,
    fields: Vec<Arc<dyn Field>>,
    #[derivative(Debug = "ignore")]
    validators: Vec<Arc<dyn ResourceValidator>>,
    key_attr: String,
    key_type: ValueType,
    methods: Methods,
    annotations: Vec<(String, Aggregate)>,
    max_age: Option<Duration>,
}

impl ModelResourceClass {
    /// A class with no fields, addressed by primary key, supporting `GET`, `PUT` and `DELETE`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![],
            validators: vec![],
            key_attr: PK.into(),
            key_type: ValueType::Int,
            methods: [Method::Get, Method::Put, Method::Delete].into(),
            annotations: vec![],
            max_age: None,
        }
    }

    pub fn field(mut self, field: impl Field + 'static) -> Self {
        self.fields.push(Arc::new(field));
        self
    }

    /// Add a rule checked against whole incoming payloads.
    pub fn validator(mut self, validator: impl ResourceValidator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Address resources by the attribute `attr` instead of the primary key.
    pub fn published_key(mut self, attr: impl Into<String>, ty: ValueType) -> Self {
        self.key_attr = attr.into();
        self.key_type = ty;
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Attach `aggregate` to every object loaded for this class, under the attribute `name`.
    pub fn annotate(mut self, name: impl Into<String>, aggregate: Aggregate) -> Self {
        self.annotations.push((name.into(), aggregate));
        self
    }

    /// Let clients cache representations of this class for `max_age`.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Arc<dyn Field>] {
        &self.fields
    }

    pub fn validators(&self) -> &[Arc<dyn ResourceValidator>] {
        &self.validators
    }

    pub fn key_attr(&self) -> &str {
        &self.key_attr
    }

    pub fn key_type(&self) -> ValueType {
        self.key_type
    }

    pub fn allowed_methods(&self) -> &Methods {
        &self.methods
    }

    /// Register the relations traversed by the fields of this class.
    pub fn prepare(&self, ctx: &ApiContext, related: &mut Related<'_>) -> Result<()> {
        for field in &self.fields {
            field.prepare(ctx, related)?;
        }
        Ok(())
    }

    /// The eager-load plan for queries returning objects of this class.
    pub fn query_plan(&self, ctx: &ApiContext) -> Result<QueryPlan> {
        let mut plan = QueryPlan::new();
        self.prepare(ctx, &mut plan.related())?;
        for (name, aggregate) in &self.annotations {
            plan.annotate(name.clone(), aggregate.clone());
        }
        Ok(plan)
    }

    /// The path segment addressing `obj`, or [`None`] if its published key is not set.
    pub async fn key_segment(&self, ctx: &ApiContext, obj: &ObjectRef) -> Result<Option<String>> {
        let key = match obj.get(&self.key_attr).await? {
            Attr::Value(value) => value,
            Attr::Object(related) => related.and_then(|related| related.pk()).into(),
            Attr::Many(_) => Value::Null,
        };
        if key.is_null() {
            return Ok(None);
        }
        Ok(Some(
            match ctx.formatter().to_api_value(self.key_type, &key) {
                JsonValue::String(s) => s,
                other => other.to_string(),
            },
        ))
    }

    /// The representation of `obj`.
    ///
    /// The representation includes the address of `obj`: `path` if given, otherwise its canonical
    /// address if it has one.
    pub async fn serialize(
        &self,
        ctx: &mut ApiContext,
        obj: &ObjectRef,
        path: Option<&str>,
    ) -> Result<Mapping> {
        let mut mapping = Mapping::new();
        for field in &self.fields {
            field.handle_outgoing(ctx, obj, &mut mapping).await?;
        }
        let uri = match path {
            Some(path) => Some(path.to_string()),
            None => ctx.address_of(&self.name, obj).await?,
        };
        if let Some(uri) = uri {
            mapping.insert(ctx.resource_uri_key(), JsonValue::String(uri));
        }
        if let Some(max_age) = self.max_age {
            ctx.expire_in(max_age);
        }
        Ok(mapping)
    }

    /// Write `payload` to `obj` and save it.
    ///
    /// Every authorizer the write consults, including those of nested resources, is checked before
    /// anything is saved, so a rejected write leaves the database untouched.
    pub async fn apply(&self, ctx: &mut ApiContext, payload: &Mapping, obj: &ObjectRef) -> Result<()> {
        self.authorize(ctx, payload, obj).await?;
        self.write(ctx, payload, obj).await
    }

    /// Check that writing `payload` to `obj` would be authorized, without writing anything.
    pub async fn authorize(
        &self,
        ctx: &mut ApiContext,
        payload: &Mapping,
        obj: &ObjectRef,
    ) -> Result<()> {
        for field in &self.fields {
            if field.options().read_only {
                continue;
            }
            if let Some(value) = payload.get(&field.public_name(ctx)) {
                field.authorize(ctx, obj, value).await?;
            }
        }
        Ok(())
    }

    /// Write `payload` to `obj` and save it, without checking authorization up front.
    ///
    /// Fields which need `obj` to have a key run last, after `obj` has been saved once if it is
    /// new.
    pub(crate) async fn write(
        &self,
        ctx: &mut ApiContext,
        payload: &Mapping,
        obj: &ObjectRef,
    ) -> Result<()> {
        let (later, now): (Vec<_>, Vec<_>) = self
            .fields
            .iter()
            .partition(|field| field.requires_saved_target());
        for field in now {
            field.handle_incoming(ctx, payload, obj).await?;
        }
        let needs_key = later.iter().any(|field| {
            !field.options().read_only && payload.contains_key(&field.public_name(ctx))
        });
        if needs_key && obj.pk().is_none() {
            obj.save().await?;
        }
        for field in later {
            field.handle_incoming(ctx, payload, obj).await?;
        }

        let created = obj.pk().is_none();
        obj.save().await?;
        if created {
            tracing::info!("created {} {:?}", self.name, obj.pk());
        } else {
            tracing::info!("updated {} {:?}", self.name, obj.pk());
        }
        Ok(())
    }

    /// The resource for `obj`.
    pub fn wrap(self: &Arc<Self>, obj: ObjectRef) -> ModelResource {
        ModelResource {
            class: self.clone(),
            object: obj,
            path: Default::default(),
        }
    }
}

/// A single object, exposed through a [`ModelResourceClass`].
#[derive(Debug)]
pub struct ModelResource {
    class: Arc<ModelResourceClass>,
    object: ObjectRef,
    path: ResourcePath,
}

impl ModelResource {
    pub fn class(&self) -> &Arc<ModelResourceClass> {
        &self.class
    }
}

#[async_trait]
impl Resource for ModelResource {
    fn resource_path(&self) -> Option<&str> {
        self.path.get()
    }

    fn set_resource_path(&self, path: String) {
        self.path.set(path)
    }

    fn allowed_methods(&self) -> Methods {
        self.class
            .allowed_methods()
            .iter()
            .copied()
            .filter(|method| *method != Method::Post)
            .collect()
    }

    fn class_name(&self) -> Option<&str> {
        Some(self.class.name())
    }

    fn object(&self) -> Option<&ObjectRef> {
        Some(&self.object)
    }

    async fn get(&self, ctx: &mut ApiContext, _params: &Params) -> Result<Mapping> {
        self.check_allowed(Method::Get)?;
        self.class
            .serialize(ctx, &self.object, self.resource_path())
            .await
    }

    async fn put(&self, ctx: &mut ApiContext, payload: &Mapping) -> Result<()> {
        self.check_allowed(Method::Put)?;
        self.class.apply(ctx, payload, &self.object).await
    }

    async fn delete(&self, _ctx: &mut ApiContext) -> Result<()> {
        self.check_allowed(Method::Delete)?;
        tracing::info!("deleting {} {:?}", self.class.name(), self.object.pk());
        self.object.delete().await?;
        Ok(())
    }

    async fn validate(
        &self,
        ctx: &mut ApiContext,
        key: &str,
        payload: &Mapping,
    ) -> Result<ValidationErrors> {
        validation::validate(ctx, key, &self.class, Some(&self.object), payload).await
    }
}
