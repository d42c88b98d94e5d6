use super::{check_authorized, validate_value, Field, FieldBuilder, FieldOptions};
use crate::context::ApiContext;
use crate::error::{Error, Result};
use crate::formatter::Mapping;
use crate::orm::{Attr, ObjectRef};
use crate::related::Related;
use crate::validation::{self, ValidationErrors};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// A to-one relation, embedded on the wire as the full representation of the related resource.
///
/// An incoming mapping updates the related object in place. If the mapping carries the address of
/// another resource of the right class, that resource is updated and becomes the related object
/// instead. If the relation is unset and the mapping carries no usable address, a new object is
/// created.
#[derive(Clone, Debug)]
pub struct SubObjectResourceField {
    options: FieldOptions,
    class: String,
}

impl SubObjectResourceField {
    /// A field embedding resources of the class named `class`.
    pub fn new(path: &str, class: impl Into<String>) -> Self {
        Self {
            options: FieldOptions::new(path),
            class: class.into(),
        }
    }

    fn related(&self, value: Attr) -> Result<Option<ObjectRef>> {
        match value {
            Attr::Object(obj) => Ok(obj),
            _ => Err(crate::orm::Error::unsupported(format!(
                "{} is not a to-one relation",
                self.options.path
            ))
            .into()),
        }
    }

    /// The object `mapping` is written to: the resource named by its address if there is one,
    /// otherwise `current`.
    async fn target(
        &self,
        ctx: &mut ApiContext,
        current: Option<ObjectRef>,
        mapping: &Mapping,
    ) -> Result<Option<ObjectRef>> {
        if let Some(JsonValue::String(uri)) = mapping.get(&ctx.resource_uri_key()) {
            if let Some(child) = ctx.resolve_object(uri, &self.class).await? {
                return Ok(Some(child));
            }
        }
        Ok(current)
    }
}

impl FieldBuilder for SubObjectResourceField {
    fn options_mut(&mut self) -> &mut FieldOptions {
        &mut self.options
    }
}

#[async_trait]
impl Field for SubObjectResourceField {
    fn options(&self) -> &FieldOptions {
        &self.options
    }

    fn class(&self) -> Option<&str> {
        Some(&self.class)
    }

    fn embeds(&self) -> bool {
        true
    }

    async fn outgoing_value(&self, ctx: &mut ApiContext, value: Attr) -> Result<JsonValue> {
        let Some(obj) = self.related(value)? else {
            return Ok(JsonValue::Null);
        };
        let class = ctx.api().class(&self.class)?.clone();
        Ok(JsonValue::Object(class.serialize(ctx, &obj, None).await?))
    }

    async fn incoming_value(
        &self,
        ctx: &mut ApiContext,
        holder: &ObjectRef,
        attr: &str,
        value: &JsonValue,
    ) -> Result<()> {
        let current = self.related(holder.get(attr).await?)?;
        let mapping = match value {
            JsonValue::Null => {
                // Some storage layers reject redundant writes of null over null.
                if current.is_some() {
                    holder.set(attr, Attr::Object(None))?;
                }
                return Ok(());
            }
            JsonValue::Object(mapping) => mapping,
            _ => return Err(Error::type_coercion("object", value)),
        };

        let class = ctx.api().class(&self.class)?.clone();
        let child = match self.target(ctx, current, mapping).await? {
            Some(child) => child,
            None => holder.new_related(attr)?,
        };

        // The child must have a key before the holder can refer to it.
        class.write(ctx, mapping, &child).await?;
        holder.set(attr, Attr::Object(Some(child)))?;
        Ok(())
    }

    async fn unchanged(
        &self,
        _ctx: &mut ApiContext,
        current: &Attr,
        value: &JsonValue,
    ) -> Result<bool> {
        // Nested values are validated field by field.
        Ok(value.is_null() && matches!(current, Attr::Object(None)))
    }

    async fn check_incoming(&self, _ctx: &mut ApiContext, value: &JsonValue) -> Result<()> {
        match value {
            JsonValue::Null | JsonValue::Object(_) => Ok(()),
            _ => Err(Error::type_coercion("object", value)),
        }
    }

    fn prepare(&self, ctx: &ApiContext, related: &mut Related<'_>) -> Result<()> {
        let class = ctx.api().class(&self.class)?;
        let path = self.options.path.lookup();
        if self.options.prefetch {
            related.prefetch(&path);
            class.prepare(ctx, &mut related.sub_prefetch(&path))
        } else {
            related.select(&path);
            class.prepare(ctx, &mut related.sub_select(&path))
        }
    }

    async fn validate(
        &self,
        ctx: &mut ApiContext,
        key: &str,
        target: Option<&ObjectRef>,
        value: &JsonValue,
        errors: &mut ValidationErrors,
    ) -> Result<()> {
        validate_value(self, ctx, key, target, value, errors).await?;
        let JsonValue::Object(mapping) = value else {
            return Ok(());
        };
        let child = match target {
            Some(target) => match self.options.path.read(target).await? {
                Some(attr) => self.related(attr)?,
                None => None,
            },
            None => None,
        };
        let child = self.target(ctx, child, mapping).await?;
        let class = ctx.api().class(&self.class)?.clone();
        validation::validate_into(ctx, key, &class, child.as_ref(), mapping, errors).await
    }

    async fn authorize(
        &self,
        ctx: &mut ApiContext,
        target: &ObjectRef,
        value: &JsonValue,
    ) -> Result<()> {
        let Some(holder) = self.options.path.holder(target).await? else {
            return Ok(());
        };
        let mut ctx = ctx.enter(target.clone());
        check_authorized(self, &mut ctx, &holder, value).await?;
        let JsonValue::Object(mapping) = value else {
            return Ok(());
        };
        let attr = self.options.path.last();
        let current = self.related(holder.get(attr).await?)?;
        let child = match self.target(&mut ctx, current, mapping).await? {
            Some(child) => child,
            None => holder.new_related(attr)?,
        };
        let class = ctx.api().class(&self.class)?.clone();
        class.authorize(&mut ctx, mapping, &child).await
    }
}
