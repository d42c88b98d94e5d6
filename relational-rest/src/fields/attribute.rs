use super::{Field, FieldBuilder, FieldOptions};
use crate::context::ApiContext;
use crate::error::Result;
use crate::orm::{Attr, ObjectRef, Value, ValueType};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// A scalar attribute, coerced to and from its declared type by the formatter.
///
/// The path may also end at a to-one relation, in which case the primary key of the related
/// object is emitted. Such a field is read-only in practice: incoming values are rejected by the
/// persistence layer.
#[derive(Clone, Debug)]
pub struct AttributeField {
    options: FieldOptions,
    ty: ValueType,
}

impl AttributeField {
    pub fn new(path: &str, ty: ValueType) -> Self {
        Self {
            options: FieldOptions::new(path),
            ty,
        }
    }

    pub fn ty(&self) -> ValueType {
        self.ty
    }
}

impl FieldBuilder for AttributeField {
    fn options_mut(&mut self) -> &mut FieldOptions {
        &mut self.options
    }
}

#[async_trait]
impl Field for AttributeField {
    fn options(&self) -> &FieldOptions {
        &self.options
    }

    async fn outgoing_value(&self, ctx: &mut ApiContext, value: Attr) -> Result<JsonValue> {
        let value = match value {
            Attr::Value(value) => value,
            Attr::Object(obj) => obj.and_then(|obj| obj.pk()).into(),
            Attr::Many(_) => {
                return Err(crate::orm::Error::unsupported(format!(
                    "{} is a to-many relation",
                    self.options.path
                ))
                .into())
            }
        };
        Ok(ctx.formatter().to_api_value(self.ty, &value))
    }

    async fn incoming_value(
        &self,
        ctx: &mut ApiContext,
        holder: &ObjectRef,
        attr: &str,
        value: &JsonValue,
    ) -> Result<()> {
        let value = ctx.formatter().to_native_value(self.ty, value)?;
        holder.set(attr, Attr::Value(value))?;
        Ok(())
    }

    async fn unchanged(
        &self,
        ctx: &mut ApiContext,
        current: &Attr,
        value: &JsonValue,
    ) -> Result<bool> {
        let new = ctx.formatter().to_native_value(self.ty, value)?;
        Ok(match current {
            Attr::Value(old) => old.compare(&new) == Some(Ordering::Equal),
            Attr::Object(None) => new == Value::Null,
            Attr::Object(Some(obj)) => obj
                .pk()
                .map(|pk| pk.compare(&new) == Some(Ordering::Equal))
                .unwrap_or(false),
            Attr::Many(_) => false,
        })
    }

    async fn check_incoming(&self, ctx: &mut ApiContext, value: &JsonValue) -> Result<()> {
        ctx.formatter().to_native_value(self.ty, value)?;
        Ok(())
    }
}
