use super::{Field, FieldBuilder, FieldOptions};
use crate::context::ApiContext;
use crate::error::{Error, Result};
use crate::orm::{Attr, ObjectRef};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// A to-one relation, represented on the wire by the address of the related resource.
#[derive(Clone, Debug)]
pub struct URIResourceField {
    options: FieldOptions,
    class: String,
}

impl URIResourceField {
    /// A field referencing resources of the class named `class`.
    pub fn new(path: &str, class: impl Into<String>) -> Self {
        Self {
            options: FieldOptions::new(path),
            class: class.into(),
        }
    }

    async fn resolve(&self, ctx: &mut ApiContext, value: &JsonValue) -> Result<Option<ObjectRef>> {
        match value {
            JsonValue::Null => Ok(None),
            JsonValue::String(uri) => match ctx.resolve_object(uri, &self.class).await? {
                Some(obj) => Ok(Some(obj)),
                None => Err(Error::invalid_reference(uri, &self.class)),
            },
            _ => Err(Error::type_coercion("resource URI", value)),
        }
    }
}

impl FieldBuilder for URIResourceField {
    fn options_mut(&mut self) -> &mut FieldOptions {
        &mut self.options
    }
}

#[async_trait]
impl Field for URIResourceField {
    fn options(&self) -> &FieldOptions {
        &self.options
    }

    fn class(&self) -> Option<&str> {
        Some(&self.class)
    }

    async fn outgoing_value(&self, ctx: &mut ApiContext, value: Attr) -> Result<JsonValue> {
        let Attr::Object(obj) = value else {
            return Err(crate::orm::Error::unsupported(format!(
                "{} is not a to-one relation",
                self.options.path
            ))
            .into());
        };
        let Some(obj) = obj else {
            return Ok(JsonValue::Null);
        };
        match ctx.address_of(&self.class, &obj).await? {
            Some(uri) => Ok(JsonValue::String(uri)),
            None => Err(Error::Unaddressable {
                model: obj.model().to_string(),
                pk: obj.pk().map(|pk| pk.to_string()).unwrap_or_default(),
            }),
        }
    }

    async fn incoming_value(
        &self,
        ctx: &mut ApiContext,
        holder: &ObjectRef,
        attr: &str,
        value: &JsonValue,
    ) -> Result<()> {
        let obj = self.resolve(ctx, value).await?;
        holder.set(attr, Attr::Object(obj))?;
        Ok(())
    }

    async fn unchanged(
        &self,
        ctx: &mut ApiContext,
        current: &Attr,
        value: &JsonValue,
    ) -> Result<bool> {
        let new = self.resolve(ctx, value).await?;
        Ok(match (current, new) {
            (Attr::Object(None), None) => true,
            (Attr::Object(Some(old)), Some(new)) => {
                old.model() == new.model() && old.pk().is_some() && old.pk() == new.pk()
            }
            _ => false,
        })
    }

    async fn check_incoming(&self, ctx: &mut ApiContext, value: &JsonValue) -> Result<()> {
        self.resolve(ctx, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Api;
    use crate::fields::test::schema;
    use crate::fields::AttributeField;
    use crate::formatter::Mapping;
    use crate::init_logging;
    use crate::orm::mock::Database;
    use crate::orm::ValueType;
    use crate::resources::{Collection, ModelResourceClass};
    use serde_json::json;
    use std::sync::Arc;

    /// Authors are served, agents are not.
    fn api(db: &Database) -> Arc<Api> {
        Api::builder()
            .class(
                ModelResourceClass::new("author")
                    .field(AttributeField::new("name", ValueType::Text))
                    .field(URIResourceField::new("agent", "agent").optional()),
            )
            .class(ModelResourceClass::new("agent").field(AttributeField::new("name", ValueType::Text)))
            .collection(Collection::new("authors", db.queryset("author"), "author"))
            .build()
            .unwrap()
    }

    #[async_std::test]
    async fn test_unaddressable() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let agent = db
            .insert("agent", [("name", Attr::Value("Alice".into()))])
            .await
            .unwrap();
        let author = db
            .insert(
                "author",
                [
                    ("name", Attr::Value("Bob".into())),
                    ("agent", Attr::Object(None)),
                ],
            )
            .await
            .unwrap();

        let field = URIResourceField::new("agent", "agent");
        let mut mapping = Mapping::new();
        field
            .handle_outgoing(&mut ctx, &author, &mut mapping)
            .await
            .unwrap();
        assert_eq!(mapping["agent"], JsonValue::Null);

        author.set("agent", Attr::Object(Some(agent))).unwrap();
        assert!(matches!(
            field.handle_outgoing(&mut ctx, &author, &mut mapping).await,
            Err(Error::Unaddressable { model, pk }) if model == "agent" && pk == "1"
        ));
    }

    #[async_std::test]
    async fn test_invalid_reference() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let author = db
            .insert("author", [("name", Attr::Value("Bob".into()))])
            .await
            .unwrap();
        let field = URIResourceField::new("agent", "agent");

        // Nothing is served at the address, or something of the wrong class is.
        for uri in ["/api/agents/1", "/api/authors/1", "/elsewhere/1"] {
            let payload = json!({ "agent": uri });
            assert!(matches!(
                field
                    .handle_incoming(&mut ctx, payload.as_object().unwrap(), &author)
                    .await,
                Err(Error::InvalidReference { uri: bad, class }) if bad == uri && class == "agent"
            ));
        }
        assert!(matches!(
            field
                .handle_incoming(&mut ctx, json!({"agent": 1}).as_object().unwrap(), &author)
                .await,
            Err(Error::TypeCoercion { .. })
        ));
        assert!(matches!(author.get("agent").await.unwrap(), Attr::Object(None)));
        assert!(ctx.stack().is_empty());

        // An unset relation stays unset.
        field
            .handle_incoming(&mut ctx, json!({"agent": null}).as_object().unwrap(), &author)
            .await
            .unwrap();
        assert!(matches!(author.get("agent").await.unwrap(), Attr::Object(None)));
    }
}
