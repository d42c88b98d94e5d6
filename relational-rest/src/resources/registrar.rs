use super::{CollectionResource, Method, Methods, Params, Resource, ResourcePath};
use crate::context::ApiContext;
use crate::error::Result;
use crate::formatter::Mapping;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// The root of the resource tree, serving an index of the registered collections.
#[derive(Debug)]
pub struct Registrar {
    path: ResourcePath,
}

impl Registrar {
    pub fn new(path: &str) -> Self {
        Self {
            path: ResourcePath::new(path),
        }
    }
}

#[async_trait]
impl Resource for Registrar {
    fn resource_path(&self) -> Option<&str> {
        self.path.get()
    }

    fn set_resource_path(&self, path: String) {
        self.path.set(path)
    }

    fn allowed_methods(&self) -> Methods {
        [Method::Get].into()
    }

    async fn get(&self, ctx: &mut ApiContext, _params: &Params) -> Result<Mapping> {
        Ok(ctx
            .api()
            .collections()
            .iter()
            .map(|collection| {
                (
                    ctx.public_name(collection.segment()),
                    JsonValue::String(ctx.uri_for(collection.segment())),
                )
            })
            .collect())
    }

    async fn child_resource(
        &self,
        ctx: &mut ApiContext,
        segment: &str,
    ) -> Result<Option<Arc<dyn Resource>>> {
        Ok(ctx
            .api()
            .collection(segment)
            .map(|collection| Arc::new(CollectionResource::new(collection.clone())) as Arc<dyn Resource>))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::fields::test::{api, schema};
    use crate::init_logging;
    use crate::orm::mock::Database;
    use serde_json::json;

    #[async_std::test]
    async fn test_index() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let root = ctx.root();
        assert_eq!(root.resource_path(), Some("/api"));
        assert_eq!(
            JsonValue::Object(root.get(&mut ctx, &Params::new()).await.unwrap()),
            json!({"authors": "/api/authors", "books": "/api/books"})
        );
        assert!(matches!(
            root.delete(&mut ctx).await,
            Err(Error::MethodNotAllowed { method: Method::Delete, .. })
        ));
        assert!(root.child_resource(&mut ctx, "shelves").await.unwrap().is_none());
    }
}
