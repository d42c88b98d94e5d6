use super::{Method, Methods, ModelResourceClass, Params, Resource, ResourcePath};
use crate::context::ApiContext;
use crate::error::Result;
use crate::filters::Filter;
use crate::formatter::Mapping;
use crate::orm::{Predicates, QuerySet, QuerySetExt, Value};
use crate::validation::{self, ValidationErrors};
use async_trait::async_trait;
use chrono::Duration;
use derivative::Derivative;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use url::form_urlencoded;

/// A set of objects served at one path segment beneath the root.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Collection {
    segment: String,
    queryset: Arc<dyn QuerySet>,
    class: String,
    page_size: Option<usize>,
    #[derivative(Debug = "ignore")]
    filters: Vec<Arc<dyn Filter>>,
    methods: Methods,
    max_age: Option<Duration>,
}

impl Collection {
    /// The objects of `queryset`, represented as resources of the class named `class` and served
    /// at `segment`.
    pub fn new(
        segment: impl Into<String>,
        queryset: Arc<dyn QuerySet>,
        class: impl Into<String>,
    ) -> Self {
        Self {
            segment: segment.into(),
            queryset,
            class: class.into(),
            page_size: None,
            filters: vec![],
            methods: [Method::Get, Method::Post].into(),
            max_age: None,
        }
    }

    /// Serve at most `size` objects per page.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Add a filter to the end of the chain.
    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// The name of the class representing members of this collection.
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn queryset(&self) -> &Arc<dyn QuerySet> {
        &self.queryset
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }
}

/// The resource serving a [`Collection`].
#[derive(Debug)]
pub struct CollectionResource {
    collection: Arc<Collection>,
    path: ResourcePath,
}

impl CollectionResource {
    pub fn new(collection: Arc<Collection>) -> Self {
        Self {
            collection,
            path: Default::default(),
        }
    }

    fn link(&self, params: &Params, page_param: &str, page: usize) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().filter(|(key, _)| *key != page_param))
            .append_pair(page_param, &page.to_string())
            .finish();
        format!("{}?{query}", self.resource_path().unwrap_or_default())
    }
}

#[async_trait]
impl Resource for CollectionResource {
    fn resource_path(&self) -> Option<&str> {
        self.path.get()
    }

    fn set_resource_path(&self, path: String) {
        self.path.set(path)
    }

    fn allowed_methods(&self) -> Methods {
        self.collection
            .methods
            .iter()
            .copied()
            .filter(|method| matches!(method, Method::Get | Method::Post))
            .collect()
    }

    async fn get(&self, ctx: &mut ApiContext, params: &Params) -> Result<Mapping> {
        self.check_allowed(Method::Get)?;
        let class = ctx.api().class(&self.collection.class)?.clone();

        let mut qs = self.collection.queryset.all();
        for filter in &self.collection.filters {
            qs = filter.filter(ctx, params, qs)?;
        }

        let page_param = ctx.config().page_param.clone();
        let page_size = self.collection.page_size.or(ctx.config().default_page_size);
        let page = params
            .get(&page_param)
            .and_then(|page| page.parse::<usize>().ok())
            .unwrap_or(0);
        let mut meta = Mapping::new();
        let objects = match page_size {
            Some(size) => {
                let count = qs.count().await?;
                // A page too far out to have an offset is past the end.
                let objects = match page.checked_mul(size) {
                    Some(offset) => {
                        class
                            .query_plan(ctx)?
                            .prepare(qs.slice(offset, Some(size)))
                            .fetch()
                            .await?
                    }
                    None => vec![],
                };
                meta.insert("count".into(), json!(count));
                let end = page.checked_add(1).and_then(|next| next.checked_mul(size));
                if end.map_or(false, |end| end < count) {
                    meta.insert("next".into(), self.link(params, &page_param, page + 1).into());
                }
                if page > 0 {
                    meta.insert("prev".into(), self.link(params, &page_param, page - 1).into());
                }
                objects
            }
            None => {
                let objects = class.query_plan(ctx)?.prepare(qs).fetch().await?;
                meta.insert("count".into(), json!(objects.len()));
                objects
            }
        };

        let mut items = Vec::with_capacity(objects.len());
        for obj in &objects {
            items.push(JsonValue::Object(class.serialize(ctx, obj, None).await?));
        }
        if let Some(max_age) = self.collection.max_age {
            ctx.expire_in(max_age);
        }

        let mut mapping = Mapping::new();
        mapping.insert("meta".into(), JsonValue::Object(meta));
        mapping.insert("objects".into(), JsonValue::Array(items));
        Ok(mapping)
    }

    async fn post(&self, ctx: &mut ApiContext, payload: &Mapping) -> Result<Arc<dyn Resource>> {
        self.check_allowed(Method::Post)?;
        let class = ctx.api().class(&self.collection.class)?.clone();
        let obj = self.collection.queryset.new_object();
        class.apply(ctx, payload, &obj).await?;

        let resource = class.wrap(obj.clone());
        if let (Some(path), Some(key)) = (self.resource_path(), class.key_segment(ctx, &obj).await?)
        {
            resource.set_resource_path(format!("{path}/{key}"));
        }
        tracing::info!(
            "created {} at {}",
            class.name(),
            resource.resource_path().unwrap_or("<unaddressable>")
        );
        Ok(Arc::new(resource))
    }

    async fn child_resource(
        &self,
        ctx: &mut ApiContext,
        segment: &str,
    ) -> Result<Option<Arc<dyn Resource>>> {
        let class: Arc<ModelResourceClass> = ctx.api().class(&self.collection.class)?.clone();
        let key = match ctx
            .formatter()
            .to_native_value(class.key_type(), &JsonValue::String(segment.into()))
        {
            Ok(Value::Null) | Err(_) => return Ok(None),
            Ok(key) => key,
        };
        let qs = class.query_plan(ctx)?.prepare(self.collection.queryset.all());
        let predicates = Predicates::from([(class.key_attr().to_string(), key)]);
        Ok(qs
            .opt(&predicates)
            .await?
            .map(|obj| Arc::new(class.wrap(obj)) as Arc<dyn Resource>))
    }

    async fn validate(
        &self,
        ctx: &mut ApiContext,
        key: &str,
        payload: &Mapping,
    ) -> Result<ValidationErrors> {
        let class = ctx.api().class(&self.collection.class)?.clone();
        validation::validate(ctx, key, &class, None, payload).await
    }
}
