//! Registration of resource classes and collections, and the request boundary.
//!
//! An [`Api`] is assembled once at startup by an [`ApiBuilder`] and is immutable afterwards. Each
//! request is served by [`Api::handle`], which resolves the requested path, checks the method,
//! validates incoming payloads, enforces `If-Match` preconditions and collects response headers.

use crate::config::ApiConfig;
use crate::context::ApiContext;
use crate::error::{Error, Result};
use crate::formatter::{Formatter, JsonFormatter, Mapping};
use crate::resources::{Collection, Method, ModelResourceClass, Params, Resource};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use url::form_urlencoded;

/// The registered resource classes and collections of one API.
#[derive(Debug)]
pub struct Api {
    config: ApiConfig,
    formatter: Arc<dyn Formatter>,
    classes: HashMap<String, Arc<ModelResourceClass>>,
    collections: Vec<Arc<Collection>>,
}

impl Api {
    pub fn builder() -> ApiBuilder {
        ApiBuilder::default()
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn formatter(&self) -> &dyn Formatter {
        self.formatter.as_ref()
    }

    /// The resource class named `name`.
    pub fn class(&self, name: &str) -> Result<&Arc<ModelResourceClass>> {
        self.classes
            .get(name)
            .ok_or_else(|| Error::unknown_resource(name))
    }

    /// The collection served at `segment`.
    pub fn collection(&self, segment: &str) -> Option<&Arc<Collection>> {
        self.collections
            .iter()
            .find(|collection| collection.segment() == segment)
    }

    /// All collections, in registration order.
    pub fn collections(&self) -> &[Arc<Collection>] {
        &self.collections
    }

    /// The collection giving objects of `class` their canonical address: the first one registered
    /// for it.
    pub fn canonical_collection(&self, class: &str) -> Option<&Arc<Collection>> {
        self.collections
            .iter()
            .find(|collection| collection.class() == class)
    }

    /// A fresh context for one request.
    pub fn context(self: &Arc<Self>) -> ApiContext {
        ApiContext::new(self.clone())
    }

    /// The entity tag of a representation: the SHA-256 of its encoding, in hex.
    pub fn etag(&self, representation: &Mapping) -> Result<String> {
        let mut bytes = vec![];
        self.formatter.write_to(representation, &mut bytes)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    /// Serve a single request.
    ///
    /// # Errors
    ///
    /// Besides errors raised by the resources themselves, this fails with
    ///
    /// * [`Error::NotFound`] if nothing lives at the requested path,
    /// * [`Error::MethodNotAllowed`] if the resource does not support the method,
    /// * [`Error::Validation`] if a `POST` or `PUT` payload is invalid,
    /// * [`Error::PreconditionFailed`] if a `PUT` carries an `If-Match` tag which does not match
    ///   the current representation. Validation errors take precedence.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Result<Response> {
        tracing::info!("{} {}", request.method, request.path);
        let mut ctx = self.context();
        let resource = ctx
            .resolve(&request.path)
            .await?
            .ok_or_else(|| Error::NotFound {
                path: request.path.clone(),
            })?;
        resource.check_allowed(request.method)?;

        let mut response = match request.method {
            Method::Get => {
                let body = resource.get(&mut ctx, &request.params).await?;
                Response::new(Status::Ok, Some(body))
            }
            Method::Post => {
                let payload = request.payload()?;
                check_valid(&mut ctx, resource.as_ref(), payload).await?;
                let created = resource.post(&mut ctx, payload).await?;
                let body = representation(&mut ctx, created.as_ref()).await?;
                let mut response = Response::new(Status::Created, body);
                if let Some(path) = created.resource_path() {
                    response.headers.insert("Location".into(), path.into());
                }
                response
            }
            Method::Put => {
                let payload = request.payload()?;
                check_valid(&mut ctx, resource.as_ref(), payload).await?;
                if let Some(tag) = &request.if_match {
                    let current = match representation(&mut ctx, resource.as_ref()).await? {
                        Some(current) => Some(self.etag(&current)?),
                        None => None,
                    };
                    if current.as_deref() != Some(tag.trim().trim_matches('"')) {
                        tracing::info!("stale write to {}: {tag} is out of date", request.path);
                        return Err(Error::PreconditionFailed);
                    }
                }
                resource.put(&mut ctx, payload).await?;
                let body = representation(&mut ctx, resource.as_ref()).await?;
                Response::new(Status::Ok, body)
            }
            Method::Delete => {
                resource.delete(&mut ctx).await?;
                Response::new(Status::NoContent, None)
            }
        };

        if let Some(body) = &response.body {
            let etag = self.etag(body)?;
            response.headers.insert("ETag".into(), format!("\"{etag}\""));
        }
        if let Some(expires) = ctx.expires() {
            response.headers.insert(
                "Expires".into(),
                expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }
        for (name, value) in ctx.headers() {
            response.headers.insert(name.clone(), value.clone());
        }
        Ok(response)
    }
}

async fn check_valid(ctx: &mut ApiContext, resource: &dyn Resource, payload: &Mapping) -> Result<()> {
    let errors = resource.validate(ctx, "", payload).await?;
    if errors.is_empty() {
        Ok(())
    } else {
        tracing::info!("rejecting invalid payload: {errors}");
        Err(Error::Validation { errors })
    }
}

/// The representation of `resource`, if it can be read.
async fn representation(ctx: &mut ApiContext, resource: &dyn Resource) -> Result<Option<Mapping>> {
    if resource.allowed_methods().contains(&Method::Get) {
        Ok(Some(resource.get(ctx, &Params::new()).await?))
    } else {
        Ok(None)
    }
}

/// Assembles an [`Api`].
#[derive(Debug, Default)]
pub struct ApiBuilder {
    config: ApiConfig,
    formatter: Option<Arc<dyn Formatter>>,
    classes: Vec<ModelResourceClass>,
    collections: Vec<Collection>,
}

impl ApiBuilder {
    pub fn config(mut self, config: ApiConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `formatter` instead of the default [`JsonFormatter`].
    pub fn formatter(mut self, formatter: impl Formatter + 'static) -> Self {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    pub fn class(mut self, class: ModelResourceClass) -> Self {
        self.classes.push(class);
        self
    }

    pub fn collection(mut self, collection: Collection) -> Self {
        self.collections.push(collection);
        self
    }

    /// Check the registrations for consistency and build the [`Api`].
    ///
    /// # Errors
    ///
    /// This fails with [`Error::UnknownResource`] if a collection or field refers to a class which
    /// was not registered, and with [`Error::InvalidConfiguration`] if a class or collection is
    /// registered twice, or if classes embed each other in a cycle.
    pub fn build(self) -> Result<Arc<Api>> {
        let mut classes = HashMap::new();
        for class in self.classes {
            let name = class.name().to_string();
            if classes.insert(name.clone(), Arc::new(class)).is_some() {
                return Err(Error::invalid_configuration(format!(
                    "class {name} is registered twice"
                )));
            }
        }
        for class in classes.values() {
            for field in class.fields() {
                if let Some(target) = field.class() {
                    if !classes.contains_key(target) {
                        return Err(Error::unknown_resource(target));
                    }
                }
            }
        }
        check_acyclic(&classes)?;

        let mut collections: Vec<Arc<Collection>> = vec![];
        for collection in self.collections {
            if !classes.contains_key(collection.class()) {
                return Err(Error::unknown_resource(collection.class()));
            }
            if collections
                .iter()
                .any(|other| other.segment() == collection.segment())
            {
                return Err(Error::invalid_configuration(format!(
                    "collection {} is registered twice",
                    collection.segment()
                )));
            }
            collections.push(Arc::new(collection));
        }

        Ok(Arc::new(Api {
            config: self.config,
            formatter: self
                .formatter
                .unwrap_or_else(|| Arc::new(JsonFormatter::default())),
            classes,
            collections,
        }))
    }
}

/// Fail if some class embeds itself, directly or through other classes.
fn check_acyclic(classes: &HashMap<String, Arc<ModelResourceClass>>) -> Result<()> {
    fn visit<'a>(
        classes: &'a HashMap<String, Arc<ModelResourceClass>>,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut Vec<&'a str>,
    ) -> Result<()> {
        if done.contains(&name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|visiting| *visiting == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name);
            return Err(Error::invalid_configuration(format!(
                "classes embed each other in a cycle: {}",
                cycle.join(" -> ")
            )));
        }
        path.push(name);
        if let Some(class) = classes.get(name) {
            for field in class.fields() {
                if let (true, Some(target)) = (field.embeds(), field.class()) {
                    visit(classes, target, path, done)?;
                }
            }
        }
        path.pop();
        done.push(name);
        Ok(())
    }

    let mut done = vec![];
    for name in classes.keys() {
        visit(classes, name, &mut vec![], &mut done)?;
    }
    Ok(())
}

/// A request as seen by [`Api::handle`].
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub params: Params,
    pub body: Option<Mapping>,
    /// Entity tag from an `If-Match` header, with or without quotes.
    pub if_match: Option<String>,
}

impl Request {
    /// A request for `uri`, whose query string becomes the parameters of the request.
    pub fn new(method: Method, uri: &str) -> Self {
        let uri = uri.split('#').next().unwrap_or_default();
        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        Self {
            method,
            path: path.to_string(),
            params: form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            body: None,
            if_match: None,
        }
    }

    pub fn get(uri: &str) -> Self {
        Self::new(Method::Get, uri)
    }

    pub fn post(uri: &str, body: Mapping) -> Self {
        Self::new(Method::Post, uri).with_body(body)
    }

    pub fn put(uri: &str, body: Mapping) -> Self {
        Self::new(Method::Put, uri).with_body(body)
    }

    pub fn delete(uri: &str) -> Self {
        Self::new(Method::Delete, uri)
    }

    pub fn with_body(mut self, body: Mapping) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    fn payload(&self) -> Result<&Mapping> {
        self.body
            .as_ref()
            .ok_or_else(|| Error::format(format!("{} requires a request body", self.method)))
    }
}

/// The outcome of a successful request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NoContent,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::NoContent => 204,
        }
    }
}

/// A response produced by [`Api::handle`].
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: Status,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Mapping>,
}

impl Response {
    fn new(status: Status, body: Option<Mapping>) -> Self {
        Self {
            status,
            headers: Default::default(),
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fields::test::{api, schema};
    use crate::fields::{AttributeField, FieldBuilder, SubObjectResourceField};
    use crate::init_logging;
    use crate::orm::mock::{Database, Model, Schema};
    use crate::orm::{Attr, ValueType};
    use crate::validation::Length;
    use chrono::{Duration, NaiveDateTime, Utc};
    use serde_json::{json, Value as JsonValue};

    fn mapping(value: JsonValue) -> Mapping {
        match value {
            JsonValue::Object(mapping) => mapping,
            _ => panic!("not an object: {value}"),
        }
    }

    async fn bob(db: &Database) {
        db.insert(
            "author",
            [
                ("name", Attr::Value("Bob".into())),
                ("age", Attr::Value(20.into())),
            ],
        )
        .await
        .unwrap();
    }

    #[async_std::test]
    async fn test_get() {
        init_logging();

        let db = Database::create(
            Schema::new().model(
                Model::new("user")
                    .scalar("name", ValueType::Text)
                    .scalar("age", ValueType::Int),
            ),
        );
        let api = Api::builder()
            .class(
                ModelResourceClass::new("user")
                    .field(AttributeField::new("name", ValueType::Text))
                    .field(AttributeField::new("age", ValueType::Int))
                    .max_age(Duration::minutes(5)),
            )
            .collection(Collection::new("users", db.queryset("user"), "user"))
            .build()
            .unwrap();
        db.insert(
            "user",
            [
                ("name", Attr::Value("Bob".into())),
                ("age", Attr::Value(20.into())),
            ],
        )
        .await
        .unwrap();

        let before = Utc::now();
        let response = api.handle(Request::get("/api/users/1")).await.unwrap();
        assert_eq!(response.status, Status::Ok);
        let body = response.body.as_ref().unwrap();
        assert_eq!(
            JsonValue::Object(body.clone()),
            json!({"name": "Bob", "age": 20, "resourceUri": "/api/users/1"})
        );
        assert_eq!(
            response.header("ETag"),
            Some(format!("\"{}\"", api.etag(body).unwrap()).as_str())
        );
        assert_eq!(api.etag(body).unwrap().len(), 64);

        let expires = NaiveDateTime::parse_from_str(
            response.header("Expires").unwrap(),
            "%a, %d %b %Y %H:%M:%S GMT",
        )
        .unwrap()
        .and_utc();
        assert!(expires >= before + Duration::minutes(5) - Duration::seconds(1));
        assert!(expires <= Utc::now() + Duration::minutes(5));
    }

    #[async_std::test]
    async fn test_not_found() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        for path in ["/api/authors/1", "/api/shelves", "/elsewhere"] {
            let err = api.handle(Request::get(path)).await.unwrap_err();
            assert!(matches!(err, Error::NotFound { .. }), "{path}: {err}");
            assert_eq!(err.status(), 404);
        }
    }

    #[async_std::test]
    async fn test_method_not_allowed() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let err = api.handle(Request::delete("/api/authors")).await.unwrap_err();
        match &err {
            Error::MethodNotAllowed { method, allowed } => {
                assert_eq!(*method, Method::Delete);
                assert_eq!(*allowed, [Method::Get, Method::Post]);
            }
            _ => panic!("expected method not allowed, got {err}"),
        }
        assert_eq!(err.status(), 405);
    }

    #[async_std::test]
    async fn test_post() {
        init_logging();

        let db = Database::create(schema());
        let api = Api::builder()
            .class(
                ModelResourceClass::new("author")
                    .field(AttributeField::new("name", ValueType::Text))
                    .field(SubObjectResourceField::new("agent", "agent")),
            )
            .class(ModelResourceClass::new("agent").field(AttributeField::new("name", ValueType::Text)))
            .collection(Collection::new("authors", db.queryset("author"), "author"))
            .build()
            .unwrap();

        let response = api
            .handle(Request::post(
                "/api/authors",
                mapping(json!({"name": "Bob", "agent": {"name": "Alice"}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status, Status::Created);
        assert_eq!(response.status.code(), 201);
        assert_eq!(response.header("Location"), Some("/api/authors/1"));
        assert_eq!(
            JsonValue::Object(response.body.unwrap()),
            json!({"name": "Bob", "agent": {"name": "Alice"}, "resourceUri": "/api/authors/1"})
        );
        assert_eq!(db.len("agent").await, 1);
        assert_eq!(db.len("author").await, 1);

        // A missing body is a malformed request.
        let err = api
            .handle(Request::new(Method::Post, "/api/authors"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Format { .. }), "{err}");
    }

    #[async_std::test]
    async fn test_invalid_reference() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        bob(&db).await;

        let err = api
            .handle(Request::post(
                "/api/books",
                mapping(json!({"title": "Dune", "author": "/api/authors/99"})),
            ))
            .await
            .unwrap_err();
        let Error::Validation { errors } = &err else {
            panic!("expected validation error, got {err}");
        };
        assert_eq!(errors.keys().collect::<Vec<_>>(), ["author"]);
        assert_eq!(err.status(), 400);
        assert_eq!(db.len("book").await, 0);

        let response = api
            .handle(Request::post(
                "/api/books",
                mapping(json!({"title": "Dune", "author": "/api/authors/1"})),
            ))
            .await
            .unwrap();
        assert_eq!(
            response.body.unwrap()["author"],
            JsonValue::from("/api/authors/1")
        );
    }

    #[async_std::test]
    async fn test_if_match() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        bob(&db).await;

        let response = api.handle(Request::get("/api/authors/1")).await.unwrap();
        let stale = response.header("ETag").unwrap().to_string();

        // Someone else changes the author in the meantime.
        api.handle(Request::put(
            "/api/authors/1",
            mapping(json!({"name": "Robert"})),
        ))
        .await
        .unwrap();

        let err = api
            .handle(
                Request::put("/api/authors/1", mapping(json!({"name": "Bobby"}))).if_match(&stale),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed), "{err}");
        assert_eq!(err.status(), 412);
        let response = api.handle(Request::get("/api/authors/1")).await.unwrap();
        assert_eq!(response.body.as_ref().unwrap()["name"], "Robert");

        // A fresh tag, quoted or not, lets the write through.
        let fresh = response.header("ETag").unwrap().trim_matches('"').to_string();
        let response = api
            .handle(
                Request::put("/api/authors/1", mapping(json!({"name": "Bobby"}))).if_match(fresh),
            )
            .await
            .unwrap();
        assert_eq!(response.body.unwrap()["name"], "Bobby");
    }

    #[async_std::test]
    async fn test_validation_before_precondition() {
        init_logging();

        let db = Database::create(schema());
        let api = Api::builder()
            .class(
                ModelResourceClass::new("author").field(
                    AttributeField::new("name", ValueType::Text).validator(Length::between(1, 10)),
                ),
            )
            .collection(Collection::new("authors", db.queryset("author"), "author"))
            .build()
            .unwrap();
        bob(&db).await;

        let err = api
            .handle(
                Request::put("/api/authors/1", mapping(json!({"name": ""})))
                    .if_match("\"stale\""),
            )
            .await
            .unwrap_err();
        let Error::Validation { errors } = &err else {
            panic!("expected validation error, got {err}");
        };
        assert!(errors.contains_key("name"));

        let err = api
            .handle(
                Request::put("/api/authors/1", mapping(json!({"name": "Bobby"})))
                    .if_match("\"stale\""),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed), "{err}");
    }

    #[async_std::test]
    async fn test_delete() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        bob(&db).await;

        let response = api.handle(Request::delete("/api/authors/1")).await.unwrap();
        assert_eq!(response.status, Status::NoContent);
        assert_eq!(response.body, None);
        assert!(response.header("ETag").is_none());
        assert_eq!(db.len("author").await, 0);
    }

    #[async_std::test]
    async fn test_paged_request() {
        init_logging();

        let db = Database::create(schema());
        let api = Api::builder()
            .config(ApiConfig::default().with_default_page_size(2))
            .class(ModelResourceClass::new("author").field(AttributeField::new("name", ValueType::Text)))
            .collection(Collection::new("authors", db.queryset("author"), "author"))
            .build()
            .unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            db.insert("author", [("name", Attr::Value(name.into()))])
                .await
                .unwrap();
        }

        let response = api
            .handle(Request::get("/api/authors?page=1"))
            .await
            .unwrap();
        let body = response.body.unwrap();
        assert_eq!(
            body["objects"],
            json!([
                {"name": "c", "resourceUri": "/api/authors/3"},
                {"name": "d", "resourceUri": "/api/authors/4"},
            ])
        );
        assert_eq!(
            body["meta"],
            json!({"count": 5, "next": "/api/authors?page=2", "prev": "/api/authors?page=0"})
        );
    }

    #[test]
    fn test_build_errors() {
        let db = Database::create(schema());

        let err = Api::builder()
            .collection(Collection::new("authors", db.queryset("author"), "author"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownResource { .. }), "{err}");

        let err = Api::builder()
            .class(ModelResourceClass::new("author"))
            .class(ModelResourceClass::new("author"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }), "{err}");

        let err = Api::builder()
            .class(ModelResourceClass::new("book").field(SubObjectResourceField::new("author", "author")))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnknownResource { .. }), "{err}");

        let err = Api::builder()
            .class(ModelResourceClass::new("author").field(SubObjectResourceField::new("agent", "agent")))
            .class(ModelResourceClass::new("agent").field(SubObjectResourceField::new("client", "author")))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }), "{err}");
    }

    #[test]
    fn test_request() {
        let request = Request::get("/api/authors?page=2&name=Bob%20Smith#top");
        assert_eq!(request.path, "/api/authors");
        assert_eq!(
            request.params,
            Params::from([
                ("page".into(), "2".into()),
                ("name".into(), "Bob Smith".into())
            ])
        );
        let request = request.with_param("page", "3");
        assert_eq!(request.params["page"], "3");
    }
}
