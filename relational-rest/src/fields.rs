//! Bidirectional mappings between object attributes and wire keys.
//!
//! A [`Field`] connects one attribute path on a persisted object (such as `name` or
//! `author.name`) to one key of a wire-level [`Mapping`]. Every field knows how to
//!
//! * write the value found at the end of its path into an outgoing mapping
//!   ([`handle_outgoing`](Field::handle_outgoing)),
//! * read its key from an incoming mapping and write the value through its path
//!   ([`handle_incoming`](Field::handle_incoming)),
//! * register the relations its path traverses for eager loading ([`prepare`](Field::prepare)),
//! * validate an incoming value ([`validate`](Field::validate)),
//! * and ask its authorizer about a write before anything is saved
//!   ([`authorize`](Field::authorize)).
//!
//! The generic parts of these operations are implemented once here, on top of a small set of
//! per-variant hooks ([`outgoing_value`](Field::outgoing_value),
//! [`incoming_value`](Field::incoming_value), [`unchanged`](Field::unchanged), ...). The variants
//! are:
//!
//! * [`AttributeField`], a scalar leaf.
//! * [`URIResourceField`], a to-one relation represented by the address of the related resource.
//! * [`SubObjectResourceField`], a to-one relation embedded as a nested mapping.
//! * [`IterableField`], a to-many relation embedded as a list of mappings.

use crate::context::ApiContext;
use crate::error::{Error, Result};
use crate::formatter::Mapping;
use crate::orm::{Attr, ObjectRef, LOOKUP_SEP};
use crate::related::Related;
use crate::validation::{ValidationErrors, Validator};
use async_trait::async_trait;
use derivative::Derivative;
use derive_more::Deref;
use itertools::Itertools;
use serde_json::Value as JsonValue;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

mod attribute;
mod iterable;
mod sub_object;
mod uri;

pub use attribute::AttributeField;
pub use iterable::IterableField;
pub use sub_object::SubObjectResourceField;
pub use uri::URIResourceField;

/// A dotted path of attribute names, such as `author.name`.
#[derive(Clone, Debug, Deref, PartialEq, Eq, Hash)]
pub struct AttrPath(Vec<String>);

impl Display for AttrPath {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for AttrPath {
    fn from(path: &str) -> Self {
        Self(path.split('.').map(String::from).collect())
    }
}

impl AttrPath {
    /// The attribute at the end of the path.
    pub fn last(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// The relations leading to the last attribute.
    pub fn parent(&self) -> &[String] {
        self.0.split_last().map(|(_, parent)| parent).unwrap_or_default()
    }

    /// The path in `__`-separated form, as understood by query sets.
    pub fn lookup(&self) -> String {
        self.0.join(LOOKUP_SEP)
    }

    /// Follow `hops` from `obj`, returning [`None`] if an unset relation is reached.
    async fn follow(obj: &ObjectRef, hops: &[String]) -> Result<Option<ObjectRef>> {
        let mut obj = obj.clone();
        for hop in hops {
            obj = match obj.get(hop).await? {
                Attr::Object(Some(next)) => next,
                Attr::Object(None) => return Ok(None),
                _ => {
                    return Err(crate::orm::Error::unsupported(format!(
                        "{}.{hop} is not a to-one relation",
                        obj.model()
                    ))
                    .into())
                }
            };
        }
        Ok(Some(obj))
    }

    /// The object owning the last attribute of the path, if every relation leading to it is set.
    pub async fn holder(&self, obj: &ObjectRef) -> Result<Option<ObjectRef>> {
        Self::follow(obj, self.parent()).await
    }

    /// The value at the end of the path, or [`None`] if an unset relation is reached first.
    pub async fn read(&self, obj: &ObjectRef) -> Result<Option<Attr>> {
        match self.holder(obj).await? {
            Some(holder) => Ok(Some(holder.get(self.last()).await?)),
            None => Ok(None),
        }
    }
}

/// Decides whether a change to a field is permitted.
pub trait Authorizer: Send + Sync {
    /// May `target`'s attribute change from `old` to `new`?
    ///
    /// Only consulted when the write would actually change the attribute.
    fn is_write_authorized(
        &self,
        ctx: &ApiContext,
        target: &ObjectRef,
        old: &Attr,
        new: &JsonValue,
    ) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&ApiContext, &ObjectRef, &Attr, &JsonValue) -> bool + Send + Sync,
{
    fn is_write_authorized(
        &self,
        ctx: &ApiContext,
        target: &ObjectRef,
        old: &Attr,
        new: &JsonValue,
    ) -> bool {
        self(ctx, target, old, new)
    }
}

/// Settings shared by every kind of field.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct FieldOptions {
    pub path: AttrPath,
    /// Internal name, converted to the public key by the formatter.
    pub name: String,
    /// Read-only fields ignore incoming values.
    pub read_only: bool,
    /// Optional fields may be absent from incoming mappings.
    pub optional: bool,
    /// Load the relations along the path with separate queries instead of joins.
    pub prefetch: bool,
    #[derivative(Debug = "ignore")]
    pub validators: Vec<Arc<dyn Validator>>,
    #[derivative(Debug = "ignore")]
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl FieldOptions {
    pub fn new(path: &str) -> Self {
        let path = AttrPath::from(path);
        Self {
            name: path.iter().join("_"),
            path,
            read_only: false,
            optional: false,
            prefetch: false,
            validators: vec![],
            authorizer: None,
        }
    }

    /// Register the relations leading to the last attribute.
    pub fn register_parent(&self, related: &mut Related<'_>) {
        let parent = self.path.parent();
        if parent.is_empty() {
            return;
        }
        let parent = parent.join(LOOKUP_SEP);
        if self.prefetch {
            related.prefetch(&parent);
        } else {
            related.select(&parent);
        }
    }
}

/// Chainable configuration shared by all fields.
pub trait FieldBuilder: Sized {
    fn options_mut(&mut self) -> &mut FieldOptions;

    /// Use `name` instead of the attribute path for the public key.
    fn named(mut self, name: impl Into<String>) -> Self {
        self.options_mut().name = name.into();
        self
    }

    fn read_only(mut self) -> Self {
        self.options_mut().read_only = true;
        self
    }

    fn optional(mut self) -> Self {
        self.options_mut().optional = true;
        self
    }

    fn prefetch(mut self) -> Self {
        self.options_mut().prefetch = true;
        self
    }

    fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.options_mut().validators.push(Arc::new(validator));
        self
    }

    fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.options_mut().authorizer = Some(Arc::new(authorizer));
        self
    }
}

/// A mapping between one attribute path and one wire key.
#[async_trait]
pub trait Field: Debug + Send + Sync {
    fn options(&self) -> &FieldOptions;

    /// The resource class this field refers to, if any.
    fn class(&self) -> Option<&str> {
        None
    }

    /// Whether the related resource is embedded in this field's value, as opposed to referenced.
    fn embeds(&self) -> bool {
        false
    }

    /// Whether the target object must have a primary key before this field can be written.
    fn requires_saved_target(&self) -> bool {
        false
    }

    fn public_name(&self, ctx: &ApiContext) -> String {
        ctx.public_name(&self.options().name)
    }

    /// Encode the value at the end of this field's path.
    async fn outgoing_value(&self, ctx: &mut ApiContext, value: Attr) -> Result<JsonValue>;

    /// Decode `value` and write it to the attribute `attr` of `holder`.
    async fn incoming_value(
        &self,
        ctx: &mut ApiContext,
        holder: &ObjectRef,
        attr: &str,
        value: &JsonValue,
    ) -> Result<()>;

    /// Would writing `value` leave the attribute `current` as it is?
    ///
    /// # Errors
    ///
    /// Fails if `value` cannot be decoded. Callers treat that as a change.
    async fn unchanged(&self, ctx: &mut ApiContext, current: &Attr, value: &JsonValue)
        -> Result<bool>;

    /// Check that `value` can be decoded, without writing it anywhere.
    async fn check_incoming(&self, ctx: &mut ApiContext, value: &JsonValue) -> Result<()>;

    /// Write this field's value from `source` into `target`.
    ///
    /// If a relation along the path is unset, the whole field is `null`.
    async fn handle_outgoing(
        &self,
        ctx: &mut ApiContext,
        source: &ObjectRef,
        target: &mut Mapping,
    ) -> Result<()> {
        let name = self.public_name(ctx);
        let value = match self.options().path.read(source).await? {
            Some(attr) => self.outgoing_value(ctx, attr).await?,
            None => JsonValue::Null,
        };
        target.insert(name, value);
        Ok(())
    }

    /// Write this field's value from `source` into `target`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MissingKey`] if the key is absent and the field is not optional, with
    /// [`Error::UnreachablePath`] if a relation along the path is unset, and with
    /// [`Error::Authorization`] if the field's authorizer rejects the change.
    async fn handle_incoming(
        &self,
        ctx: &mut ApiContext,
        source: &Mapping,
        target: &ObjectRef,
    ) -> Result<()> {
        let opts = self.options();
        if opts.read_only {
            return Ok(());
        }
        let name = self.public_name(ctx);
        let Some(value) = source.get(&name) else {
            if opts.optional {
                return Ok(());
            }
            return Err(Error::missing_key(name));
        };

        let mut ctx = ctx.enter(target.clone());
        let holder = opts
            .path
            .holder(target)
            .await?
            .ok_or_else(|| Error::UnreachablePath {
                path: opts.path.to_string(),
                hop: opts.path.parent().join("."),
            })?;
        check_authorized(self, &mut ctx, &holder, value).await?;
        self.incoming_value(&mut ctx, &holder, opts.path.last(), value)
            .await
    }

    /// Check that writing `value` into `target` would be authorized, without writing anything.
    ///
    /// Fields embedding other resources also check every write the nested value would make.
    async fn authorize(
        &self,
        ctx: &mut ApiContext,
        target: &ObjectRef,
        value: &JsonValue,
    ) -> Result<()> {
        let mut ctx = ctx.enter(target.clone());
        match self.options().path.holder(target).await? {
            Some(holder) => check_authorized(self, &mut ctx, &holder, value).await,
            // The write itself fails.
            None => Ok(()),
        }
    }

    /// Register the relations traversed by this field for eager loading.
    fn prepare(&self, _ctx: &ApiContext, related: &mut Related<'_>) -> Result<()> {
        self.options().register_parent(related);
        Ok(())
    }

    /// The current value of the attribute, if writing `value` to it would change it.
    ///
    /// Validation is skipped and authorization is not consulted for writes that change nothing.
    /// A `value` that cannot be decoded counts as a change.
    async fn detect_change(
        &self,
        ctx: &mut ApiContext,
        holder: &ObjectRef,
        value: &JsonValue,
    ) -> Result<Option<Attr>> {
        let current = holder.get(self.options().path.last()).await?;
        match self.unchanged(ctx, &current, value).await {
            Ok(true) => Ok(None),
            Ok(false) | Err(_) => Ok(Some(current)),
        }
    }

    /// Validate `value`, recording failures under `key`.
    ///
    /// `target` is the object the value would be written to, or [`None`] if it doesn't exist yet.
    async fn validate(
        &self,
        ctx: &mut ApiContext,
        key: &str,
        target: Option<&ObjectRef>,
        value: &JsonValue,
        errors: &mut ValidationErrors,
    ) -> Result<()> {
        validate_value(self, ctx, key, target, value, errors).await
    }
}

/// Consult the authorizer of `field`, if it has one, about writing `value` into `holder`.
pub(crate) async fn check_authorized<F: Field + ?Sized>(
    field: &F,
    ctx: &mut ApiContext,
    holder: &ObjectRef,
    value: &JsonValue,
) -> Result<()> {
    let opts = field.options();
    let Some(authorizer) = &opts.authorizer else {
        return Ok(());
    };
    if let Some(old) = field.detect_change(ctx, holder, value).await? {
        if !authorizer.is_write_authorized(ctx, holder, &old, value) {
            tracing::info!("write to {} rejected", opts.path);
            return Err(Error::Authorization {
                field: field.public_name(ctx),
            });
        }
    }
    Ok(())
}

/// The checks every field runs on an incoming value: decoding, then its validators, unless the
/// value would not change the target.
pub(crate) async fn validate_value<F: Field + ?Sized>(
    field: &F,
    ctx: &mut ApiContext,
    key: &str,
    target: Option<&ObjectRef>,
    value: &JsonValue,
    errors: &mut ValidationErrors,
) -> Result<()> {
    if let Err(err) = field.check_incoming(ctx, value).await {
        errors.add(key, err.to_string());
    }
    let validators = &field.options().validators;
    if validators.is_empty() {
        return Ok(());
    }
    if let Some(target) = target {
        if let Some(holder) = field.options().path.holder(target).await? {
            if field.detect_change(ctx, &holder, value).await?.is_none() {
                return Ok(());
            }
        }
    }
    for validator in validators {
        if let Err(msg) = validator.check_value(ctx, value) {
            errors.add(key, msg);
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::api::Api;
    use crate::init_logging;
    use crate::orm::mock::{Database, Model, Schema};
    use crate::orm::{Value, ValueType};
    use crate::resources::{Collection, ModelResourceClass};
    use serde_json::json;

    /// A small library: authors write books, which carry tags and belong to a shelf.
    pub fn schema() -> Schema {
        Schema::new()
            .model(
                Model::new("author")
                    .scalar("name", ValueType::Text)
                    .scalar("age", ValueType::Int)
                    .foreign_key("agent", "agent", true)
                    .reverse("books", "book", "author", true),
            )
            .model(Model::new("agent").scalar("name", ValueType::Text))
            .model(
                Model::new("book")
                    .scalar("title", ValueType::Text)
                    .foreign_key("author", "author", true)
                    .many_to_many("tags", "tag"),
            )
            .model(Model::new("tag").scalar("name", ValueType::Text))
    }

    pub fn api(db: &Database) -> Arc<Api> {
        Api::builder()
            .class(
                ModelResourceClass::new("author")
                    .field(AttributeField::new("name", ValueType::Text))
                    .field(AttributeField::new("age", ValueType::Int).optional())
                    .field(
                        AttributeField::new("agent.name", ValueType::Text)
                            .optional()
                            .read_only(),
                    ),
            )
            .class(
                ModelResourceClass::new("book")
                    .field(AttributeField::new("title", ValueType::Text))
                    .field(URIResourceField::new("author", "author").optional()),
            )
            .collection(Collection::new("authors", db.queryset("author"), "author"))
            .collection(Collection::new("books", db.queryset("book"), "book"))
            .build()
            .unwrap()
    }

    #[async_std::test]
    async fn test_outgoing_null_intermediate() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let author = db
            .insert("author", [("name", Attr::Value("Bob".into()))])
            .await
            .unwrap();

        let field = AttributeField::new("agent.name", ValueType::Text);
        let mut mapping = Mapping::new();
        field
            .handle_outgoing(&mut ctx, &author, &mut mapping)
            .await
            .unwrap();
        assert_eq!(mapping["agentName"], JsonValue::Null);

        // Once the relation is set, the value comes through.
        let agent = db
            .insert("agent", [("name", Attr::Value("Alice".into()))])
            .await
            .unwrap();
        author.set("agent", Attr::Object(Some(agent))).unwrap();
        field
            .handle_outgoing(&mut ctx, &author, &mut mapping)
            .await
            .unwrap();
        assert_eq!(mapping["agentName"], json!("Alice"));
    }

    #[async_std::test]
    async fn test_incoming() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let author = db
            .insert("author", [("name", Attr::Value("Bob".into()))])
            .await
            .unwrap();
        let payload = json!({"name": "Robert"});
        let payload = payload.as_object().unwrap();

        // Read-only fields ignore the payload entirely.
        AttributeField::new("name", ValueType::Text)
            .read_only()
            .handle_incoming(&mut ctx, payload, &author)
            .await
            .unwrap();
        assert!(matches!(author.get("name").await.unwrap(), Attr::Value(Value::Text(s)) if s == "Bob"));

        AttributeField::new("name", ValueType::Text)
            .handle_incoming(&mut ctx, payload, &author)
            .await
            .unwrap();
        assert!(matches!(author.get("name").await.unwrap(), Attr::Value(Value::Text(s)) if s == "Robert"));
        assert!(ctx.stack().is_empty());

        // Absent keys are an error unless the field is optional.
        let age = AttributeField::new("age", ValueType::Int);
        assert!(matches!(
            age.handle_incoming(&mut ctx, payload, &author).await,
            Err(Error::MissingKey { key }) if key == "age"
        ));
        age.optional()
            .handle_incoming(&mut ctx, payload, &author)
            .await
            .unwrap();

        // Writing through an unset relation is an error, and leaves the stack balanced.
        let payload = json!({"agentName": "Alice"});
        assert!(matches!(
            AttributeField::new("agent.name", ValueType::Text)
                .handle_incoming(&mut ctx, payload.as_object().unwrap(), &author)
                .await,
            Err(Error::UnreachablePath { .. })
        ));
        assert!(ctx.stack().is_empty());
    }

    #[async_std::test]
    async fn test_authorization() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let mut ctx = api.context();
        let author = db
            .insert(
                "author",
                [
                    ("name", Attr::Value("Bob".into())),
                    ("age", Attr::Value(20.into())),
                ],
            )
            .await
            .unwrap();

        let field = AttributeField::new("age", ValueType::Int).authorizer(
            |ctx: &ApiContext, target: &ObjectRef, _old: &Attr, new: &JsonValue| {
                // The object being written is visible on the stack.
                assert!(ctx.current().is_some());
                assert_eq!(target.model(), "author");
                new.as_i64().map(|age| age < 100).unwrap_or(false)
            },
        );

        // Unchanged values never reach the authorizer, even when it would refuse them.
        field
            .handle_incoming(&mut ctx, json!({"age": "20"}).as_object().unwrap(), &author)
            .await
            .unwrap();
        field
            .handle_incoming(&mut ctx, json!({"age": 30}).as_object().unwrap(), &author)
            .await
            .unwrap();
        assert!(matches!(
            field
                .handle_incoming(&mut ctx, json!({"age": 130}).as_object().unwrap(), &author)
                .await,
            Err(Error::Authorization { field }) if field == "age"
        ));
        assert!(matches!(author.get("age").await.unwrap(), Attr::Value(Value::Int(30))));
        assert!(ctx.stack().is_empty());
    }

    #[async_std::test]
    async fn test_prepare() {
        init_logging();

        let db = Database::create(schema());
        let api = api(&db);
        let ctx = api.context();

        let mut plan = crate::related::QueryPlan::new();
        AttributeField::new("agent.name", ValueType::Text)
            .prepare(&ctx, &mut plan.related())
            .unwrap();
        AttributeField::new("name", ValueType::Text)
            .prepare(&ctx, &mut plan.related())
            .unwrap();
        AttributeField::new("author.agent.name", ValueType::Text)
            .prefetch()
            .prepare(&ctx, &mut plan.related())
            .unwrap();
        assert_eq!(plan.selected().iter().collect::<Vec<_>>(), ["agent"]);
        assert_eq!(plan.prefetched().iter().collect::<Vec<_>>(), ["author__agent"]);
    }
}
