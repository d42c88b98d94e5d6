//! Mock instantiation of the abstract [`orm`](super) interface.
//!
//! This instantiation is built on a simple in-memory database. It is useful for testing in
//! isolation from an actual database. It behaves like a typical relational ORM where it matters
//! to resources: attribute writes are buffered until `save`, an object referencing an unsaved
//! object cannot be saved, non-nullable foreign keys must be set, and to-one relations are loaded
//! lazily unless they were preloaded by `select_related` or `prefetch_related`. Every read query
//! is counted, so tests can check that eager loading actually saves round trips.
#![cfg(any(test, feature = "mocks"))]

use super::{
    Aggregate, Attr, Error, Object, ObjectRef, Predicates, QuerySet, RelatedManager, RelationKind,
    Value, ValueType, LOOKUP_SEP, PK,
};
use async_std::sync::RwLock;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use itertools::Itertools;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lookups understood by [`MockQuerySet::filter`], as the last segment of a predicate key.
const LOOKUPS: &[&str] = &[
    "exact",
    "iexact",
    "ne",
    "contains",
    "icontains",
    "startswith",
    "gt",
    "gte",
    "lt",
    "lte",
    "isnull",
];

/// The definition of an attribute in a mock [`Model`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrDef {
    Scalar(ValueType),
    ForeignKey {
        model: String,
        nullable: bool,
    },
    ManyToMany {
        model: String,
    },
    /// The reverse side of the foreign key `field` on `model`.
    Reverse {
        model: String,
        field: String,
        nullable: bool,
        through: bool,
    },
}

/// The schema of a single table.
#[derive(Clone, Debug)]
pub struct Model {
    name: String,
    attrs: Vec<(String, AttrDef)>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: vec![],
        }
    }

    /// Add a scalar column.
    pub fn scalar(self, name: impl Into<String>, ty: ValueType) -> Self {
        self.attr(name, AttrDef::Scalar(ty))
    }

    /// Add a foreign key referencing `model`.
    pub fn foreign_key(self, name: impl Into<String>, model: impl Into<String>, nullable: bool) -> Self {
        self.attr(
            name,
            AttrDef::ForeignKey {
                model: model.into(),
                nullable,
            },
        )
    }

    /// Add a many-to-many relation to `model`.
    pub fn many_to_many(self, name: impl Into<String>, model: impl Into<String>) -> Self {
        self.attr(
            name,
            AttrDef::ManyToMany {
                model: model.into(),
            },
        )
    }

    /// Expose the objects of `model` whose foreign key `field` references this model.
    pub fn reverse(
        self,
        name: impl Into<String>,
        model: impl Into<String>,
        field: impl Into<String>,
        nullable: bool,
    ) -> Self {
        self.attr(
            name,
            AttrDef::Reverse {
                model: model.into(),
                field: field.into(),
                nullable,
                through: false,
            },
        )
    }

    /// Expose the rows of the intermediate model `model` which link this model to another.
    pub fn through(
        self,
        name: impl Into<String>,
        model: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        self.attr(
            name,
            AttrDef::Reverse {
                model: model.into(),
                field: field.into(),
                nullable: false,
                through: true,
            },
        )
    }

    fn attr(mut self, name: impl Into<String>, def: AttrDef) -> Self {
        self.attrs.push((name.into(), def));
        self
    }

    fn get(&self, name: &str) -> Option<&AttrDef> {
        self.attrs
            .iter()
            .find_map(|(attr, def)| (attr == name).then_some(def))
    }
}

/// The schema of a mock database.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    models: HashMap<String, Model>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model to the schema.
    pub fn model(mut self, model: Model) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    fn get(&self, name: &str) -> Result<&Model, Error> {
        self.models
            .get(name)
            .ok_or_else(|| Error::backend(format!("no such table {name}")))
    }
}

/// The in-memory database.
#[derive(Debug, Default)]
struct Db {
    tables: HashMap<String, Table>,
    /// Many-to-many memberships, keyed by owning model and attribute.
    links: HashMap<(String, String), BTreeSet<(i64, i64)>>,
}

/// An in-memory table.
#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<i64, Row>,
    last_pk: i64,
}

/// A row in an in-memory table.
#[derive(Clone, Debug, Default)]
struct Row {
    values: HashMap<String, Value>,
    fks: HashMap<String, Option<i64>>,
}

/// A connection to the in-memory database.
#[derive(Clone, Debug)]
pub struct Database {
    schema: Arc<Schema>,
    db: Arc<RwLock<Db>>,
    queries: Arc<AtomicUsize>,
}

impl Database {
    /// Create a new database with the given schema and connect to it.
    ///
    /// This will create a connection to a fresh, empty database. Once the database is created,
    /// this connection can be [cloned](Clone) in order to create multiple simultaneous
    /// connections to the same database.
    pub fn create(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            db: Default::default(),
            queries: Default::default(),
        }
    }

    /// A query returning all objects of `model`.
    pub fn queryset(&self, model: impl Into<String>) -> Arc<dyn QuerySet> {
        Arc::new(MockQuerySet {
            db: self.clone(),
            model: model.into(),
            ops: vec![],
        })
    }

    /// Create and save an object of `model` with the given attributes.
    pub async fn insert<I, K>(&self, model: &str, attrs: I) -> Result<ObjectRef, Error>
    where
        I: IntoIterator<Item = (K, Attr)>,
        K: AsRef<str>,
    {
        let obj: ObjectRef = Arc::new(MockObject::new(self.clone(), model));
        for (name, value) in attrs {
            obj.set(name.as_ref(), value)?;
        }
        obj.save().await?;
        Ok(obj)
    }

    /// Load a fresh copy of the object of `model` with primary key `pk`.
    pub async fn load(&self, model: &str, pk: i64) -> Result<Option<ObjectRef>, Error> {
        self.record_query(format_args!("SELECT * FROM {model} WHERE pk = {pk}"));
        Ok(self.row(model, pk).await.map(MockObject::into_ref))
    }

    /// The number of rows in the table for `model`.
    pub async fn len(&self, model: &str) -> usize {
        self.db
            .read()
            .await
            .tables
            .get(model)
            .map(|table| table.rows.len())
            .unwrap_or(0)
    }

    /// The number of read queries executed against this database so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(atomic::Ordering::SeqCst)
    }

    fn record_query(&self, query: impl Display) {
        self.queries.fetch_add(1, atomic::Ordering::SeqCst);
        tracing::info!("{query}");
    }

    fn materialize(&self, model: &str, pk: i64, row: Row) -> MockObject {
        MockObject(Arc::new(Inner {
            db: self.clone(),
            model: model.into(),
            state: Mutex::new(State {
                pk: Some(pk),
                row,
                ..Default::default()
            }),
        }))
    }

    async fn row(&self, model: &str, pk: i64) -> Option<MockObject> {
        let row = self
            .db
            .read()
            .await
            .tables
            .get(model)
            .and_then(|table| table.rows.get(&pk))
            .cloned();
        row.map(|row| self.materialize(model, pk, row))
    }

    async fn rows(&self, model: &str) -> Result<Vec<MockObject>, Error> {
        self.schema.get(model)?;
        self.record_query(format_args!("SELECT * FROM {model}"));
        let rows = self
            .db
            .read()
            .await
            .tables
            .get(model)
            .map(|table| {
                table
                    .rows
                    .iter()
                    .map(|(pk, row)| (*pk, row.clone()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|(pk, row)| self.materialize(model, pk, row))
            .collect())
    }

    /// The members of the to-many relation `attr` of the object `owner_pk` of `owner`.
    async fn members(
        &self,
        owner: &str,
        attr: &str,
        def: &AttrDef,
        owner_pk: i64,
    ) -> Result<Vec<MockObject>, Error> {
        let db = self.db.read().await;
        let (model, rows) = match def {
            AttrDef::ManyToMany { model } => {
                let table = db.tables.get(model);
                let rows = db
                    .links
                    .get(&(owner.to_string(), attr.to_string()))
                    .into_iter()
                    .flatten()
                    .filter(|(from, _)| *from == owner_pk)
                    .filter_map(|(_, to)| {
                        table
                            .and_then(|table| table.rows.get(to))
                            .map(|row| (*to, row.clone()))
                    })
                    .collect::<Vec<_>>();
                (model, rows)
            }
            AttrDef::Reverse { model, field, .. } => {
                let rows = db
                    .tables
                    .get(model)
                    .into_iter()
                    .flat_map(|table| &table.rows)
                    .filter(|(_, row)| row.fks.get(field).copied().flatten() == Some(owner_pk))
                    .map(|(pk, row)| (*pk, row.clone()))
                    .collect::<Vec<_>>();
                (model, rows)
            }
            _ => {
                return Err(Error::unsupported(format!(
                    "{owner}.{attr} is not a to-many relation"
                )))
            }
        };
        Ok(rows
            .into_iter()
            .map(|(pk, row)| self.materialize(model, pk, row))
            .collect())
    }

    async fn write_row(&self, model: &str, pk: Option<i64>, row: Row) -> i64 {
        let mut db = self.db.write().await;
        let table = db.tables.entry(model.to_string()).or_default();
        let pk = match pk {
            Some(pk) => pk,
            None => {
                table.last_pk += 1;
                table.last_pk
            }
        };
        table.last_pk = table.last_pk.max(pk);
        if table.rows.insert(pk, row).is_some() {
            tracing::info!("UPDATE {model} WHERE pk = {pk}");
        } else {
            tracing::info!("INSERT INTO {model} (pk = {pk})");
        }
        pk
    }

    async fn delete_row(&self, model: &str, pk: i64) {
        tracing::info!("DELETE FROM {model} WHERE pk = {pk}");
        let mut db = self.db.write().await;
        if let Some(table) = db.tables.get_mut(model) {
            table.rows.remove(&pk);
        }

        // Drop any many-to-many memberships the row took part in.
        for ((owner, attr), links) in db.links.iter_mut() {
            let target = match self.schema.get(owner).ok().and_then(|m| m.get(attr)) {
                Some(AttrDef::ManyToMany { model }) => model.as_str(),
                _ => continue,
            };
            links.retain(|(from, to)| {
                !((owner == model && *from == pk) || (target == model && *to == pk))
            });
        }
    }

    async fn link(&self, owner: &str, attr: &str, from: i64, to: i64, present: bool) {
        let mut db = self.db.write().await;
        let links = db
            .links
            .entry((owner.to_string(), attr.to_string()))
            .or_default();
        if present {
            tracing::info!("INSERT INTO {owner}_{attr} ({from}, {to})");
            links.insert((from, to));
        } else {
            tracing::info!("DELETE FROM {owner}_{attr} WHERE ({from}, {to})");
            links.remove(&(from, to));
        }
    }
}

/// An object in the in-memory database.
#[derive(Clone)]
pub struct MockObject(Arc<Inner>);

struct Inner {
    db: Database,
    model: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pk: Option<i64>,
    row: Row,
    /// Loaded (or assigned) targets of to-one relations.
    related: HashMap<String, Option<ObjectRef>>,
    /// Preloaded members of to-many relations.
    many: HashMap<String, Vec<ObjectRef>>,
}

impl Debug for MockObject {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("MockObject")
            .field("model", &self.0.model)
            .field("pk", &self.state().pk)
            .finish()
    }
}

impl MockObject {
    fn new(db: Database, model: impl Into<String>) -> Self {
        Self(Arc::new(Inner {
            db,
            model: model.into(),
            state: Default::default(),
        }))
    }

    fn into_ref(self) -> ObjectRef {
        Arc::new(self)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schema(&self) -> Result<&Model, Error> {
        self.0.db.schema.get(&self.0.model)
    }

    fn def(&self, attr: &str) -> Result<&AttrDef, Error> {
        self.schema()?
            .get(attr)
            .ok_or_else(|| Error::unknown_attribute(&self.0.model, attr))
    }

    fn fk(&self, attr: &str) -> Option<i64> {
        self.state().row.fks.get(attr).copied().flatten()
    }

    fn annotate(&self, name: &str, value: Value) {
        self.state().row.values.insert(name.to_string(), value);
    }

    fn manager(&self, attr: &str, def: &AttrDef) -> Manager {
        Manager {
            owner: self.clone(),
            attr: attr.to_string(),
            def: def.clone(),
        }
    }
}

fn int_pk(obj: &ObjectRef) -> Option<i64> {
    match obj.pk() {
        Some(Value::Int(pk)) => Some(pk),
        _ => None,
    }
}

#[async_trait]
impl Object for MockObject {
    fn model(&self) -> &str {
        &self.0.model
    }

    fn pk(&self) -> Option<Value> {
        self.state().pk.map(Value::Int)
    }

    async fn get(&self, attr: &str) -> Result<Attr, Error> {
        if attr == PK {
            return Ok(Attr::Value(self.pk().into()));
        }
        let Some(def) = self.schema()?.get(attr) else {
            // Annotations live alongside the regular columns.
            return self
                .state()
                .row
                .values
                .get(attr)
                .cloned()
                .map(Attr::Value)
                .ok_or_else(|| Error::unknown_attribute(&self.0.model, attr));
        };
        match def {
            AttrDef::Scalar(_) => Ok(Attr::Value(
                self.state()
                    .row
                    .values
                    .get(attr)
                    .cloned()
                    .unwrap_or(Value::Null),
            )),
            AttrDef::ForeignKey { model, .. } => {
                if let Some(obj) = self.state().related.get(attr) {
                    return Ok(Attr::Object(obj.clone()));
                }
                let Some(fk) = self.fk(attr) else {
                    return Ok(Attr::Object(None));
                };
                let obj = self.0.db.load(model, fk).await?;
                self.state().related.insert(attr.to_string(), obj.clone());
                Ok(Attr::Object(obj))
            }
            many => Ok(Attr::Many(Arc::new(self.manager(attr, many)))),
        }
    }

    fn set(&self, attr: &str, value: Attr) -> Result<(), Error> {
        if attr == PK {
            return Err(Error::unsupported("primary keys are assigned on save"));
        }
        match (self.def(attr)?, value) {
            (AttrDef::Scalar(ty), Attr::Value(value)) => {
                let fits = match value.ty() {
                    None => true,
                    Some(actual) => actual == *ty || (*ty == ValueType::Float && actual == ValueType::Int),
                };
                if !fits {
                    return Err(Error::TypeMismatch {
                        error: format!("cannot store {value} in {} column {attr}", ty),
                    });
                }
                self.state().row.values.insert(attr.to_string(), value);
                Ok(())
            }
            (AttrDef::ForeignKey { model, .. }, Attr::Object(obj)) => {
                if let Some(obj) = &obj {
                    if obj.model() != model {
                        return Err(Error::TypeMismatch {
                            error: format!("{attr} must reference {model}, not {}", obj.model()),
                        });
                    }
                }
                let mut state = self.state();
                state
                    .row
                    .fks
                    .insert(attr.to_string(), obj.as_ref().and_then(int_pk));
                state.related.insert(attr.to_string(), obj);
                Ok(())
            }
            (AttrDef::ManyToMany { .. } | AttrDef::Reverse { .. }, _) => Err(Error::unsupported(
                format!("{attr} is a to-many relation; use its manager"),
            )),
            (_, value) => Err(Error::TypeMismatch {
                error: format!("cannot assign {value:?} to {}.{attr}", self.0.model),
            }),
        }
    }

    fn new_related(&self, attr: &str) -> Result<ObjectRef, Error> {
        match self.def(attr)? {
            AttrDef::ForeignKey { model, .. }
            | AttrDef::ManyToMany { model }
            | AttrDef::Reverse { model, .. } => {
                Ok(MockObject::new(self.0.db.clone(), model.clone()).into_ref())
            }
            AttrDef::Scalar(_) => Err(Error::unsupported(format!(
                "{}.{attr} is not a relation",
                self.0.model
            ))),
        }
    }

    async fn save(&self) -> Result<(), Error> {
        let model = self.schema()?;
        let (pk, row) = {
            let mut state = self.state();
            for (name, def) in &model.attrs {
                let AttrDef::ForeignKey { nullable, .. } = def else {
                    continue;
                };
                let fk = match state.related.get(name) {
                    Some(Some(obj)) => Some(int_pk(obj).ok_or_else(|| Error::Integrity {
                        error: format!(
                            "save() prohibited to prevent data loss due to unsaved related object '{name}'"
                        ),
                    })?),
                    Some(None) => None,
                    None => state.row.fks.get(name).copied().flatten(),
                };
                if fk.is_none() && !nullable {
                    return Err(Error::Integrity {
                        error: format!("NOT NULL constraint failed: {}.{name}", model.name),
                    });
                }
                state.row.fks.insert(name.clone(), fk);
            }
            (state.pk, state.row.clone())
        };
        let pk = self.0.db.write_row(&self.0.model, pk, row).await;
        self.state().pk = Some(pk);
        Ok(())
    }

    async fn delete(&self) -> Result<(), Error> {
        let pk = self.state().pk.ok_or_else(|| Error::Integrity {
            error: format!(
                "{} object can't be deleted because its pk is None",
                self.0.model
            ),
        })?;
        self.0.db.delete_row(&self.0.model, pk).await;
        self.state().pk = None;
        Ok(())
    }
}

/// The manager of a to-many relation of a [`MockObject`].
#[derive(Debug)]
struct Manager {
    owner: MockObject,
    attr: String,
    def: AttrDef,
}

impl Manager {
    fn invalidate(&self) {
        self.owner.state().many.remove(&self.attr);
    }

    fn owner_pk(&self) -> Result<i64, Error> {
        self.owner.state().pk.ok_or_else(|| Error::Integrity {
            error: format!(
                "{} instance needs a primary key before {} can be used",
                self.owner.0.model, self.attr
            ),
        })
    }
}

#[async_trait]
impl RelatedManager for Manager {
    fn kind(&self) -> RelationKind {
        match self.def {
            AttrDef::Reverse { through: true, .. } => RelationKind::Through,
            AttrDef::Reverse { nullable, .. } => RelationKind::ReverseForeignKey { nullable },
            _ => RelationKind::ManyToMany,
        }
    }

    async fn all(&self) -> Result<Vec<ObjectRef>, Error> {
        if let Some(cached) = self.owner.state().many.get(&self.attr) {
            // Members deleted since they were preloaded have lost their keys.
            return Ok(cached
                .iter()
                .filter(|obj| obj.pk().is_some())
                .cloned()
                .collect());
        }
        let Some(pk) = self.owner.state().pk else {
            return Ok(vec![]);
        };
        let db = &self.owner.0.db;
        db.record_query(format_args!(
            "SELECT * FROM {}.{} WHERE owner = {pk}",
            self.owner.0.model, self.attr
        ));
        Ok(db
            .members(&self.owner.0.model, &self.attr, &self.def, pk)
            .await?
            .into_iter()
            .map(MockObject::into_ref)
            .collect())
    }

    fn new_object(&self) -> ObjectRef {
        let model = match &self.def {
            AttrDef::ManyToMany { model } | AttrDef::Reverse { model, .. } => model.clone(),
            _ => self.owner.0.model.clone(),
        };
        MockObject::new(self.owner.0.db.clone(), model).into_ref()
    }

    fn link(&self, obj: &ObjectRef) -> Result<(), Error> {
        let AttrDef::Reverse { field, .. } = &self.def else {
            return Err(Error::unsupported(format!(
                "{} is linked through a join table",
                self.attr
            )));
        };
        obj.set(field, Attr::Object(Some(self.owner.clone().into_ref())))?;
        self.invalidate();
        Ok(())
    }

    async fn add(&self, obj: &ObjectRef) -> Result<(), Error> {
        match &self.def {
            AttrDef::ManyToMany { model } => {
                if obj.model() != model {
                    return Err(Error::TypeMismatch {
                        error: format!("{} must contain {model}, not {}", self.attr, obj.model()),
                    });
                }
                let from = self.owner_pk()?;
                let to = int_pk(obj).ok_or_else(|| Error::Integrity {
                    error: format!("cannot add unsaved {} to {}", obj.model(), self.attr),
                })?;
                self.owner
                    .0
                    .db
                    .link(&self.owner.0.model, &self.attr, from, to, true)
                    .await;
                self.invalidate();
                Ok(())
            }
            _ => {
                self.link(obj)?;
                obj.save().await
            }
        }
    }

    async fn remove(&self, obj: &ObjectRef) -> Result<(), Error> {
        match &self.def {
            AttrDef::ManyToMany { .. } => {
                let from = self.owner_pk()?;
                if let Some(to) = int_pk(obj) {
                    self.owner
                        .0
                        .db
                        .link(&self.owner.0.model, &self.attr, from, to, false)
                        .await;
                }
                self.invalidate();
                Ok(())
            }
            AttrDef::Reverse {
                field,
                nullable: true,
                through: false,
                ..
            } => {
                obj.set(field, Attr::Object(None))?;
                obj.save().await?;
                self.invalidate();
                Ok(())
            }
            _ => Err(Error::unsupported(format!(
                "{} does not permit removal; delete the object instead",
                self.attr
            ))),
        }
    }
}

/// A lazily evaluated query against the in-memory database.
#[derive(Clone, Debug)]
pub struct MockQuerySet {
    db: Database,
    model: String,
    ops: Vec<Op>,
}

#[derive(Clone, Debug)]
enum Op {
    Filter(Predicates),
    OrderBy(Vec<String>),
    Slice(usize, Option<usize>),
    SelectRelated(Vec<String>),
    PrefetchRelated(Vec<String>),
    Annotate(String, Aggregate),
}

impl MockQuerySet {
    fn with(&self, op: Op) -> Box<dyn QuerySet> {
        let mut qs = self.clone();
        qs.ops.push(op);
        Box::new(qs)
    }

    /// Run the query, applying each operation in the order it was added.
    async fn evaluate(&self, preload: bool) -> Result<Vec<MockObject>, Error> {
        let mut objects = self.db.rows(&self.model).await?;
        let mut paths = vec![];
        for op in &self.ops {
            match op {
                Op::Filter(predicates) => {
                    tracing::info!("WHERE {predicates:?}");
                    let mut kept = vec![];
                    for obj in objects {
                        if matches(obj.clone().into_ref(), predicates).await? {
                            kept.push(obj);
                        }
                    }
                    objects = kept;
                }
                Op::OrderBy(fields) => {
                    tracing::info!("ORDER BY {}", fields.iter().join(", "));
                    objects = order(objects, fields).await?;
                }
                Op::Slice(offset, limit) => {
                    tracing::info!("OFFSET {offset} LIMIT {limit:?}");
                    objects = objects
                        .into_iter()
                        .skip(*offset)
                        .take(limit.unwrap_or(usize::MAX))
                        .collect();
                }
                Op::Annotate(name, aggregate) => {
                    for obj in &objects {
                        let value = compute(obj.clone().into_ref(), aggregate).await?;
                        obj.annotate(name, value);
                    }
                }
                Op::SelectRelated(more) | Op::PrefetchRelated(more) => {
                    paths.extend(more.iter().cloned())
                }
            }
        }
        if preload {
            for path in paths {
                let hops = path.split(LOOKUP_SEP).map(String::from).collect::<Vec<_>>();
                preload_path(&self.db, &objects, &hops).await?;
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl QuerySet for MockQuerySet {
    fn model(&self) -> &str {
        &self.model
    }

    fn all(&self) -> Box<dyn QuerySet> {
        Box::new(self.clone())
    }

    fn filter(&self, predicates: &Predicates) -> Box<dyn QuerySet> {
        self.with(Op::Filter(predicates.clone()))
    }

    fn order_by(&self, fields: &[String]) -> Box<dyn QuerySet> {
        self.with(Op::OrderBy(fields.to_vec()))
    }

    fn slice(&self, offset: usize, limit: Option<usize>) -> Box<dyn QuerySet> {
        self.with(Op::Slice(offset, limit))
    }

    fn select_related(&self, paths: &[String]) -> Box<dyn QuerySet> {
        self.with(Op::SelectRelated(paths.to_vec()))
    }

    fn prefetch_related(&self, paths: &[String]) -> Box<dyn QuerySet> {
        self.with(Op::PrefetchRelated(paths.to_vec()))
    }

    fn annotate(&self, name: &str, aggregate: &Aggregate) -> Box<dyn QuerySet> {
        self.with(Op::Annotate(name.to_string(), aggregate.clone()))
    }

    fn new_object(&self) -> ObjectRef {
        MockObject::new(self.db.clone(), self.model.clone()).into_ref()
    }

    async fn count(&self) -> Result<usize, Error> {
        Ok(self.evaluate(false).await?.len())
    }

    async fn fetch(&self) -> Result<Vec<ObjectRef>, Error> {
        Ok(self
            .evaluate(true)
            .await?
            .into_iter()
            .map(MockObject::into_ref)
            .collect())
    }

    async fn get(&self, predicates: &Predicates) -> Result<ObjectRef, Error> {
        let mut qs = self.clone();
        qs.ops.push(Op::Filter(predicates.clone()));
        let mut objects = qs.evaluate(true).await?;
        match objects.len() {
            0 => Err(Error::DoesNotExist {
                model: self.model.clone(),
            }),
            1 => Ok(objects.remove(0).into_ref()),
            count => Err(Error::MultipleObjectsReturned {
                model: self.model.clone(),
                count,
            }),
        }
    }
}

/// All values reachable from `obj` along `path`.
///
/// A path through a to-many relation fans out, so there may be many values. A path ending at a
/// relation yields the primary keys of the related objects.
fn values_at(obj: ObjectRef, path: &[String]) -> BoxFuture<'_, Result<Vec<Value>, Error>> {
    async move {
        let Some((head, rest)) = path.split_first() else {
            return Ok(vec![]);
        };
        match obj.get(head).await? {
            Attr::Value(value) if rest.is_empty() => Ok(vec![value]),
            Attr::Value(_) => Err(Error::unknown_attribute(obj.model(), rest.join(LOOKUP_SEP))),
            Attr::Object(None) => Ok(vec![Value::Null]),
            Attr::Object(Some(related)) if rest.is_empty() => Ok(vec![related.pk().into()]),
            Attr::Object(Some(related)) => values_at(related, rest).await,
            Attr::Many(manager) => {
                let mut values = vec![];
                for related in manager.all().await? {
                    if rest.is_empty() {
                        values.push(related.pk().into());
                    } else {
                        values.extend(values_at(related, rest).await?);
                    }
                }
                Ok(values)
            }
        }
    }
    .boxed()
}

/// Split a predicate key into an attribute path and a lookup.
fn parse_lookup(key: &str) -> (Vec<String>, &str) {
    let mut path = key.split(LOOKUP_SEP).collect::<Vec<_>>();
    let lookup = match path.last() {
        Some(last) if path.len() > 1 && LOOKUPS.contains(last) => path.pop().unwrap_or("exact"),
        _ => "exact",
    };
    (path.into_iter().map(String::from).collect(), lookup)
}

async fn matches(obj: ObjectRef, predicates: &Predicates) -> Result<bool, Error> {
    for (key, param) in predicates {
        let (path, lookup) = parse_lookup(key);
        let values = values_at(obj.clone(), &path).await?;
        if !values.iter().any(|value| test(value, lookup, param)) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn test(value: &Value, lookup: &str, param: &Value) -> bool {
    let text = |v: &Value| match v {
        Value::Text(s) => Some(s.clone()),
        _ => None,
    };
    let cmp = value.compare(param);
    match lookup {
        "exact" => cmp == Some(Ordering::Equal),
        "ne" => cmp != Some(Ordering::Equal),
        "gt" => !value.is_null() && cmp == Some(Ordering::Greater),
        "gte" => !value.is_null() && matches!(cmp, Some(Ordering::Greater | Ordering::Equal)),
        "lt" => !value.is_null() && cmp == Some(Ordering::Less),
        "lte" => !value.is_null() && matches!(cmp, Some(Ordering::Less | Ordering::Equal)),
        "isnull" => *param == Value::Bool(value.is_null()),
        "iexact" | "contains" | "icontains" | "startswith" => {
            let (Some(value), Some(param)) = (text(value), text(param)) else {
                return false;
            };
            match lookup {
                "iexact" => value.to_lowercase() == param.to_lowercase(),
                "contains" => value.contains(&param),
                "icontains" => value.to_lowercase().contains(&param.to_lowercase()),
                _ => value.starts_with(&param),
            }
        }
        _ => false,
    }
}

async fn order(objects: Vec<MockObject>, fields: &[String]) -> Result<Vec<MockObject>, Error> {
    let mut keyed = vec![];
    for obj in objects {
        let mut key = vec![];
        for field in fields {
            let path = field
                .trim_start_matches('-')
                .split(LOOKUP_SEP)
                .map(String::from)
                .collect::<Vec<_>>();
            let value = values_at(obj.clone().into_ref(), &path)
                .await?
                .into_iter()
                .next()
                .unwrap_or(Value::Null);
            key.push(value);
        }
        keyed.push((key, obj));
    }
    keyed.sort_by(|(l, _), (r, _)| {
        for ((l, r), field) in l.iter().zip(r).zip(fields) {
            let ord = l.compare(r).unwrap_or(Ordering::Equal);
            let ord = if field.starts_with('-') { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(keyed.into_iter().map(|(_, obj)| obj).collect())
}

async fn compute(obj: ObjectRef, aggregate: &Aggregate) -> Result<Value, Error> {
    match aggregate {
        Aggregate::Count(path) => {
            let path = path.split(LOOKUP_SEP).map(String::from).collect::<Vec<_>>();
            let values = values_at(obj, &path).await?;
            Ok(Value::Int(values.iter().filter(|v| !v.is_null()).count() as i64))
        }
    }
}

/// Load the relations along `path` for all of `objects` with one query per hop.
fn preload_path<'a>(
    db: &'a Database,
    objects: &'a [MockObject],
    path: &'a [String],
) -> BoxFuture<'a, Result<(), Error>> {
    async move {
        let (Some((head, rest)), Some(first)) = (path.split_first(), objects.first()) else {
            return Ok(());
        };
        let def = first.def(head)?.clone();
        db.record_query(format_args!(
            "SELECT * FROM {}.{head} -- preloading for {} rows",
            first.0.model,
            objects.len()
        ));
        let mut next = vec![];
        for obj in objects {
            match &def {
                AttrDef::Scalar(_) => {
                    return Err(Error::unsupported(format!(
                        "{}.{head} is not a relation",
                        first.0.model
                    )))
                }
                AttrDef::ForeignKey { model, .. } => {
                    let related = match obj.fk(head) {
                        Some(pk) => db.row(model, pk).await,
                        None => None,
                    };
                    next.extend(related.clone());
                    obj.state()
                        .related
                        .insert(head.clone(), related.map(MockObject::into_ref));
                }
                many => {
                    let Some(pk) = obj.state().pk else {
                        continue;
                    };
                    let members = db.members(&obj.0.model, head, many, pk).await?;
                    obj.state().many.insert(
                        head.clone(),
                        members.iter().cloned().map(MockObject::into_ref).collect(),
                    );
                    next.extend(members);
                }
            }
        }
        preload_path(db, &next, rest).await
    }
    .boxed()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::init_logging;
    use crate::orm::QuerySetExt;

    fn schema() -> Schema {
        Schema::new()
            .model(
                Model::new("author")
                    .scalar("name", ValueType::Text)
                    .scalar("born", ValueType::Int)
                    .reverse("books", "book", "author", false),
            )
            .model(
                Model::new("book")
                    .scalar("title", ValueType::Text)
                    .foreign_key("author", "author", false)
                    .many_to_many("tags", "tag"),
            )
            .model(Model::new("tag").scalar("name", ValueType::Text))
    }

    async fn author(db: &Database, name: &str, born: i64) -> ObjectRef {
        db.insert(
            "author",
            [
                ("name", Attr::Value(name.into())),
                ("born", Attr::Value(born.into())),
            ],
        )
        .await
        .unwrap()
    }

    async fn book(db: &Database, title: &str, author: &ObjectRef) -> ObjectRef {
        db.insert(
            "book",
            [
                ("title", Attr::Value(title.into())),
                ("author", Attr::Object(Some(author.clone()))),
            ],
        )
        .await
        .unwrap()
    }

    #[async_std::test]
    async fn test_round_trip() {
        init_logging();

        let db = Database::create(schema());
        let tolkien = author(&db, "Tolkien", 1892).await;
        assert_eq!(tolkien.pk(), Some(Value::Int(1)));

        let loaded = db.load("author", 1).await.unwrap().unwrap();
        let Attr::Value(name) = loaded.get("name").await.unwrap() else {
            panic!("name is not a scalar");
        };
        assert_eq!(name, Value::from("Tolkien"));

        // Writes are buffered until saved.
        loaded.set("name", Attr::Value("J.R.R. Tolkien".into())).unwrap();
        let stale = db.load("author", 1).await.unwrap().unwrap();
        assert!(matches!(stale.get("name").await.unwrap(), Attr::Value(Value::Text(s)) if s == "Tolkien"));
        loaded.save().await.unwrap();
        let fresh = db.load("author", 1).await.unwrap().unwrap();
        assert!(matches!(fresh.get("name").await.unwrap(), Attr::Value(Value::Text(s)) if s == "J.R.R. Tolkien"));
    }

    #[async_std::test]
    async fn test_unsaved_related_object() {
        init_logging();

        let db = Database::create(schema());
        let qs = db.queryset("book");
        let book = qs.new_object();
        book.set("title", Attr::Value("The Hobbit".into())).unwrap();

        // A non-nullable foreign key must be set.
        assert!(matches!(book.save().await, Err(Error::Integrity { .. })));

        // And it must reference a saved object.
        let author = book.new_related("author").unwrap();
        author.set("name", Attr::Value("Tolkien".into())).unwrap();
        book.set("author", Attr::Object(Some(author.clone()))).unwrap();
        assert!(matches!(book.save().await, Err(Error::Integrity { .. })));

        author.save().await.unwrap();
        book.save().await.unwrap();
        assert_eq!(db.len("book").await, 1);
    }

    #[async_std::test]
    async fn test_filter_order_slice() {
        init_logging();

        let db = Database::create(schema());
        let tolkien = author(&db, "Tolkien", 1892).await;
        let lewis = author(&db, "Lewis", 1898).await;
        book(&db, "The Hobbit", &tolkien).await;
        book(&db, "Narnia", &lewis).await;
        book(&db, "Silmarillion", &tolkien).await;

        let qs = db.queryset("book");
        let titles = |objs: Vec<ObjectRef>| async move {
            let mut titles = vec![];
            for obj in objs {
                if let Attr::Value(Value::Text(title)) = obj.get("title").await.unwrap() {
                    titles.push(title);
                }
            }
            titles
        };

        let tolkiens = qs
            .filter_by("author__name", "Tolkien")
            .order_by(&["-title".to_string()])
            .fetch()
            .await
            .unwrap();
        assert_eq!(titles(tolkiens).await, ["The Hobbit", "Silmarillion"]);

        let late = qs
            .filter_by("author__born__gte", 1895)
            .fetch()
            .await
            .unwrap();
        assert_eq!(titles(late).await, ["Narnia"]);

        let page = qs
            .order_by(&["title".to_string()])
            .slice(1, Some(1))
            .fetch()
            .await
            .unwrap();
        assert_eq!(titles(page).await, ["Silmarillion"]);
        assert_eq!(qs.filter_by("title__icontains", "the").count().await.unwrap(), 1);

        // Reverse relations can be filtered on too.
        let authors = db.queryset("author");
        assert_eq!(
            authors
                .filter_by("books__title", "Narnia")
                .count()
                .await
                .unwrap(),
            1
        );
        assert!(authors
            .opt(&Predicates::from([("name".into(), "Nobody".into())]))
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            db.queryset("book").get(&Predicates::new()).await,
            Err(Error::MultipleObjectsReturned { count: 3, .. })
        ));
    }

    #[async_std::test]
    async fn test_relations() {
        init_logging();

        let db = Database::create(schema());
        let tolkien = author(&db, "Tolkien", 1892).await;
        let hobbit = book(&db, "The Hobbit", &tolkien).await;
        let tag = db
            .insert("tag", [("name", Attr::Value("fantasy".into()))])
            .await
            .unwrap();

        let Attr::Many(tags) = hobbit.get("tags").await.unwrap() else {
            panic!("tags is not a to-many relation");
        };
        assert_eq!(tags.kind(), RelationKind::ManyToMany);
        tags.add(&tag).await.unwrap();
        assert_eq!(tags.all().await.unwrap().len(), 1);
        tags.remove(&tag).await.unwrap();
        assert!(tags.all().await.unwrap().is_empty());

        let Attr::Many(books) = tolkien.get("books").await.unwrap() else {
            panic!("books is not a to-many relation");
        };
        assert_eq!(books.kind(), RelationKind::ReverseForeignKey { nullable: false });
        assert_eq!(books.all().await.unwrap().len(), 1);
        assert!(books.remove(&hobbit).await.is_err());

        // Deleting a tagged book drops its memberships.
        tags.add(&tag).await.unwrap();
        hobbit.delete().await.unwrap();
        assert!(hobbit.pk().is_none());
        assert!(books.all().await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn test_preload_and_annotate() {
        init_logging();

        let db = Database::create(schema());
        let tolkien = author(&db, "Tolkien", 1892).await;
        let lewis = author(&db, "Lewis", 1898).await;
        book(&db, "The Hobbit", &tolkien).await;
        book(&db, "Narnia", &lewis).await;
        book(&db, "Silmarillion", &tolkien).await;

        // Without preloading, every author costs a query.
        let before = db.query_count();
        for obj in db.queryset("book").fetch().await.unwrap() {
            obj.get("author").await.unwrap();
        }
        assert_eq!(db.query_count() - before, 4);

        // With preloading, the authors come in one extra query.
        let before = db.query_count();
        for obj in db
            .queryset("book")
            .select_related(&["author".to_string()])
            .fetch()
            .await
            .unwrap()
        {
            obj.get("author").await.unwrap();
        }
        assert_eq!(db.query_count() - before, 2);

        let authors = db
            .queryset("author")
            .annotate("book_count", &Aggregate::Count("books".into()))
            .order_by(&["-book_count".to_string()])
            .fetch()
            .await
            .unwrap();
        assert!(matches!(
            authors[0].get("book_count").await.unwrap(),
            Attr::Value(Value::Int(2))
        ));
    }
}
