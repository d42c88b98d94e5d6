use super::{check_authorized, validate_value, Field, FieldBuilder, FieldOptions};
use crate::context::ApiContext;
use crate::error::{Error, Result};
use crate::formatter::Mapping;
use crate::orm::{Attr, ObjectRef, RelatedManager};
use crate::related::Related;
use crate::resources::ModelResourceClass;
use crate::validation::{self, ValidationErrors};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// A to-many relation, embedded on the wire as a list of related representations.
///
/// Incoming lists are reconciled against the current members of the relation. Each incoming item
/// is matched to a current member by its address, by its surrogate id, or by its natural key, in
/// that order. Matched members are updated in place. An item addressing an existing object which
/// is not a member updates that object and adds it to the relation. Any other item becomes a new
/// member, and members no incoming item matched leave the relation. Whether a leaving member is unlinked or
/// deleted depends on the [kind](crate::orm::RelationKind) of the relation.
///
/// Applying the same list twice creates and removes nothing the second time, provided every item
/// can be matched: items created by the first application must be identified by address,
/// surrogate id or natural key in the second.
#[derive(Clone, Debug)]
pub struct IterableField {
    options: FieldOptions,
    class: String,
    natural_key: Vec<String>,
}

impl IterableField {
    /// A field embedding resources of the class named `class`.
    pub fn new(path: &str, class: impl Into<String>) -> Self {
        Self {
            options: FieldOptions::new(path),
            class: class.into(),
            natural_key: vec![],
        }
    }

    /// Match incoming items to current members by these attributes of the related model.
    pub fn natural_key<I>(mut self, attrs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.natural_key = attrs.into_iter().map(Into::into).collect();
        self
    }

    fn manager(&self, value: Attr) -> Result<Arc<dyn RelatedManager>> {
        match value {
            Attr::Many(manager) => Ok(manager),
            _ => Err(crate::orm::Error::unsupported(format!(
                "{} is not a to-many relation",
                self.options.path
            ))
            .into()),
        }
    }

    fn items<'a>(&self, value: &'a JsonValue) -> Result<Vec<&'a Mapping>> {
        let fail = || Error::type_coercion("list of objects", value);
        value
            .as_array()
            .ok_or_else(fail)?
            .iter()
            .map(|item| item.as_object().ok_or_else(fail))
            .collect()
    }

    /// The object `item` describes.
    async fn find(
        &self,
        ctx: &mut ApiContext,
        members: &[ObjectRef],
        item: &Mapping,
    ) -> Result<Target> {
        if let Some(JsonValue::String(uri)) = item.get(&ctx.resource_uri_key()) {
            if let Some(obj) = ctx.resolve_object(uri, &self.class).await? {
                let found = members
                    .iter()
                    .position(|member| member.model() == obj.model() && member.pk() == obj.pk());
                return Ok(match found {
                    Some(i) => Target::Member(i),
                    None => Target::Existing(obj),
                });
            }
        }

        if let Some(id) = item.get(&ctx.config().surrogate_key) {
            let formatter = ctx.formatter();
            let found = members.iter().position(|member| match member.pk() {
                Some(pk) => pk
                    .ty()
                    .map(|ty| formatter.to_api_value(ty, &pk) == *id)
                    .unwrap_or(false),
                None => false,
            });
            if let Some(i) = found {
                return Ok(Target::Member(i));
            }
        }

        if self.natural_key.is_empty() {
            return Ok(Target::New);
        }
        'members: for (i, member) in members.iter().enumerate() {
            for attr in &self.natural_key {
                let Some(wire) = item.get(&ctx.public_name(attr)) else {
                    return Ok(Target::New);
                };
                let Attr::Value(value) = member.get(attr).await? else {
                    continue 'members;
                };
                let matches = value
                    .ty()
                    .map(|ty| ctx.formatter().to_api_value(ty, &value) == *wire)
                    .unwrap_or(wire.is_null());
                if !matches {
                    continue 'members;
                }
            }
            return Ok(Target::Member(i));
        }
        Ok(Target::New)
    }

    /// Write `item` to `obj` and make `obj` a member of the relation.
    async fn join(
        &self,
        ctx: &mut ApiContext,
        class: &ModelResourceClass,
        manager: &dyn RelatedManager,
        item: &Mapping,
        obj: &ObjectRef,
    ) -> Result<()> {
        if manager.kind().links_before_save() {
            manager.link(obj)?;
            class.write(ctx, item, obj).await?;
        } else {
            class.write(ctx, item, obj).await?;
            manager.add(obj).await?;
        }
        tracing::info!("added {:?} to {}", obj, self.options.path);
        Ok(())
    }

    async fn reconcile(
        &self,
        ctx: &mut ApiContext,
        class: &ModelResourceClass,
        manager: &dyn RelatedManager,
        items: Vec<&Mapping>,
    ) -> Result<()> {
        let kind = manager.kind();
        let members = manager.all().await?;
        let mut matched = vec![false; members.len()];

        for item in items {
            match self.find(ctx, &members, item).await? {
                Target::Member(i) => {
                    matched[i] = true;
                    class.write(ctx, item, &members[i]).await?;
                }
                Target::Existing(obj) => {
                    self.join(ctx, class, manager, item, &obj).await?;
                }
                Target::New => {
                    let obj = manager.new_object();
                    self.join(ctx, class, manager, item, &obj).await?;
                }
            }
        }

        for (member, matched) in members.iter().zip(matched) {
            if matched {
                continue;
            }
            if kind.can_unlink() {
                tracing::info!("removing {member:?} from {}", self.options.path);
                manager.remove(member).await?;
            } else {
                tracing::info!("deleting {member:?} from {}", self.options.path);
                member.delete().await?;
            }
        }
        Ok(())
    }
}

impl FieldBuilder for IterableField {
    fn options_mut(&mut self) -> &mut FieldOptions {
        &mut self.options
    }
}

#[async_trait]
impl Field for IterableField {
    fn options(&self) -> &FieldOptions {
        &self.options
    }

    fn class(&self) -> Option<&str> {
        Some(&self.class)
    }

    fn embeds(&self) -> bool {
        true
    }

    fn requires_saved_target(&self) -> bool {
        true
    }

    async fn outgoing_value(&self, ctx: &mut ApiContext, value: Attr) -> Result<JsonValue> {
        let manager = self.manager(value)?;
        let class = ctx.api().class(&self.class)?.clone();
        let uri_key = ctx.resource_uri_key();
        let mut items = vec![];
        for obj in manager.all().await? {
            let mut item = class.serialize(ctx, &obj, None).await?;
            if !item.contains_key(&uri_key) {
                if let Some(pk) = obj.pk() {
                    let id = match pk.ty() {
                        Some(ty) => ctx.formatter().to_api_value(ty, &pk),
                        None => JsonValue::Null,
                    };
                    item.insert(ctx.config().surrogate_key.clone(), id);
                }
            }
            items.push(JsonValue::Object(item));
        }
        Ok(JsonValue::Array(items))
    }

    async fn incoming_value(
        &self,
        ctx: &mut ApiContext,
        holder: &ObjectRef,
        attr: &str,
        value: &JsonValue,
    ) -> Result<()> {
        let items = self.items(value)?;
        let manager = self.manager(holder.get(attr).await?)?;
        let class = ctx.api().class(&self.class)?.clone();
        self.reconcile(ctx, &class, manager.as_ref(), items).await
    }

    async fn unchanged(
        &self,
        _ctx: &mut ApiContext,
        _current: &Attr,
        _value: &JsonValue,
    ) -> Result<bool> {
        // Nested values are validated item by item.
        Ok(false)
    }

    async fn check_incoming(&self, _ctx: &mut ApiContext, value: &JsonValue) -> Result<()> {
        self.items(value)?;
        Ok(())
    }

    fn prepare(&self, ctx: &ApiContext, related: &mut Related<'_>) -> Result<()> {
        let class = ctx.api().class(&self.class)?;
        let path = self.options.path.lookup();
        related.prefetch(&path);
        class.prepare(ctx, &mut related.sub_prefetch(&path))
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
        let Ok(items) = self.items(value) else {
            return Ok(());
        };
        let members = match target {
            Some(target) => match self.options.path.read(target).await? {
                Some(attr) => self.manager(attr)?.all().await?,
                None => vec![],
            },
            None => vec![],
        };
        let class = ctx.api().class(&self.class)?.clone();
        for (i, item) in items.into_iter().enumerate() {
            let target = match self.find(ctx, &members, item).await? {
                Target::Member(j) => Some(members[j].clone()),
                Target::Existing(obj) => Some(obj),
                Target::New => None,
            };
            let key = validation::dotted(key, &i.to_string());
            validation::validate_into(ctx, &key, &class, target.as_ref(), item, errors).await?;
        }
        Ok(())
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
        let Ok(items) = self.items(value) else {
            return Ok(());
        };
        let manager = self.manager(holder.get(self.options.path.last()).await?)?;
        let members = manager.all().await?;
        let class = ctx.api().class(&self.class)?.clone();
        for item in items {
            let obj = match self.find(&mut ctx, &members, item).await? {
                Target::Member(i) => members[i].clone(),
                Target::Existing(obj) => obj,
                Target::New => manager.new_object(),
            };
            class.authorize(&mut ctx, item, &obj).await?;
        }
        Ok(())
    }
}

/// What an incoming list item refers to.
enum Target {
    /// The current member at this position.
    Member(usize),
    /// An existing object which is not a member yet.
    Existing(ObjectRef),
    /// Nothing yet.
    New,
}
