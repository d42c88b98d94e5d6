//! Common items that you will always want in scope when defining an API.

pub use crate::{
    api::{Api, Request, Response, Status},
    config::ApiConfig,
    context::ApiContext,
    error::{Error, Result},
    fields::{
        AttributeField, Field, FieldBuilder, IterableField, SubObjectResourceField,
        URIResourceField,
    },
    filters::{Filter, ParameterizedFilter, StandardFilter},
    formatter::{Formatter, JsonFormatter, Mapping},
    orm::{Aggregate, Attr, Object, ObjectRef, QuerySet, QuerySetExt, Value, ValueType},
    resources::{Collection, Method, ModelResourceClass, Params, Resource},
    validation::{Length, OneOf, Range, Required, Validator},
};
