//! Conversion between native values and their wire representation.
//!
//! A [`Formatter`] owns every decision about how data looks on the wire: how scalar values are
//! encoded, how internal attribute names map to public keys, and how whole documents are read and
//! written. The rest of the crate works with [`Mapping`]s of already-formatted values.

use crate::error::{Error, Result};
use crate::orm::{Value, ValueType};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use convert_case::{Case, Casing};
use serde_json::{Number, Value as JsonValue};
use std::fmt::Debug;
use std::io::{Read, Write};

/// A wire-level object: public names mapped to formatted values.
pub type Mapping = serde_json::Map<String, JsonValue>;

/// Encoding of values, names and documents.
pub trait Formatter: Debug + Send + Sync {
    /// Encode a native value of type `ty`.
    fn to_api_value(&self, ty: ValueType, value: &Value) -> JsonValue;

    /// Decode a wire value as a native value of type `ty`.
    ///
    /// `null` decodes to [`Value::Null`] for every type.
    ///
    /// # Errors
    ///
    /// This method fails with [`Error::TypeCoercion`] if `value` cannot be read as a `ty`.
    fn to_native_value(&self, ty: ValueType, value: &JsonValue) -> Result<Value>;

    /// The public key for the internal name `name`.
    fn public_name(&self, name: &str) -> String;

    /// Read a whole document, which must be an object.
    fn read_from(&self, reader: &mut dyn Read) -> Result<Mapping>;

    /// Write a whole document.
    fn write_to(&self, mapping: &Mapping, writer: &mut dyn Write) -> Result<()>;
}

/// A [`Formatter`] for JSON documents.
///
/// Public names are converted to camel case unless configured otherwise. Datetimes are written in
/// RFC 3339 form in UTC.
#[derive(Clone, Copy, Debug)]
pub struct JsonFormatter {
    case: Option<Case>,
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self {
            case: Some(Case::Camel),
        }
    }
}

impl JsonFormatter {
    /// A formatter which converts public names to `case`.
    pub fn with_case(case: Case) -> Self {
        Self { case: Some(case) }
    }

    /// A formatter which uses internal names verbatim.
    pub fn verbatim() -> Self {
        Self { case: None }
    }
}

/// Parse a datetime, reading values without an offset as UTC.
pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .into_iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl Formatter for JsonFormatter {
    fn to_api_value(&self, ty: ValueType, value: &Value) -> JsonValue {
        match (ty, value) {
            (_, Value::Null) => JsonValue::Null,
            (ValueType::Float, Value::Int(i)) => Number::from_f64(*i as f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            (_, Value::Bool(b)) => JsonValue::Bool(*b),
            (_, Value::Int(i)) => JsonValue::from(*i),
            // JSON has no representation for NaN or the infinities.
            (_, Value::Float(f)) => Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            (_, Value::Text(s)) => JsonValue::String(s.clone()),
            (_, Value::DateTime(dt)) => {
                JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }

    fn to_native_value(&self, ty: ValueType, value: &JsonValue) -> Result<Value> {
        let fail = || Error::type_coercion(ty, value);
        if value.is_null() {
            return Ok(Value::Null);
        }
        match ty {
            ValueType::Bool => value.as_bool().map(Value::Bool).ok_or_else(fail),
            ValueType::Int => match value {
                JsonValue::Number(n) => n
                    .as_i64()
                    .or_else(|| {
                        n.as_f64()
                            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                            .map(|f| f as i64)
                    })
                    .map(Value::Int)
                    .ok_or_else(fail),
                JsonValue::String(s) => s.trim().parse().map(Value::Int).map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueType::Float => match value {
                JsonValue::Number(n) => n.as_f64().map(Value::Float).ok_or_else(fail),
                JsonValue::String(s) => s.trim().parse().map(Value::Float).map_err(|_| fail()),
                _ => Err(fail()),
            },
            ValueType::Text => value
                .as_str()
                .map(|s| Value::Text(s.to_string()))
                .ok_or_else(fail),
            ValueType::DateTime => value
                .as_str()
                .and_then(parse_datetime)
                .map(Value::DateTime)
                .ok_or_else(fail),
        }
    }

    fn public_name(&self, name: &str) -> String {
        match self.case {
            Some(case) => name.to_case(case),
            None => name.to_string(),
        }
    }

    fn read_from(&self, reader: &mut dyn Read) -> Result<Mapping> {
        match serde_json::from_reader(reader).map_err(Error::format)? {
            JsonValue::Object(mapping) => Ok(mapping),
            other => Err(Error::format(format!("expected an object, got {other}"))),
        }
    }

    fn write_to(&self, mapping: &Mapping, writer: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(writer, mapping).map_err(Error::format)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn round_trip(ty: ValueType, value: Value) {
        let fmt = JsonFormatter::default();
        let wire = fmt.to_api_value(ty, &value);
        assert_eq!(fmt.to_native_value(ty, &wire).unwrap(), value);
    }

    proptest! {
        #[test]
        fn proptest_round_trip_int(i in any::<i64>()) {
            round_trip(ValueType::Int, Value::Int(i));
        }

        #[test]
        fn proptest_round_trip_float(f in -1e15f64..1e15f64) {
            round_trip(ValueType::Float, Value::Float(f));
        }

        #[test]
        fn proptest_round_trip_text(s in ".*") {
            round_trip(ValueType::Text, Value::Text(s));
        }

        #[test]
        fn proptest_round_trip_datetime(secs in 0i64..4_000_000_000i64, nanos in 0u32..1_000_000_000u32) {
            let dt = Utc.timestamp_opt(secs, nanos).unwrap();
            round_trip(ValueType::DateTime, Value::DateTime(dt));
        }
    }

    #[test]
    fn test_null() {
        let fmt = JsonFormatter::default();
        for ty in [
            ValueType::Bool,
            ValueType::Int,
            ValueType::Float,
            ValueType::Text,
            ValueType::DateTime,
        ] {
            assert_eq!(fmt.to_api_value(ty, &Value::Null), JsonValue::Null);
            assert_eq!(fmt.to_native_value(ty, &JsonValue::Null).unwrap(), Value::Null);
        }
    }

    #[test]
    fn test_coercion() {
        let fmt = JsonFormatter::default();
        assert_eq!(fmt.to_native_value(ValueType::Int, &json!("42")).unwrap(), Value::Int(42));
        assert_eq!(fmt.to_native_value(ValueType::Int, &json!(3.0)).unwrap(), Value::Int(3));
        assert_eq!(fmt.to_native_value(ValueType::Float, &json!(3)).unwrap(), Value::Float(3.0));
        assert_eq!(fmt.to_api_value(ValueType::Float, &Value::Int(3)), json!(3.0));
        assert!(matches!(
            fmt.to_native_value(ValueType::Int, &json!("forty-two")),
            Err(Error::TypeCoercion { expected, .. }) if expected == "integer"
        ));
        assert!(fmt.to_native_value(ValueType::Int, &json!(3.5)).is_err());
        assert!(fmt.to_native_value(ValueType::Text, &json!(7)).is_err());
        assert!(fmt.to_native_value(ValueType::Bool, &json!("true")).is_err());
    }

    #[test]
    fn test_datetime_offsets() {
        let fmt = JsonFormatter::default();
        let instant = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        for wire in [
            "2020-01-02T03:04:05Z",
            "2020-01-02T05:04:05+02:00",
            "2020-01-01T22:04:05-05:00",
            "2020-01-02T03:04:05",
            "2020-01-02 03:04:05",
        ] {
            assert_eq!(
                fmt.to_native_value(ValueType::DateTime, &json!(wire)).unwrap(),
                Value::DateTime(instant),
                "{wire}"
            );
        }
        assert_eq!(
            fmt.to_api_value(ValueType::DateTime, &Value::DateTime(instant)),
            json!("2020-01-02T03:04:05Z")
        );
    }

    #[test]
    fn test_public_name() {
        assert_eq!(JsonFormatter::default().public_name("resource_uri"), "resourceUri");
        assert_eq!(JsonFormatter::default().public_name("name"), "name");
        assert_eq!(JsonFormatter::verbatim().public_name("resource_uri"), "resource_uri");
        assert_eq!(
            JsonFormatter::with_case(Case::Kebab).public_name("first_name"),
            "first-name"
        );
    }

    #[test]
    fn test_documents() {
        let fmt = JsonFormatter::default();
        let doc = fmt
            .read_from(&mut r#"{"name": "Bob", "age": 20}"#.as_bytes())
            .unwrap();
        assert_eq!(doc["name"], json!("Bob"));

        let mut out = vec![];
        fmt.write_to(&doc, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"name":"Bob","age":20}"#);

        assert!(matches!(
            fmt.read_from(&mut "[1, 2]".as_bytes()),
            Err(Error::Format { .. })
        ));
    }
}
