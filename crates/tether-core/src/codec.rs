//! Envelope codec: declarative objects ↔ protocol payloads.
//!
//! This is the only place payload/object translation happens. The provider
//! server, the client session, and the engine all see exactly one side of
//! the conversion.
//!
//! Payloads are the well-known `Struct` type: a recursive mapping of typed
//! scalars, lists, and nested structs. JSON numbers survive a round trip
//! with protojson's normalization: the wire carries doubles, and integral
//! doubles decode back to integers.

use prost_types::value::Kind as ProtoKind;
use prost_types::{ListValue, Struct, Value as ProtoValue};
use serde_json::{Map, Number, Value};

use crate::kind::Kind;
use crate::resource::Resource;

/// Errors raised by payload conversion.
///
/// All are terminal for the operation that hit them; retrying without
/// re-fetching the object cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The object contains a value the payload cannot represent.
    #[error("cannot encode resource as payload: {reason}")]
    Encode {
        /// What was not representable.
        reason: String,
    },

    /// The payload contains a value the object tree cannot represent.
    #[error("cannot decode payload into resource: {reason}")]
    Decode {
        /// What was malformed.
        reason: String,
    },

    /// The payload is missing `apiVersion` or `kind`.
    #[error("cannot determine resource kind from payload")]
    NoKind,
}

/// Serializes a declarative object into a protocol payload.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] on non-representable values (non-finite
/// numbers, integers beyond double precision).
pub fn encode(resource: &Resource) -> Result<Struct, CodecError> {
    match to_proto_value(resource.value())? {
        ProtoValue {
            kind: Some(ProtoKind::StructValue(s)),
        } => Ok(s),
        // Unreachable in practice: a Resource root is always a mapping.
        _ => Err(CodecError::Encode {
            reason: "object root is not a mapping".to_string(),
        }),
    }
}

/// Deserializes a protocol payload into an untyped holder.
///
/// The holder's property tree is overwritten atomically: on error the
/// existing tree is untouched.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] on malformed payloads (non-finite
/// numbers, non-mapping roots).
pub fn decode(payload: &Struct, into: &mut Resource) -> Result<(), CodecError> {
    let value = from_proto_struct(payload)?;
    into.replace_value(value).map_err(|e| CodecError::Decode {
        reason: e.to_string(),
    })
}

/// Reads the kind triple out of a payload without fully decoding it.
///
/// # Errors
///
/// Returns [`CodecError::NoKind`] when `apiVersion` or `kind` is absent,
/// empty, or malformed.
pub fn extract_kind(payload: &Struct) -> Result<Kind, CodecError> {
    let api_version = string_field(payload, "apiVersion").ok_or(CodecError::NoKind)?;
    let kind = string_field(payload, "kind").ok_or(CodecError::NoKind)?;
    Kind::from_api_version(api_version, kind).map_err(|_| CodecError::NoKind)
}

fn string_field<'a>(payload: &'a Struct, field: &str) -> Option<&'a str> {
    match payload.fields.get(field)?.kind.as_ref()? {
        ProtoKind::StringValue(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn to_proto_value(value: &Value) -> Result<ProtoValue, CodecError> {
    let kind = match value {
        Value::Null => ProtoKind::NullValue(0),
        Value::Bool(b) => ProtoKind::BoolValue(*b),
        Value::Number(n) => {
            let f = n.as_f64().ok_or_else(|| CodecError::Encode {
                reason: format!("number {n} is not representable as a double"),
            })?;
            if !f.is_finite() {
                return Err(CodecError::Encode {
                    reason: format!("number {n} is not finite"),
                });
            }
            ProtoKind::NumberValue(f)
        }
        Value::String(s) => ProtoKind::StringValue(s.clone()),
        Value::Array(items) => {
            let values = items
                .iter()
                .map(to_proto_value)
                .collect::<Result<Vec<_>, _>>()?;
            ProtoKind::ListValue(ListValue { values })
        }
        Value::Object(map) => {
            let mut fields = std::collections::BTreeMap::new();
            for (key, item) in map {
                fields.insert(key.clone(), to_proto_value(item)?);
            }
            ProtoKind::StructValue(Struct { fields })
        }
    };
    Ok(ProtoValue { kind: Some(kind) })
}

fn from_proto_struct(payload: &Struct) -> Result<Value, CodecError> {
    let mut map = Map::with_capacity(payload.fields.len());
    for (key, value) in &payload.fields {
        map.insert(key.clone(), from_proto_value(value)?);
    }
    Ok(Value::Object(map))
}

fn from_proto_value(value: &ProtoValue) -> Result<Value, CodecError> {
    let json = match value.kind.as_ref() {
        None | Some(ProtoKind::NullValue(_)) => Value::Null,
        Some(ProtoKind::BoolValue(b)) => Value::Bool(*b),
        Some(ProtoKind::NumberValue(f)) => Value::Number(number_from_f64(*f)?),
        Some(ProtoKind::StringValue(s)) => Value::String(s.clone()),
        Some(ProtoKind::ListValue(list)) => Value::Array(
            list.values
                .iter()
                .map(from_proto_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(ProtoKind::StructValue(s)) => from_proto_struct(s)?,
    };
    Ok(json)
}

// protojson normalization: integral doubles come back as JSON integers so
// Decode(Encode(o)) reproduces o for common object graphs.
#[allow(clippy::cast_possible_truncation)]
fn number_from_f64(f: f64) -> Result<Number, CodecError> {
    if !f.is_finite() {
        return Err(CodecError::Decode {
            reason: format!("number {f} is not finite"),
        });
    }
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        return Ok(Number::from(f as i64));
    }
    Number::from_f64(f).ok_or_else(|| CodecError::Decode {
        reason: format!("number {f} is not representable"),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn widget() -> Resource {
        Resource::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "labels": { "tier": "test" } },
            "spec": {
                "size": 3,
                "ratio": 1.5,
                "enabled": true,
                "tags": ["a", "b"],
                "nothing": null,
            },
        }))
        .unwrap()
    }

    #[test]
    fn round_trip_reproduces_the_object() {
        let original = widget();
        let payload = encode(&original).unwrap();

        let mut decoded = Resource::new(&Kind::new("", "v1", "Placeholder"), "x");
        decode(&payload, &mut decoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn extract_kind_reads_the_triple() {
        let payload = encode(&widget()).unwrap();
        let kind = extract_kind(&payload).unwrap();
        assert_eq!(kind, Kind::new("example.org", "v1", "Widget"));
    }

    #[test]
    fn extract_kind_fails_without_api_version() {
        let resource = Resource::from_value(json!({
            "kind": "Widget",
            "metadata": { "name": "w1" },
        }))
        .unwrap();
        let payload = encode(&resource).unwrap();
        assert_eq!(extract_kind(&payload), Err(CodecError::NoKind));
    }

    #[test]
    fn extract_kind_fails_on_non_string_kind() {
        let resource = Resource::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": 7,
        }))
        .unwrap();
        let payload = encode(&resource).unwrap();
        assert_eq!(extract_kind(&payload), Err(CodecError::NoKind));
    }

    #[test]
    fn decode_overwrites_atomically() {
        let mut target = widget();
        let payload = encode(
            &Resource::from_value(json!({
                "apiVersion": "example.org/v1",
                "kind": "Widget",
                "metadata": { "name": "w2" },
            }))
            .unwrap(),
        )
        .unwrap();

        decode(&payload, &mut target).unwrap();
        assert_eq!(target.name(), "w2");
        assert!(target.value().pointer("/spec").is_none());
    }

    #[test]
    fn integral_doubles_decode_as_integers() {
        let payload = encode(&widget()).unwrap();
        let mut decoded = Resource::new(&Kind::new("", "v1", "P"), "x");
        decode(&payload, &mut decoded).unwrap();
        assert_eq!(decoded.value().pointer("/spec/size"), Some(&json!(3)));
        assert_eq!(decoded.value().pointer("/spec/ratio"), Some(&json!(1.5)));
    }

    #[test]
    fn non_finite_payload_number_fails_decode() {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(
            "bad".to_string(),
            ProtoValue {
                kind: Some(ProtoKind::NumberValue(f64::NAN)),
            },
        );
        let payload = Struct { fields };

        let mut target = widget();
        let err = decode(&payload, &mut target).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
        // The holder keeps its previous tree on failure.
        assert_eq!(target.name(), "w1");
    }
}
