//! Content fingerprints used as HTTP entity tags.
//!
//! A fingerprint is the first 64 bits of a SHA-256 digest, hex-encoded and
//! quoted so it can be sent as a strong `ETag` verbatim. Structured values are
//! digested from a canonical walk of their JSON form (object keys sorted), so
//! two structurally equal values always share a fingerprint regardless of
//! map iteration order. NaN and infinities have no JSON form and are rejected
//! rather than collapsed into `null`.

use std::fmt;

use serde::ser::{self, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

use super::error::FingerprintError;

const TAG_HEX_LEN: usize = 16;

/// Fingerprint a serializable value, optionally mixing in a timestamp.
pub fn fingerprint<T: Serialize + ?Sized>(
    value: &T,
    timestamp: Option<OffsetDateTime>,
) -> Result<String, FingerprintError> {
    value
        .serialize(&mut FiniteFloats)
        .map_err(|err| FingerprintError::new(err.to_string()))?;
    let json = serde_json::to_value(value).map_err(|err| FingerprintError::new(err.to_string()))?;

    let mut hasher = Sha256::new();
    feed_canonical(&mut hasher, &json);
    if let Some(ts) = timestamp {
        hasher.update(b"@");
        hasher.update(ts.unix_timestamp_nanos().to_be_bytes());
    }
    Ok(finish(hasher))
}

/// Fingerprint raw bytes, e.g. a buffered response body.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    finish(hasher)
}

/// Exact comparison of a request-supplied tag with the stored one.
pub fn matches(request: &str, stored: &str) -> bool {
    request == stored
}

/// Evaluate an `If-None-Match` header value against a stored tag.
///
/// The header may carry a comma-separated list; `*` matches any stored tag.
pub fn if_none_match_matches(header: &str, stored: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || matches(candidate, stored))
}

fn finish(hasher: Sha256) -> String {
    let digest = hex::encode(hasher.finalize());
    format!("\"{}\"", &digest[..TAG_HEX_LEN])
}

// Every node is prefixed with a type marker and strings/keys with their length,
// so distinct structures cannot collide by concatenation.
fn feed_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(flag) => hasher.update(if *flag { b"t" } else { b"f" }),
        Value::Number(number) => {
            hasher.update(b"d");
            feed_str(hasher, &number.to_string());
        }
        Value::String(text) => {
            hasher.update(b"s");
            feed_str(hasher, text);
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed_canonical(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            hasher.update((keys.len() as u64).to_be_bytes());
            for key in keys {
                feed_str(hasher, key);
                feed_canonical(hasher, &map[key.as_str()]);
            }
        }
    }
}

fn feed_str(hasher: &mut Sha256, text: &str) {
    hasher.update((text.len() as u64).to_be_bytes());
    hasher.update(text.as_bytes());
}

/// Serializer that produces nothing and fails on the first non-finite float.
struct FiniteFloats;

#[derive(Debug, Error)]
#[error("{0}")]
struct NonFinite(String);

impl ser::Error for NonFinite {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

impl FiniteFloats {
    fn check(value: f64) -> Result<(), NonFinite> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(NonFinite(format!("non-finite float `{value}` cannot be fingerprinted")))
        }
    }
}

impl Serializer for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i16(self, _: i16) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i32(self, _: i32) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i64(self, _: i64) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i128(self, _: i128) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u8(self, _: u8) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u16(self, _: u16) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u32(self, _: u32) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u64(self, _: u64) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u128(self, _: u128) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_f32(self, value: f32) -> Result<(), NonFinite> {
        FiniteFloats::check(f64::from(value))
    }

    fn serialize_f64(self, value: f64) -> Result<(), NonFinite> {
        FiniteFloats::check(value)
    }

    fn serialize_char(self, _: char) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }
}

impl ser::SerializeSeq for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTuple for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeMap for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), NonFinite> {
        key.serialize(&mut **self)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStruct for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for &mut FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde::Serialize;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn fingerprint_is_quoted_hex() {
        let tag = fingerprint(&json!({ "name": "Foo" }), None).expect("fingerprint");
        assert_eq!(tag.len(), TAG_HEX_LEN + 2);
        assert!(tag.starts_with('"') && tag.ends_with('"'));
        assert!(tag[1..=TAG_HEX_LEN].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn structurally_equal_values_share_a_fingerprint() {
        let mut left = HashMap::new();
        let mut right = HashMap::new();
        for i in 0..32 {
            left.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            right.insert(format!("k{i}"), i);
        }

        assert_eq!(
            fingerprint(&left, None).expect("left"),
            fingerprint(&right, None).expect("right")
        );
    }

    #[test]
    fn timestamp_changes_the_fingerprint_only_when_it_differs() {
        let value = json!({ "id": 7 });
        let at = datetime!(2024-05-01 12:00 UTC);

        let plain = fingerprint(&value, None).expect("plain");
        let stamped = fingerprint(&value, Some(at)).expect("stamped");
        let stamped_again = fingerprint(&value, Some(at)).expect("stamped again");
        let later = fingerprint(&value, Some(datetime!(2024-05-01 12:01 UTC))).expect("later");

        assert_ne!(plain, stamped);
        assert_eq!(stamped, stamped_again);
        assert_ne!(stamped, later);
    }

    #[test]
    fn nested_structure_is_not_confused_by_concatenation() {
        let a = fingerprint(&json!(["ab", "c"]), None).expect("a");
        let b = fingerprint(&json!(["a", "bc"]), None).expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn non_string_map_keys_fail_loudly() {
        let mut map = BTreeMap::new();
        map.insert(vec![1_u8, 2], "tuple keys are not JSON");

        let err = fingerprint(&map, None).expect_err("non-string keys must be rejected");
        assert!(!err.reason().is_empty());
    }

    #[test]
    fn non_finite_floats_fail_loudly() {
        #[derive(Serialize)]
        struct Rating {
            score: f64,
            samples: Vec<f32>,
        }

        for bad in [
            Rating { score: f64::NAN, samples: Vec::new() },
            Rating { score: 4.5, samples: vec![1.0, f32::INFINITY] },
            Rating { score: f64::NEG_INFINITY, samples: Vec::new() },
        ] {
            let err = fingerprint(&bad, None).expect_err("non-finite floats must be rejected");
            assert!(err.reason().contains("non-finite"), "{}", err.reason());
        }

        let finite = Rating { score: 4.5, samples: vec![1.0] };
        assert!(fingerprint(&finite, None).is_ok());
    }

    #[test]
    fn bytes_fingerprint_is_deterministic() {
        assert_eq!(fingerprint_bytes(b"hello"), fingerprint_bytes(b"hello"));
        assert_ne!(fingerprint_bytes(b"hello"), fingerprint_bytes(b"hellO"));
    }

    #[test]
    fn if_none_match_handles_lists_and_wildcards() {
        let stored = "\"0123456789abcdef\"";
        assert!(if_none_match_matches(stored, stored));
        assert!(if_none_match_matches("\"nope\", \"0123456789abcdef\"", stored));
        assert!(if_none_match_matches("*", stored));
        assert!(!if_none_match_matches("\"nope\"", stored));
        assert!(!matches("W/\"0123456789abcdef\"", stored));
    }
}
