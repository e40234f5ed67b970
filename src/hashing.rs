//! Content Hashing
//!
//! Deterministic content digests over a pinned canonical JSON encoding,
//! plus the hash-combination primitive used for Merkle parents.
//!
//! Canonical form: object keys sorted by byte order, no whitespace, UTF-8,
//! standard JSON string escaping. Numbers with an integral value inside
//! ±2^53 are written as integers; any other finite number uses the shortest
//! decimal that round-trips. Non-finite numbers are rejected.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};

/// Largest integer exactly representable in an IEEE-754 double.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// SHA-256 of raw bytes, lowercase hex
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Parent hash of two child hashes
pub fn combine(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of the canonical encoding of a JSON value
pub fn hash_value(value: &Value) -> Result<String> {
    let canonical = canonicalize(value)?;
    Ok(digest(canonical.as_bytes()))
}

/// Encode a JSON value in canonical form
pub fn canonicalize(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Timestamps are hashed as RFC 3339 UTC with millisecond precision
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Drop sub-millisecond precision so a stored timestamp re-hashes identically
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Canonical text for a floating point amount
pub fn format_number(value: f64) -> Result<String> {
    if !value.is_finite() {
        return Err(LedgerError::ValidationError(format!(
            "Non-finite number cannot be hashed: {}",
            value
        )));
    }

    if value.fract() == 0.0 && value.abs() < MAX_SAFE_INTEGER {
        // also folds -0.0 into "0"
        return Ok(format!("{}", value as i64));
    }

    Ok(format!("{}", value))
}

fn canonical_number(number: &Number) -> Result<String> {
    if let Some(i) = number.as_i64() {
        return Ok(i.to_string());
    }
    if let Some(u) = number.as_u64() {
        return Ok(u.to_string());
    }

    let f = number
        .as_f64()
        .ok_or_else(|| LedgerError::ValidationError(format!("Unsupported number: {}", number)))?;
    format_number(f)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)?),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_fixtures() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_fixture() {
        let value = json!({
            "c": {"z": 1.5, "y": 100.0},
            "b": 1,
            "a": [true, null, "x"]
        });

        let canonical = canonicalize(&value).unwrap();
        assert_eq!(canonical, r#"{"a":[true,null,"x"],"b":1,"c":{"y":100,"z":1.5}}"#);
        assert_eq!(
            hash_value(&value).unwrap(),
            "03fc941d268f1048dee36101d015c9e64ef26f446cad0e9825e5435c643ffc2c"
        );
    }

    #[test]
    fn test_key_order_is_irrelevant() {
        let mut first = serde_json::Map::new();
        first.insert("zeta".to_string(), json!("1"));
        first.insert("alpha".to_string(), json!({"b": 2, "a": 1}));

        let mut second = serde_json::Map::new();
        second.insert("alpha".to_string(), json!({"a": 1, "b": 2}));
        second.insert("zeta".to_string(), json!("1"));

        assert_eq!(
            hash_value(&Value::Object(first)).unwrap(),
            hash_value(&Value::Object(second)).unwrap()
        );
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(250.0).unwrap(), "250");
        assert_eq!(format_number(-0.0).unwrap(), "0");
        assert_eq!(format_number(0.1).unwrap(), "0.1");
        assert_eq!(format_number(1234.56).unwrap(), "1234.56");
        assert!(format_number(f64::NAN).is_err());
        assert!(format_number(f64::INFINITY).is_err());
    }

    #[test]
    fn test_string_escaping_is_stable() {
        let value = json!({"note": "line\nbreak \"quoted\" café"});
        assert_eq!(
            canonicalize(&value).unwrap(),
            "{\"note\":\"line\\nbreak \\\"quoted\\\" café\"}"
        );
    }

    #[test]
    fn test_combine_is_concatenation_digest() {
        let a = digest(b"a");
        let b = digest(b"b");
        assert_eq!(
            combine(&a, &b),
            "62af5c3cb8da3e4f25061e829ebeea5c7513c54949115b1acc225930a90154da"
        );
        assert_ne!(combine(&a, &b), combine(&b, &a));
    }

    #[test]
    fn test_canonical_timestamp_millis() {
        let ts = DateTime::parse_from_rfc3339("2024-01-15T10:30:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(canonical_timestamp(&ts), "2024-01-15T10:30:00.123Z");
        assert_eq!(
            canonical_timestamp(&truncate_to_millis(ts)),
            "2024-01-15T10:30:00.123Z"
        );
    }
}
