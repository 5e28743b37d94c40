//! Cache key derivation.
//!
//! Structured request inputs are serialized canonically (object keys sorted at
//! every depth) and reduced to a 64-bit FNV-1a digest rendered as fixed-width
//! base-36. Two inputs that differ only in key order map to the same key.

use serde::Serialize;
use serde_json::Value;

use crate::cache::manager::CacheError;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Width of a rendered key: 36^13 > 2^64.
pub const KEY_WIDTH: usize = 13;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// FNV-1a over raw bytes.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Render a u64 as zero-padded base-36.
pub fn to_base36(mut n: u64) -> String {
    let mut buf = [b'0'; KEY_WIDTH];
    for slot in buf.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    // Every byte comes from BASE36, so this is always valid ASCII.
    buf.iter().map(|&b| b as char).collect()
}

/// FNV-1a digest of `bytes`, rendered as base-36.
pub fn fnv1a_base36(bytes: &[u8]) -> String {
    to_base36(fnv1a(bytes))
}

/// Derive the cache key for a JSON input. Infallible and pure.
pub fn derive_key(input: &Value) -> String {
    let mut canonical = Vec::with_capacity(64);
    write_canonical(input, &mut canonical);
    fnv1a_base36(&canonical)
}

/// Derive the cache key for any serializable input.
pub fn derive_key_from<S: Serialize + ?Sized>(input: &S) -> Result<String, CacheError> {
    let value = serde_json::to_value(input).map_err(|e| CacheError::Key(e.to_string()))?;
    Ok(derive_key(&value))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    out.extend_from_slice(value.to_string().as_bytes());
}
