#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use custody_contracts::artifact::ArtifactPayload;
use custody_contracts::{ContractViolation, SchemaVersion};

/// Canonicalization rules are versioned so a future rule change cannot
/// silently break verification of historical hashes.
pub const CANON_RULES_VERSION: SchemaVersion = SchemaVersion(1);

/// Canonical bytes for a JSON document: object keys sorted
/// lexicographically, no insignificant whitespace, serde_json's
/// shortest-round-trip number formatting. Logically-equal documents
/// canonicalize identically regardless of construction order.
pub fn canonicalize_json(raw: &str) -> Result<Vec<u8>, ContractViolation> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| ContractViolation::InvalidValue {
            field: "canon.document",
            reason: "must be valid JSON",
        })?;
    let mut out = Vec::with_capacity(raw.len());
    write_canonical(&value, &mut out);
    Ok(out)
}

/// Canonical bytes for an already-structured value. Serialization
/// through serde_json cannot fail for the plain-scalar types this
/// ledger canonicalizes, but the error is surfaced rather than
/// swallowed.
pub fn canonicalize_value<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ContractViolation> {
    let value = serde_json::to_value(value).map_err(|_| ContractViolation::InvalidValue {
        field: "canon.value",
        reason: "must serialize to JSON",
    })?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) {
    match value {
        serde_json::Value::Null => out.extend_from_slice(b"null"),
        serde_json::Value::Bool(true) => out.extend_from_slice(b"true"),
        serde_json::Value::Bool(false) => out.extend_from_slice(b"false"),
        serde_json::Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        serde_json::Value::String(s) => write_json_string(s, out),
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
            out.push(b'{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_json_string(key, out);
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
    }
}

fn write_json_string(s: &str, out: &mut Vec<u8>) {
    // serde_json escaping is deterministic; reuse it for scalars.
    match serde_json::to_vec(s) {
        Ok(encoded) => out.extend_from_slice(&encoded),
        // String serialization is infallible; keep the canonical
        // stream well-formed even if that ever changes.
        Err(_) => {
            out.push(b'"');
            out.extend_from_slice(s.replace('"', "\\\"").as_bytes());
            out.push(b'"');
        }
    }
}

/// `sha256:<64 lowercase hex>` over the given bytes.
pub fn content_hash_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(7 + 64);
    hex.push_str("sha256:");
    for b in digest {
        hex.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
        hex.push(char::from_digit((b & 0x0f) as u32, 16).unwrap_or('0'));
    }
    hex
}

/// Content hash of an artifact payload. Inline documents are
/// canonicalized first; content refs hash the reference string itself
/// (the ledger never dereferences external blobs).
pub fn artifact_content_hash(payload: &ArtifactPayload) -> Result<String, ContractViolation> {
    match payload {
        ArtifactPayload::InlineJson(doc) => Ok(content_hash_hex(&canonicalize_json(doc)?)),
        ArtifactPayload::ContentRef(r) => Ok(content_hash_hex(r.as_bytes())),
    }
}
