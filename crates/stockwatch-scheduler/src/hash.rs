//! Canonical hashing of the shortage picture.
//!
//! Change detection compares digests of the part of a calculation result that
//! matters to recipients: which items are short, by how much, and which are
//! critical. Two results that agree on that subset hash identically no matter
//! how the collaborator ordered its rows or keys.
//!
//! Canonical form:
//! - object keys sorted lexicographically at every level
//! - shortage records sorted by (item, version)
//! - every number printed as a fixed 6-decimal float
//! - non-finite quantities rejected, never coerced
//!
//! Digest: SHA-256, lowercase hex.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::types::CalculationResult;

/// One item that is short or below its critical threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShortageEntry {
    pub item: String,
    pub version: Option<String>,
    pub shortage: f64,
    pub critical: bool,
}

/// The hashed subset of a `CalculationResult`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShortageSnapshot {
    pub shortages: Vec<ShortageEntry>,
}

impl ShortageSnapshot {
    pub fn from_result(result: &CalculationResult) -> Result<Self> {
        let mut shortages = Vec::new();
        for row in &result.detailed_rows {
            if !row.shortage.is_finite() {
                return Err(StockWatchError::Serialization(format!(
                    "non-finite shortage for item '{}'",
                    row.item_name
                )));
            }
            if row.in_shortage() || row.critical {
                shortages.push(ShortageEntry {
                    item: row.item_name.clone(),
                    version: row.version.clone(),
                    shortage: row.shortage,
                    critical: row.critical,
                });
            }
        }
        // Total order: duplicate (item, version) rows must not keep input order.
        shortages.sort_by(|a, b| {
            a.item
                .cmp(&b.item)
                .then_with(|| a.version.cmp(&b.version))
                .then_with(|| a.shortage.total_cmp(&b.shortage))
                .then_with(|| a.critical.cmp(&b.critical))
        });
        Ok(Self { shortages })
    }

    /// Digest of this snapshot.
    pub fn digest(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(digest_hex(&canonical_json(&value)?))
    }
}

/// Hash the shortage picture of a result.
pub fn shortage_hash(result: &CalculationResult) -> Result<String> {
    ShortageSnapshot::from_result(result)?.digest()
}

/// Serialize a JSON value canonically.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let f = n.as_f64().filter(|f| f.is_finite()).ok_or_else(|| {
                StockWatchError::Serialization(format!("number {n} has no stable form"))
            })?;
            // -0.0 and 0.0 are the same quantity.
            let f = if f == 0.0 { 0.0 } else { f };
            out.push_str(&format!("{f:.6}"));
        }
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
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn digest_hex(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
