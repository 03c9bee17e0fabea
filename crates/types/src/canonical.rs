//! Canonical JSON encoding, checksums, and line diffing for graph payloads.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Encode a JSON value with sorted object keys and compact separators.
///
/// Two structurally equal graphs always canonicalize to the same string,
/// which makes the encoding suitable for checksums and signatures.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (position, (key, child)) in sorted.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                out.push_str(&encode_scalar(&Value::String((*key).clone())));
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&encode_scalar(leaf)),
    }
}

fn encode_scalar(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Pretty canonical encoding (sorted keys, two-space indent) used when a
/// human-readable line-oriented form is needed, e.g. version diffing.
pub fn canonical_json_pretty(value: &Value) -> String {
    let mut out = String::new();
    write_pretty(value, 0, &mut out);
    out
}

fn write_pretty(value: &Value, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth + 1);
    let closing_indent = "  ".repeat(depth);
    match value {
        Value::Object(map) if !map.is_empty() => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push_str("{\n");
            for (position, (key, child)) in sorted.iter().enumerate() {
                out.push_str(&indent);
                out.push_str(&encode_scalar(&Value::String((*key).clone())));
                out.push_str(": ");
                write_pretty(child, depth + 1, out);
                if position + 1 < sorted.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&closing_indent);
            out.push('}');
        }
        Value::Array(items) if !items.is_empty() => {
            out.push_str("[\n");
            for (position, item) in items.iter().enumerate() {
                out.push_str(&indent);
                write_pretty(item, depth + 1, out);
                if position + 1 < items.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&closing_indent);
            out.push(']');
        }
        other => out.push_str(&canonical_json(other)),
    }
}

/// Compute the SHA-256 hash of the given bytes encoded as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Produce unified-diff-style lines (` `, `-`, `+` prefixes) between two
/// texts. Unchanged regions are kept so the output reads as one pass over
/// the target document.
pub fn diff_lines(base: &str, target: &str) -> Vec<String> {
    let left: Vec<&str> = base.lines().collect();
    let right: Vec<&str> = target.lines().collect();

    // Longest-common-subsequence table; graph documents are small enough
    // that the quadratic table is not a concern.
    let mut table = vec![vec![0usize; right.len() + 1]; left.len() + 1];
    for (i, left_line) in left.iter().enumerate().rev() {
        for (j, right_line) in right.iter().enumerate().rev() {
            table[i][j] = if left_line == right_line {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut lines = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < left.len() && j < right.len() {
        if left[i] == right[j] {
            lines.push(format!(" {}", left[i]));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            lines.push(format!("-{}", left[i]));
            i += 1;
        } else {
            lines.push(format!("+{}", right[j]));
            j += 1;
        }
    }
    while i < left.len() {
        lines.push(format!("-{}", left[i]));
        i += 1;
    }
    while j < right.len() {
        lines.push(format!("+{}", right[j]));
        j += 1;
    }
    lines
}
