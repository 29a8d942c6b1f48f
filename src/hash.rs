//! xxHash-based advisory lock keys for target tables.
//!
//! Two sync runs against the same table are serialised through a
//! transaction-scoped advisory lock keyed by a deterministic 64-bit hash of
//! the qualified table name.

use xxhash_rust::xxh64;

const SEED: u64 = 0x517cc1b727220a95;

/// Hash several text parts into one key. Parts are joined with the ASCII
/// record separator so `("ab", "c")` and `("a", "bc")` differ.
pub fn hash_parts(parts: &[&str]) -> i64 {
    let mut combined = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            combined.push('\x1E'); // record separator
        }
        combined.push_str(part);
    }
    xxh64::xxh64(combined.as_bytes(), SEED) as i64
}

/// Advisory lock key for `schema.table`.
pub fn advisory_lock_key(schema: &str, table: &str) -> i64 {
    hash_parts(&["pg_dunesync", schema, table])
}
