//! Subkey names under an index's dedicated subspace. Not a new persistence
//! concept of its own: these are just the strings `StoreTransaction`'s
//! `get_subspace`/`put_subspace`/`atomic_add_scanned` calls are addressed
//! with, so the range set, scanned counter, lease, and strategy marker all
//! live under one well-known prefix per index.
pub const RANGE: &str = "range";
pub const SCANNED: &str = "scanned";
pub const LOCK: &str = "lock";
pub const TYPE: &str = "type";
