//! Configuration merging
//!
//! Files are partial: a project file naming only `[lock] lease_secs` must
//! not reset anything else. Layers are therefore merged as TOML tables and
//! deserialized once at the end.

use toml::{Table, Value};

/// Overlay `other` onto `base`. Tables merge key by key, everything else
/// (arrays included) is replaced.
pub(super) fn merge_tables(mut base: Table, other: Table) -> Table {
    for (key, value) in other {
        let merged = match (base.remove(&key), value) {
            (Some(Value::Table(lower)), Value::Table(upper)) => Value::Table(merge_tables(lower, upper)),
            (_, upper) => upper,
        };
        base.insert(key, merged);
    }
    base
}
