use proptest::prelude::*;

/// Objid segments as generated at runtime: short lowercase hex
pub fn segment_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{10}"
}

/// A root objid plus the number of descendants to hang below it
pub fn hierarchy_strategy() -> impl Strategy<Value = (String, usize)> {
    (segment_strategy(), 1usize..6)
}

/// Resource names accepted by the dispatcher
pub fn resource_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,30}"
}
