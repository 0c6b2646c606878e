//! # Object Identifiers
//!
//! An objid is a `//`-delimited path encoding the authorization hierarchy of an entity:
//! a container owns `<segment>`, a top-level resource owns `<container objid>//<segment>`,
//! and every child owns `<parent objid>//<segment>`. Objids are generated once at creation
//! and never mutated.

use crate::constants::objid::{SEGMENT_LENGTH, SEPARATOR, WILDCARD};
use uuid::Uuid;

/// Generate a fresh random objid segment
pub fn generate_segment() -> String {
    Uuid::new_v4().simple().to_string()[..SEGMENT_LENGTH].to_string()
}

/// Build the objid of a new child entity
pub fn child_of(parent_objid: &str) -> String {
    join(parent_objid, &generate_segment())
}

/// Build a root objid for a new container
pub fn root() -> String {
    generate_segment()
}

pub fn join(parent_objid: &str, segment: &str) -> String {
    format!("{parent_objid}{SEPARATOR}{segment}")
}

/// Objid of the direct parent, if any
pub fn parent_of(objid: &str) -> Option<&str> {
    objid.rsplit_once(SEPARATOR).map(|(parent, _)| parent)
}

pub fn segments(objid: &str) -> Vec<&str> {
    objid.split(SEPARATOR).collect()
}

/// Check whether `objid` is a strict descendant of `ancestor`
pub fn is_descendant_of(objid: &str, ancestor: &str) -> bool {
    objid.len() > ancestor.len() + SEPARATOR.len()
        && objid.starts_with(ancestor)
        && objid[ancestor.len()..].starts_with(SEPARATOR)
}

/// Match an objid against a pattern whose segments may be `*`. A pattern shorter
/// than the objid matches the whole subtree below it.
pub fn matches_pattern(objid: &str, pattern: &str) -> bool {
    let objid_segments = segments(objid);
    let pattern_segments = segments(pattern);

    if pattern_segments.len() > objid_segments.len() {
        return false;
    }

    pattern_segments
        .iter()
        .zip(objid_segments.iter())
        .all(|(pattern, segment)| *pattern == WILDCARD || pattern == segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_objid_extends_parent() {
        let parent = "a1b2c3d4e5//f6a7b8c9d0";
        let child = child_of(parent);
        assert!(child.starts_with("a1b2c3d4e5//f6a7b8c9d0//"));
        assert_eq!(segments(&child).len(), 3);
        assert_eq!(parent_of(&child), Some(parent));
    }

    #[test]
    fn test_root_has_no_parent() {
        let objid = root();
        assert_eq!(objid.len(), SEGMENT_LENGTH);
        assert_eq!(parent_of(&objid), None);
    }

    #[test]
    fn test_descendant_check() {
        assert!(is_descendant_of("a//b//c", "a//b"));
        assert!(is_descendant_of("a//b//c", "a"));
        assert!(!is_descendant_of("a//bc", "a//b"));
        assert!(!is_descendant_of("a//b", "a//b"));
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("a//b//c", "a//*//c"));
        assert!(matches_pattern("a//b//c", "a//b"));
        assert!(matches_pattern("a//b//c", "*"));
        assert!(!matches_pattern("a//b", "a//b//c"));
        assert!(!matches_pattern("a//x//c", "a//b"));
    }
}
