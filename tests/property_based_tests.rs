mod common;

use cloudmgr_core::models::{merge_attribute, objid};
use cloudmgr_core::state_machine::{ResourceEvent, ResourceState, ResourceStateMachine};
use common::strategies::*;
use proptest::prelude::*;
use serde_json::json;

fn event_strategy() -> impl Strategy<Value = ResourceEvent> {
    prop_oneof![
        Just(ResourceEvent::Build),
        Just(ResourceEvent::Update),
        Just(ResourceEvent::Complete),
        "[a-z ]{0,20}".prop_map(ResourceEvent::Fail),
        Just(ResourceEvent::Delete),
        Just(ResourceEvent::SoftDelete),
        any::<bool>().prop_map(|force| ResourceEvent::Expunge { force }),
        Just(ResourceEvent::Expunged),
        Just(ResourceEvent::Disable),
        Just(ResourceEvent::Enable),
    ]
}

fn state_strategy() -> impl Strategy<Value = ResourceState> {
    prop::sample::select(ResourceState::ALL.to_vec())
}

proptest! {
    /// Property: every generated objid hangs below each of its ancestors
    #[test]
    fn objids_nest_below_their_ancestors((root, depth) in hierarchy_strategy()) {
        let mut chain = vec![root];
        for _ in 0..depth {
            let child = objid::child_of(chain.last().unwrap());
            chain.push(child);
        }

        for (index, ancestor) in chain.iter().enumerate() {
            for descendant in &chain[index + 1..] {
                prop_assert!(objid::is_descendant_of(descendant, ancestor));
                prop_assert!(!objid::is_descendant_of(ancestor, descendant));
                prop_assert!(objid::matches_pattern(descendant, ancestor));
            }
        }
        let leaf = chain.last().unwrap();
        prop_assert_eq!(objid::parent_of(leaf), Some(chain[depth - 1].as_str()));
        prop_assert_eq!(objid::segments(leaf).len(), depth + 1);
    }

    /// Property: sibling objids never nest inside each other
    #[test]
    fn siblings_are_disjoint(root in segment_strategy()) {
        let first = objid::child_of(&root);
        let second = objid::child_of(&root);
        prop_assert_ne!(&first, &second);
        prop_assert!(!objid::is_descendant_of(&first, &second));
        prop_assert!(!objid::is_descendant_of(&second, &first));
    }

    /// Property: a wildcard segment matches any value in that position
    #[test]
    fn wildcard_matches_any_segment(root in segment_strategy()) {
        let child = objid::child_of(&root);
        prop_assert!(objid::matches_pattern(&child, &objid::join(&root, "*")));
        prop_assert!(objid::matches_pattern(&child, "*"));
    }

    /// Property: nothing leaves EXPUNGED
    #[test]
    fn expunged_is_final(event in event_strategy()) {
        prop_assert!(!ResourceStateMachine::is_allowed(ResourceState::Expunged, &event));
    }

    /// Property: an allowed event always leads to its declared target state
    #[test]
    fn allowed_events_have_a_fixed_target(state in state_strategy(), event in event_strategy()) {
        if ResourceStateMachine::is_allowed(state, &event) {
            prop_assert!(ResourceStateMachine::allowed_from(&event).contains(&state));
        }
        if let ResourceEvent::Fail(_) = event {
            prop_assert_eq!(ResourceStateMachine::target_state(&event), ResourceState::Error);
        }
    }

    /// Property: applying the same merge patch twice changes nothing further
    #[test]
    fn attribute_merge_is_idempotent(name in resource_name_strategy(), size in 0u32..64) {
        let patch = json!({"name": name, "flavor": {"size": size}, "obsolete": null});
        let mut once = json!({"obsolete": true, "flavor": {"zone": "a"}});
        merge_attribute(&mut once, &patch);
        let mut twice = once.clone();
        merge_attribute(&mut twice, &patch);

        prop_assert_eq!(&once, &twice);
        prop_assert!(once.get("obsolete").is_none());
        prop_assert_eq!(&once["flavor"]["zone"], "a");
    }
}
