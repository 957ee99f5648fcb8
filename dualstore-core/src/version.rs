//! Version tracking for publish runs
//!
//! Each published item advances its structural version, its content version,
//! both, or neither. A content id shared by several siblings has its content
//! version bumped by the first qualifying sibling of a run only; the
//! [`RunMemo`] remembers which content ids were already bumped.

use std::collections::HashMap;

use crate::object::{ContentEntry, ContentId, Resource, ResourceState, StructureEntry, StructureId};

/// Which counters an item advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionDecision {
    pub content: bool,
    pub structure: bool,
}

impl VersionDecision {
    pub fn is_noop(&self) -> bool {
        !self.content && !self.structure
    }

    /// Advance the counters of a copy of a resource
    pub fn apply(&self, structure: &mut StructureEntry, content: &mut ContentEntry) {
        if self.structure {
            structure.version += 1;
        }
        if self.content {
            content.version += 1;
        }
    }
}

/// Whether an item qualifies as a content operation: its bytes changed, or
/// it is the last sibling of a deleted content entry.
pub fn is_content_operation(resource: &Resource) -> bool {
    let content_changed = !matches!(
        resource.content.state,
        ResourceState::Unchanged | ResourceState::Keep
    );
    content_changed || is_terminal_delete(resource)
}

/// A deleted structure that is the only remaining reference to its content
pub fn is_terminal_delete(resource: &Resource) -> bool {
    resource.structure.state.is_deleted() && resource.content.sibling_count <= 1
}

/// Per-run memo of content ids
///
/// Built from the items of a batch before processing starts. An entry is
/// dropped once the last sibling of its content id in the batch has been
/// processed.
#[derive(Debug, Default)]
pub struct RunMemo {
    pending: HashMap<ContentId, usize>,
    /// Content ids bumped in this run and the item that bumped them
    bumped: HashMap<ContentId, StructureId>,
}

impl RunMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more batch item referencing `content_id`
    pub fn expect(&mut self, content_id: ContentId) {
        *self.pending.entry(content_id).or_insert(0) += 1;
    }

    /// Version decision for `resource`, recording a content bump
    pub fn decide(&mut self, resource: &Resource, moved: bool) -> VersionDecision {
        let candidate = is_content_operation(resource);
        let content = candidate && !self.bumped.contains_key(&resource.content_id());
        if content {
            self.bumped.insert(resource.content_id(), resource.structure_id());
        }

        let structure = match resource.structure.state {
            _ if moved => true,
            ResourceState::Changed => true,
            ResourceState::New => !candidate,
            ResourceState::Deleted => !is_terminal_delete(resource),
            _ => false,
        };
        VersionDecision { content, structure }
    }

    /// Mark one item of `content_id` as processed, whatever its outcome
    pub fn finish_item(&mut self, content_id: ContentId) {
        let remaining = match self.pending.get_mut(&content_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.pending.remove(&content_id);
            self.bumped.remove(&content_id);
        }
    }

    /// Undo the content bump claimed by a failed item so a later sibling
    /// in the same run can perform it
    pub fn forget_bump(&mut self, content_id: ContentId, by: StructureId) {
        if self.bumped.get(&content_id) == Some(&by) {
            self.bumped.remove(&content_id);
        }
    }

    pub fn was_bumped(&self, content_id: ContentId) -> bool {
        self.bumped.contains_key(&content_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.bumped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ResourceKind;
    use proptest::prelude::*;

    fn resource(content: &ContentEntry, structure_state: ResourceState) -> Resource {
        let structure = StructureEntry {
            structure_id: StructureId::new(),
            content_id: content.content_id,
            parent_id: None,
            path: "/x.html".into(),
            state: structure_state,
            version: 0,
            date_released: None,
            date_expired: None,
        };
        Resource::new(structure, content.clone())
    }

    fn content(state: ResourceState, siblings: u32) -> ContentEntry {
        let mut c = ContentEntry::new(ResourceKind::File, 1, 3, "offline");
        c.state = state;
        c.sibling_count = siblings;
        c
    }

    #[test]
    fn test_new_file_bumps_content_only() {
        let c = content(ResourceState::New, 1);
        let mut memo = RunMemo::new();
        memo.expect(c.content_id);
        let d = memo.decide(&resource(&c, ResourceState::New), false);
        assert_eq!(d, VersionDecision { content: true, structure: false });
    }

    #[test]
    fn test_second_sibling_skips_content_bump() {
        let c = content(ResourceState::Changed, 2);
        let mut memo = RunMemo::new();
        memo.expect(c.content_id);
        memo.expect(c.content_id);
        let first = memo.decide(&resource(&c, ResourceState::Unchanged), false);
        memo.finish_item(c.content_id);
        assert!(memo.was_bumped(c.content_id));
        let second = memo.decide(&resource(&c, ResourceState::Unchanged), false);
        memo.finish_item(c.content_id);
        assert!(first.content);
        assert!(second.is_noop());
        assert!(memo.is_empty());
    }

    #[test]
    fn test_moved_item_bumps_structure() {
        let c = content(ResourceState::Unchanged, 1);
        let mut memo = RunMemo::new();
        let d = memo.decide(&resource(&c, ResourceState::Changed), true);
        assert_eq!(d, VersionDecision { content: false, structure: true });
    }

    #[test]
    fn test_deleted_siblings() {
        let shared = content(ResourceState::Unchanged, 2);
        let mut memo = RunMemo::new();
        let d = memo.decide(&resource(&shared, ResourceState::Deleted), false);
        assert_eq!(d, VersionDecision { content: false, structure: true });

        let last = content(ResourceState::Unchanged, 1);
        let d = memo.decide(&resource(&last, ResourceState::Deleted), false);
        assert_eq!(d, VersionDecision { content: true, structure: false });
    }

    #[test]
    fn test_new_sibling_of_existing_content() {
        let c = content(ResourceState::Unchanged, 2);
        let mut memo = RunMemo::new();
        let d = memo.decide(&resource(&c, ResourceState::New), false);
        assert_eq!(d, VersionDecision { content: false, structure: true });
    }

    #[test]
    fn test_failed_bump_is_handed_to_next_sibling() {
        let c = content(ResourceState::Changed, 2);
        let mut memo = RunMemo::new();
        memo.expect(c.content_id);
        memo.expect(c.content_id);
        let first = resource(&c, ResourceState::Unchanged);
        assert!(memo.decide(&first, false).content);
        memo.forget_bump(c.content_id, first.structure_id());
        memo.finish_item(c.content_id);
        assert!(memo.decide(&resource(&c, ResourceState::Unchanged), false).content);
    }

    #[test]
    fn test_memo_reset_allows_bump_in_next_run() {
        let c = content(ResourceState::Changed, 1);
        let mut memo = RunMemo::new();
        memo.expect(c.content_id);
        assert!(memo.decide(&resource(&c, ResourceState::Unchanged), false).content);
        memo.finish_item(c.content_id);
        assert!(memo.decide(&resource(&c, ResourceState::Unchanged), false).content);
    }

    fn any_state() -> impl Strategy<Value = ResourceState> {
        prop_oneof![
            Just(ResourceState::Unchanged),
            Just(ResourceState::Changed),
            Just(ResourceState::New),
            Just(ResourceState::Deleted),
        ]
    }

    proptest! {
        #[test]
        fn prop_content_bumped_at_most_once_per_run(
            items in prop::collection::vec((any_state(), any_state(), 1u32..4, any::<bool>()), 1..12)
        ) {
            let c = content(ResourceState::Unchanged, 1);
            let mut memo = RunMemo::new();
            for _ in &items {
                memo.expect(c.content_id);
            }
            let mut content_version = 0u64;
            let mut bumps = 0;
            for (structure_state, content_state, siblings, moved) in items {
                let mut entry = c.clone();
                entry.state = content_state;
                entry.sibling_count = siblings;
                let mut r = resource(&entry, structure_state);
                let before = (r.structure.version, r.content.version);
                let d = memo.decide(&r, moved);
                d.apply(&mut r.structure, &mut r.content);
                prop_assert!(r.structure.version >= before.0);
                prop_assert!(r.content.version >= before.1);
                if d.content {
                    bumps += 1;
                    content_version += 1;
                }
                memo.finish_item(c.content_id);
            }
            prop_assert!(bumps <= 1);
            prop_assert!(content_version <= 1);
            prop_assert!(memo.is_empty());
        }
    }
}
