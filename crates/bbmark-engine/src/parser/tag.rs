//! The tag object model: candidate markup annotations over text spans.
//!
//! Tags reference each other (pairing back-references, cascading
//! invalidation lists), so they live in a per-parse [`TagArena`] and link
//! via [`TagId`] indices rather than pointers. Invalidation is monotonic:
//! a tag goes invalid once and never comes back, which is also what keeps
//! cascade traversal over cyclic graphs finite.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use crate::schema::NameId;

/// Start and end behave as bits: a self-closing tag is both at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Start,
    End,
    SelfClosing,
}

impl TagKind {
    /// True for tags that open an element (Start and SelfClosing).
    pub fn is_start(self) -> bool {
        matches!(self, TagKind::Start | TagKind::SelfClosing)
    }

    /// True for tags that close an element (End and SelfClosing).
    pub fn is_end(self) -> bool {
        matches!(self, TagKind::End | TagKind::SelfClosing)
    }

    /// Tie-break rank for zero-width tags at the same position: End before
    /// SelfClosing before Start, so a pair can close before the next one
    /// opens at the same point.
    pub(crate) fn zero_width_rank(self) -> u8 {
        match self {
            TagKind::End => 0,
            TagKind::SelfClosing => 1,
            TagKind::Start => 2,
        }
    }
}

/// Index of a tag within its parse session's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(u32);

/// One candidate markup annotation.
#[derive(Debug)]
pub struct Tag {
    pub(crate) kind: TagKind,
    pub(crate) name: String,
    /// Bit slot if the name is configured in the schema; `None` for system
    /// and unknown names.
    pub(crate) name_id: Option<NameId>,
    pub(crate) pos: usize,
    pub(crate) len: usize,
    pub(crate) sort_priority: i32,
    pub(crate) attributes: BTreeMap<String, String>,
    pub(crate) flags: u32,
    pub(crate) invalid: bool,
    pub(crate) start_tag: Option<TagId>,
    pub(crate) end_tag: Option<TagId>,
    /// Tags to invalidate when this one goes invalid. One-directional.
    pub(crate) cascade: Vec<TagId>,
}

impl Tag {
    pub(crate) fn new(kind: TagKind, name: String, pos: usize, len: usize, prio: i32) -> Self {
        Tag {
            kind,
            name,
            name_id: None,
            pos,
            len,
            sort_priority: prio,
            attributes: BTreeMap::new(),
            flags: 0,
            invalid: false,
            start_tag: None,
            end_tag: None,
            cascade: Vec::new(),
        }
    }

    pub fn kind(&self) -> TagKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of the first byte after the text this tag consumes.
    pub fn end_pos(&self) -> usize {
        self.pos + self.len
    }

    pub fn sort_priority(&self) -> i32 {
        self.sort_priority
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_br_tag(&self) -> bool {
        self.name == "br"
    }

    pub fn is_ignore_tag(&self) -> bool {
        self.name == "i"
    }

    pub fn is_paragraph_break(&self) -> bool {
        self.name == "pb"
    }

    pub fn is_system_tag(&self) -> bool {
        self.is_br_tag() || self.is_ignore_tag() || self.is_paragraph_break()
    }
}

/// Owns every tag created during one parse.
#[derive(Debug, Default)]
pub struct TagArena {
    tags: Vec<Tag>,
}

impl TagArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, tag: Tag) -> TagId {
        let id = TagId(self.tags.len() as u32);
        self.tags.push(tag);
        id
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Invalidate a tag and everything in its cascade list, transitively.
    /// Already-invalid tags are skipped, so cyclic cascade graphs terminate
    /// and each tag is invalidated at most once.
    pub fn invalidate(&mut self, id: TagId) {
        let mut worklist = vec![id];
        while let Some(id) = worklist.pop() {
            let tag = &mut self[id];
            if tag.invalid {
                continue;
            }
            tag.invalid = true;
            worklist.extend_from_slice(&tag.cascade);
        }
    }

    /// Register `to` in `from`'s cascade list. Registration on an
    /// already-invalid tag still propagates immediately.
    pub fn cascade_invalidation_to(&mut self, from: TagId, to: TagId) {
        self[from].cascade.push(to);
        if self[from].invalid {
            self.invalidate(to);
        }
    }

    /// Try to pair two tags, in either direction.
    ///
    /// A valid Start/End couple with matching names and `end.pos >=
    /// start.pos` is linked both ways; pairing in the start→end direction
    /// additionally cascades the start's invalidation onto the end (an
    /// orphaned start takes its forced end tag down with it). Anything else
    /// is a no-op.
    pub fn pair_with(&mut self, a: TagId, b: TagId) {
        if self[a].name != self[b].name {
            return;
        }
        let (a_kind, b_kind) = (self[a].kind, self[b].kind);
        if a_kind == TagKind::Start
            && b_kind == TagKind::End
            && self[b].pos >= self[a].pos
            && !self[a].invalid
            && !self[b].invalid
        {
            self[a].end_tag = Some(b);
            self[b].start_tag = Some(a);
            self.cascade_invalidation_to(a, b);
        } else if a_kind == TagKind::End && b_kind == TagKind::Start && self[b].pos <= self[a].pos
        {
            self[a].start_tag = Some(b);
            self[b].end_tag = Some(a);
        }
    }

    /// Whether `end` may close `start`: right kinds, same name, ordered
    /// positions, `end` still valid, and no existing pairing on either side
    /// that disagrees.
    pub fn can_close(&self, end: TagId, start: TagId) -> bool {
        let e = &self[end];
        let s = &self[start];
        !e.invalid
            && e.kind == TagKind::End
            && s.kind == TagKind::Start
            && e.name == s.name
            && e.pos >= s.pos
            && e.start_tag.is_none_or(|id| id == start)
            && s.end_tag.is_none_or(|id| id == end)
    }
}

impl Index<TagId> for TagArena {
    type Output = Tag;

    fn index(&self, id: TagId) -> &Tag {
        &self.tags[id.0 as usize]
    }
}

impl IndexMut<TagId> for TagArena {
    fn index_mut(&mut self, id: TagId) -> &mut Tag {
        &mut self.tags[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(arena: &mut TagArena, name: &str, pos: usize) -> TagId {
        arena.alloc(Tag::new(TagKind::Start, name.to_string(), pos, 0, 0))
    }

    fn end(arena: &mut TagArena, name: &str, pos: usize) -> TagId {
        arena.alloc(Tag::new(TagKind::End, name.to_string(), pos, 0, 0))
    }

    #[test]
    fn invalidation_is_idempotent() {
        let mut arena = TagArena::new();
        let a = start(&mut arena, "X", 0);
        arena.invalidate(a);
        assert!(arena[a].is_invalid());
        arena.invalidate(a);
        assert!(arena[a].is_invalid());
    }

    #[test]
    fn cascade_cycle_terminates() {
        let mut arena = TagArena::new();
        let a = start(&mut arena, "X", 0);
        let b = start(&mut arena, "Y", 1);
        let c = start(&mut arena, "Z", 2);
        arena.cascade_invalidation_to(a, b);
        arena.cascade_invalidation_to(b, c);
        arena.cascade_invalidation_to(c, a);
        arena.invalidate(b);
        assert!(arena[a].is_invalid());
        assert!(arena[b].is_invalid());
        assert!(arena[c].is_invalid());
    }

    #[test]
    fn cascade_registration_on_invalid_tag_propagates() {
        let mut arena = TagArena::new();
        let a = start(&mut arena, "X", 0);
        let b = start(&mut arena, "Y", 1);
        arena.invalidate(a);
        arena.cascade_invalidation_to(a, b);
        assert!(arena[b].is_invalid());
    }

    #[test]
    fn pairing_is_symmetric_but_cascade_is_not() {
        let mut arena = TagArena::new();
        let s = start(&mut arena, "X", 0);
        let e = end(&mut arena, "X", 5);
        arena.pair_with(s, e);
        assert_eq!(arena[s].end_tag, Some(e));
        assert_eq!(arena[e].start_tag, Some(s));

        // Invalidating the end leaves the start alone.
        arena.invalidate(e);
        assert!(!arena[s].is_invalid());
    }

    #[test]
    fn invalidating_start_takes_end_down() {
        let mut arena = TagArena::new();
        let s = start(&mut arena, "X", 0);
        let e = end(&mut arena, "X", 5);
        arena.pair_with(s, e);
        arena.invalidate(s);
        assert!(arena[e].is_invalid());
    }

    #[test]
    fn pairing_rejects_wrong_order_and_name() {
        let mut arena = TagArena::new();
        let s = start(&mut arena, "X", 5);
        let e = end(&mut arena, "X", 2);
        arena.pair_with(s, e);
        assert_eq!(arena[s].end_tag, None);

        let s2 = start(&mut arena, "X", 0);
        let e2 = end(&mut arena, "Y", 3);
        arena.pair_with(s2, e2);
        assert_eq!(arena[s2].end_tag, None);
    }

    #[test]
    fn reverse_direction_links_without_cascade() {
        let mut arena = TagArena::new();
        let e = end(&mut arena, "X", 5);
        let s = start(&mut arena, "X", 0);
        arena.pair_with(e, s);
        assert_eq!(arena[e].start_tag, Some(s));
        assert_eq!(arena[s].end_tag, Some(e));
        arena.invalidate(s);
        assert!(!arena[e].is_invalid());
    }

    #[test]
    fn can_close_respects_existing_pairing() {
        let mut arena = TagArena::new();
        let s1 = start(&mut arena, "X", 0);
        let s2 = start(&mut arena, "X", 1);
        let e = end(&mut arena, "X", 5);
        arena.pair_with(s1, e);
        assert!(arena.can_close(e, s1));
        assert!(!arena.can_close(e, s2));
    }

    #[test]
    fn can_close_rejects_invalid_and_self_closing() {
        let mut arena = TagArena::new();
        let s = start(&mut arena, "X", 0);
        let e = end(&mut arena, "X", 5);
        arena.invalidate(e);
        assert!(!arena.can_close(e, s));

        let sc = arena.alloc(Tag::new(TagKind::SelfClosing, "X".to_string(), 0, 0, 0));
        let e2 = end(&mut arena, "X", 5);
        assert!(!arena.can_close(e2, sc));
    }
}
