//! The accumulation stack of not-yet-processed tags.
//!
//! Plugins register tags in arbitrary order; the stack keeps them sorted so
//! that popping yields left-to-right text order. Sortedness is cached and
//! only re-established lazily, right before the next pop.

use std::cmp::Ordering;

use super::tag::{Tag, TagArena, TagId};

#[derive(Debug, Default)]
pub struct TagStack {
    items: Vec<TagId>,
    sorted: bool,
}

impl TagStack {
    pub fn new() -> Self {
        TagStack {
            items: Vec::new(),
            sorted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Upcoming tags, bottom to top: the next tag to be popped is last.
    /// Only meaningful while the stack is sorted.
    pub fn items(&self) -> &[TagId] {
        &self.items
    }

    /// Push a tag, invalidating the sortedness cache if it lands out of
    /// order with the current tail.
    pub fn push(&mut self, id: TagId, arena: &TagArena) {
        if self.sorted
            && let Some(&last) = self.items.last()
            && arena[id].pos >= arena[last].pos
        {
            // The tail is the next tag to pop (lowest position); anything at
            // or past it may need to interleave.
            self.sorted = false;
        }
        self.items.push(id);
    }

    /// Pop the next tag in processing order, re-sorting first if needed.
    pub fn pop(&mut self, arena: &TagArena) -> Option<TagId> {
        if !self.sorted {
            self.sort(arena);
        }
        self.items.pop()
    }

    fn sort(&mut self, arena: &TagArena) {
        self.items
            .sort_unstable_by(|&a, &b| compare_tags(&arena[a], &arena[b]));
        self.sorted = true;
    }
}

/// Total order over candidate tags.
///
/// The stack is arranged so that popping from the tail yields ascending
/// text position. `Greater` here means "popped sooner". On equal positions,
/// lower sort priority pops first; then zero-width tags pop before
/// text-consuming ones, with End < SelfClosing < Start among zero-width
/// ties; among text-consuming ties the shorter tag pops first. Ties beyond
/// that are unspecified (the sort is unstable).
fn compare_tags(a: &Tag, b: &Tag) -> Ordering {
    b.pos
        .cmp(&a.pos)
        .then_with(|| b.sort_priority.cmp(&a.sort_priority))
        .then_with(|| {
            if a.len == 0 || b.len == 0 {
                if a.len == 0 && b.len == 0 {
                    b.kind.zero_width_rank().cmp(&a.kind.zero_width_rank())
                } else if a.len == 0 {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            } else {
                b.len.cmp(&a.len)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tag::TagKind;
    use pretty_assertions::assert_eq;

    fn tag(arena: &mut TagArena, kind: TagKind, pos: usize, len: usize, prio: i32) -> TagId {
        arena.alloc(Tag::new(kind, "X".to_string(), pos, len, prio))
    }

    fn pop_all(stack: &mut TagStack, arena: &TagArena) -> Vec<TagId> {
        let mut order = Vec::new();
        while let Some(id) = stack.pop(arena) {
            order.push(id);
        }
        order
    }

    #[test]
    fn pop_order_is_ascending_position() {
        let mut arena = TagArena::new();
        let mut stack = TagStack::new();
        let ids: Vec<TagId> = [5, 1, 3, 0, 4]
            .iter()
            .map(|&pos| tag(&mut arena, TagKind::SelfClosing, pos, 1, 0))
            .collect();
        for &id in &ids {
            stack.push(id, &arena);
        }
        let order = pop_all(&mut stack, &arena);
        let positions: Vec<usize> = order.iter().map(|&id| arena[id].pos()).collect();
        assert_eq!(positions, vec![0, 1, 3, 4, 5]);
    }

    #[test]
    fn lower_priority_pops_first_on_position_tie() {
        let mut arena = TagArena::new();
        let mut stack = TagStack::new();
        let late = tag(&mut arena, TagKind::SelfClosing, 2, 1, 10);
        let early = tag(&mut arena, TagKind::SelfClosing, 2, 1, -10);
        stack.push(late, &arena);
        stack.push(early, &arena);
        assert_eq!(pop_all(&mut stack, &arena), vec![early, late]);
    }

    #[test]
    fn zero_width_end_pops_before_zero_width_start() {
        let mut arena = TagArena::new();
        let mut stack = TagStack::new();
        let s = tag(&mut arena, TagKind::Start, 3, 0, 0);
        let sc = tag(&mut arena, TagKind::SelfClosing, 3, 0, 0);
        let e = tag(&mut arena, TagKind::End, 3, 0, 0);
        stack.push(s, &arena);
        stack.push(sc, &arena);
        stack.push(e, &arena);
        assert_eq!(pop_all(&mut stack, &arena), vec![e, sc, s]);
    }

    #[test]
    fn zero_width_pops_before_text_consuming_at_same_position() {
        let mut arena = TagArena::new();
        let mut stack = TagStack::new();
        let wide = tag(&mut arena, TagKind::Start, 3, 4, 0);
        let zero = tag(&mut arena, TagKind::Start, 3, 0, 0);
        stack.push(wide, &arena);
        stack.push(zero, &arena);
        assert_eq!(pop_all(&mut stack, &arena), vec![zero, wide]);
    }

    #[test]
    fn shorter_tag_pops_first_on_full_tie() {
        let mut arena = TagArena::new();
        let mut stack = TagStack::new();
        let long = tag(&mut arena, TagKind::Start, 3, 9, 0);
        let short = tag(&mut arena, TagKind::Start, 3, 2, 0);
        stack.push(long, &arena);
        stack.push(short, &arena);
        assert_eq!(pop_all(&mut stack, &arena), vec![short, long]);
    }

    #[test]
    fn sort_is_deterministic_for_distinct_keys() {
        let mut arena = TagArena::new();
        let ids: Vec<TagId> = (0..20)
            .map(|i| tag(&mut arena, TagKind::SelfClosing, i * 7 % 13, 1 + i % 3, i as i32 % 5))
            .collect();
        let mut first = None;
        for _ in 0..3 {
            let mut stack = TagStack::new();
            for &id in ids.iter().rev() {
                stack.push(id, &arena);
            }
            let order = pop_all(&mut stack, &arena);
            let keys: Vec<(usize, i32, usize)> = order
                .iter()
                .map(|&id| (arena[id].pos(), arena[id].sort_priority(), arena[id].len()))
                .collect();
            match &first {
                None => first = Some(keys),
                Some(expected) => assert_eq!(&keys, expected),
            }
        }
    }

    #[test]
    fn in_order_pushes_keep_stack_sorted() {
        let mut arena = TagArena::new();
        let mut stack = TagStack::new();
        for pos in (0..5).rev() {
            let id = tag(&mut arena, TagKind::SelfClosing, pos, 1, 0);
            stack.push(id, &arena);
        }
        assert!(stack.sorted);
        let order = pop_all(&mut stack, &arena);
        let positions: Vec<usize> = order.iter().map(|&id| arena[id].pos()).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    }
}
