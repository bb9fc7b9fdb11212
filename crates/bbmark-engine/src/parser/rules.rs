//! The rule engine: turns the sorted tag stream into well-formed output.
//!
//! Tags are popped in text order and checked against the current context.
//! Structural rules (closeParent, closeAncestor, fosterParent, autoClose,
//! autoReopen) repair the stream by synthesizing zero-width tags instead of
//! rejecting input. Every repair spends from a per-parse budget so that
//! adversarial input cannot make the parse loop; exhausting the budget
//! aborts with [`ParseError::FixingCostExceeded`].

use tracing::{debug, error, warn};

use super::tag::{Tag, TagId, TagKind};
use super::{OpenEntry, ParseError, Session};
use crate::schema::{NameId, flags};

impl Session<'_> {
    /// Drain the stack, then force-close whatever is still open at the end
    /// of the text.
    pub(crate) fn process_all(&mut self) -> Result<(), ParseError> {
        while let Some(id) = self.stack.pop(&self.arena) {
            self.process_tag(id)?;
        }
        while !self.open.is_empty() {
            let innermost = self.open[self.open.len() - 1].tag;
            self.add_magic_end_tag(innermost, self.text.len(), 0);
            while let Some(id) = self.stack.pop(&self.arena) {
                self.process_tag(id)?;
            }
        }
        Ok(())
    }

    fn process_tag(&mut self, id: TagId) -> Result<(), ParseError> {
        if self.context.flags() & flags::IGNORE_TAGS != 0 {
            let closes_innermost = self
                .open
                .last()
                .is_some_and(|entry| self.arena.can_close(id, entry.tag));
            if !closes_innermost && !self.arena[id].is_system_tag() {
                debug!(tag = %self.arena[id].name(), "tag suppressed by ignoreTags context");
                self.arena.invalidate(id);
                return Ok(());
            }
        }

        let pos = self.arena[id].pos;
        let len = self.arena[id].len;
        if pos < self.output.pos() {
            // The cursor already moved past this tag, usually because an
            // earlier tag consumed overlapping text.
            if self.arena[id].kind == TagKind::End
                && let Some(start) = self.arena[id].start_tag
                && self.open.iter().any(|entry| entry.tag == start)
            {
                // Its start tag is still open: re-issue the end tag at the
                // cursor, consuming whatever is left of its text.
                let cursor = self.output.pos();
                let remaining = (pos + len).saturating_sub(cursor);
                let name = self.arena[start].name.clone();
                let prio = self.arena[id].sort_priority;
                let end = self.add_tag(TagKind::End, name, cursor, remaining, prio);
                self.arena.pair_with(start, end);
                return Ok(());
            }
            if self.arena[id].is_ignore_tag() {
                let cursor = self.output.pos();
                let remaining = (pos + len).saturating_sub(cursor);
                if remaining > 0 {
                    let prio = self.arena[id].sort_priority;
                    self.add_ignore_tag(cursor, remaining, prio);
                    return Ok(());
                }
            }
            debug!(tag = %self.arena[id].name(), pos, "overlapping tag discarded");
            self.arena.invalidate(id);
            return Ok(());
        }

        if self.arena[id].invalid {
            return Ok(());
        }

        let ctx_flags = self.context.flags();
        if self.arena[id].is_ignore_tag() {
            self.output.emit_ignore(pos, len, ctx_flags);
        } else if self.arena[id].is_br_tag() {
            if ctx_flags & flags::NO_BR_CHILD == 0 {
                self.output.emit_br(pos, ctx_flags);
            }
        } else if self.arena[id].is_paragraph_break() {
            self.output.catch_up(pos, 0, ctx_flags);
        } else if self.arena[id].kind.is_start() {
            self.process_start_tag(id)?;
        } else {
            self.process_end_tag(id)?;
        }
        Ok(())
    }

    fn process_start_tag(&mut self, id: TagId) -> Result<(), ParseError> {
        let Some(nid) = self.arena[id].name_id else {
            self.arena.invalidate(id);
            return Ok(());
        };
        let schema = self.schema;
        let tag_schema = schema.tag(nid);

        if self.cnt_total[nid.bit()] >= tag_schema.tag_limit {
            warn!(
                tag = %self.arena[id].name(),
                limit = tag_schema.tag_limit,
                "tag limit exceeded"
            );
            self.arena.invalidate(id);
            return Ok(());
        }

        if !self.filter_tag(id, nid) {
            self.arena.invalidate(id);
            return Ok(());
        }

        // Structural rules re-queue the tag after closing or synthesizing
        // other tags; it will be processed again in the new context.
        if self.foster_parent(id, nid)? || self.close_parent(id, nid)? {
            return Ok(());
        }
        if self.close_ancestor(id, nid)? {
            return Ok(());
        }

        if self.cnt_open[nid.bit()] >= tag_schema.nesting_limit {
            warn!(
                tag = %self.arena[id].name(),
                limit = tag_schema.nesting_limit,
                "nesting limit exceeded"
            );
            self.arena.invalidate(id);
            return Ok(());
        }

        if !self.require_ancestor_met(nid) {
            self.arena.invalidate(id);
            return Ok(());
        }

        if !self.context.tag_is_allowed(nid) {
            debug!(tag = %self.arena[id].name(), "tag not allowed in this context");
            self.arena.invalidate(id);
            return Ok(());
        }

        let mut id = id;
        if self.arena[id].flags & flags::AUTO_CLOSE != 0
            && self.arena[id].kind == TagKind::Start
            && self.arena[id].end_tag.is_none()
            && !self.followed_by_closing(id)
        {
            // No end tag in sight: treat the tag as self-closed.
            let src = &self.arena[id];
            let mut copy = Tag::new(
                TagKind::SelfClosing,
                src.name.clone(),
                src.pos,
                src.len,
                src.sort_priority,
            );
            copy.name_id = src.name_id;
            copy.flags = src.flags;
            copy.attributes = src.attributes.clone();
            id = self.arena.alloc(copy);
        }

        let ctx_flags = self.context.flags();
        self.output.emit_tag(&self.arena[id], ctx_flags);
        self.push_context(id, nid);
        Ok(())
    }

    fn process_end_tag(&mut self, id: TagId) -> Result<(), ParseError> {
        let Some(nid) = self.arena[id].name_id else {
            return Ok(());
        };
        if self.cnt_open[nid.bit()] == 0 {
            debug!(tag = %self.arena[id].name(), "unmatched end tag discarded");
            return Ok(());
        }

        // Walk the open stack down to the tag this end tag actually closes,
        // collecting everything that has to be force-closed on the way.
        let mut close_ids: Vec<TagId> = Vec::new();
        let mut matched = false;
        for entry in self.open.iter().rev() {
            if self.arena.can_close(id, entry.tag) {
                matched = true;
                break;
            }
            close_ids.push(entry.tag);
        }
        self.spend(close_ids.len() as u32)?;
        if !matched {
            debug!(tag = %self.arena[id].name(), "end tag closes nothing");
            return Ok(());
        }

        // Force-close the skipped tags, remembering which ones want to be
        // reopened afterwards. The first non-reopenable tag ends the run.
        let mut keep_reopening = self.within_budget();
        let mut reopen: Vec<TagId> = Vec::new();
        for index in 0..close_ids.len() {
            let open_id = close_ids[index];
            if keep_reopening {
                if self.arena[open_id].flags & flags::AUTO_REOPEN != 0 {
                    reopen.push(open_id);
                } else {
                    keep_reopening = false;
                }
            }
            let mut end_pos = self.arena[id].pos;
            if self.arena[open_id].flags & flags::TRIM_BEFORE != 0 {
                end_pos = self.magic_end_pos(end_pos);
            }
            let mut synth = Tag::new(
                TagKind::End,
                self.arena[open_id].name.clone(),
                end_pos,
                0,
                0,
            );
            synth.name_id = self.arena[open_id].name_id;
            synth.flags = self.arena[open_id].flags;
            let ctx_flags = self.context.flags();
            self.output.emit_tag(&synth, ctx_flags);
            self.pop_context();
        }

        let ctx_flags = self.context.flags();
        self.output.emit_tag(&self.arena[id], ctx_flags);
        self.pop_context();

        if close_ids.is_empty() || !self.within_budget() {
            return Ok(());
        }

        // Look ahead for end tags that would immediately close a tag we are
        // about to reopen; cancel those reopenings and swallow their text.
        let base_pos = self.output.pos();
        let mut ignore_pos = base_pos;
        let mut index = self.stack.len();
        'upcoming: while index > 0 {
            index -= 1;
            let upcoming = self.stack.items()[index];
            if self.arena[upcoming].pos > base_pos || self.arena[upcoming].kind.is_start() {
                break;
            }
            let mut j = close_ids.len();
            while j > 0 {
                j -= 1;
                self.spend(1)?;
                if self.arena.can_close(upcoming, close_ids[j]) {
                    close_ids.remove(j);
                    if j < reopen.len() {
                        reopen.remove(j);
                    }
                    ignore_pos = ignore_pos.max(self.arena[upcoming].end_pos());
                    continue 'upcoming;
                }
            }
        }
        if ignore_pos > base_pos {
            let ctx_flags = self.context.flags();
            self.output.emit_ignore(base_pos, ignore_pos - base_pos, ctx_flags);
        }

        // Reopen survivors as zero-width copies at the cursor, inheriting
        // the original end tag pairing so a later end tag closes the copy.
        for index in 0..reopen.len() {
            let start_id = reopen[index];
            let pos = self.output.pos();
            let copy = self.add_copy_tag(start_id, pos, 0, 0);
            if let Some(end_id) = self.arena[start_id].end_tag {
                self.arena.pair_with(copy, end_id);
            }
        }
        Ok(())
    }

    /// closeParent: the innermost open tag is listed as a parent to close.
    fn close_parent(&mut self, id: TagId, nid: NameId) -> Result<bool, ParseError> {
        let schema = self.schema;
        let set = &schema.tag(nid).close_parent;
        if set.is_empty() {
            return Ok(false);
        }
        let Some(entry) = self.open.last() else {
            return Ok(false);
        };
        let parent = entry.tag;
        if !self.arena[parent]
            .name_id
            .is_some_and(|parent_nid| set.contains(parent_nid))
        {
            return Ok(false);
        }
        self.spend(1)?;
        self.requeue_behind_magic_end(id, parent);
        Ok(true)
    }

    /// closeAncestor: like closeParent but scans the whole open stack.
    fn close_ancestor(&mut self, id: TagId, nid: NameId) -> Result<bool, ParseError> {
        let schema = self.schema;
        let set = &schema.tag(nid).close_ancestor;
        if set.is_empty() {
            return Ok(false);
        }
        let Some(ancestor) = self
            .open
            .iter()
            .rev()
            .map(|entry| entry.tag)
            .find(|&tag| {
                self.arena[tag]
                    .name_id
                    .is_some_and(|ancestor_nid| set.contains(ancestor_nid))
            })
        else {
            return Ok(false);
        };
        self.spend(1)?;
        self.requeue_behind_magic_end(id, ancestor);
        Ok(true)
    }

    /// fosterParent: close the parent, then reopen a copy of it right after
    /// this tag's text so the parent "adopts" the rest of its content.
    fn foster_parent(&mut self, id: TagId, nid: NameId) -> Result<bool, ParseError> {
        let schema = self.schema;
        let set = &schema.tag(nid).foster_parent;
        if set.is_empty() {
            return Ok(false);
        }
        let Some(entry) = self.open.last() else {
            return Ok(false);
        };
        let parent = entry.tag;
        let Some(parent_nid) = self.arena[parent].name_id else {
            return Ok(false);
        };
        if !set.contains(parent_nid) {
            return Ok(false);
        }
        if parent_nid != nid && self.within_budget() {
            let (copy_pos, copy_prio) = self.magic_start_coords(self.arena[id].end_pos());
            let copy = self.add_copy_tag(parent, copy_pos, 0, copy_prio);
            // If this tag dies, the fostered copy has no reason to exist.
            self.arena.cascade_invalidation_to(id, copy);
        }
        // Fostering is the most expensive repair: it synthesizes two tags
        // and reprocesses a third.
        self.spend(4)?;
        self.requeue_behind_magic_end(id, parent);
        Ok(true)
    }

    /// Put `id` back on the stack behind a magic end tag that closes
    /// `target`, so the close happens first and `id` is reprocessed in the
    /// outer context.
    fn requeue_behind_magic_end(&mut self, id: TagId, target: TagId) {
        let pos = self.arena[id].pos;
        let prio = self.arena[id].sort_priority;
        self.stack.push(id, &self.arena);
        self.add_magic_end_tag(target, pos, prio.saturating_sub(1));
    }

    /// Synthesize a zero-width end tag paired with `start`.
    fn add_magic_end_tag(&mut self, start: TagId, mut pos: usize, prio: i32) -> TagId {
        if self.arena[start].flags & flags::TRIM_BEFORE != 0 {
            pos = self.magic_end_pos(pos);
        }
        let name = self.arena[start].name.clone();
        let end = self.add_tag(TagKind::End, name, pos, 0, prio);
        self.arena.pair_with(start, end);
        end
    }

    /// Back up over whitespace, but never past the output cursor.
    fn magic_end_pos(&self, mut pos: usize) -> usize {
        let bytes = self.text.as_bytes();
        while pos > self.output.pos() && matches!(bytes[pos - 1], b' ' | b'\n' | b'\t') {
            pos -= 1;
        }
        pos
    }

    /// Position and priority for a tag synthesized at `pos`: skip leading
    /// whitespace, and if that lands exactly on the next queued tag, slot in
    /// just before it.
    fn magic_start_coords(&self, mut pos: usize) -> (usize, i32) {
        let (next_pos, next_prio) = match self.stack.items().last() {
            Some(&next) => (self.arena[next].pos, self.arena[next].sort_priority),
            None => (self.text.len() + 1, 0),
        };
        let bytes = self.text.as_bytes();
        while pos < next_pos && pos < self.text.len() && matches!(bytes[pos], b' ' | b'\n' | b'\t')
        {
            pos += 1;
        }
        let prio = if pos == next_pos {
            next_prio.saturating_sub(1)
        } else {
            0
        };
        (pos, prio)
    }

    /// Copy a tag's identity and attributes to a new position.
    fn add_copy_tag(&mut self, src: TagId, pos: usize, len: usize, prio: i32) -> TagId {
        let kind = self.arena[src].kind;
        let name = self.arena[src].name.clone();
        let attributes = self.arena[src].attributes.clone();
        let id = self.add_tag(kind, name, pos, len, prio);
        self.arena[id].attributes = attributes;
        id
    }

    /// Validate and normalize a tag's attributes against its schema entry.
    /// Returns false if a required attribute ends up missing.
    fn filter_tag(&mut self, id: TagId, nid: NameId) -> bool {
        let schema = self.schema;
        let tag_schema = schema.tag(nid);
        let mut attributes = std::mem::take(&mut self.arena[id].attributes);
        attributes.retain(|name, _| tag_schema.attributes.contains_key(name));

        for (attr_name, attr_schema) in &tag_schema.attributes {
            match attributes.get(attr_name).cloned() {
                Some(raw) => match attr_schema.apply(&raw) {
                    Some(value) => {
                        attributes.insert(attr_name.clone(), value);
                    }
                    None => match &attr_schema.default_value {
                        Some(default) => {
                            debug!(
                                tag = %self.arena[id].name(),
                                attribute = %attr_name,
                                "invalid attribute value replaced by default"
                            );
                            attributes.insert(attr_name.clone(), default.clone());
                        }
                        None => {
                            warn!(
                                tag = %self.arena[id].name(),
                                attribute = %attr_name,
                                "invalid attribute value removed"
                            );
                            attributes.remove(attr_name);
                        }
                    },
                },
                None => {
                    if let Some(default) = &attr_schema.default_value {
                        attributes.insert(attr_name.clone(), default.clone());
                    }
                }
            }
        }

        let mut valid = true;
        for (attr_name, attr_schema) in &tag_schema.attributes {
            if attr_schema.required && !attributes.contains_key(attr_name) {
                error!(
                    tag = %self.arena[id].name(),
                    attribute = %attr_name,
                    "missing required attribute"
                );
                valid = false;
            }
        }
        self.arena[id].attributes = attributes;
        valid
    }

    fn require_ancestor_met(&self, nid: NameId) -> bool {
        let schema = self.schema;
        let set = &schema.tag(nid).require_ancestor;
        if set.is_empty() || set.iter().any(|ancestor| self.cnt_open[ancestor.bit()] > 0) {
            return true;
        }
        error!(tag = %schema.tag(nid).name, "required ancestor not found");
        false
    }

    /// Whether the next queued tag would close `id`.
    fn followed_by_closing(&self, id: TagId) -> bool {
        self.stack
            .items()
            .last()
            .is_some_and(|&next| self.arena.can_close(next, id))
    }

    fn push_context(&mut self, id: TagId, nid: NameId) {
        self.cnt_total[nid.bit()] += 1;
        if self.arena[id].kind == TagKind::SelfClosing {
            return;
        }
        self.cnt_open[nid.bit()] += 1;
        let schema = self.schema;
        let child = self
            .context
            .child_of(self.arena[id].flags, schema.tag(nid));
        let saved = std::mem::replace(&mut self.context, child);
        self.open.push(OpenEntry { tag: id, saved });
    }

    fn pop_context(&mut self) {
        if let Some(entry) = self.open.pop() {
            if let Some(nid) = self.arena[entry.tag].name_id {
                self.cnt_open[nid.bit()] -= 1;
            }
            self.context = entry.saved;
        }
    }

    fn spend(&mut self, cost: u32) -> Result<(), ParseError> {
        self.fixing_cost += cost;
        if self.fixing_cost > self.max_fixing_cost {
            error!(
                cost = self.fixing_cost,
                max = self.max_fixing_cost,
                "fixing cost budget exceeded"
            );
            return Err(ParseError::FixingCostExceeded {
                max: self.max_fixing_cost,
            });
        }
        Ok(())
    }

    /// Soft budget check used to decide whether optional repairs (reopening,
    /// fostering) are still worth attempting.
    fn within_budget(&self) -> bool {
        self.fixing_cost < self.max_fixing_cost
    }
}
