//! The compiled tag schema consumed by the parser.
//!
//! A [`Schema`] is the static input the parser runs against: one entry per
//! tag name, each holding its limits, rule flags, rule name-sets and the
//! bitfield slots used for the allowed-children/allowed-descendants model.
//! Schemas are built once (see [`SchemaBuilder`]) and never mutated during a
//! parse; the parser keeps its own copy so runtime overrides such as
//! `disable_tag` stay local to that parser instance.

pub mod attributes;
pub mod builder;

pub use attributes::{AttrSchema, AttributeFilter, RegexFilter};
pub use builder::SchemaBuilder;

use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Rule flags attached to a tag schema entry and copied onto tags at
/// creation. Stored as plain bits so context snapshots can combine them
/// cheaply.
pub mod flags {
    /// Convert an unpaired start tag into a self-closing tag instead of
    /// leaving it open to the end of the text.
    pub const AUTO_CLOSE: u32 = 1 << 0;
    /// Re-open this tag after it has been force-closed by an overlapping
    /// end tag.
    pub const AUTO_REOPEN: u32 = 1 << 1;
    /// While this tag is open, other tags are invalidated unless they close
    /// it or are system tags.
    pub const IGNORE_TAGS: u32 = 1 << 2;
    /// Literal text inside this tag is emitted as ignored spans.
    pub const IGNORE_TEXT: u32 = 1 << 3;
    /// This tag inherits its parent's allowed-children set instead of
    /// replacing it.
    pub const IS_TRANSPARENT: u32 = 1 << 4;
    /// No line breaks may be produced directly inside this tag.
    pub const NO_BR_CHILD: u32 = 1 << 5;
    /// No line breaks anywhere inside this tag, at any depth.
    pub const NO_BR_DESCENDANT: u32 = 1 << 6;
    /// Trim whitespace up to one newline before this tag.
    pub const TRIM_BEFORE: u32 = 1 << 7;
    /// Skip newlines following this tag (one after a start tag, two after
    /// an end tag).
    pub const TRIM_AFTER: u32 = 1 << 8;
}

/// Dense bit-slot identifier assigned to each tag name at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NameId(u32);

impl NameId {
    pub(crate) fn new(bit: u32) -> Self {
        NameId(bit)
    }

    /// The bit number this name occupies in [`NameSet`] bitfields.
    pub fn bit(self) -> usize {
        self.0 as usize
    }
}

/// A set of tag names represented as a bitfield over their [`NameId`] slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameSet {
    words: Vec<u64>,
}

impl NameSet {
    /// An empty set sized for `n` names.
    pub fn empty(n: usize) -> Self {
        NameSet {
            words: vec![0; n.div_ceil(64)],
        }
    }

    /// A set containing every one of the `n` configured names.
    pub fn all(n: usize) -> Self {
        let mut set = Self::empty(n);
        for word in 0..n / 64 {
            set.words[word] = u64::MAX;
        }
        if n % 64 != 0 {
            set.words[n / 64] = (1u64 << (n % 64)) - 1;
        }
        set
    }

    pub fn insert(&mut self, id: NameId) {
        let bit = id.bit();
        if bit / 64 >= self.words.len() {
            self.words.resize(bit / 64 + 1, 0);
        }
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    pub fn remove(&mut self, id: NameId) {
        let bit = id.bit();
        if let Some(word) = self.words.get_mut(bit / 64) {
            *word &= !(1 << (bit % 64));
        }
    }

    pub fn contains(&self, id: NameId) -> bool {
        let bit = id.bit();
        self.words
            .get(bit / 64)
            .is_some_and(|word| word & (1 << (bit % 64)) != 0)
    }

    /// In-place intersection with another set.
    pub fn intersect_with(&mut self, other: &NameSet) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate the ids present in this set, in bit order.
    pub fn iter(&self) -> impl Iterator<Item = NameId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| NameId((i * 64 + bit) as u32))
        })
    }
}

/// Compiled configuration for a single tag name.
#[derive(Debug, Serialize)]
pub struct TagSchema {
    pub name: String,
    /// Bit slot in the allowed-children/descendants bitfields.
    pub bit_number: NameId,
    /// Lifetime cap on accepted uses of this tag per parse.
    pub tag_limit: u32,
    /// Cap on simultaneously open instances of this tag.
    pub nesting_limit: u32,
    /// Rule flags, see [`flags`].
    pub flags: u32,
    pub allowed_children: NameSet,
    pub allowed_descendants: NameSet,
    /// Parents auto-closed when this tag is opened directly inside them.
    pub close_parent: NameSet,
    /// Ancestors auto-closed when this tag is opened anywhere inside them.
    pub close_ancestor: NameSet,
    /// At least one of these must be open for this tag to be valid.
    pub require_ancestor: NameSet,
    /// Parents that are closed and re-opened around this tag.
    pub foster_parent: NameSet,
    pub attributes: BTreeMap<String, AttrSchema>,
    pub disabled: bool,
}

/// The full compiled schema: every configured tag plus the root context.
#[derive(Debug, Serialize)]
pub struct Schema {
    tags: Vec<TagSchema>,
    by_name: HashMap<String, NameId>,
    root_allowed_children: NameSet,
    root_allowed_descendants: NameSet,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Number of configured tag names (and thus bitfield width).
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Look up a tag name (already normalized) to its bit slot.
    pub fn name_id(&self, name: &str) -> Option<NameId> {
        self.by_name.get(name).copied()
    }

    pub fn tag(&self, id: NameId) -> &TagSchema {
        &self.tags[id.bit()]
    }

    pub(crate) fn tag_mut(&mut self, id: NameId) -> &mut TagSchema {
        &mut self.tags[id.bit()]
    }

    pub fn root_allowed_children(&self) -> &NameSet {
        &self.root_allowed_children
    }

    pub fn root_allowed_descendants(&self) -> &NameSet {
        &self.root_allowed_descendants
    }

    pub(crate) fn from_parts(
        tags: Vec<TagSchema>,
        by_name: HashMap<String, NameId>,
        root_allowed_children: NameSet,
        root_allowed_descendants: NameSet,
    ) -> Self {
        Schema {
            tags,
            by_name,
            root_allowed_children,
            root_allowed_descendants,
        }
    }
}

/// Normalize a tag name: uppercased unless it carries a namespace prefix,
/// in which case it is kept verbatim.
pub fn normalize_name(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        name.to_ascii_uppercase()
    }
}

/// Names reserved for the parser's own zero-schema markers: `br` (forced
/// line break), `i` (ignored span) and `pb` (paragraph break). Lowercase on
/// purpose so they can never collide with normalized schema names.
pub fn is_system_name(name: &str) -> bool {
    matches!(name, "br" | "i" | "pb")
}
