//! Programmatic construction of a [`Schema`].
//!
//! This is a plain builder for tests, demos and embedders, not the
//! configuration compiler of a full deployment: names are normalized,
//! bit slots are assigned densely in declaration order, and the
//! allowed-children/descendants bitfields are materialized at `build()`.

use std::collections::{BTreeMap, HashMap};

use super::attributes::AttrSchema;
use super::{NameId, NameSet, Schema, TagSchema, normalize_name};

/// Whether a tag restricts its contents by exclusion or by enumeration.
#[derive(Debug, Clone, Default)]
enum ChildPolicy {
    /// Everything allowed except the listed names.
    #[default]
    AllowAll,
    /// Only the listed names are allowed.
    Only(Vec<String>),
}

/// Per-tag draft accumulated by the builder.
#[derive(Debug, Default)]
pub struct TagDraft {
    name: String,
    tag_limit: Option<u32>,
    nesting_limit: Option<u32>,
    flags: u32,
    children: ChildPolicy,
    deny_children: Vec<String>,
    deny_descendants: Vec<String>,
    close_parent: Vec<String>,
    close_ancestor: Vec<String>,
    require_ancestor: Vec<String>,
    foster_parent: Vec<String>,
    attributes: BTreeMap<String, AttrSchema>,
}

impl TagDraft {
    pub fn tag_limit(&mut self, limit: u32) -> &mut Self {
        self.tag_limit = Some(limit);
        self
    }

    pub fn nesting_limit(&mut self, limit: u32) -> &mut Self {
        self.nesting_limit = Some(limit);
        self
    }

    /// OR the given rule flags into this tag's flags.
    pub fn rule_flags(&mut self, flags: u32) -> &mut Self {
        self.flags |= flags;
        self
    }

    /// Restrict direct children to exactly the listed names.
    pub fn only_children(&mut self, names: &[&str]) -> &mut Self {
        self.children = ChildPolicy::Only(names.iter().map(|n| normalize_name(n)).collect());
        self
    }

    pub fn deny_child(&mut self, name: &str) -> &mut Self {
        self.deny_children.push(normalize_name(name));
        self
    }

    pub fn deny_descendant(&mut self, name: &str) -> &mut Self {
        self.deny_descendants.push(normalize_name(name));
        self
    }

    pub fn close_parent(&mut self, name: &str) -> &mut Self {
        self.close_parent.push(normalize_name(name));
        self
    }

    pub fn close_ancestor(&mut self, name: &str) -> &mut Self {
        self.close_ancestor.push(normalize_name(name));
        self
    }

    pub fn require_ancestor(&mut self, name: &str) -> &mut Self {
        self.require_ancestor.push(normalize_name(name));
        self
    }

    pub fn foster_parent(&mut self, name: &str) -> &mut Self {
        self.foster_parent.push(normalize_name(name));
        self
    }

    pub fn attribute(&mut self, name: &str, schema: AttrSchema) -> &mut Self {
        self.attributes.insert(name.to_string(), schema);
        self
    }
}

/// Builds a [`Schema`] from per-tag drafts.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    drafts: Vec<TagDraft>,
    by_name: HashMap<String, usize>,
    root_deny_children: Vec<String>,
    root_deny_descendants: Vec<String>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or reopen) a tag by name and return its draft for chaining.
    pub fn tag(&mut self, name: &str) -> &mut TagDraft {
        let name = normalize_name(name);
        let index = *self.by_name.entry(name.clone()).or_insert_with(|| {
            self.drafts.push(TagDraft {
                name,
                ..TagDraft::default()
            });
            self.drafts.len() - 1
        });
        &mut self.drafts[index]
    }

    /// Forbid a tag as a direct child of the document root.
    pub fn deny_at_root(&mut self, name: &str) -> &mut Self {
        self.root_deny_children.push(normalize_name(name));
        self
    }

    /// Forbid a tag anywhere in the document.
    pub fn deny_descendant_of_root(&mut self, name: &str) -> &mut Self {
        self.root_deny_descendants.push(normalize_name(name));
        self
    }

    pub fn build(self) -> Schema {
        let SchemaBuilder {
            drafts,
            by_name,
            root_deny_children,
            root_deny_descendants,
        } = self;
        let n = drafts.len();
        let lookup: HashMap<String, NameId> = by_name
            .iter()
            .map(|(name, &index)| (name.clone(), NameId::new(index as u32)))
            .collect();

        // Unknown names in rule sets are silently skipped: a schema may
        // reference tags provided by plugins that were not configured here.
        let to_set = |names: &[String]| {
            let mut set = NameSet::empty(n);
            for name in names {
                if let Some(&id) = lookup.get(name) {
                    set.insert(id);
                }
            }
            set
        };

        let mut tags = Vec::with_capacity(n);
        for (index, draft) in drafts.into_iter().enumerate() {
            let allowed_children = match &draft.children {
                ChildPolicy::AllowAll => {
                    let mut set = NameSet::all(n);
                    for name in &draft.deny_children {
                        if let Some(&id) = lookup.get(name) {
                            set.remove(id);
                        }
                    }
                    set
                }
                ChildPolicy::Only(names) => to_set(names),
            };
            let mut allowed_descendants = NameSet::all(n);
            for name in &draft.deny_descendants {
                if let Some(&id) = lookup.get(name) {
                    allowed_descendants.remove(id);
                }
            }
            tags.push(TagSchema {
                name: draft.name,
                bit_number: NameId::new(index as u32),
                tag_limit: draft.tag_limit.unwrap_or(u32::MAX),
                nesting_limit: draft.nesting_limit.unwrap_or(10),
                flags: draft.flags,
                allowed_children,
                allowed_descendants,
                close_parent: to_set(&draft.close_parent),
                close_ancestor: to_set(&draft.close_ancestor),
                require_ancestor: to_set(&draft.require_ancestor),
                foster_parent: to_set(&draft.foster_parent),
                attributes: draft.attributes,
                disabled: false,
            });
        }

        let mut root_allowed_children = NameSet::all(n);
        for name in &root_deny_children {
            if let Some(&id) = lookup.get(name) {
                root_allowed_children.remove(id);
            }
        }
        let mut root_allowed_descendants = NameSet::all(n);
        for name in &root_deny_descendants {
            if let Some(&id) = lookup.get(name) {
                root_allowed_descendants.remove(id);
            }
        }
        root_allowed_children.intersect_with(&root_allowed_descendants);

        Schema::from_parts(tags, lookup, root_allowed_children, root_allowed_descendants)
    }
}
