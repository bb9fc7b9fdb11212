//! Per-scope snapshots of what the schema allows at the current depth.
//!
//! Each accepted non-self-closing start tag pushes a fresh [`Context`]
//! computed from its schema entry and the parent context; popping the tag
//! restores the parent snapshot. Snapshots are immutable once created.

use crate::schema::{NameId, NameSet, Schema, TagSchema, flags};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub(crate) allowed_children: NameSet,
    pub(crate) allowed_descendants: NameSet,
    pub(crate) flags: u32,
}

impl Context {
    /// The document root context.
    pub fn root(schema: &Schema) -> Self {
        Context {
            allowed_children: schema.root_allowed_children().clone(),
            allowed_descendants: schema.root_allowed_descendants().clone(),
            flags: 0,
        }
    }

    /// The context inside an accepted start tag.
    ///
    /// A transparent tag keeps its parent's permissions and can only narrow
    /// them; an opaque tag replaces them with its own configured set. In
    /// both cases the descendant set is the AND-chain of every ancestor,
    /// and children can never include something banned as a descendant.
    /// Descendant-scoped line-break restrictions propagate one level down
    /// as child-scoped ones.
    pub fn child_of(&self, tag_flags: u32, tag_schema: &TagSchema) -> Context {
        let mut allowed_children = tag_schema.allowed_children.clone();
        if tag_flags & flags::IS_TRANSPARENT != 0 {
            allowed_children.intersect_with(&self.allowed_children);
        }
        let mut allowed_descendants = self.allowed_descendants.clone();
        allowed_descendants.intersect_with(&tag_schema.allowed_descendants);
        allowed_children.intersect_with(&allowed_descendants);

        let mut ctx_flags = tag_flags | (self.flags & flags::NO_BR_DESCENDANT);
        if ctx_flags & flags::NO_BR_DESCENDANT != 0 {
            ctx_flags |= flags::NO_BR_CHILD;
        }

        Context {
            allowed_children,
            allowed_descendants,
            flags: ctx_flags,
        }
    }

    /// O(1) bit test: may `name` open directly here?
    pub fn tag_is_allowed(&self, name: NameId) -> bool {
        self.allowed_children.contains(name)
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;

    fn schema_abc() -> Schema {
        let mut builder = SchemaBuilder::new();
        builder.tag("a");
        builder.tag("b").only_children(&["c"]);
        builder.tag("c").rule_flags(flags::IS_TRANSPARENT);
        builder.tag("d").deny_descendant("a");
        builder.build()
    }

    #[test]
    fn root_allows_everything_by_default() {
        let schema = schema_abc();
        let root = Context::root(&schema);
        for name in ["A", "B", "C", "D"] {
            assert!(root.tag_is_allowed(schema.name_id(name).unwrap()));
        }
    }

    #[test]
    fn opaque_tag_replaces_allowed_children() {
        let schema = schema_abc();
        let root = Context::root(&schema);
        let b = schema.name_id("B").unwrap();
        let inside_b = root.child_of(0, schema.tag(b));
        assert!(inside_b.tag_is_allowed(schema.name_id("C").unwrap()));
        assert!(!inside_b.tag_is_allowed(schema.name_id("A").unwrap()));
    }

    #[test]
    fn transparent_tag_inherits_parent_restrictions() {
        let schema = schema_abc();
        let root = Context::root(&schema);
        let b = schema.name_id("B").unwrap();
        let c = schema.name_id("C").unwrap();
        let inside_b = root.child_of(0, schema.tag(b));
        // C is transparent: inside B>C only what B allowed remains.
        let inside_c = inside_b.child_of(flags::IS_TRANSPARENT, schema.tag(c));
        assert!(inside_c.tag_is_allowed(c));
        assert!(!inside_c.tag_is_allowed(schema.name_id("A").unwrap()));
    }

    #[test]
    fn descendant_bans_reach_through_children() {
        let schema = schema_abc();
        let root = Context::root(&schema);
        let d = schema.name_id("D").unwrap();
        let a = schema.name_id("A").unwrap();
        let c = schema.name_id("C").unwrap();
        let inside_d = root.child_of(0, schema.tag(d));
        assert!(!inside_d.tag_is_allowed(a));
        // The ban survives an intermediate level that would allow A.
        let deeper = inside_d.child_of(0, schema.tag(c));
        assert!(!deeper.tag_is_allowed(a));
        assert!(!deeper.allowed_descendants.contains(a));
    }

    #[test]
    fn no_br_descendant_implies_no_br_child_below() {
        let schema = schema_abc();
        let root = Context::root(&schema);
        let a = schema.name_id("A").unwrap();
        let ctx = root.child_of(flags::NO_BR_DESCENDANT, schema.tag(a));
        assert_ne!(ctx.flags() & flags::NO_BR_CHILD, 0);
        // And it keeps propagating to grandchildren.
        let deeper = ctx.child_of(0, schema.tag(a));
        assert_ne!(deeper.flags() & flags::NO_BR_CHILD, 0);
        assert_ne!(deeper.flags() & flags::NO_BR_DESCENDANT, 0);
    }
}
