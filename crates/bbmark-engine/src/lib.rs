//! Core engine for parsing BBCode-style markup into an XML-like
//! intermediate representation.
//!
//! A [`Schema`] describes the available tags, their attributes and their
//! structural rules. A [`Parser`] pairs a schema with plugins that scan the
//! input text and register candidate tags; the engine then resolves the
//! candidates into a well-formed document:
//!
//! ```
//! use bbmark_engine::{Parser, SchemaBuilder};
//!
//! let mut builder = SchemaBuilder::new();
//! builder.tag("b");
//! let mut parser = Parser::new(builder.build());
//! parser.register_parser("bbcode", |tags, text, _| {
//!     if let Some(pos) = text.find("[b]") {
//!         tags.add_start_tag("B", pos, 3);
//!     }
//!     if let Some(pos) = text.find("[/b]") {
//!         tags.add_end_tag("B", pos, 4);
//!     }
//! });
//! let ir = parser.parse("hello [b]world[/b]").unwrap();
//! assert_eq!(ir, "<r>hello <B><s>[b]</s>world<e>[/b]</e></B></r>");
//! ```

pub mod parser;
pub mod schema;

pub use parser::{DEFAULT_MAX_FIXING_COST, ParseError, Parser, PluginMatch, TagCollector};
pub use parser::tag::{TagId, TagKind};
pub use schema::attributes::{AttrSchema, AttributeFilter, RegexFilter};
pub use schema::builder::{SchemaBuilder, TagDraft};
pub use schema::{NameId, NameSet, Schema, TagSchema, flags};
