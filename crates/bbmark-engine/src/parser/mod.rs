//! The parser: plugins discover candidate tags, the rule engine resolves
//! them against the schema, and the output stream turns the survivors into
//! the intermediate representation.
//!
//! One [`Parser::parse`] call owns all mutable state for its duration
//! (arena, stack, context chain, counters, output buffer), bundled in a
//! per-call `Session`. Tag-scoped problems (bad attributes, limits,
//! disallowed nesting) are logged and resolved by invalidating the tag;
//! only parse-scoped failures surface as [`ParseError`].

pub mod context;
pub mod output;
pub mod rules;
pub mod stack;
pub mod tag;

use std::ops::Range;

use regex::Regex;
use tracing::{debug, trace, warn};

use crate::schema::{NameId, Schema, is_system_name, normalize_name};
use context::Context;
use output::OutputStream;
use stack::TagStack;
use tag::{Tag, TagArena, TagId, TagKind};

/// Default budget for markup-fixing work before a parse is aborted.
pub const DEFAULT_MAX_FIXING_COST: u32 = 1000;

/// Default cap on regex matches handed to a single plugin per parse.
const DEFAULT_REGEX_LIMIT: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The markup required more fixing work than the configured budget
    /// allows; the input is pathologically malformed or the schema's
    /// structural rules loop. No partial output is produced.
    #[error("fixing cost budget exceeded (maximum {max})")]
    FixingCostExceeded { max: u32 },
    /// `parse()` was called while a parse was already in progress on the
    /// same instance.
    #[error("parse() is not reentrant")]
    ReentrantParse,
}

/// One regex match handed to a plugin callback.
#[derive(Debug, Clone)]
pub struct PluginMatch {
    /// Byte range of the whole match.
    pub range: Range<usize>,
    /// Byte ranges of capture groups 1.., in order.
    pub groups: Vec<Option<Range<usize>>>,
}

type PluginCallback = Box<dyn FnMut(&mut TagCollector<'_, '_>, &str, &[PluginMatch])>;

struct Plugin {
    name: String,
    quick_match: Option<String>,
    regex: Option<Regex>,
    regex_limit: usize,
    callback: PluginCallback,
}

/// The parser's handle given to plugin callbacks for registering tags.
pub struct TagCollector<'a, 'p> {
    session: &'a mut Session<'p>,
}

impl TagCollector<'_, '_> {
    /// The text being parsed.
    pub fn text(&self) -> &str {
        self.session.text
    }

    pub fn add_start_tag(&mut self, name: &str, pos: usize, len: usize) -> TagId {
        self.add_start_tag_with_priority(name, pos, len, 0)
    }

    pub fn add_start_tag_with_priority(
        &mut self,
        name: &str,
        pos: usize,
        len: usize,
        prio: i32,
    ) -> TagId {
        self.session
            .add_tag(TagKind::Start, normalize_name(name), pos, len, prio)
    }

    pub fn add_end_tag(&mut self, name: &str, pos: usize, len: usize) -> TagId {
        self.add_end_tag_with_priority(name, pos, len, 0)
    }

    pub fn add_end_tag_with_priority(
        &mut self,
        name: &str,
        pos: usize,
        len: usize,
        prio: i32,
    ) -> TagId {
        self.session
            .add_tag(TagKind::End, normalize_name(name), pos, len, prio)
    }

    pub fn add_self_closing_tag(&mut self, name: &str, pos: usize, len: usize) -> TagId {
        self.add_self_closing_tag_with_priority(name, pos, len, 0)
    }

    pub fn add_self_closing_tag_with_priority(
        &mut self,
        name: &str,
        pos: usize,
        len: usize,
        prio: i32,
    ) -> TagId {
        self.session
            .add_tag(TagKind::SelfClosing, normalize_name(name), pos, len, prio)
    }

    /// Register a pre-paired Start/End couple. Returns the start tag.
    pub fn add_tag_pair(
        &mut self,
        name: &str,
        start_pos: usize,
        start_len: usize,
        end_pos: usize,
        end_len: usize,
    ) -> TagId {
        self.add_tag_pair_with_priority(name, start_pos, start_len, end_pos, end_len, 0)
    }

    pub fn add_tag_pair_with_priority(
        &mut self,
        name: &str,
        start_pos: usize,
        start_len: usize,
        end_pos: usize,
        end_len: usize,
        prio: i32,
    ) -> TagId {
        let name = normalize_name(name);
        // The end tag is registered first to keep the stack closer to
        // sorted order.
        let end = self.session.add_tag(
            TagKind::End,
            name.clone(),
            end_pos,
            end_len,
            prio.saturating_neg(),
        );
        let start = self
            .session
            .add_tag(TagKind::Start, name, start_pos, start_len, prio);
        self.session.arena.pair_with(start, end);
        start
    }

    /// Mark a span of text as ignored.
    pub fn add_ignore_tag(&mut self, pos: usize, len: usize) -> TagId {
        self.session.add_ignore_tag(pos, len, 0)
    }

    /// Register a forced line break.
    pub fn add_br_tag(&mut self, pos: usize) -> TagId {
        self.session
            .add_tag(TagKind::SelfClosing, "br".to_string(), pos, 0, 0)
    }

    /// Register a paragraph break, flushing pending text at `pos`.
    pub fn add_paragraph_break(&mut self, pos: usize) -> TagId {
        self.session
            .add_tag(TagKind::SelfClosing, "pb".to_string(), pos, 0, 0)
    }

    pub fn set_attribute(&mut self, tag: TagId, name: &str, value: &str) {
        self.session.arena[tag]
            .attributes
            .insert(name.to_string(), value.to_string());
    }

    pub fn pair_tags(&mut self, a: TagId, b: TagId) {
        self.session.arena.pair_with(a, b);
    }

    pub fn cascade_invalidation(&mut self, from: TagId, to: TagId) {
        self.session.arena.cascade_invalidation_to(from, to);
    }

    pub fn invalidate(&mut self, tag: TagId) {
        self.session.arena.invalidate(tag);
    }
}

/// All mutable state of one parse call.
pub(crate) struct Session<'p> {
    pub(crate) schema: &'p Schema,
    pub(crate) text: &'p str,
    pub(crate) arena: TagArena,
    pub(crate) stack: TagStack,
    pub(crate) open: Vec<OpenEntry>,
    pub(crate) context: Context,
    /// Lifetime accepted uses per tag name, for tagLimit.
    pub(crate) cnt_total: Vec<u32>,
    /// Currently open instances per tag name, for nestingLimit.
    pub(crate) cnt_open: Vec<u32>,
    pub(crate) fixing_cost: u32,
    pub(crate) max_fixing_cost: u32,
    pub(crate) output: OutputStream<'p>,
}

/// An open start tag together with the context snapshot it replaced.
pub(crate) struct OpenEntry {
    pub(crate) tag: TagId,
    pub(crate) saved: Context,
}

impl<'p> Session<'p> {
    fn new(schema: &'p Schema, text: &'p str, max_fixing_cost: u32) -> Self {
        let n = schema.tag_count();
        Session {
            schema,
            text,
            arena: TagArena::new(),
            stack: TagStack::new(),
            open: Vec::new(),
            context: Context::root(schema),
            cnt_total: vec![0; n],
            cnt_open: vec![0; n],
            fixing_cost: 0,
            max_fixing_cost,
            output: OutputStream::new(text),
        }
    }

    /// Create a tag and, if it is usable, put it on the stack. Unknown,
    /// disabled and out-of-bounds tags are stored invalidated so plugins
    /// holding the returned id can still pair against them.
    pub(crate) fn add_tag(
        &mut self,
        kind: TagKind,
        name: String,
        pos: usize,
        len: usize,
        prio: i32,
    ) -> TagId {
        let mut tag = Tag::new(kind, name, pos, len, prio);
        let name_id = self.schema.name_id(&tag.name);
        if let Some(nid) = name_id {
            tag.name_id = Some(nid);
            tag.flags = self.schema.tag(nid).flags;
        }
        let id = self.arena.alloc(tag);

        // The span must also land on character boundaries: every slice the
        // output stream takes starts or ends at a tag's pos/end_pos.
        let span_ok = pos.checked_add(len).is_some_and(|end| {
            end <= self.text.len()
                && self.text.is_char_boundary(pos)
                && self.text.is_char_boundary(end)
        });
        if name_id.is_none() && !is_system_name(&self.arena[id].name) {
            debug!(tag = %self.arena[id].name(), "unknown tag name");
            self.arena.invalidate(id);
        } else if name_id.is_some_and(|nid| self.schema.tag(nid).disabled) {
            warn!(tag = %self.arena[id].name(), "tag is disabled");
            self.arena.invalidate(id);
        } else if !span_ok {
            debug!(tag = %self.arena[id].name(), pos, len, "tag span out of bounds or splits a character");
            self.arena.invalidate(id);
        } else {
            self.stack.push(id, &self.arena);
        }
        id
    }

    pub(crate) fn add_ignore_tag(&mut self, pos: usize, len: usize, prio: i32) -> TagId {
        let len = len.min(self.text.len().saturating_sub(pos));
        self.add_tag(TagKind::SelfClosing, "i".to_string(), pos, len, prio)
    }

    fn finish(self) -> String {
        self.output.finalize(self.context.flags())
    }
}

/// A configured parser instance: a schema plus registered plugins.
///
/// The instance owns its schema copy, so runtime overrides like
/// [`disable_tag`](Parser::disable_tag) never leak across parsers.
pub struct Parser {
    schema: Schema,
    plugins: Vec<Plugin>,
    max_fixing_cost: u32,
    parsing: bool,
}

impl Parser {
    pub fn new(schema: Schema) -> Self {
        Parser {
            schema,
            plugins: Vec::new(),
            max_fixing_cost: DEFAULT_MAX_FIXING_COST,
            parsing: false,
        }
    }

    /// Register a plugin invoked once per parse with no regex matching.
    pub fn register_parser<F>(&mut self, name: &str, callback: F)
    where
        F: FnMut(&mut TagCollector<'_, '_>, &str, &[PluginMatch]) + 'static,
    {
        self.plugins.push(Plugin {
            name: name.to_string(),
            quick_match: None,
            regex: None,
            regex_limit: DEFAULT_REGEX_LIMIT,
            callback: Box::new(callback),
        });
    }

    /// Register a regex-driven plugin. The quick-match substring, when
    /// given, gates the regex scan; a plugin whose regex finds nothing is
    /// not invoked at all.
    pub fn register_matcher<F>(
        &mut self,
        name: &str,
        quick_match: Option<&str>,
        regex: Regex,
        callback: F,
    ) where
        F: FnMut(&mut TagCollector<'_, '_>, &str, &[PluginMatch]) + 'static,
    {
        self.plugins.push(Plugin {
            name: name.to_string(),
            quick_match: quick_match.map(str::to_string),
            regex: Some(regex),
            regex_limit: DEFAULT_REGEX_LIMIT,
            callback: Box::new(callback),
        });
    }

    /// Parse `text` into the intermediate representation.
    pub fn parse(&mut self, text: &str) -> Result<String, ParseError> {
        if self.parsing {
            return Err(ParseError::ReentrantParse);
        }
        self.parsing = true;
        let result = run_parse(&self.schema, &mut self.plugins, self.max_fixing_cost, text);
        self.parsing = false;
        result
    }

    pub fn disable_tag(&mut self, name: &str) {
        if let Some(id) = self.lookup(name) {
            self.schema.tag_mut(id).disabled = true;
        }
    }

    pub fn enable_tag(&mut self, name: &str) {
        if let Some(id) = self.lookup(name) {
            self.schema.tag_mut(id).disabled = false;
        }
    }

    pub fn set_tag_limit(&mut self, name: &str, limit: u32) {
        if let Some(id) = self.lookup(name) {
            self.schema.tag_mut(id).tag_limit = limit;
        }
    }

    pub fn set_nesting_limit(&mut self, name: &str, limit: u32) {
        if let Some(id) = self.lookup(name) {
            self.schema.tag_mut(id).nesting_limit = limit;
        }
    }

    /// Override the markup-fixing budget (default
    /// [`DEFAULT_MAX_FIXING_COST`]).
    pub fn set_max_fixing_cost(&mut self, cost: u32) {
        self.max_fixing_cost = cost;
    }

    fn lookup(&self, name: &str) -> Option<NameId> {
        let id = self.schema.name_id(&normalize_name(name));
        if id.is_none() {
            warn!(tag = name, "unknown tag name in parser override");
        }
        id
    }
}

fn run_parse(
    schema: &Schema,
    plugins: &mut [Plugin],
    max_fixing_cost: u32,
    text: &str,
) -> Result<String, ParseError> {
    let mut session = Session::new(schema, text, max_fixing_cost);

    for plugin in plugins.iter_mut() {
        if let Some(quick) = &plugin.quick_match
            && !text.contains(quick.as_str())
        {
            trace!(plugin = %plugin.name, "quick match absent, skipping");
            continue;
        }
        let matches: Vec<PluginMatch> = match &plugin.regex {
            Some(regex) => regex
                .captures_iter(text)
                .take(plugin.regex_limit)
                .map(|caps| PluginMatch {
                    range: caps.get(0).map_or(0..0, |m| m.range()),
                    groups: (1..caps.len()).map(|i| caps.get(i).map(|m| m.range())).collect(),
                })
                .collect(),
            None => Vec::new(),
        };
        if plugin.regex.is_some() && matches.is_empty() {
            continue;
        }
        trace!(plugin = %plugin.name, matches = matches.len(), "running plugin");
        let mut collector = TagCollector {
            session: &mut session,
        };
        (plugin.callback)(&mut collector, text, &matches);
    }

    session.process_all()?;
    Ok(session.finish())
}
