//! Streaming assembly of the intermediate representation.
//!
//! The stream owns a monotonically advancing cursor into the source text.
//! As tags are accepted it emits escaped literal text and tag markers in
//! document order, trims whitespace around tags that ask for it, converts
//! newlines to forced line breaks, and finally wraps everything in the
//! computed root element.

use std::collections::BTreeSet;

use html_escape::{encode_double_quoted_attribute, encode_text};

use super::tag::{Tag, TagKind};
use crate::schema::flags;

const URN_PREFIX: &str = "urn:bbmark:";

#[derive(Debug)]
pub struct OutputStream<'t> {
    text: &'t str,
    /// Cursor: everything before this byte offset has been emitted.
    pos: usize,
    /// End of a whitespace run skipped after the last trimming tag; text up
    /// to here is emitted as an ignored span on the next catch-up.
    ws_pos: usize,
    out: String,
    /// Set once a real tag element is emitted; decides the root element.
    is_rich: bool,
    namespaces: BTreeSet<String>,
}

impl<'t> OutputStream<'t> {
    pub fn new(text: &'t str) -> Self {
        OutputStream {
            text,
            pos: 0,
            ws_pos: 0,
            out: String::with_capacity(text.len() + text.len() / 4),
            is_rich: false,
            namespaces: BTreeSet::new(),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Emit literal text from the cursor up to `catchup_pos`.
    ///
    /// Up to `max_trim_lines` trailing newline runs (with surrounding
    /// spaces and tabs) are diverted into an ignored span instead of
    /// document content. Under an IGNORE_TEXT context the whole span is
    /// ignored; otherwise newlines become `<br/>` unless the context
    /// forbids line breaks.
    pub fn catch_up(&mut self, catchup_pos: usize, max_trim_lines: u32, ctx_flags: u32) {
        if self.pos >= catchup_pos {
            return;
        }

        // Whitespace skipped after the previous tag.
        if self.ws_pos > self.pos {
            let skip = self.ws_pos.min(catchup_pos);
            self.out.push_str("<i>");
            self.out.push_str(&self.text[self.pos..skip]);
            self.out.push_str("</i>");
            self.pos = skip;
            if self.pos >= catchup_pos {
                return;
            }
        }

        if ctx_flags & flags::IGNORE_TEXT != 0 {
            self.out.push_str("<i>");
            self.out
                .push_str(&encode_text(&self.text[self.pos..catchup_pos]));
            self.out.push_str("</i>");
            self.pos = catchup_pos;
            return;
        }

        // Walk back over trailing whitespace, spending one trim budget unit
        // per newline.
        let bytes = self.text.as_bytes();
        let mut lines = max_trim_lines;
        let mut trim_start = catchup_pos;
        while lines > 0 && trim_start > self.pos {
            let c = bytes[trim_start - 1];
            if c != b' ' && c != b'\n' && c != b'\t' {
                break;
            }
            if c == b'\n' {
                lines -= 1;
            }
            trim_start -= 1;
        }

        let mut chunk = encode_text(&self.text[self.pos..trim_start]).into_owned();
        if ctx_flags & flags::NO_BR_CHILD == 0 {
            chunk = chunk.replace('\n', "<br/>\n");
        }
        self.out.push_str(&chunk);

        if trim_start < catchup_pos {
            self.out.push_str("<i>");
            self.out
                .push_str(&encode_text(&self.text[trim_start..catchup_pos]));
            self.out.push_str("</i>");
        }
        self.pos = catchup_pos;
    }

    /// Emit an accepted tag, catching up with its position first.
    pub fn emit_tag(&mut self, tag: &Tag, ctx_flags: u32) {
        self.is_rich = true;

        let skip_before = if tag.flags & flags::TRIM_BEFORE != 0 { 1 } else { 0 };
        let mut skip_after = if tag.flags & flags::TRIM_AFTER != 0 {
            if tag.kind == TagKind::End { 2 } else { 1 }
        } else {
            0
        };

        self.catch_up(tag.pos, skip_before, ctx_flags);

        let consumed = &self.text[tag.pos..tag.end_pos()];
        if tag.kind.is_start() {
            if let Some(colon) = tag.name.find(':') {
                self.namespaces.insert(tag.name[..colon].to_string());
            }
            self.out.push('<');
            self.out.push_str(&tag.name);
            // BTreeMap iteration gives the fixed attribute order.
            for (name, value) in &tag.attributes {
                self.out.push(' ');
                self.out.push_str(name);
                self.out.push_str("=\"");
                self.out
                    .push_str(&encode_double_quoted_attribute(value).replace('\n', "&#10;"));
                self.out.push('"');
            }
            match tag.kind {
                TagKind::SelfClosing if consumed.is_empty() => self.out.push_str("/>"),
                TagKind::SelfClosing => {
                    self.out.push('>');
                    self.out.push_str(&encode_text(consumed));
                    self.out.push_str("</");
                    self.out.push_str(&tag.name);
                    self.out.push('>');
                }
                _ if consumed.is_empty() => self.out.push('>'),
                _ => {
                    self.out.push_str("><s>");
                    self.out.push_str(&encode_text(consumed));
                    self.out.push_str("</s>");
                }
            }
        } else {
            if !consumed.is_empty() {
                self.out.push_str("<e>");
                self.out.push_str(&encode_text(consumed));
                self.out.push_str("</e>");
            }
            self.out.push_str("</");
            self.out.push_str(&tag.name);
            self.out.push('>');
        }

        self.pos = tag.end_pos();

        // Skip newlines (only newlines) directly after the tag; they are
        // emitted as an ignored span on the next catch-up.
        self.ws_pos = self.pos;
        let bytes = self.text.as_bytes();
        while skip_after > 0 && self.ws_pos < bytes.len() && bytes[self.ws_pos] == b'\n' {
            skip_after -= 1;
            self.ws_pos += 1;
        }
    }

    /// Emit a forced line break at `pos`. Does not make the document rich.
    pub fn emit_br(&mut self, pos: usize, ctx_flags: u32) {
        self.catch_up(pos, 0, ctx_flags);
        self.out.push_str("<br/>");
    }

    /// Emit `len` bytes starting at `pos` as an ignored span.
    pub fn emit_ignore(&mut self, pos: usize, len: usize, ctx_flags: u32) {
        self.catch_up(pos, 0, ctx_flags);
        self.out.push_str("<i>");
        self.out.push_str(&encode_text(&self.text[pos..pos + len]));
        self.out.push_str("</i>");
        self.pos = pos + len;
        self.ws_pos = self.ws_pos.max(self.pos);
    }

    /// Flush remaining text and wrap the document in its root element.
    pub fn finalize(mut self, ctx_flags: u32) -> String {
        self.catch_up(self.text.len(), 0, ctx_flags);

        let mut out = self.out;
        while let Some(stripped) = strip_empty_elements(&out) {
            out = stripped;
        }
        if out.contains("</i><i>") {
            out = out.replace("</i><i>", "");
        }
        out.retain(|c| !matches!(c, '\u{00}'..='\u{08}' | '\u{0B}'..='\u{1F}'));

        let root = if self.is_rich { "r" } else { "t" };
        let mut doc = String::with_capacity(out.len() + 32);
        doc.push('<');
        doc.push_str(root);
        for prefix in &self.namespaces {
            doc.push_str(" xmlns:");
            doc.push_str(prefix);
            doc.push_str("=\"");
            doc.push_str(URN_PREFIX);
            doc.push_str(prefix);
            doc.push('"');
        }
        doc.push('>');
        doc.push_str(&out);
        doc.push_str("</");
        doc.push_str(root);
        doc.push('>');
        doc
    }
}

/// Remove one round of empty element pairs (`<X ...></X>`), returning
/// `None` when nothing was removed. Literal text is already escaped, so
/// every `<` in the buffer starts markup.
fn strip_empty_elements(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    let mut changed = false;
    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        rest = &rest[lt..];
        if let Some(skip) = empty_element_len(rest) {
            changed = true;
            rest = &rest[skip..];
            continue;
        }
        out.push('<');
        rest = &rest[1..];
    }
    out.push_str(rest);
    changed.then_some(out)
}

/// If `s` starts with an empty element pair, the pair's total byte length.
fn empty_element_len(s: &str) -> Option<usize> {
    if s.starts_with("</") {
        return None;
    }
    let gt = s.find('>')?;
    if s[..gt].ends_with('/') {
        return None;
    }
    let name_end = s[1..gt].find(' ').map_or(gt, |sp| sp + 1);
    let name = &s[1..name_end];
    let closing = format!("</{name}>");
    s[gt + 1..]
        .starts_with(&closing)
        .then_some(gt + 1 + closing.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tag::Tag;
    use pretty_assertions::assert_eq;

    fn start_tag(name: &str, pos: usize, len: usize) -> Tag {
        Tag::new(TagKind::Start, name.to_string(), pos, len, 0)
    }

    fn end_tag(name: &str, pos: usize, len: usize) -> Tag {
        Tag::new(TagKind::End, name.to_string(), pos, len, 0)
    }

    #[test]
    fn plain_text_document_gets_plain_root() {
        let stream = OutputStream::new("Plain text");
        assert_eq!(stream.finalize(0), "<t>Plain text</t>");
    }

    #[test]
    fn literal_text_is_escaped() {
        let stream = OutputStream::new("a < b & c");
        assert_eq!(stream.finalize(0), "<t>a &lt; b &amp; c</t>");
    }

    #[test]
    fn newlines_become_line_breaks() {
        let stream = OutputStream::new("a\nb");
        assert_eq!(stream.finalize(0), "<t>a<br/>\nb</t>");
    }

    #[test]
    fn no_br_child_suppresses_line_breaks() {
        let stream = OutputStream::new("a\nb");
        assert_eq!(stream.finalize(flags::NO_BR_CHILD), "<t>a\nb</t>");
    }

    #[test]
    fn tag_with_consumed_text_wraps_it_in_markers() {
        let mut stream = OutputStream::new("[b]x[/b]");
        stream.emit_tag(&start_tag("B", 0, 3), 0);
        stream.emit_tag(&end_tag("B", 4, 4), 0);
        assert_eq!(
            stream.finalize(0),
            "<r><B><s>[b]</s>x<e>[/b]</e></B></r>"
        );
    }

    #[test]
    fn self_closing_tag_without_text_self_closes() {
        let mut stream = OutputStream::new("ab");
        stream.emit_tag(
            &Tag::new(TagKind::SelfClosing, "HR".to_string(), 1, 0, 0),
            0,
        );
        assert_eq!(stream.finalize(0), "<r>a<HR/>b</r>");
    }

    #[test]
    fn attributes_are_emitted_sorted_and_escaped() {
        let mut stream = OutputStream::new("x");
        let mut tag = start_tag("URL", 0, 0);
        tag.attributes
            .insert("url".to_string(), "http://a?b=\"c\"".to_string());
        tag.attributes.insert("id".to_string(), "1\n2".to_string());
        stream.emit_tag(&tag, 0);
        stream.emit_tag(&end_tag("URL", 1, 0), 0);
        assert_eq!(
            stream.finalize(0),
            "<r><URL id=\"1&#10;2\" url=\"http://a?b=&quot;c&quot;\">x</URL></r>"
        );
    }

    #[test]
    fn trim_before_diverts_trailing_whitespace() {
        let mut stream = OutputStream::new("a\n [x]");
        let mut tag = Tag::new(TagKind::SelfClosing, "X".to_string(), 3, 3, 0);
        tag.flags = flags::TRIM_BEFORE;
        stream.emit_tag(&tag, 0);
        assert_eq!(stream.finalize(0), "<r>a<i>\n </i><X>[x]</X></r>");
    }

    #[test]
    fn trim_after_skips_following_newline() {
        let mut stream = OutputStream::new("[x]\nb");
        let mut tag = Tag::new(TagKind::SelfClosing, "X".to_string(), 0, 3, 0);
        tag.flags = flags::TRIM_AFTER;
        stream.emit_tag(&tag, 0);
        assert_eq!(stream.finalize(0), "<r><X>[x]</X><i>\n</i>b</r>");
    }

    #[test]
    fn ignore_text_context_wraps_span() {
        let mut stream = OutputStream::new("abc");
        stream.catch_up(3, 0, flags::IGNORE_TEXT);
        assert_eq!(stream.finalize(0), "<t><i>abc</i></t>");
    }

    #[test]
    fn ignored_spans_do_not_make_document_rich() {
        let mut stream = OutputStream::new("abc");
        stream.emit_ignore(1, 1, 0);
        assert_eq!(stream.finalize(0), "<t>a<i>b</i>c</t>");
    }

    #[test]
    fn empty_element_pairs_are_stripped_recursively() {
        assert_eq!(
            strip_empty_elements("a<I><U></U></I>b"),
            Some("a<I></I>b".to_string())
        );
        assert_eq!(strip_empty_elements("a<I></I>b"), Some("ab".to_string()));
        assert_eq!(strip_empty_elements("a<I>x</I>b"), None);
        assert_eq!(strip_empty_elements("<br/><hr/>"), None);
        assert_eq!(
            strip_empty_elements("<X a=\"1\"></X>rest"),
            Some("rest".to_string())
        );
    }

    #[test]
    fn adjacent_ignore_spans_are_merged() {
        let mut stream = OutputStream::new("abcd");
        stream.emit_ignore(0, 2, 0);
        stream.emit_ignore(2, 2, 0);
        assert_eq!(stream.finalize(0), "<t><i>abcd</i></t>");
    }

    #[test]
    fn control_characters_are_stripped() {
        let stream = OutputStream::new("a\u{01}b\tc");
        assert_eq!(stream.finalize(0), "<t>ab\tc</t>");
    }

    #[test]
    fn namespaced_tags_declare_their_prefix_on_root() {
        let mut stream = OutputStream::new("x");
        stream.emit_tag(&start_tag("html:b", 0, 0), 0);
        stream.emit_tag(&end_tag("html:b", 1, 0), 0);
        assert_eq!(
            stream.finalize(0),
            "<r xmlns:html=\"urn:bbmark:html\"><html:b>x</html:b></r>"
        );
    }
}
