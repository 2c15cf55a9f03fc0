//! Streaming HTML tokenizer and attribute/inline-content rewriter
//!
//! The tokenizer only understands as much HTML as the rewriter needs: tags
//! with their attribute value spans, raw-text elements, comments and
//! declarations. Every byte not deliberately rewritten is copied through
//! unchanged.

use super::{css, js, RewriteContext};

/// Elements whose content is not markup
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "textarea", "title", "xmp", "iframe", "noembed", "noframes", "noscript",
];

/// Attributes holding a URL, per element
pub fn url_attributes(tag: &str) -> &'static [&'static str] {
    match tag {
        "a" | "area" | "base" | "link" => &["href"],
        "applet" => &["codebase"],
        "audio" | "embed" | "script" | "source" => &["src"],
        "blockquote" | "del" | "ins" | "q" => &["cite"],
        "body" => &["background"],
        "button" => &["formaction"],
        "command" => &["icon"],
        "form" => &["action"],
        "frame" | "iframe" => &["longdesc", "src"],
        "head" => &["profile"],
        "html" => &["manifest"],
        "img" => &["longdesc", "src", "usemap"],
        "input" => &["src", "usemap", "formaction"],
        "object" => &["classid", "codebase", "data", "usemap"],
        "video" => &["poster", "src"],
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    /// Byte range of the value inside the tag's raw bytes, quotes excluded
    pub value: Option<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTag<'a> {
    pub raw: &'a [u8],
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub self_closing: bool,
}

impl StartTag<'_> {
    pub fn attribute_value(&self, attr: &Attribute) -> Option<&[u8]> {
        attr.value.map(|(start, end)| &self.raw[start..end])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    Text(&'a [u8]),
    StartTag(StartTag<'a>),
    EndTag { raw: &'a [u8], name: String },
    /// Comments, doctype, processing instructions
    Other(&'a [u8]),
}

pub struct Tokenizer<'a> {
    input: &'a [u8],
    pos: usize,
    raw_text: Option<String>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            raw_text: None,
        }
    }

    fn rest(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let start = self.pos;
        self.pos = (start + len).min(self.input.len());
        &self.input[start..self.pos]
    }

    fn raw_text_token(&mut self, element: &str) -> Token<'a> {
        let rest = self.rest();
        let end = find_closing_tag(rest, element).unwrap_or(rest.len());
        Token::Text(self.take(end))
    }

    fn text_token(&mut self, skip: usize) -> Token<'a> {
        let rest = self.rest();
        let end = rest[skip..]
            .iter()
            .position(|&b| b == b'<')
            .map(|i| i + skip)
            .unwrap_or(rest.len());
        Token::Text(self.take(end))
    }

    fn markup_token(&mut self) -> Token<'a> {
        let rest = self.rest();
        match rest.get(1) {
            Some(b'/') if rest.get(2).is_some_and(u8::is_ascii_alphabetic) => self.end_tag(),
            Some(b'!') if rest.starts_with(b"<!--") => {
                // `<!-->` and `<!--->` close immediately
                let end = if rest[4..].starts_with(b">") {
                    5
                } else if rest[4..].starts_with(b"->") {
                    6
                } else {
                    find(&rest[4..], b"-->").map(|i| i + 7).unwrap_or(rest.len())
                };
                Token::Other(self.take(end))
            }
            Some(b'!') | Some(b'?') => {
                let end = rest.iter().position(|&b| b == b'>').map(|i| i + 1).unwrap_or(rest.len());
                Token::Other(self.take(end))
            }
            Some(b) if b.is_ascii_alphabetic() => self.start_tag(),
            _ => self.text_token(1),
        }
    }

    fn end_tag(&mut self) -> Token<'a> {
        let rest = self.rest();
        let name_end = rest[2..]
            .iter()
            .position(|&b| is_space(b) || b == b'/' || b == b'>')
            .map(|i| i + 2)
            .unwrap_or(rest.len());
        let name = String::from_utf8_lossy(&rest[2..name_end]).to_ascii_lowercase();
        let end = rest.iter().position(|&b| b == b'>').map(|i| i + 1).unwrap_or(rest.len());
        Token::EndTag {
            raw: self.take(end),
            name,
        }
    }

    fn start_tag(&mut self) -> Token<'a> {
        let rest = self.rest();
        let mut i = 1;
        while i < rest.len() && !is_space(rest[i]) && rest[i] != b'/' && rest[i] != b'>' {
            i += 1;
        }
        let name = String::from_utf8_lossy(&rest[1..i]).to_ascii_lowercase();

        let mut attributes = Vec::new();
        let mut self_closing = false;
        let mut closed = false;

        while i < rest.len() {
            let b = rest[i];
            if is_space(b) {
                i += 1;
                continue;
            }
            if b == b'>' {
                i += 1;
                closed = true;
                break;
            }
            if b == b'/' {
                self_closing = rest.get(i + 1) == Some(&b'>');
                i += 1;
                continue;
            }
            self_closing = false;

            let name_start = i;
            i += 1;
            while i < rest.len() && !is_space(rest[i]) && !matches!(rest[i], b'/' | b'>' | b'=') {
                i += 1;
            }
            let attr_name = String::from_utf8_lossy(&rest[name_start..i]).to_ascii_lowercase();

            let mut j = i;
            while j < rest.len() && is_space(rest[j]) {
                j += 1;
            }
            let mut value = None;
            if rest.get(j) == Some(&b'=') {
                j += 1;
                while j < rest.len() && is_space(rest[j]) {
                    j += 1;
                }
                match rest.get(j) {
                    Some(&q) if q == b'"' || q == b'\'' => {
                        let start = j + 1;
                        let end = rest[start..]
                            .iter()
                            .position(|&b| b == q)
                            .map(|p| p + start)
                            .unwrap_or(rest.len());
                        value = Some((start, end));
                        i = (end + 1).min(rest.len());
                    }
                    _ => {
                        let start = j;
                        let mut end = j;
                        while end < rest.len() && !is_space(rest[end]) && rest[end] != b'>' {
                            end += 1;
                        }
                        value = Some((start, end));
                        i = end;
                    }
                }
            }
            attributes.push(Attribute {
                name: attr_name,
                value,
            });
        }

        if !closed {
            // unterminated tag at end of input
            return Token::Text(self.take(rest.len()));
        }

        if !self_closing && RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
            self.raw_text = Some(name.clone());
        }

        Token::StartTag(StartTag {
            raw: self.take(i),
            name,
            attributes,
            self_closing,
        })
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        if self.pos >= self.input.len() {
            return None;
        }
        if let Some(element) = self.raw_text.take() {
            let token = self.raw_text_token(&element);
            if matches!(token, Token::Text(t) if !t.is_empty()) {
                return Some(token);
            }
        }
        if self.rest()[0] == b'<' {
            Some(self.markup_token())
        } else {
            Some(self.text_token(0))
        }
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0c)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Offset of `</element` followed by whitespace, `/` or `>`
fn find_closing_tag(haystack: &[u8], element: &str) -> Option<usize> {
    let needle_len = element.len() + 2;
    let mut from = 0;
    while let Some(i) = find(&haystack[from..], b"</").map(|i| i + from) {
        let candidate = haystack.get(i + 2..i + needle_len)?;
        if candidate.eq_ignore_ascii_case(element.as_bytes()) {
            match haystack.get(i + needle_len) {
                None => return Some(i),
                Some(&b) if is_space(b) || b == b'/' || b == b'>' => return Some(i),
                _ => {}
            }
        }
        from = i + 2;
    }
    None
}

/// What the rewriter is collecting while walking the document
enum BodyState {
    Default,
    InStyle(Vec<u8>),
    InScript(Vec<u8>),
}

/// Rewrite URL attributes plus inline `<style>` and `<script>` bodies
pub fn rewrite_html(input: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 16);
    let mut state = BodyState::Default;

    for token in Tokenizer::new(input) {
        match token {
            Token::StartTag(tag) => {
                let buffer = match &mut state {
                    BodyState::Default => &mut out,
                    BodyState::InStyle(buf) | BodyState::InScript(buf) => buf,
                };
                write_start_tag(buffer, &tag, ctx);
                if !tag.self_closing {
                    match tag.name.as_str() {
                        "style" => state = flush_into(&mut out, state, BodyState::InStyle(Vec::new())),
                        "script" => state = flush_into(&mut out, state, BodyState::InScript(Vec::new())),
                        _ => {}
                    }
                }
            }
            Token::EndTag { raw, name } => {
                state = match (state, name.as_str()) {
                    (BodyState::InStyle(buf), "style") => {
                        out.extend_from_slice(&css::rewrite_css(&buf, ctx));
                        BodyState::Default
                    }
                    (BodyState::InScript(buf), "script") => {
                        out.extend_from_slice(&js::rewrite_js(&buf, ctx));
                        BodyState::Default
                    }
                    (BodyState::InStyle(mut buf), _) => {
                        buf.extend_from_slice(raw);
                        BodyState::InStyle(buf)
                    }
                    (BodyState::InScript(mut buf), _) => {
                        buf.extend_from_slice(raw);
                        BodyState::InScript(buf)
                    }
                    (BodyState::Default, _) => BodyState::Default,
                };
                if matches!(state, BodyState::Default) {
                    out.extend_from_slice(raw);
                }
            }
            Token::Text(bytes) | Token::Other(bytes) => match &mut state {
                BodyState::Default => out.extend_from_slice(bytes),
                BodyState::InStyle(buf) | BodyState::InScript(buf) => buf.extend_from_slice(bytes),
            },
        }
    }

    flush_into(&mut out, state, BodyState::Default);
    out
}

/// Emit whatever an unfinished element buffered, then switch state
fn flush_into(out: &mut Vec<u8>, previous: BodyState, next: BodyState) -> BodyState {
    if let BodyState::InStyle(buf) | BodyState::InScript(buf) = previous {
        out.extend_from_slice(&buf);
    }
    next
}

fn write_start_tag(out: &mut Vec<u8>, tag: &StartTag<'_>, ctx: &RewriteContext) {
    let url_attrs = url_attributes(&tag.name);
    let mut copied = 0;

    for attr in &tag.attributes {
        if !url_attrs.contains(&attr.name.as_str()) {
            continue;
        }
        let Some((start, end)) = attr.value else {
            continue;
        };
        let Ok(value) = std::str::from_utf8(&tag.raw[start..end]) else {
            continue;
        };
        if let Some(rewritten) = ctx.rewrite_reference(value) {
            out.extend_from_slice(&tag.raw[copied..start]);
            out.extend_from_slice(rewritten.as_bytes());
            copied = end;
        }
    }

    out.extend_from_slice(&tag.raw[copied..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::tests::context;

    fn rewrite(html: &str) -> String {
        String::from_utf8(rewrite_html(html.as_bytes(), &context())).unwrap()
    }

    #[test]
    fn test_tokenizer_basic() {
        let tokens: Vec<_> = Tokenizer::new(b"<!DOCTYPE html><p class=x>hi</p><!-- c -->").collect();
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0], Token::Other(b"<!DOCTYPE html>"));
        match &tokens[1] {
            Token::StartTag(tag) => {
                assert_eq!(tag.name, "p");
                assert_eq!(tag.attributes.len(), 1);
                assert_eq!(tag.attribute_value(&tag.attributes[0]), Some(&b"x"[..]));
            }
            other => panic!("unexpected token {:?}", other),
        }
        assert_eq!(tokens[2], Token::Text(b"hi"));
        assert!(matches!(&tokens[3], Token::EndTag { name, .. } if name == "p"));
        assert_eq!(tokens[4], Token::Other(b"<!-- c -->"));
    }

    #[test]
    fn test_tokenizer_attribute_forms() {
        let mut tokens = Tokenizer::new(b"<IMG SRC='a.png' alt = \"x y\" hidden data-v=raw/>");
        let Some(Token::StartTag(tag)) = tokens.next() else {
            panic!("expected start tag");
        };
        assert_eq!(tag.name, "img");
        // the slash belongs to the unquoted value
        assert!(!tag.self_closing);
        let names: Vec<_> = tag.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["src", "alt", "hidden", "data-v"]);
        assert_eq!(tag.attribute_value(&tag.attributes[0]), Some(&b"a.png"[..]));
        assert_eq!(tag.attribute_value(&tag.attributes[1]), Some(&b"x y"[..]));
        assert_eq!(tag.attribute_value(&tag.attributes[2]), None);
        assert_eq!(tag.attribute_value(&tag.attributes[3]), Some(&b"raw/"[..]));

        let Some(Token::StartTag(tag)) = Tokenizer::new(b"<br class=\"x\"/>").next() else {
            panic!("expected start tag");
        };
        assert!(tag.self_closing);
    }

    #[test]
    fn test_tokenizer_raw_text() {
        let tokens: Vec<_> = Tokenizer::new(b"<script>if (a<b) { x = '</p>'; }</script>").collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[1], Token::Text(b"if (a<b) { x = '</p>'; }"));
        assert!(matches!(&tokens[2], Token::EndTag { name, .. } if name == "script"));
    }

    #[test]
    fn test_lone_angle_bracket_is_text() {
        assert_eq!(rewrite("a < b > c"), "a < b > c");
        assert_eq!(rewrite("x <3"), "x <3");
    }

    #[test]
    fn test_rewrites_allow_listed_attributes() {
        let html = r#"<a href="/api/v1/namespaces/n1/services/s1:80/proxy/page">p</a><img src="https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/i.png" alt="/api/v1/namespaces/n1/services/s1:80/proxy/x">"#;
        assert_eq!(
            rewrite(html),
            r#"<a href="//apps.example.com/page">p</a><img src="https://apps.example.com/i.png" alt="/api/v1/namespaces/n1/services/s1:80/proxy/x">"#
        );
    }

    #[test]
    fn test_non_allow_listed_attributes_untouched() {
        let html = r#"<div data-href="/api/v1/namespaces/n1/services/s1:80/proxy/x"></div><span src="/x"></span><a title="/y" href="z.html">"#;
        assert_eq!(rewrite(html), html);
    }

    #[test]
    fn test_preserves_formatting() {
        let html = "<A  HREF = '/api/v1/namespaces/n1/services/s1:80/proxy/q?a=1&amp;b=2'\n class=\"c\" >";
        assert_eq!(
            rewrite(html),
            "<A  HREF = '//apps.example.com/q?a=1&amp;b=2'\n class=\"c\" >"
        );
    }

    #[test]
    fn test_unquoted_value() {
        assert_eq!(
            rewrite("<form action=/api/v1/namespaces/n1/services/s1:80/proxy/submit method=post>"),
            "<form action=//apps.example.com/submit method=post>"
        );
    }

    #[test]
    fn test_inline_style_and_script() {
        let html = concat!(
            "<style>body { background: url(\"https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/bg.png\"); }</style>",
            "<script>var cfg = {\"appSubUrl\": \"https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy\"};</script>"
        );
        assert_eq!(
            rewrite(html),
            concat!(
                "<style>body { background: url('https://apps.example.com/bg.png'); }</style>",
                "<script>var cfg = {\"appSubUrl\": \"https://apps.example.com/\"};</script>"
            )
        );
    }

    #[test]
    fn test_script_src_rewritten() {
        assert_eq!(
            rewrite(r#"<script src="/api/v1/namespaces/n1/services/s1:80/proxy/app.js"></script>"#),
            r#"<script src="//apps.example.com/app.js"></script>"#
        );
    }

    #[test]
    fn test_unterminated_script_flushed_unmodified() {
        let html = "<p>x</p><script>var host = 'kubernetes.default.svc';";
        assert_eq!(rewrite(html), html);
    }

    #[test]
    fn test_unterminated_tag_preserved() {
        let html = "<p>x</p><a href=\"/api/v1/namespaces/n1/services/s1:80/proxy/";
        assert_eq!(rewrite(html), html);
    }

    #[test]
    fn test_textarea_content_not_parsed() {
        let html = "<textarea><a href=\"/api/v1/namespaces/n1/services/s1:80/proxy/x\"></textarea>";
        assert_eq!(rewrite(html), html);
    }

    #[test]
    fn test_abruptly_closed_comments() {
        for comment in ["<!-->", "<!--->"] {
            let html = format!(
                "{}<a href=\"/api/v1/namespaces/n1/services/s1:80/proxy/x\">x</a><!-- c -->",
                comment
            );
            assert_eq!(
                rewrite(&html),
                format!("{}<a href=\"//apps.example.com/x\">x</a><!-- c -->", comment)
            );
        }
    }

    #[test]
    fn test_document_without_urls_is_identical() {
        let html = "<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"utf-8\"><title>T</title></head>\n<body><p>Hello &amp; welcome</p></body></html>\n";
        assert_eq!(rewrite(html), html);
    }
}
