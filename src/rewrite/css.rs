use super::RewriteContext;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use std::borrow::Cow;

static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*['"]?([^'")\s]+)\s*['"]?\)"#).expect("valid css url pattern")
});

/// Rewrite `url(...)` references that point at the internal origin.
/// Rewritten references are re-emitted single-quoted.
pub fn rewrite_css<'a>(css: &'a [u8], ctx: &RewriteContext) -> Cow<'a, [u8]> {
    CSS_URL.replace_all(css, |caps: &Captures<'_>| {
        let target = std::str::from_utf8(&caps[1]).ok();
        match target.and_then(|t| ctx.rewrite_absolute(t)) {
            Some(rewritten) => format!("url('{}')", rewritten).into_bytes(),
            None => caps[0].to_vec(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::tests::context;

    fn rewrite(css: &str) -> String {
        String::from_utf8(rewrite_css(css.as_bytes(), &context()).into_owned()).unwrap()
    }

    #[test]
    fn test_rewrites_internal_urls() {
        assert_eq!(
            rewrite("a { background: url( \"https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/img/a.png\") }"),
            "a { background: url('https://apps.example.com/img/a.png') }"
        );
        assert_eq!(
            rewrite("@font-face { src: url(https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/f.woff) }"),
            "@font-face { src: url('https://apps.example.com/f.woff') }"
        );
    }

    #[test]
    fn test_leaves_other_urls() {
        let css = "a { background: url('/img/a.png') } b { background: url(data:image/png;base64,AAAA) }";
        assert_eq!(rewrite(css), css);
        let css = "a { background: url(\"http://kubernetes.default.svc/x.png\") }";
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn test_multiline() {
        assert_eq!(
            rewrite("x { b: url(\n  'https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/a.png'\n) }"),
            "x { b: url('https://apps.example.com/a.png') }"
        );
    }
}
