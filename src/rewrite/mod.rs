//! URL rewriting for proxied responses
//!
//! Pages served through the cluster API server proxy refer to themselves as
//! `<scheme>://kubernetes.default.svc/api/v1/namespaces/<ns>/services/<svc>/proxy/...`
//! or with a bare `/api/v1/...` path. Neither works in the browser, so links
//! in HTML attributes, inline CSS and inline scripts, plus the `Location`
//! header, are pointed back at the host the browser used.

pub mod css;
pub mod encoding;
pub mod headers;
pub mod html;
pub mod js;

pub use encoding::ContentEncoding;

use crate::routing::RoutingContext;
use hyper::header::HeaderMap;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use url::{ParseError, Url};

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Resolves host-relative references; its host never reaches the output
static RELATIVE_BASE: Lazy<Url> =
    Lazy::new(|| Url::parse("http://relative.invalid/").expect("valid relative base url"));

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("failed to decode {encoding} body: {source}")]
    Decode {
        encoding: &'static str,
        source: std::io::Error,
    },
    #[error("failed to encode {encoding} body: {source}")]
    Encode {
        encoding: &'static str,
        source: std::io::Error,
    },
}

/// Everything needed to rewrite one response
#[derive(Debug, Clone)]
pub struct RewriteContext {
    internal_host: String,
    internal_origin: String,
    source_host: String,
    prefix: String,
    /// Literal match of the internal host for raw replacement in scripts
    internal_host_pattern: Option<Regex>,
}

impl RewriteContext {
    pub fn new(internal_host: &str, source_scheme: &str, source_host: &str, routing: &RoutingContext) -> Self {
        Self {
            internal_host: internal_host.to_string(),
            internal_origin: format!("{}://{}", source_scheme, internal_host),
            source_host: source_host.to_string(),
            prefix: routing.proxy_prefix(),
            internal_host_pattern: (!internal_host.is_empty())
                .then(|| Regex::new(&regex::escape(internal_host)).ok())
                .flatten(),
        }
    }

    /// Build from the inbound request headers.
    ///
    /// The external URL comes from `X-Forwarded-Proto`/`X-Forwarded-Host`,
    /// falling back to `http` and the `Host` header. Returns `None` when no
    /// usable host is available.
    pub fn from_request(headers: &HeaderMap, internal_host: &str, routing: &RoutingContext) -> Option<Self> {
        let header = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').next().unwrap_or(v).trim())
                .filter(|v| !v.is_empty())
        };

        let scheme = match header(X_FORWARDED_PROTO) {
            Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
            _ => "http",
        };
        let host = header(X_FORWARDED_HOST).or_else(|| header("host"))?;
        if !is_valid_host(host) {
            return None;
        }

        Some(Self::new(internal_host, scheme, host, routing))
    }

    pub fn source_host(&self) -> &str {
        &self.source_host
    }

    pub fn internal_origin(&self) -> &str {
        &self.internal_origin
    }

    pub fn internal_host_pattern(&self) -> Option<&Regex> {
        self.internal_host_pattern.as_ref()
    }

    /// Rewrite a URL found in an HTML attribute or a `Location` header.
    ///
    /// Applies when the URL has no host or the internal host, and its path is
    /// absolute. The proxy prefix is stripped and the host replaced with the
    /// external one. Returns `None` when the URL must be left alone.
    pub fn rewrite_reference(&self, raw: &str) -> Option<String> {
        match Url::parse(raw) {
            Ok(url) => {
                if !self.is_internal(&url) {
                    return None;
                }
                Some(self.render(Some(url.scheme()), &url))
            }
            Err(ParseError::RelativeUrlWithoutBase) => {
                let raw = raw.trim();
                if !raw.starts_with('/') {
                    return None;
                }
                let url = RELATIVE_BASE.join(raw).ok()?;
                // network-path references name their own host
                if url.host_str() != RELATIVE_BASE.host_str() && !self.is_internal(&url) {
                    return None;
                }
                Some(self.render(None, &url))
            }
            Err(_) => None,
        }
    }

    /// Rewrite an absolute URL that starts with the internal origin; used
    /// for URLs embedded in CSS and scripts.
    pub fn rewrite_absolute(&self, raw: &str) -> Option<String> {
        let rest = raw.strip_prefix(&self.internal_origin)?;
        if !(rest.is_empty() || rest.starts_with(['/', '?', '#'])) {
            return None;
        }
        let url = Url::parse(raw).ok()?;
        Some(self.render(Some(url.scheme()), &url))
    }

    fn is_internal(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        authority.eq_ignore_ascii_case(&self.internal_host)
    }

    /// `[scheme:]//[userinfo@]<source host><path without prefix>[?query][#fragment]`
    fn render(&self, scheme: Option<&str>, url: &Url) -> String {
        let mut out = String::with_capacity(self.source_host.len() + url.as_str().len());
        if let Some(scheme) = scheme {
            out.push_str(scheme);
            out.push(':');
        }
        out.push_str("//");
        if !url.username().is_empty() || url.password().is_some() {
            out.push_str(url.username());
            if let Some(password) = url.password() {
                out.push(':');
                out.push_str(password);
            }
            out.push('@');
        }
        out.push_str(&self.source_host);
        out.push_str(&self.strip_prefix(url.path()));
        if let Some(query) = url.query() {
            out.push('?');
            out.push_str(query);
        }
        if let Some(fragment) = url.fragment() {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }

    fn strip_prefix(&self, path: &str) -> String {
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }
}

/// Rewrite a complete HTML document, undoing and reapplying its
/// content encoding.
pub fn rewrite_body(body: &[u8], encoding: ContentEncoding, ctx: &RewriteContext) -> Result<Vec<u8>, RewriteError> {
    let (plain, codec) = encoding::decode(body, encoding)?;
    let rewritten = html::rewrite_html(&plain, ctx);
    encoding::encode(&rewritten, codec)
}

/// Host names are spliced into markup verbatim, so only allow host syntax
fn is_valid_host(host: &str) -> bool {
    host.len() <= 255
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']' | '_'))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hyper::header::{HeaderValue, HOST};

    pub(crate) fn routing() -> RoutingContext {
        RoutingContext {
            project_id: "p1".to_string(),
            cluster: "c1".to_string(),
            namespace: "n1".to_string(),
            service: "s1:80".to_string(),
        }
    }

    pub(crate) fn context() -> RewriteContext {
        RewriteContext::new("kubernetes.default.svc", "https", "apps.example.com", &routing())
    }

    #[test]
    fn test_rewrite_internal_absolute_url() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_reference("https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/static/app.js")
                .as_deref(),
            Some("https://apps.example.com/static/app.js")
        );
    }

    #[test]
    fn test_rewrite_host_relative_path() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_reference("/api/v1/namespaces/n1/services/s1:80/proxy/login?next=%2F#form").as_deref(),
            Some("//apps.example.com/login?next=%2F#form")
        );
        // paths without the prefix still get the external host
        assert_eq!(
            ctx.rewrite_reference("/favicon.ico").as_deref(),
            Some("//apps.example.com/favicon.ico")
        );
    }

    #[test]
    fn test_prefix_alone_becomes_root() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_reference("/api/v1/namespaces/n1/services/s1:80/proxy").as_deref(),
            Some("//apps.example.com/")
        );
    }

    #[test]
    fn test_prefix_must_end_at_segment_boundary() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_reference("/api/v1/namespaces/n1/services/s1:80/proxyfoo").as_deref(),
            Some("//apps.example.com/api/v1/namespaces/n1/services/s1:80/proxyfoo")
        );
    }

    #[test]
    fn test_foreign_and_relative_urls_untouched() {
        let ctx = context();
        assert_eq!(ctx.rewrite_reference("https://cdn.example.org/lib.js"), None);
        assert_eq!(ctx.rewrite_reference("https://kubernetes.default.svc:6443/x"), None);
        assert_eq!(ctx.rewrite_reference("img/logo.png"), None);
        assert_eq!(ctx.rewrite_reference("mailto:ops@example.com"), None);
        assert_eq!(ctx.rewrite_reference("javascript:void(0)"), None);
        assert_eq!(ctx.rewrite_reference("#section"), None);
        assert_eq!(ctx.rewrite_reference("?page=2"), None);
        assert_eq!(ctx.rewrite_reference(""), None);
    }

    #[test]
    fn test_network_path_reference() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_reference("//kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/a.css").as_deref(),
            Some("//apps.example.com/a.css")
        );
        assert_eq!(ctx.rewrite_reference("//cdn.example.org/a.css"), None);
        assert_eq!(ctx.rewrite_reference("/\\cdn.example.org/a.css"), None);
    }

    #[test]
    fn test_user_info_kept() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_reference("http://user:pw@kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/x")
                .as_deref(),
            Some("http://user:pw@apps.example.com/x")
        );
    }

    #[test]
    fn test_other_service_prefix_not_stripped() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_reference("/api/v1/namespaces/n2/services/other/proxy/x").as_deref(),
            Some("//apps.example.com/api/v1/namespaces/n2/services/other/proxy/x")
        );
    }

    #[test]
    fn test_rewrite_absolute() {
        let ctx = context();
        assert_eq!(
            ctx.rewrite_absolute("https://kubernetes.default.svc/api/v1/namespaces/n1/services/s1:80/proxy/img/bg.png")
                .as_deref(),
            Some("https://apps.example.com/img/bg.png")
        );
        assert_eq!(ctx.rewrite_absolute("/api/v1/namespaces/n1/services/s1:80/proxy/x"), None);
        assert_eq!(ctx.rewrite_absolute("http://kubernetes.default.svc/x"), None);
        assert_eq!(ctx.rewrite_absolute("https://kubernetes.default.svc.evil.com/x"), None);
    }

    #[test]
    fn test_from_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("internal:8123"));
        headers.insert(X_FORWARDED_HOST, HeaderValue::from_static("apps.example.com"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        let ctx = RewriteContext::from_request(&headers, "kubernetes.default.svc", &routing()).unwrap();
        assert_eq!(ctx.source_host(), "apps.example.com");
        assert_eq!(ctx.internal_origin(), "https://kubernetes.default.svc");
    }

    #[test]
    fn test_from_request_falls_back_to_host() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:8123"));

        let ctx = RewriteContext::from_request(&headers, "kubernetes.default.svc", &routing()).unwrap();
        assert_eq!(ctx.source_host(), "localhost:8123");
        assert_eq!(ctx.internal_origin(), "http://kubernetes.default.svc");
    }

    #[test]
    fn test_rewrite_body_preserves_encoding() {
        let ctx = context();
        let html = b"<a href=\"/api/v1/namespaces/n1/services/s1:80/proxy/docs\">docs</a>";
        let expected = html::rewrite_html(html, &ctx);
        assert_eq!(
            expected,
            b"<a href=\"//apps.example.com/docs\">docs</a>".to_vec()
        );

        let gzipped = encoding::encode(html, encoding::Codec::Gzip).unwrap();
        let out = rewrite_body(&gzipped, ContentEncoding::Gzip, &ctx).unwrap();
        let (plain, codec) = encoding::decode(&out, ContentEncoding::Gzip).unwrap();
        assert_eq!(plain, expected);
        assert_eq!(codec, encoding::Codec::Gzip);

        let raw = encoding::encode(html, encoding::Codec::RawDeflate).unwrap();
        let out = rewrite_body(&raw, ContentEncoding::Deflate, &ctx).unwrap();
        assert_eq!(encoding::decode(&out, ContentEncoding::Deflate).unwrap().0, expected);
    }

    #[test]
    fn test_rewrite_body_identity() {
        let out = rewrite_body(b"<img src=\"/a.png\">", ContentEncoding::Identity, &context()).unwrap();
        assert_eq!(out, b"<img src=\"//apps.example.com/a.png\">".to_vec());
    }

    #[test]
    fn test_from_request_rejects_unsafe_host() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_HOST, HeaderValue::from_static("evil\"><script>"));
        assert!(RewriteContext::from_request(&headers, "kubernetes.default.svc", &routing()).is_none());
        assert!(RewriteContext::from_request(&HeaderMap::new(), "kubernetes.default.svc", &routing()).is_none());
    }
}
