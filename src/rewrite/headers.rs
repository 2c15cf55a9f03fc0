use super::RewriteContext;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_SECURITY_POLICY, CONTENT_TYPE, LOCATION};
use tracing::debug;

/// Allow the proxied page to be framed by its own origin.
///
/// `'none'` becomes `'self'`; otherwise `'self'` is appended to the source
/// list. Returns `None` when the policy has no `frame-ancestors` directive
/// or already allows `'self'`.
pub fn patch_frame_ancestors(policy: &str) -> Option<String> {
    let mut changed = false;
    let directives: Vec<String> = policy
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|directive| {
            let mut parts = directive.split_ascii_whitespace();
            let name = parts.next().unwrap_or_default();
            if !name.eq_ignore_ascii_case("frame-ancestors") {
                return directive.to_string();
            }
            let sources: Vec<&str> = parts.collect();
            if sources.iter().any(|s| s.eq_ignore_ascii_case("'self'")) {
                return directive.to_string();
            }
            changed = true;
            let mut sources: Vec<&str> = sources.into_iter().filter(|s| !s.eq_ignore_ascii_case("'none'")).collect();
            sources.push("'self'");
            format!("{} {}", name, sources.join(" "))
        })
        .collect();

    changed.then(|| directives.join("; "))
}

/// Fix up headers on any proxied response: `Location` is pointed at the
/// external host and the CSP allows same-origin framing.
pub fn rewrite_response_headers(headers: &mut HeaderMap, ctx: &RewriteContext) {
    let location = headers.get(LOCATION).and_then(|v| v.to_str().ok()).map(str::to_owned);
    if let Some(location) = location {
        if let Some(rewritten) = ctx.rewrite_reference(&location) {
            match HeaderValue::from_str(&rewritten) {
                Ok(value) => {
                    debug!(from = %location, to = %rewritten, "Rewrote Location header");
                    headers.insert(LOCATION, value);
                }
                Err(e) => debug!(error = %e, "Rewritten Location is not a valid header value"),
            }
        }
    }

    let policies: Vec<HeaderValue> = headers.get_all(CONTENT_SECURITY_POLICY).iter().cloned().collect();
    if policies.is_empty() {
        return;
    }
    headers.remove(CONTENT_SECURITY_POLICY);
    for policy in policies {
        let patched = policy
            .to_str()
            .ok()
            .and_then(patch_frame_ancestors)
            .and_then(|p| HeaderValue::from_str(&p).ok());
        headers.append(CONTENT_SECURITY_POLICY, patched.unwrap_or(policy));
    }
}

/// Only `text/html` bodies are rewritten
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
        .unwrap_or(false)
}
