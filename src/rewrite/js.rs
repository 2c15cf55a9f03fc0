use super::RewriteContext;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, NoExpand, Regex};

/// String-valued configuration keys that carry the application's base URL
static APP_SUB_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"("appSubUrl"\s*:\s*")(.*?)(")"#).expect("valid appSubUrl pattern")
});

/// Rewrite base-URL settings, then replace any remaining mention of the
/// internal host with the external one.
pub fn rewrite_js(script: &[u8], ctx: &RewriteContext) -> Vec<u8> {
    let replaced = APP_SUB_URL.replace_all(script, |caps: &Captures<'_>| {
        let value = std::str::from_utf8(&caps[2]).ok();
        let mut out = caps[1].to_vec();
        match value.and_then(|v| ctx.rewrite_absolute(v)) {
            Some(rewritten) => out.extend_from_slice(rewritten.as_bytes()),
            None => out.extend_from_slice(&caps[2]),
        }
        out.extend_from_slice(&caps[3]);
        out
    });

    match ctx.internal_host_pattern() {
        Some(host) => host.replace_all(&replaced, NoExpand(ctx.source_host().as_bytes())).into_owned(),
        None => replaced.into_owned(),
    }
}
