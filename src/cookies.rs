//! Cookie header parsing helpers

use hyper::header::{HeaderMap, HeaderValue, COOKIE};

/// Iterate over every `name=value` pair across all Cookie headers
pub fn cookie_pairs<'a>(headers: &'a HeaderMap) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim(), unquote(value.trim())))
        })
}

/// Value of the first cookie called `name`
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    cookie_pairs(headers).find(|(n, _)| *n == name).map(|(_, v)| v)
}

/// Drop every cookie for which `remove` returns true.
///
/// Remaining cookies are folded into a single Cookie header; the header is
/// removed entirely when nothing is left.
pub fn strip_cookies<F>(headers: &mut HeaderMap, remove: F)
where
    F: Fn(&str) -> bool,
{
    let kept: Vec<String> = cookie_pairs(headers)
        .filter(|(name, _)| !remove(name))
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();

    headers.remove(COOKIE);
    if kept.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
        headers.insert(COOKIE, value);
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
