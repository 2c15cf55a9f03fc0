//! Static web assets: the login page of the HTTP proxy and the VNC console
//! page of the tunnel

use crate::error::{full_body, json_error_response, ProxyErrorCode, ResponseBody};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use url::form_urlencoded;

/// Problem with the query string of a landing page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryProblem {
    /// At least one required parameter is absent
    Missing,
    /// A required parameter is present but blank
    Empty(&'static str),
}

/// Check that every `required` parameter is present and not blank once
/// percent-decoded
pub fn check_query(query: Option<&str>, required: &[&'static str]) -> Result<(), QueryProblem> {
    let pairs: Vec<(Cow<'_, str>, Cow<'_, str>)> = query
        .map(|q| form_urlencoded::parse(q.as_bytes()).collect())
        .unwrap_or_default();

    let mut empty = None;
    for name in required {
        match pairs.iter().find(|(k, _)| k == name) {
            None => return Err(QueryProblem::Missing),
            Some((_, v)) if v.trim().is_empty() && empty.is_none() => empty = Some(*name),
            Some(_) => {}
        }
    }

    match empty {
        Some(name) => Err(QueryProblem::Empty(name)),
        None => Ok(()),
    }
}

pub fn content_type(file: &str) -> &'static str {
    match Path::new(file).extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Files served from one directory
#[derive(Debug, Clone)]
pub struct StaticAssets {
    root: PathBuf,
}

impl StaticAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Serve `file`, a bare file name inside the asset root
    pub async fn serve(&self, file: &str) -> Response<ResponseBody> {
        if file.contains(['/', '\\']) || file.starts_with('.') {
            return json_error_response(ProxyErrorCode::NotFound, "Not found");
        }

        let path = self.root.join(file);
        match tokio::fs::read(&path).await {
            Ok(contents) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, content_type(file))
                .body(full_body(contents))
                .expect("valid response builder"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Static asset not found");
                json_error_response(ProxyErrorCode::NotFound, "Not found")
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read static asset");
                json_error_response(ProxyErrorCode::InternalError, "Failed to read asset")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    const LOGIN_PARAMS: &[&str] = &["project", "cluster", "namespace", "service"];

    #[test]
    fn test_check_query() {
        assert_eq!(
            check_query(Some("project=p&cluster=c&namespace=n&service=s%3A80"), LOGIN_PARAMS),
            Ok(())
        );
        assert_eq!(check_query(None, LOGIN_PARAMS), Err(QueryProblem::Missing));
        assert_eq!(
            check_query(Some("project=p&cluster=c&namespace=n"), LOGIN_PARAMS),
            Err(QueryProblem::Missing)
        );
        assert_eq!(
            check_query(Some("project=p&cluster=&namespace=n&service"), LOGIN_PARAMS),
            Err(QueryProblem::Empty("cluster"))
        );
    }

    #[test]
    fn test_check_query_decodes_values() {
        assert_eq!(
            check_query(Some("project=%20&cluster=c&namespace=n&service=s"), LOGIN_PARAMS),
            Err(QueryProblem::Empty("project"))
        );
        assert_eq!(
            check_query(Some("project=p&cluster=c&namespace=n&service=+"), LOGIN_PARAMS),
            Err(QueryProblem::Empty("service"))
        );
        assert_eq!(
            check_query(Some("pro%6Aect=p&cluster=c&namespace=n&service=s"), LOGIN_PARAMS),
            Ok(())
        );
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("app-service-proxy-index.html"), "text/html");
        assert_eq!(content_type("rfb.js"), "application/javascript");
        assert_eq!(content_type("vnc-proxy-styles.css"), "text/css");
        assert_eq!(content_type("LICENSE"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_serve() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>login</h1>").unwrap();
        let assets = StaticAssets::new(dir.path());

        let response = assets.serve("index.html").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<h1>login</h1>");

        assert_eq!(assets.serve("missing.js").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(assets.serve("../etc/passwd").await.status(), StatusCode::NOT_FOUND);
    }
}
