//! Routing context carried in cookies set by the login page

use crate::cookies::get_cookie;
use hyper::header::HeaderMap;

pub const PROJECT_COOKIE: &str = "app-service-proxy-project";
pub const CLUSTER_COOKIE: &str = "app-service-proxy-cluster";
pub const NAMESPACE_COOKIE: &str = "app-service-proxy-namespace";
pub const SERVICE_COOKIE: &str = "app-service-proxy-service";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("routing cookie {0} is missing")]
    Missing(&'static str),
    #[error("routing cookie {0} has an invalid value")]
    Malformed(&'static str),
}

/// Which downstream service a request is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingContext {
    pub project_id: String,
    pub cluster: String,
    pub namespace: String,
    pub service: String,
}

impl RoutingContext {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, RoutingError> {
        Ok(Self {
            project_id: required(headers, PROJECT_COOKIE)?,
            cluster: required(headers, CLUSTER_COOKIE)?,
            namespace: required(headers, NAMESPACE_COOKIE)?,
            service: required(headers, SERVICE_COOKIE)?,
        })
    }

    /// Path prefix the cluster API server adds to every proxied service URL
    pub fn proxy_prefix(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}/proxy",
            self.namespace, self.service
        )
    }

    /// Path on the gateway for `path_and_query` of the inbound request
    pub fn downstream_path(&self, infra_name: &str, path_and_query: &str) -> String {
        format!(
            "/kubernetes/{}-{}{}{}",
            self.project_id,
            infra_name,
            self.proxy_prefix(),
            path_and_query
        )
    }
}

fn required(headers: &HeaderMap, name: &'static str) -> Result<String, RoutingError> {
    let value = get_cookie(headers, name).ok_or(RoutingError::Missing(name))?;
    if !is_valid_segment(value) {
        return Err(RoutingError::Malformed(name));
    }
    Ok(value.to_string())
}

/// Values end up as single path segments of the downstream URL
fn is_valid_segment(value: &str) -> bool {
    !value.is_empty()
        && !value.contains("..")
        && !value
            .chars()
            .any(|c| matches!(c, '/' | '?' | '#' | '\\') || c.is_whitespace() || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, COOKIE};

    fn headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    const ALL: &str = "app-service-proxy-project=p1; app-service-proxy-cluster=c1; \
                       app-service-proxy-namespace=n1; app-service-proxy-service=s1:80";

    #[test]
    fn test_from_headers() {
        let ctx = RoutingContext::from_headers(&headers(ALL)).unwrap();
        assert_eq!(ctx.project_id, "p1");
        assert_eq!(ctx.cluster, "c1");
        assert_eq!(ctx.namespace, "n1");
        assert_eq!(ctx.service, "s1:80");
    }

    #[test]
    fn test_missing_cookie() {
        let err = RoutingContext::from_headers(&headers(
            "app-service-proxy-project=p1; app-service-proxy-cluster=c1; app-service-proxy-namespace=n1",
        ))
        .unwrap_err();
        assert_eq!(err, RoutingError::Missing(SERVICE_COOKIE));

        let err = RoutingContext::from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(err, RoutingError::Missing(PROJECT_COOKIE));
    }

    #[test]
    fn test_malformed_cookie() {
        for bad in ["", "a/b", "..", "x?y", "x#y"] {
            let cookie = format!(
                "app-service-proxy-project=p1; app-service-proxy-cluster=c1; \
                 app-service-proxy-namespace={}; app-service-proxy-service=s1",
                bad
            );
            let err = RoutingContext::from_headers(&headers(&cookie)).unwrap_err();
            assert_eq!(err, RoutingError::Malformed(NAMESPACE_COOKIE), "value {:?}", bad);
        }
    }

    #[test]
    fn test_downstream_path() {
        let ctx = RoutingContext::from_headers(&headers(ALL)).unwrap();
        assert_eq!(ctx.proxy_prefix(), "/api/v1/namespaces/n1/services/s1:80/proxy");
        assert_eq!(
            ctx.downstream_path("x", "/index.html?a=b"),
            "/kubernetes/p1-x/api/v1/namespaces/n1/services/s1:80/proxy/index.html?a=b"
        );
    }
}
