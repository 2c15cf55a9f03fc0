//! Gateway round trip with response rewriting
//!
//! Headers are fixed up on every response. HTML bodies are buffered,
//! rewritten and re-encoded; anything else streams through untouched.

use crate::error::{full_body, ResponseBody};
use crate::pool::{GatewayPool, PoolError, RequestBody};
use crate::rewrite::headers::{is_html, rewrite_response_headers};
use crate::rewrite::{rewrite_body, ContentEncoding, RewriteContext};
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Request, Response};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("gateway request failed: {0}")]
    Gateway(#[from] PoolError),
    #[error("failed to read gateway response body: {0}")]
    Body(#[from] hyper::Error),
}

pub struct RewritingTransport {
    pool: Arc<GatewayPool>,
}

impl RewritingTransport {
    pub fn new(pool: Arc<GatewayPool>) -> Self {
        Self { pool }
    }

    pub async fn round_trip(
        &self,
        req: Request<RequestBody>,
        ctx: &RewriteContext,
    ) -> Result<Response<ResponseBody>, TransportError> {
        let response = self.pool.send_request(req).await?;
        let (mut parts, body) = response.into_parts();

        rewrite_response_headers(&mut parts.headers, ctx);

        if !is_html(&parts.headers) {
            return Ok(Response::from_parts(parts, body.boxed()));
        }

        let encoding = ContentEncoding::from_headers(&parts.headers);
        if encoding == ContentEncoding::Unsupported {
            warn!(
                encoding = ?parts.headers.get(hyper::header::CONTENT_ENCODING),
                "Unsupported content encoding, passing HTML through unmodified"
            );
            return Ok(Response::from_parts(parts, body.boxed()));
        }

        let original = body.collect().await?.to_bytes();
        if original.is_empty() {
            return Ok(Response::from_parts(parts, full_body(original)));
        }

        let rewritten = match rewrite_body(&original, encoding, ctx) {
            Ok(rewritten) => {
                debug!(before = original.len(), after = rewritten.len(), "Rewrote HTML body");
                rewritten.into()
            }
            Err(e) => {
                error!(error = %e, "Failed to rewrite HTML body, passing it through");
                original
            }
        };

        parts.headers.remove(TRANSFER_ENCODING);
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
        Ok(Response::from_parts(parts, full_body(rewritten)))
    }
}
