//! Resolver contract.
//!
//! The front-end treats the resolver as a black-box request/response
//! function over an HTTP-shaped value type. DoT queries are wrapped into a
//! synthetic `POST`; DoH requests pass through with their original method,
//! path and headers. Either way the request carries a correlation id in
//! `x-rxid`.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use rand::RngCore;

/// Header carrying the per-request correlation id.
pub const RXID_HEADER: &str = "x-rxid";

/// MIME type for DNS messages.
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Request value handed to the resolver.
#[derive(Debug, Clone)]
pub struct ResolverRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response value returned by the resolver.
#[derive(Debug, Clone)]
pub struct ResolverResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResolverResponse {
    /// An empty-bodied response with the given status.
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// The external resolver.
///
/// Implementations must never panic; the front-end maps failures to
/// SERVFAIL (DoT) or an error status (DoH) but does not retry.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: ResolverRequest) -> ResolverResponse;
}

/// Stand-in resolver returning an empty `200` for every request.
///
/// The DoT pipeline turns the empty answer into a SERVFAIL, so a front-end
/// wired to this handler stays protocol-correct while no resolver is
/// linked in. Also useful in tests.
pub struct NullResolver;

#[async_trait]
impl RequestHandler for NullResolver {
    async fn handle(&self, _request: ResolverRequest) -> ResolverResponse {
        ResolverResponse::empty(StatusCode::OK)
    }
}

/// Generates a fresh correlation id: 16 lowercase hex chars.
pub fn new_rxid() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rxid_shape() {
        let id = new_rxid();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        // Two draws should essentially never collide.
        assert_ne!(new_rxid(), new_rxid());
    }

    #[tokio::test]
    async fn test_null_resolver_is_empty_ok() {
        let resp = NullResolver
            .handle(ResolverRequest {
                method: Method::POST,
                url: "https://a.example/".into(),
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"\x00\x01"),
            })
            .await;

        assert_eq!(resp.status, StatusCode::OK);
        assert!(resp.body.is_empty());
    }
}
