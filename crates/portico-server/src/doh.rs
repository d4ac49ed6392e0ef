//! DNS-over-HTTPS pipeline.
//!
//! Every request on the DoH listeners lands here regardless of path: the
//! body is buffered whole, wrapped into an internal request at
//! `https://<authority>/<path>`, and the resolver's answer is mirrored
//! back. `POST` carries the query in the body and is bounds-checked;
//! `GET` is forwarded unchanged. The front-end never retries.

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderValue, Method, Request, StatusCode};
use std::net::Ipv6Addr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::framing::{MAX_DNS_PACKET, MIN_DNS_PACKET};
use crate::handler::{new_rxid, RequestHandler, ResolverRequest, RXID_HEADER};
use crate::health::Heartbeat;

/// Shared state for the DoH routers.
#[derive(Clone)]
pub struct DohState {
    pub handler: Arc<dyn RequestHandler>,
    pub heartbeat: Arc<Heartbeat>,
}

/// Builds the DoH router. Every method and path funnels into the
/// resolver; routing decisions belong to it, not the front-end.
pub fn router(state: DohState) -> Router {
    Router::new()
        .fallback(serve)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn serve(State(state): State<DohState>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let authority = authority_of(&request);
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = request.headers().clone();
    if let Ok(rxid) = HeaderValue::from_str(&new_rxid()) {
        headers.insert(RXID_HEADER, rxid);
    }

    let body = if method == Method::POST {
        let buffered = match axum::body::to_bytes(request.into_body(), MAX_DNS_PACKET).await {
            Ok(buffered) => buffered,
            Err(e) => {
                debug!(error = %e, "DoH body over DNS bounds");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };
        if buffered.len() < MIN_DNS_PACKET {
            debug!(len = buffered.len(), "DoH body under DNS bounds");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        buffered
    } else {
        Bytes::new()
    };

    state.heartbeat.beat();

    let resolver_request = ResolverRequest {
        method,
        url: format!("https://{authority}{path_and_query}"),
        headers,
        body,
    };

    let answer = state.handler.handle(resolver_request).await;

    let mut builder = Response::builder().status(answer.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in answer.headers.iter() {
            // Hop-by-hop and length framing are the server's business.
            if *name == CONTENT_LENGTH || *name == CONNECTION || *name == TRANSFER_ENCODING {
                continue;
            }
            headers.append(name, value.clone());
        }
    }

    let body = if answer.body.is_empty() {
        Body::empty()
    } else {
        Body::from(answer.body)
    };

    builder.body(body).unwrap_or_else(|e| {
        debug!(error = %e, "DoH response build failed");
        StatusCode::BAD_REQUEST.into_response()
    })
}

/// Resolves the request authority: the HTTP/2 `:authority` pseudo when
/// present, else the Host header. Raw IPv6 literals are bracketed.
fn authority_of(request: &Request<Body>) -> String {
    let raw = request
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .unwrap_or_default();

    bracket_ipv6(&raw)
}

fn bracket_ipv6(authority: &str) -> String {
    if !authority.starts_with('[') && authority.parse::<Ipv6Addr>().is_ok() {
        format!("[{authority}]")
    } else {
        authority.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ResolverResponse;
    use crate::stats::Stats;
    use crate::FrontendConfig;
    use async_trait::async_trait;
    use http::HeaderMap;
    use parking_lot::Mutex;
    use tower::util::ServiceExt;

    struct RecordingResolver {
        seen: Mutex<Vec<ResolverRequest>>,
        status: StatusCode,
        body: Bytes,
        headers: HeaderMap,
    }

    impl RecordingResolver {
        fn new(status: StatusCode, body: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                status,
                body: Bytes::from_static(body),
                headers: HeaderMap::new(),
            })
        }

        fn with_header(status: StatusCode, body: &'static [u8]) -> Arc<Self> {
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/dns-message"));
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                status,
                body: Bytes::from_static(body),
                headers,
            })
        }
    }

    #[async_trait]
    impl RequestHandler for RecordingResolver {
        async fn handle(&self, request: ResolverRequest) -> ResolverResponse {
            self.seen.lock().push(request);
            ResolverResponse {
                status: self.status,
                headers: self.headers.clone(),
                body: self.body.clone(),
            }
        }
    }

    fn app(resolver: Arc<dyn RequestHandler>) -> Router {
        let stats = Stats::new();
        router(DohState {
            handler: resolver,
            heartbeat: Heartbeat::new(stats, &FrontendConfig::default()),
        })
    }

    fn dns_query(len: usize) -> Vec<u8> {
        let mut q = vec![0u8; len];
        q[5] = 0x01;
        q
    }

    #[tokio::test]
    async fn test_post_forwards_body_and_mirrors_response() {
        // Scenario S4.
        let resolver = RecordingResolver::new(StatusCode::OK, b"\x00\x00answer");
        let app = app(resolver.clone());

        let res = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/flagX")
                    .header(HOST, "a.example")
                    .header("content-type", "application/dns-message")
                    .body(Body::from(dns_query(28)))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"\x00\x00answer");

        let seen = resolver.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].url, "https://a.example/flagX");
        assert_eq!(seen[0].body.len(), 28);
        assert!(seen[0].headers.contains_key(RXID_HEADER));
        assert!(seen[0].headers.contains_key("content-type"));
    }

    #[tokio::test]
    async fn test_get_forwarded_without_body() {
        let resolver = RecordingResolver::new(StatusCode::OK, b"\x00\x00answer");
        let app = app(resolver.clone());

        let res = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/dns-query?dns=AAABAA")
                    .header(HOST, "a.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let seen = resolver.seen.lock();
        assert_eq!(seen[0].method, Method::GET);
        assert_eq!(seen[0].url, "https://a.example/dns-query?dns=AAABAA");
        assert!(seen[0].body.is_empty());
    }

    #[tokio::test]
    async fn test_post_bounds() {
        let resolver = RecordingResolver::new(StatusCode::OK, b"x");

        // Undersized.
        let res = app(resolver.clone())
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(HOST, "a.example")
                    .body(Body::from(vec![0u8; 5]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Oversized.
        let res = app(resolver.clone())
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(HOST, "a.example")
                    .body(Body::from(vec![0u8; MAX_DNS_PACKET + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert!(resolver.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_resolver_status_and_headers_mirrored() {
        let resolver = RecordingResolver::with_header(StatusCode::IM_A_TEAPOT, b"tea");
        let app = app(resolver);

        let res = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(HOST, "a.example")
                    .body(Body::from(dns_query(12)))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(
            res.headers().get("content-type").unwrap(),
            "application/dns-message"
        );
        // The resolver's stale content-length is not forwarded.
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"tea");
    }

    #[tokio::test]
    async fn test_empty_answer_ends_without_body() {
        let resolver = RecordingResolver::new(StatusCode::OK, b"");
        let app = app(resolver);

        let res = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(HOST, "a.example")
                    .body(Body::from(dns_query(12)))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_bracket_ipv6() {
        assert_eq!(bracket_ipv6("2001:db8::1"), "[2001:db8::1]");
        assert_eq!(bracket_ipv6("[2001:db8::1]:443"), "[2001:db8::1]:443");
        assert_eq!(bracket_ipv6("a.example"), "a.example");
        assert_eq!(bracket_ipv6("a.example:443"), "a.example:443");
    }
}
