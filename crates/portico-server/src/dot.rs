//! DNS-over-TCP pipeline: RFC 7766 framing in, resolver dispatch, framed
//! answers out.
//!
//! One reader task per socket feeds the framing buffer; each completed
//! query is dispatched to the resolver on its own task so slow answers
//! never stall the pipeline. Responses flow through a bounded channel to a
//! single writer task and may be written in completion order, which
//! pipelining clients must tolerate.
//!
//! Backpressure: the writer awaiting the socket fills the response
//! channel, dispatch tasks block on it, the in-flight semaphore drains,
//! and the reader stops pulling bytes until the socket drains again. No
//! query is dropped on that path.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::framing::{FrameBuffer, MAX_DNS_PACKET};
use crate::handler::{
    new_rxid, RequestHandler, ResolverRequest, DNS_MESSAGE_CONTENT_TYPE, RXID_HEADER,
};
use crate::health::Heartbeat;
use crate::stats::Stats;
use crate::tracker::ConnGuard;

/// Resolver calls in flight per socket.
const MAX_INFLIGHT_QUERIES: usize = 16;

/// Responses buffered between dispatch tasks and the writer.
const RESPONSE_CHANNEL_DEPTH: usize = 32;

/// Shared dependencies of every DoT connection.
pub struct DotContext {
    pub handler: Arc<dyn RequestHandler>,
    pub heartbeat: Arc<Heartbeat>,
    pub stats: Arc<Stats>,
    pub io_timeout: Duration,
}

/// Serves one DoT (or cleartext DoT) connection until EOF, idle timeout,
/// framing violation, or drain.
pub async fn serve_stream<S>(
    stream: S,
    peer: SocketAddr,
    host: String,
    flag: String,
    ctx: Arc<DotContext>,
    guard: ConnGuard,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    trace!(client = %peer, host, "DoT connection open");

    let (mut rd, mut wr) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Bytes>(RESPONSE_CHANNEL_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if wr.write_all(&frame).await.is_err() {
                break;
            }
            if wr.flush().await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_QUERIES));
    let mut framer = FrameBuffer::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut clean = true;

    'read: loop {
        buf.clear();

        let read = tokio::select! {
            _ = guard.killed() => {
                trace!(client = %peer, "DoT connection force-closed");
                clean = false;
                break 'read;
            }
            r = timeout(ctx.io_timeout, rd.read_buf(&mut buf)) => r,
        };

        let n = match read {
            Err(_) => {
                trace!(client = %peer, "DoT idle timeout");
                ctx.stats.inc_timeouts();
                clean = false;
                break 'read;
            }
            Ok(Err(e)) => {
                debug!(client = %peer, error = %e, "DoT read error");
                clean = false;
                break 'read;
            }
            Ok(Ok(0)) => break 'read,
            Ok(Ok(n)) => n,
        };

        let queries = match framer.feed(&buf[..n]) {
            Ok(queries) => queries,
            Err(e) => {
                debug!(client = %peer, error = %e, "DoT framing violation");
                clean = false;
                break 'read;
            }
        };

        for query in queries {
            // Backpressure point: waits while the write side is saturated.
            let permit = match inflight.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break 'read,
            };

            let ctx = ctx.clone();
            let tx = tx.clone();
            let host = host.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                let frame = resolve_query(query, &host, &flag, &ctx).await;
                let _ = tx.send(frame).await;
                drop(permit);
            });
        }
    }

    drop(tx);
    if clean {
        // Let in-flight answers drain before the socket closes.
        let _ = writer.await;
    } else {
        writer.abort();
    }

    trace!(client = %peer, "DoT connection closed");
    Ok(())
}

/// Dispatches one query and produces the framed wire response.
async fn resolve_query(query: Bytes, host: &str, flag: &str, ctx: &DotContext) -> Bytes {
    ctx.heartbeat.beat();

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(DNS_MESSAGE_CONTENT_TYPE));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(DNS_MESSAGE_CONTENT_TYPE),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(query.len()));
    if let Ok(rxid) = HeaderValue::from_str(&new_rxid()) {
        headers.insert(RXID_HEADER, rxid);
    }

    let request = ResolverRequest {
        method: Method::POST,
        url: format!("https://{host}/{flag}"),
        headers,
        body: query.clone(),
    };

    let response = ctx.handler.handle(request).await;

    let answer = if response.body.is_empty() || response.body.len() > MAX_DNS_PACKET {
        servfail(&query)
    } else {
        response.body
    };

    frame_answer(&answer)
}

/// Prefixes an answer with its 16-bit big-endian length.
pub fn frame_answer(answer: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + answer.len());
    out.put_u16(answer.len() as u16);
    out.extend_from_slice(answer);
    out.freeze()
}

/// Synthesises a SERVFAIL for the original query at the wire level: the
/// query is echoed with QR and RA set and RCODE=2. Counts are untouched
/// (a query carries no answers), so the question and any OPT record
/// survive intact.
pub fn servfail(query: &[u8]) -> Bytes {
    let mut out = BytesMut::from(query);
    if out.len() >= 12 {
        out[2] |= 0x80;
        out[3] = (out[3] & 0xF0) | 0x02;
        out[3] |= 0x80;
    }
    out.freeze()
}
