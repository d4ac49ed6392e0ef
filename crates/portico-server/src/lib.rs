//! # Portico DNS Front-End
//!
//! Multi-protocol connection front-end for a DNS-over-HTTPS / DNS-over-TLS
//! resolver, built on Tokio.
//!
//! ## Architecture
//!
//! - **DoT listener**: TLS termination, RFC 7766 framing, pipelined queries
//! - **DoT-cleartext listener**: same pipeline behind an offloading proxy
//! - **PROXY-protocol listener**: parses the v2 header, then splices into
//!   the local DoT listener
//! - **DoH listener**: HTTP/2 over TLS (ALPN `h2`)
//! - **DoH-cleartext listener**: h2c behind an offloading proxy
//! - **Health listener**: immediate `200` for orchestration probes
//!
//! Every accepted socket is serviced by its own task under an idle timeout.
//! Queries are bridged into an external resolver behind [`RequestHandler`];
//! the front-end never interprets DNS payloads beyond the 2-byte length
//! prefix and a minimum size check. An admission controller retunes the
//! per-listener connection caps from load averages and free memory, and can
//! escalate sustained pressure into graceful self-termination.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod admission;
pub mod doh;
pub mod dot;
pub mod framing;
pub mod handler;
pub mod health;
pub mod proxyv2;
pub mod sni;
pub mod stats;
pub mod supervisor;
pub mod tickets;
pub mod tracker;

pub use admission::AdmissionController;
pub use framing::FrameBuffer;
pub use handler::{RequestHandler, ResolverRequest, ResolverResponse};
pub use sni::SniMatcher;
pub use stats::Stats;
pub use supervisor::Supervisor;
pub use tracker::ConnTracker;

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    Shutdown,
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Listener flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Cleartext DNS over TCP.
    Tcp,
    /// DNS over TLS.
    Tls,
    /// DNS over TLS behind a PROXY-protocol v2 hop.
    ProxyTls,
    /// DNS over HTTPS (h2 over TLS).
    H2Tls,
    /// DNS over HTTP (h2c, TLS offloaded).
    H2Cleartext,
    /// HTTP health check.
    Health,
}

impl ListenerKind {
    /// Returns the listener name used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            ListenerKind::Tcp => "DoT-cleartext",
            ListenerKind::Tls => "DoT",
            ListenerKind::ProxyTls => "DoT-proxyproto",
            ListenerKind::H2Tls => "DoH",
            ListenerKind::H2Cleartext => "DoH-cleartext",
            ListenerKind::Health => "health",
        }
    }

    /// Returns true when the listener terminates TLS itself.
    pub const fn is_tls(&self) -> bool {
        matches!(self, ListenerKind::Tls | ListenerKind::H2Tls)
    }
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TLS settings for the terminating listeners.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM private key path.
    pub key_path: PathBuf,

    /// PEM certificate chain path.
    pub cert_path: PathBuf,

    /// DNS SAN hostnames of the serving certificate.
    pub hosts: Vec<String>,
}

/// Front-end configuration, mapped from `portico-config` by the binary.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// DoT port (0 disables).
    pub dot_port: u16,

    /// PROXY-protocol DoT port (0 disables).
    pub dot_proxy_port: u16,

    /// DoH port (0 disables).
    pub doh_port: u16,

    /// Cleartext DoT port (0 disables).
    pub dot_cleartext_port: u16,

    /// Cleartext DoH port (0 disables).
    pub doh_cleartext_port: u16,

    /// Health-check port (0 disables).
    pub check_port: u16,

    /// TCP accept backlog.
    pub backlog: u32,

    /// Per-socket idle timeout.
    pub io_timeout: Duration,

    /// Hard deadline for graceful drain.
    pub shutdown_timeout: Duration,

    /// Floor for the per-listener connection cap.
    pub min_conns: usize,

    /// Ceiling for the per-listener connection cap.
    pub max_conns: usize,

    /// TLS-offload mode: only cleartext and health listeners run.
    pub cleartext: bool,

    /// Whether the PROXY-protocol listener runs.
    pub proxy_proto: bool,

    /// TLS materials; required unless `cleartext`.
    pub tls: Option<TlsSettings>,

    /// Base64 seed for ticket-key derivation.
    pub secret_b64: Option<String>,

    /// Image reference mixed into the ticket-key context.
    pub image_ref: Option<String>,

    /// Enable periodic heap usage reports.
    pub measure_heap: bool,

    /// Developer machine, not a cloud environment.
    pub on_local: bool,
}

impl FrontendConfig {
    /// TLS handshake deadline: half the idle timeout, floored at 3 s.
    pub fn handshake_timeout(&self) -> Duration {
        std::cmp::max(self.io_timeout / 2, Duration::from_secs(3))
    }
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            dot_port: 10_000,
            dot_proxy_port: 10_001,
            doh_port: 8443,
            dot_cleartext_port: 10_555,
            doh_cleartext_port: 8055,
            check_port: 8888,
            backlog: 1024,
            io_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            min_conns: 32,
            max_conns: 512,
            cleartext: false,
            proxy_proto: false,
            tls: None,
            secret_b64: None,
            image_ref: None,
            measure_heap: false,
            on_local: false,
        }
    }
}

/// Sentinel host handed to the resolver for traffic whose TLS (and thus
/// SNI) was terminated upstream.
pub const OFFLOADED_HOST: &str = "ignored.example.com";

/// Formats a connection key as `<ip>|<port>`.
pub(crate) fn conn_key(peer: &SocketAddr) -> String {
    format!("{}|{}", peer.ip(), peer.port())
}
