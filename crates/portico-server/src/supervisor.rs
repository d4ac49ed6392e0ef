//! Listener supervisor: binds every configured listener flavour, admits
//! connections against the per-listener cap, and owns graceful drain.
//!
//! In TLS mode the DoT, PROXY-protocol, DoH and health listeners run; in
//! cleartext (offload) mode the DoT-cleartext, DoH-cleartext and health
//! listeners run instead. All listeners bind `[::]` with keepalive and
//! nodelay set on every accepted socket.

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsServerConfig;
use socket2::{Domain, SockRef, Socket, Type};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

use crate::admission::{self, AdmissionController};
use crate::doh::{self, DohState};
use crate::dot::{self, DotContext};
use crate::handler::RequestHandler;
use crate::health::{self, Heartbeat};
use crate::proxyv2;
use crate::sni::SniMatcher;
use crate::stats::Stats;
use crate::tickets::{self, RotatingTicketer};
use crate::tracker::{ConnGuard, ConnTracker, ListenerEntry};
use crate::{
    FrontendConfig, ListenerKind, Result, ServerError, TlsSettings, OFFLOADED_HOST,
};

const ALPN_H2: &[u8] = b"h2";

/// TLS state shared by the terminating listeners.
struct TlsRuntime {
    dot_acceptor: TlsAcceptor,
    doh_acceptor: TlsAcceptor,
    sni: Arc<SniMatcher>,
    ticketer: Arc<RotatingTicketer>,
    ticket_seed: Vec<u8>,
}

/// The front-end: listeners, pipelines and the admission controller.
pub struct Supervisor {
    cfg: FrontendConfig,
    handler: Arc<dyn RequestHandler>,
    stats: Arc<Stats>,
    tracker: Arc<ConnTracker>,
    heartbeat: Arc<Heartbeat>,
    admission: Arc<AdmissionController>,
    shutdown_tx: broadcast::Sender<()>,
    tls: Option<TlsRuntime>,
}

impl Supervisor {
    /// Builds the supervisor, loading TLS materials when not offloaded.
    pub fn new(
        cfg: FrontendConfig,
        handler: Arc<dyn RequestHandler>,
        stats: Arc<Stats>,
        tracker: Arc<ConnTracker>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        let heartbeat = Heartbeat::new(stats.clone(), &cfg);
        let admission = AdmissionController::new(
            stats.clone(),
            tracker.clone(),
            cfg.min_conns,
            cfg.max_conns,
            !cfg.on_local,
            shutdown_tx.clone(),
        );

        let tls = if cfg.cleartext {
            None
        } else {
            let settings = cfg
                .tls
                .as_ref()
                .ok_or_else(|| ServerError::Config("TLS mode without key material".into()))?;
            Some(build_tls_runtime(settings, &cfg)?)
        };

        Ok(Self {
            cfg,
            handler,
            stats,
            tracker,
            heartbeat,
            admission,
            shutdown_tx,
            tls,
        })
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub fn tracker(&self) -> Arc<ConnTracker> {
        self.tracker.clone()
    }

    /// Binds and runs every configured listener until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Vec::new();

        admission::spawn_ticker(self.admission.clone(), self.shutdown_tx.subscribe());

        if let Some(tls) = &self.tls {
            tickets::spawn_rotation(
                tls.ticketer.clone(),
                tls.ticket_seed.clone(),
                self.cfg.image_ref.clone(),
                self.shutdown_tx.subscribe(),
            );

            if self.cfg.dot_port != 0 {
                tasks.push(self.spawn_dot_tls(tls.dot_acceptor.clone(), tls.sni.clone()).await?);
            }
            if self.cfg.proxy_proto && self.cfg.dot_proxy_port != 0 {
                tasks.push(self.spawn_proxy().await?);
            }
            if self.cfg.doh_port != 0 {
                tasks.push(self.spawn_doh(Some(tls.doh_acceptor.clone())).await?);
            }
        } else {
            if self.cfg.dot_cleartext_port != 0 {
                tasks.push(self.spawn_dot_cleartext().await?);
            }
            if self.cfg.doh_cleartext_port != 0 {
                tasks.push(self.spawn_doh(None).await?);
            }
        }

        if self.cfg.check_port != 0 {
            tasks.push(self.spawn_health().await?);
        }

        for task in tasks {
            task.await
                .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        }

        Ok(())
    }

    /// Graceful drain: keep a single admission slot for health probes,
    /// terminate the tracker, and force-close whatever is still open.
    /// Listener accept loops exit on the shutdown broadcast.
    pub fn drain(&self) {
        info!("draining front-end");
        self.admission.adjust_max_conns(1);

        let listeners = self.tracker.end();
        for listener in &listeners {
            listener.kill_all();
        }

        self.heartbeat.final_report();
    }

    fn dot_context(&self) -> Arc<DotContext> {
        Arc::new(DotContext {
            handler: self.handler.clone(),
            heartbeat: self.heartbeat.clone(),
            stats: self.stats.clone(),
            io_timeout: self.cfg.io_timeout,
        })
    }

    async fn bind(&self, kind: ListenerKind, port: u16) -> Result<(TcpListener, Arc<ListenerEntry>)> {
        let listener = bind_listener(port, self.cfg.backlog)?;
        let addr = listener.local_addr()?;

        let entry = self
            .tracker
            .track_server(kind, addr, self.cfg.max_conns)
            .ok_or(ServerError::Shutdown)?;

        info!(addr = %addr, listener = %kind, "listening");
        Ok((listener, entry))
    }

    async fn spawn_dot_tls(
        &self,
        acceptor: TlsAcceptor,
        sni: Arc<SniMatcher>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let (listener, entry) = self.bind(ListenerKind::Tls, self.cfg.dot_port).await?;
        let ctx = self.dot_context();
        let hs_timeout = self.cfg.handshake_timeout();
        let this = self.clone_accept_state();

        Ok(tokio::spawn(async move {
            let mut shutdown = this.shutdown_tx.subscribe();
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        let Some(guard) = this.admit(&entry, &stream, peer) else {
                            continue;
                        };
                        let acceptor = acceptor.clone();
                        let sni = sni.clone();
                        let ctx = ctx.clone();
                        let stats = this.stats.clone();

                        tokio::spawn(async move {
                            let tls_stream = match timeout(hs_timeout, acceptor.accept(stream)).await {
                                Ok(Ok(tls_stream)) => tls_stream,
                                Ok(Err(e)) => {
                                    stats.inc_tls_errors();
                                    debug!(client = %peer, error = %e, "TLS handshake failed");
                                    return;
                                }
                                Err(_) => {
                                    stats.inc_tls_errors();
                                    debug!(client = %peer, "TLS handshake timed out");
                                    return;
                                }
                            };

                            let name = tls_stream
                                .get_ref()
                                .1
                                .server_name()
                                .map(|s| s.to_string());

                            let meta = match name.as_deref().and_then(|s| sni.classify(s)) {
                                Some(meta) => meta,
                                None => {
                                    stats.inc_tls_errors();
                                    debug!(client = %peer, sni = ?name, "unrecognised SNI");
                                    return;
                                }
                            };

                            if let Err(e) = dot::serve_stream(
                                tls_stream, peer, meta.host, meta.flag, ctx, guard,
                            )
                            .await
                            {
                                debug!(client = %peer, error = %e, "DoT connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "DoT accept failed");
                        let _ = this.shutdown_tx.send(());
                        break;
                    }
                }
            }
        }))
    }

    async fn spawn_dot_cleartext(&self) -> Result<tokio::task::JoinHandle<()>> {
        let (listener, entry) = self
            .bind(ListenerKind::Tcp, self.cfg.dot_cleartext_port)
            .await?;
        let ctx = self.dot_context();
        let this = self.clone_accept_state();

        Ok(tokio::spawn(async move {
            let mut shutdown = this.shutdown_tx.subscribe();
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        let Some(guard) = this.admit(&entry, &stream, peer) else {
                            continue;
                        };
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dot::serve_stream(
                                stream,
                                peer,
                                OFFLOADED_HOST.to_string(),
                                String::new(),
                                ctx,
                                guard,
                            )
                            .await
                            {
                                debug!(client = %peer, error = %e, "DoT-cleartext connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "DoT-cleartext accept failed");
                        let _ = this.shutdown_tx.send(());
                        break;
                    }
                }
            }
        }))
    }

    async fn spawn_proxy(&self) -> Result<tokio::task::JoinHandle<()>> {
        let (listener, entry) = self
            .bind(ListenerKind::ProxyTls, self.cfg.dot_proxy_port)
            .await?;
        let backend = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), self.cfg.dot_port);
        let io_timeout = self.cfg.io_timeout;
        let this = self.clone_accept_state();

        Ok(tokio::spawn(async move {
            let mut shutdown = this.shutdown_tx.subscribe();
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        let Some(guard) = this.admit(&entry, &stream, peer) else {
                            continue;
                        };
                        tokio::spawn(async move {
                            if let Err(e) =
                                proxyv2::serve(stream, peer, backend, io_timeout, guard).await
                            {
                                debug!(client = %peer, error = %e, "PROXYv2 connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "PROXYv2 accept failed");
                        let _ = this.shutdown_tx.send(());
                        break;
                    }
                }
            }
        }))
    }

    async fn spawn_doh(&self, acceptor: Option<TlsAcceptor>) -> Result<tokio::task::JoinHandle<()>> {
        let (kind, port) = if acceptor.is_some() {
            (ListenerKind::H2Tls, self.cfg.doh_port)
        } else {
            (ListenerKind::H2Cleartext, self.cfg.doh_cleartext_port)
        };
        let (listener, entry) = self.bind(kind, port).await?;

        let router = doh::router(DohState {
            handler: self.handler.clone(),
            heartbeat: self.heartbeat.clone(),
        });
        let hs_timeout = self.cfg.handshake_timeout();
        let io_timeout = self.cfg.io_timeout;
        let this = self.clone_accept_state();

        Ok(tokio::spawn(async move {
            let mut shutdown = this.shutdown_tx.subscribe();
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        let Some(guard) = this.admit(&entry, &stream, peer) else {
                            continue;
                        };
                        let acceptor = acceptor.clone();
                        let service = TowerToHyperService::new(router.clone());
                        let stats = this.stats.clone();

                        tokio::spawn(async move {
                            let mut builder = ConnectionBuilder::new(TokioExecutor::new());
                            builder
                                .http2()
                                .keep_alive_interval(Some(io_timeout / 2))
                                .keep_alive_timeout(io_timeout);

                            let served = match acceptor {
                                Some(acceptor) => {
                                    let tls_stream =
                                        match timeout(hs_timeout, acceptor.accept(stream)).await {
                                            Ok(Ok(tls_stream)) => tls_stream,
                                            Ok(Err(e)) => {
                                                stats.inc_tls_errors();
                                                debug!(client = %peer, error = %e, "TLS handshake failed");
                                                return;
                                            }
                                            Err(_) => {
                                                stats.inc_tls_errors();
                                                debug!(client = %peer, "TLS handshake timed out");
                                                return;
                                            }
                                        };
                                    serve_h2(builder, TokioIo::new(tls_stream), service, &guard).await
                                }
                                None => {
                                    serve_h2(builder, TokioIo::new(stream), service, &guard).await
                                }
                            };

                            if let Err(e) = served {
                                debug!(client = %peer, error = %e, "DoH connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "DoH accept failed");
                        let _ = this.shutdown_tx.send(());
                        break;
                    }
                }
            }
        }))
    }

    async fn spawn_health(&self) -> Result<tokio::task::JoinHandle<()>> {
        let (listener, entry) = self.bind(ListenerKind::Health, self.cfg.check_port).await?;
        let _ = entry; // health probes are not tracked per-connection
        let router = health::router(self.stats.clone());
        let this = self.clone_accept_state();

        Ok(tokio::spawn(async move {
            let mut shutdown = this.shutdown_tx.subscribe();
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(client = %peer, error = %e, "nodelay failed");
                        }
                        if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                            debug!(client = %peer, error = %e, "keepalive failed");
                        }

                        let service = TowerToHyperService::new(router.clone());
                        tokio::spawn(async move {
                            let builder = ConnectionBuilder::new(TokioExecutor::new());
                            let _ = builder
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "health accept failed");
                    }
                }
            }
        }))
    }

    fn clone_accept_state(&self) -> AcceptState {
        AcceptState {
            stats: self.stats.clone(),
            tracker: self.tracker.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}

/// The slice of supervisor state each accept loop needs.
struct AcceptState {
    stats: Arc<Stats>,
    tracker: Arc<ConnTracker>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AcceptState {
    fn admit(&self, entry: &Arc<ListenerEntry>, stream: &TcpStream, peer: SocketAddr) -> Option<ConnGuard> {
        self.stats.inc_total_conns();

        if entry.conn_count() >= entry.max_conns() {
            self.stats.inc_drops();
            trace!(client = %peer, listener = %entry.kind(), "connection dropped at cap");
            return None;
        }

        let guard = self.tracker.track_conn(entry, peer)?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %peer, error = %e, "nodelay failed");
        }
        if let Err(e) = SockRef::from(stream).set_keepalive(true) {
            debug!(client = %peer, error = %e, "keepalive failed");
        }

        Some(guard)
    }
}

async fn serve_h2<I>(
    builder: ConnectionBuilder<TokioExecutor>,
    io: TokioIo<I>,
    service: TowerToHyperService<axum::Router>,
    guard: &ConnGuard,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::select! {
        result = builder.serve_connection_with_upgrades(io, service) => result,
        _ = guard.killed() => Ok(()),
    }
}

/// Binds `[::]:port` with the configured backlog via socket2.
fn bind_listener(port: u16, backlog: u32) -> Result<TcpListener> {
    let addr: SocketAddr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);

    let socket = Socket::new(Domain::IPV6, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Loads certificates and key, builds both rustls configs, and seeds the
/// ticket rotator.
fn build_tls_runtime(settings: &TlsSettings, cfg: &FrontendConfig) -> Result<TlsRuntime> {
    let certs = load_certs(&settings.cert_path)?;
    let key = load_key(&settings.key_path)?;

    let seed = tickets::ticket_seed(cfg.secret_b64.as_deref(), key.secret_der())?;
    let context = tickets::rotation_context(cfg.image_ref.as_deref());
    let ticketer = RotatingTicketer::new(tickets::derive_ticket_key(&seed, &context));

    let dot_config = tls_server_config(certs.clone(), key.clone_key(), false, ticketer.clone())?;
    let doh_config = tls_server_config(certs, key, true, ticketer.clone())?;

    let sni = Arc::new(SniMatcher::from_sans(&settings.hosts)?);

    Ok(TlsRuntime {
        dot_acceptor: TlsAcceptor::from(dot_config),
        doh_acceptor: TlsAcceptor::from(doh_config),
        sni,
        ticketer,
        ticket_seed: seed,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ServerError::Tls(format!("failed to open certificate file: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(ServerError::Tls("no certificates found in file".into()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ServerError::Tls(format!("failed to open key file: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found in file".into()))
}

fn tls_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn_h2: bool,
    ticketer: Arc<RotatingTicketer>,
) -> Result<Arc<RustlsServerConfig>> {
    let mut config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("failed to build TLS config: {e}")))?;

    if alpn_h2 {
        config.alpn_protocols = vec![ALPN_H2.to_vec()];
    }
    config.ticketer = ticketer;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NullResolver;

    fn offload_config() -> FrontendConfig {
        FrontendConfig {
            cleartext: true,
            dot_cleartext_port: 0,
            doh_cleartext_port: 0,
            check_port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_bind_listener_ephemeral() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let listener = bind_listener(0, 128).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_supervisor_requires_tls_material() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let stats = Stats::new();
        let tracker = ConnTracker::new(stats.clone());
        let (tx, _rx) = broadcast::channel(1);

        let cfg = FrontendConfig::default(); // TLS mode, no materials
        let err = Supervisor::new(cfg, Arc::new(NullResolver), stats, tracker, tx)
            .err()
            .expect("missing TLS material must fail");
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_cleartext_supervisor_builds_without_tls() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let stats = Stats::new();
        let tracker = ConnTracker::new(stats.clone());
        let (tx, _rx) = broadcast::channel(1);

        Supervisor::new(offload_config(), Arc::new(NullResolver), stats, tracker, tx)
            .expect("cleartext mode needs no TLS material");
    }

    #[test]
    fn test_drain_sets_cap_and_ends_tracker() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let stats = Stats::new();
        let tracker = ConnTracker::new(stats.clone());
        let (tx, _rx) = broadcast::channel(1);

        let sup = Supervisor::new(
            offload_config(),
            Arc::new(NullResolver),
            stats,
            tracker.clone(),
            tx,
        )
        .unwrap();

        let entry = tracker
            .track_server(ListenerKind::Tcp, "[::]:10555".parse().unwrap(), 512)
            .unwrap();

        sup.drain();

        // Cap clamped to the floor, registry terminated.
        assert_eq!(entry.max_conns(), sup.cfg.min_conns);
        assert!(tracker.is_ended());
    }
}
