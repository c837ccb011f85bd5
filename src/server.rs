use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::handshake::{
    established_response, method_not_allowed_response, rejection_response, ProxyBody,
    TunnelHandshake,
};
use crate::registry::ConnectionRegistry;
use crate::relay::relay;

use hyper::header::PROXY_AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_loop: JoinHandle<()>,
}

/// Owns the listening socket and the start/stop lifecycle.
///
/// Stopping only closes the listener and winds down connections that are
/// still handshaking; established tunnels keep running until they end on
/// their own or [`ConnectionRegistry::close_all`] is called.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    registry: ConnectionRegistry,
    running: Option<Running>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            running: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Tunnels established through this server
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Bound address while the server is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Bind the listener and start accepting.
    ///
    /// Returns once the socket is listening. Calling it again while running
    /// is a no-op that returns the current address.
    pub async fn start(&mut self) -> ProxyResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::BindError { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::BindError { addr, source })?;

        info!("Server is listening on {}", local_addr);
        self.registry.reopen();

        let shutdown = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.config),
            self.registry.clone(),
            shutdown.clone(),
        ));

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_loop,
        });
        Ok(local_addr)
    }

    /// Close the listener and give unfinished handshakes
    /// `shutdown_timeout` to complete.
    ///
    /// Resolves once the listener is closed. Established tunnels are left
    /// alone.
    pub async fn stop(&mut self) -> ProxyResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept_loop.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        info!(
            "Server on {} stopped, {} tunnels still open",
            running.local_addr,
            self.registry.len()
        );
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ProxyConfig>,
    registry: ConnectionRegistry,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => {
                debug!("Accept loop received shutdown");
                break;
            }
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                tokio::task::spawn(serve_connection(
                    stream,
                    peer_addr,
                    Arc::clone(&config),
                    registry.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!("Accept error: {} (continuing)", e);
            }
        }
    }
}

/// Serve one client connection until it upgrades into a tunnel or closes.
async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    registry: ConnectionRegistry,
    shutdown: CancellationToken,
) {
    let shutdown_timeout: Duration = config.shutdown_timeout;
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        proxy(req, peer_addr, Arc::clone(&config), registry.clone())
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(shutdown_timeout, conn.as_mut()).await {
                Ok(res) => res,
                Err(_) => {
                    debug!("Dropping {}: handshake still pending at shutdown", peer_addr);
                    return;
                }
            }
        }
    };

    if let Err(err) = result {
        // Only log connection errors, not normal endings
        if !err.is_incomplete_message() {
            warn!("Connection from {} error: {}", peer_addr, err);
        }
    }
}

async fn proxy(
    req: Request<hyper::body::Incoming>,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    registry: ConnectionRegistry,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Only CONNECT is served, everything else ends here
    if req.method() != Method::CONNECT {
        debug!("{} {} {} not allowed", peer_addr, req.method(), req.uri());
        return Ok(method_not_allowed_response());
    }

    info!("{} {} {}", peer_addr, req.method(), req.uri());

    let authority = req
        .uri()
        .authority()
        .map(|authority| authority.as_str().to_string())
        .unwrap_or_default();

    let mut handshake = TunnelHandshake::new(&config, peer_addr);
    let (target, upstream) = match handshake
        .run(req.headers().get(PROXY_AUTHORIZATION), &authority)
        .await
    {
        Ok(established) => established,
        Err(e) => {
            warn!("Tunnel from {} not established: {}", peer_addr, e);
            return Ok(rejection_response(&e));
        }
    };

    let registration = registry.register(peer_addr, target.clone());
    let tunnel_id = registration.id();
    info!("Tunnel #{} {} -> {} established", tunnel_id, peer_addr, target);

    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                match relay(client, upstream, registration.cancel_token()).await {
                    Ok(stats) => debug!(
                        "Tunnel #{} closed: {}↑ {}↓ bytes, {} active",
                        tunnel_id,
                        stats.from_client,
                        stats.from_upstream,
                        registry.len().saturating_sub(1)
                    ),
                    Err(e) => warn!(
                        "Tunnel #{} {} -> {} error: {}",
                        tunnel_id, peer_addr, target, e
                    ),
                }
            }
            Err(e) => warn!("Tunnel #{} upgrade error: {}", tunnel_id, e),
        }
        drop(registration);
    });

    Ok(established_response())
}
