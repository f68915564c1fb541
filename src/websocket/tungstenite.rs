//! Production WebSocket backend on tokio-tungstenite and rustls
//!
//! Each outbound connection and each accepted connection runs a pair of
//! tokio tasks: one reading WebSocket messages into [`EventSink`]
//! dispatches, one draining an outbound queue fed by `dispatch_send`. The
//! backend owns its own tokio runtime so the blocking datalink façade can
//! be used from plain threads.
//!
//! TLS follows AB.7.1: both sides present certificates, the peer is
//! verified against the configured issuer chain, and the SC subprotocol is
//! carried in `Sec-WebSocket-Protocol`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async_tls_with_config, Connector};

use crate::bvlc::ErrorCode;
use crate::util::HostNPort;
use crate::websocket::{
    ConnHandle, ContextId, EventSink, Result, ServerHandle, TlsCredentials, WebSocketError,
    WebSocketEvent, WebSocketEventKind, WebSocketProtocol, WebSocketTransport,
};

enum WriterCommand {
    /// Ask the connection task to emit a `Sendable` event.
    NotifySendable,
    /// Queue one binary message.
    Frame(Vec<u8>),
    /// Close the connection.
    Close,
}

struct ConnEntry {
    tx: UnboundedSender<WriterCommand>,
    peer: Option<SocketAddr>,
    server: Option<ServerHandle>,
}

struct ServerEntry {
    shutdown: UnboundedSender<()>,
}

struct Shared {
    conns: Mutex<HashMap<u64, ConnEntry>>,
    servers: Mutex<HashMap<u64, ServerEntry>>,
    next_id: AtomicU64,
}

/// tokio-tungstenite + rustls implementation of [`WebSocketTransport`].
pub struct TungsteniteTransport {
    runtime: tokio::runtime::Runtime,
    shared: Arc<Shared>,
}

impl TungsteniteTransport {
    /// Create the backend with its own multi-threaded tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        Ok(TungsteniteTransport {
            runtime,
            shared: Arc::new(Shared {
                conns: Mutex::new(HashMap::new()),
                servers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn load_certs(pem: &[u8]) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut &pem[..]).collect();
    let certs = certs.map_err(|e| WebSocketError::Tls(format!("bad certificate chain: {}", e)))?;
    if certs.is_empty() {
        return Err(WebSocketError::Tls("certificate chain is empty".to_string()));
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| WebSocketError::Tls(format!("bad private key: {}", e)))?
        .ok_or_else(|| WebSocketError::Tls("no private key found".to_string()))
}

fn load_roots(pem: &[u8]) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(pem)? {
        roots
            .add(cert)
            .map_err(|e| WebSocketError::Tls(format!("bad issuer certificate: {}", e)))?;
    }
    Ok(roots)
}

fn client_tls_config(credentials: &TlsCredentials) -> Result<Arc<rustls::ClientConfig>> {
    let roots = load_roots(&credentials.ca_chain)?;
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(&credentials.cert_chain)?, load_key(&credentials.private_key)?)
        .map_err(|e| WebSocketError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

fn server_tls_config(credentials: &TlsCredentials) -> Result<Arc<rustls::ServerConfig>> {
    let roots = load_roots(&credentials.ca_chain)?;
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| WebSocketError::Tls(e.to_string()))?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&credentials.cert_chain)?, load_key(&credentials.private_key)?)
        .map_err(|e| WebSocketError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Resolve a bind address from an optional interface name.
fn bind_address(iface: Option<&str>, port: u16) -> SocketAddr {
    if let Some(name) = iface {
        if let Ok(addrs) = if_addrs::get_if_addrs() {
            for addr in addrs {
                if addr.name == name && !addr.is_loopback() {
                    return SocketAddr::new(addr.ip(), port);
                }
            }
        }
        warn!("interface {} not found, binding to all interfaces", name);
    }
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

fn emit(sink: &Arc<dyn EventSink>, ctx: ContextId, conn: Option<ConnHandle>, kind: WebSocketEventKind) {
    sink.dispatch(WebSocketEvent { ctx, conn, kind });
}

fn disconnect_reason(err: &tokio_tungstenite::tungstenite::Error) -> (ErrorCode, String) {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            (ErrorCode::WebsocketClosedByPeer, "closed by peer".to_string())
        }
        WsError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            (ErrorCode::TcpConnectionRefused, e.to_string())
        }
        WsError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            (ErrorCode::TcpConnectTimeout, e.to_string())
        }
        WsError::Io(e) => (ErrorCode::WebsocketError, e.to_string()),
        WsError::Tls(e) => (ErrorCode::TlsError, e.to_string()),
        WsError::Protocol(e) => (ErrorCode::WebsocketProtocolError, e.to_string()),
        other => (ErrorCode::WebsocketError, other.to_string()),
    }
}

/// Drive one established WebSocket until either side closes it.
async fn run_connection<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut rx: UnboundedReceiver<WriterCommand>,
    shared: Arc<Shared>,
    handle: ConnHandle,
    ctx: ContextId,
    sink: Arc<dyn EventSink>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = ws.split();
    let mut reason = (ErrorCode::WebsocketClosedByPeer, "closed by peer".to_string());

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(WriterCommand::NotifySendable) => {
                    emit(&sink, ctx, Some(handle), WebSocketEventKind::Sendable);
                }
                Some(WriterCommand::Frame(frame)) => {
                    if let Err(e) = writer.send(Message::binary(frame)).await {
                        reason = disconnect_reason(&e);
                        break;
                    }
                }
                Some(WriterCommand::Close) | None => {
                    let _ = writer.close().await;
                    reason = (ErrorCode::Success, "closed locally".to_string());
                    break;
                }
            },
            message = reader.next() => match message {
                Some(Ok(Message::Binary(payload))) => {
                    emit(
                        &sink,
                        ctx,
                        Some(handle),
                        WebSocketEventKind::Received { data: payload.to_vec() },
                    );
                }
                Some(Ok(Message::Close(_))) | None => {
                    break;
                }
                Some(Ok(_)) => {
                    // text/ping/pong frames are not part of BACnet/SC
                    debug!("ignoring non-binary websocket frame on conn {:?}", handle);
                }
                Some(Err(e)) => {
                    reason = disconnect_reason(&e);
                    break;
                }
            },
        }
    }

    shared.conns.lock().expect("conn table poisoned").remove(&handle.0);
    emit(
        &sink,
        ctx,
        Some(handle),
        WebSocketEventKind::Disconnected {
            reason: reason.0,
            description: reason.1,
        },
    );
}

impl WebSocketTransport for TungsteniteTransport {
    fn connect(
        &self,
        proto: WebSocketProtocol,
        url: &str,
        credentials: &TlsCredentials,
        connect_timeout: Duration,
        ctx: ContextId,
        sink: Arc<dyn EventSink>,
    ) -> Result<ConnHandle> {
        let mut request = url
            .into_client_request()
            .map_err(|e| WebSocketError::InvalidUrl(format!("{}: {}", url, e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(proto.as_str()),
        );

        let secure = url.starts_with("wss://");
        let connector = if secure {
            Some(Connector::Rustls(client_tls_config(credentials)?))
        } else {
            None
        };

        let handle = ConnHandle(self.next_id());
        let (tx, rx) = unbounded_channel();
        self.shared.conns.lock().expect("conn table poisoned").insert(
            handle.0,
            ConnEntry {
                tx,
                peer: None,
                server: None,
            },
        );

        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            let attempt = tokio::time::timeout(
                connect_timeout,
                connect_async_tls_with_config(request, None, false, connector),
            )
            .await;

            let ws = match attempt {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    let (reason, description) = disconnect_reason(&e);
                    shared.conns.lock().expect("conn table poisoned").remove(&handle.0);
                    emit(
                        &sink,
                        ctx,
                        Some(handle),
                        WebSocketEventKind::Disconnected { reason, description },
                    );
                    return;
                }
                Err(_) => {
                    shared.conns.lock().expect("conn table poisoned").remove(&handle.0);
                    emit(
                        &sink,
                        ctx,
                        Some(handle),
                        WebSocketEventKind::Disconnected {
                            reason: ErrorCode::TcpConnectTimeout,
                            description: "websocket connect timed out".to_string(),
                        },
                    );
                    return;
                }
            };

            emit(&sink, ctx, Some(handle), WebSocketEventKind::Connected);
            run_connection(ws, rx, shared, handle, ctx, sink).await;
        });

        Ok(handle)
    }

    fn disconnect(&self, conn: ConnHandle) {
        if let Some(entry) = self.shared.conns.lock().expect("conn table poisoned").get(&conn.0) {
            let _ = entry.tx.send(WriterCommand::Close);
        }
    }

    fn request_send(&self, conn: ConnHandle) {
        if let Some(entry) = self.shared.conns.lock().expect("conn table poisoned").get(&conn.0) {
            let _ = entry.tx.send(WriterCommand::NotifySendable);
        }
    }

    fn dispatch_send(&self, conn: ConnHandle, frame: &[u8]) -> Result<()> {
        let conns = self.shared.conns.lock().expect("conn table poisoned");
        let entry = conns.get(&conn.0).ok_or(WebSocketError::NotConnected)?;
        entry
            .tx
            .send(WriterCommand::Frame(frame.to_vec()))
            .map_err(|_| WebSocketError::NotConnected)
    }

    fn start_server(
        &self,
        proto: WebSocketProtocol,
        port: u16,
        iface: Option<&str>,
        credentials: &TlsCredentials,
        _connect_timeout: Duration,
        ctx: ContextId,
        sink: Arc<dyn EventSink>,
    ) -> Result<ServerHandle> {
        let tls_config = server_tls_config(credentials)?;
        let bind = bind_address(iface, port);
        let server = ServerHandle(self.next_id());
        let (shutdown_tx, mut shutdown_rx) = unbounded_channel();
        self.shared
            .servers
            .lock()
            .expect("server table poisoned")
            .insert(server.0, ServerEntry { shutdown: shutdown_tx });

        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            let listener = match TcpListener::bind(bind).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("websocket server bind {} failed: {}", bind, e);
                    shared.servers.lock().expect("server table poisoned").remove(&server.0);
                    emit(&sink, ctx, None, WebSocketEventKind::ServerStopped);
                    return;
                }
            };
            emit(&sink, ctx, None, WebSocketEventKind::ServerStarted);
            let acceptor = TlsAcceptor::from(tls_config);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                debug!("accept failed: {}", e);
                                continue;
                            }
                        };
                        spawn_accepted(
                            stream,
                            peer,
                            proto,
                            acceptor.clone(),
                            shared.clone(),
                            server,
                            ctx,
                            sink.clone(),
                        );
                    }
                }
            }

            // close every connection accepted by this server
            let to_close: Vec<_> = {
                let conns = shared.conns.lock().expect("conn table poisoned");
                conns
                    .iter()
                    .filter(|(_, entry)| entry.server == Some(server))
                    .map(|(id, entry)| (*id, entry.tx.clone()))
                    .collect()
            };
            for (_, tx) in &to_close {
                let _ = tx.send(WriterCommand::Close);
            }
            shared.servers.lock().expect("server table poisoned").remove(&server.0);
            emit(&sink, ctx, None, WebSocketEventKind::ServerStopped);
        });

        Ok(server)
    }

    fn stop_server(&self, server: ServerHandle) {
        if let Some(entry) = self
            .shared
            .servers
            .lock()
            .expect("server table poisoned")
            .get(&server.0)
        {
            let _ = entry.shutdown.send(());
        }
    }

    fn peer_address(&self, conn: ConnHandle) -> Option<HostNPort> {
        self.shared
            .conns
            .lock()
            .expect("conn table poisoned")
            .get(&conn.0)
            .and_then(|entry| entry.peer)
            .map(HostNPort::Ip)
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_accepted(
    stream: TcpStream,
    peer: SocketAddr,
    proto: WebSocketProtocol,
    acceptor: TlsAcceptor,
    shared: Arc<Shared>,
    server: ServerHandle,
    ctx: ContextId,
    sink: Arc<dyn EventSink>,
) {
    tokio::spawn(async move {
        let tls_stream = match acceptor.accept(stream).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("TLS accept from {} failed: {}", peer, e);
                return;
            }
        };

        let requested = proto.as_str();
        let callback = move |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                             mut response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            let offered = request
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if offered.split(',').any(|p| p.trim() == requested) {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(requested));
                Ok(response)
            } else {
                Err(tokio_tungstenite::tungstenite::handshake::server::ErrorResponse::new(Some(
                    "unsupported websocket subprotocol".to_string(),
                )))
            }
        };

        let ws = match accept_hdr_async(tls_stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("websocket handshake from {} failed: {}", peer, e);
                return;
            }
        };

        let handle = ConnHandle(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unbounded_channel();
        shared.conns.lock().expect("conn table poisoned").insert(
            handle.0,
            ConnEntry {
                tx,
                peer: Some(peer),
                server: Some(server),
            },
        );

        emit(&sink, ctx, Some(handle), WebSocketEventKind::Connected);
        run_connection(ws, rx, shared, handle, ctx, sink).await;
    });
}
