use crate::client::{ClientCommand, ClientInfo, ClientSession};
use crate::compression::negotiate;
use crate::config::{ServerConfig, WebSocketConfig, DEFAULT_IO_WORKERS};
use crate::error::Error;
use crate::frame::OpCode;
use crate::handshake::{
    build_accept_response, build_reject_response, generate_websocket_accept_value,
    read_upgrade_request, write_response,
};
use crate::protocol::ProtocolRegistry;
use crate::registry::{ClientEntry, ClientId, Registry};
use crate::stream::ServerStream;
use crate::worker::{Worker, WorkerCommand};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// A running WebSocket server: the accept loop, the worker pool and the
/// client registry behind one handle.
pub struct WsServer {
    registry: Arc<Registry>,
    workers: Vec<Worker>,
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

/// Spawn a server on the given port with the default configuration and
/// the built-in `echo` sub-protocol.
pub async fn start_server(port: u16) -> Result<WsServer, Error> {
    start_server_with_config(port, None, ProtocolRegistry::default()).await
}

/// Spawn a server with explicit configuration and sub-protocol handlers.
///
/// The listener accepts plain TCP, or TLS when `tls_config` is set. Every
/// accepted connection runs the upgrade handshake on its own task; on
/// success the client is registered, assigned to the least-loaded worker
/// and handed over through an AddClient command.
pub async fn start_server_with_config(
    port: u16,
    config: Option<ServerConfig>,
    protocols: ProtocolRegistry,
) -> Result<WsServer, Error> {
    let config = config.unwrap_or_default();
    let ws_config = config.web_socket_config.clone().unwrap_or_default();
    let tls_acceptor = config.tls_config.clone().map(TlsAcceptor::from);

    let worker_count = if config.io_workers == 0 {
        DEFAULT_IO_WORKERS
    } else {
        config.io_workers
    };

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    let local_addr = listener.local_addr()?;

    let registry = Arc::new(Registry::new(worker_count));
    let workers: Vec<Worker> = (0..worker_count)
        .map(|index| Worker::spawn(index, registry.clone()))
        .collect();
    let worker_commands: Vec<_> = workers
        .iter()
        .map(|worker| worker.commands.clone())
        .collect();
    registry.set_broadcasters(worker_commands.clone());

    info!(
        "websocket server listening on {} ({} workers, compression {})",
        local_addr,
        worker_count,
        if ws_config.permessage_deflate {
            "enabled"
        } else {
            "disabled"
        }
    );

    let accept_registry = registry.clone();
    let accept_handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let tls_acceptor = tls_acceptor.clone();
                    let protocols = protocols.clone();
                    let ws_config = ws_config.clone();
                    let registry = accept_registry.clone();
                    let worker_commands = worker_commands.clone();

                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(
                            stream,
                            peer,
                            tls_acceptor,
                            protocols,
                            ws_config,
                            registry,
                            worker_commands,
                        )
                        .await
                        {
                            debug!("connection from {peer} not upgraded: {err}");
                        }
                    });
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                }
            }
        }
    });

    Ok(WsServer {
        registry,
        workers,
        local_addr,
        accept_handle,
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    protocols: ProtocolRegistry,
    ws_config: WebSocketConfig,
    registry: Arc<Registry>,
    worker_commands: Vec<mpsc::UnboundedSender<WorkerCommand>>,
) -> Result<(), Error> {
    let mut stream = match tls_acceptor {
        Some(acceptor) => ServerStream::Secure(Box::new(acceptor.accept(stream).await?)),
        None => ServerStream::Plain(stream),
    };

    let request = read_upgrade_request(&mut stream).await?;

    // sub-protocol: the Sec-WebSocket-Protocol header wins, the first URL
    // path segment is the fallback; with neither the upgrade fails
    let Some((protocol, from_header)) =
        protocols.select(&request.protocols, request.path_protocol())
    else {
        let _ = write_response(&mut stream, build_reject_response()).await;
        return Err(Error::UnknownProtocol(
            request
                .path_protocol()
                .unwrap_or("<none>")
                .to_owned(),
        ));
    };

    let compression = if ws_config.permessage_deflate {
        request
            .extensions
            .as_ref()
            .and_then(|offer| negotiate(offer, ws_config.compression_level))
    } else {
        None
    };
    let (compression, extensions_reply) = match compression {
        Some((config, reply)) => (Some(config), Some(reply)),
        None => (None, None),
    };

    let max_outbound_frame_size = request
        .max_outbound_frame_size()
        .min(ws_config.max_outbound_frame_size.max(1024));

    let accept_key = generate_websocket_accept_value(&request.key);
    let response = build_accept_response(
        &accept_key,
        from_header.then_some(protocol.as_str()),
        extensions_reply.as_deref(),
    );
    write_response(&mut stream, &response).await?;

    // handshake complete, the connection is open from here on
    let id = registry.next_client_id();
    let info = ClientInfo {
        id,
        remote_ip: peer.ip().to_string(),
        remote_port: peer.port().to_string(),
        protocol: protocol.clone(),
        authorization: request.authorization.clone(),
        connected_at: SystemTime::now(),
    };

    let factory = protocols
        .resolve(&protocol)
        .ok_or_else(|| Error::UnknownProtocol(protocol.clone()))?;
    let handler = factory(&info);

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let session = ClientSession::new(
        info,
        stream,
        compression.clone(),
        max_outbound_frame_size,
        handler,
        control_rx,
        registry.clone(),
    );

    let worker = registry.assign_worker();
    if !registry.register(
        id,
        ClientEntry {
            worker,
            control: control_tx,
            pending: Some(Box::new(session)),
        },
    ) {
        registry.release_worker_slot(worker);
        return Err(Error::CommunicationError);
    }

    if worker_commands[worker]
        .send(WorkerCommand::AddClient(id))
        .is_err()
    {
        registry.unregister(id);
        return Err(Error::CommunicationError);
    }

    info!(
        "client {id} connected from {}:{} (protocol {protocol}, worker {worker}, compression {}, max frame {} bytes)",
        peer.ip(),
        peer.port(),
        if compression.is_some() { "enabled" } else { "disabled" },
        max_outbound_frame_size
    );

    Ok(())
}

impl WsServer {
    /// The address the listener is bound to; useful when the server was
    /// started on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_clients(&self) -> usize {
        self.registry.active_clients()
    }

    /// Send a message to one client. Returns false when the client is
    /// gone.
    pub fn send_message(&self, id: ClientId, payload: Vec<u8>, opcode: OpCode) -> bool {
        let Some(control) = self.registry.control(id) else {
            return false;
        };
        control
            .send(ClientCommand::Send {
                opcode,
                payload,
                use_compression: true,
            })
            .is_ok()
    }

    pub fn send_text(&self, id: ClientId, text: &str) -> bool {
        self.send_message(id, text.as_bytes().to_vec(), OpCode::Text)
    }

    /// Deliver a message to every open client on every worker.
    pub fn broadcast(&self, payload: Vec<u8>, opcode: OpCode) {
        self.registry.broadcast(payload, opcode);
    }

    /// Start the closing handshake towards one client.
    pub fn close_client(&self, id: ClientId, code: u16, reason: &str) -> bool {
        let Some(control) = self.registry.control(id) else {
            return false;
        };
        control
            .send(ClientCommand::Close {
                code,
                reason: reason.to_owned(),
            })
            .is_ok()
    }

    /// Drop one client, with the usual close frame when possible.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let Some(worker) = self.registry.worker_of(id) else {
            return false;
        };
        self.workers[worker]
            .commands
            .send(WorkerCommand::RemoveClient(id))
            .is_ok()
    }

    /// Stop accepting, close every client with 1001 under the shutdown
    /// budgets, and wait for the workers to drain.
    pub async fn shutdown(self) {
        info!("shutting down websocket server on {}", self.local_addr);
        self.accept_handle.abort();

        for worker in &self.workers {
            let _ = worker.commands.send(WorkerCommand::Exit);
        }
        for worker in self.workers {
            if timeout(crate::config::SHUTDOWN_TOTAL_BUDGET, worker.handle)
                .await
                .is_err()
            {
                warn!("worker {} did not exit in time", worker.index);
            }
        }
    }
}
