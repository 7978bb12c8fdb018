use crate::compression::CompressionConfig;
use crate::config::{
    CLOSING_STATE_TIMEOUT, HOUSEKEEPING_INTERVAL, IDLE_PING_TIMEOUT, INACTIVITY_TIMEOUT,
    MAX_DECOMPRESSED_SIZE, SHUTDOWN_CLIENT_BUDGET,
};
use crate::decoder::Decoder;
use crate::error::Error;
use crate::frame::{parse_close_payload, CloseCode, Frame, OpCode};
use crate::message::{AssemblyStep, MessageAssembler};
use crate::protocol::{ClientContext, ProtocolHandler};
use crate::read::FrameReader;
use crate::registry::{ClientId, Registry};
use crate::stream::ServerStream;
use crate::write::FrameWriter;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, timeout, Instant};

/// Connection lifecycle. `ClosingServer` and `ClosingClient` distinguish
/// which side initiated the closing handshake, because the rules for what
/// may still be processed differ between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshake,
    Open,
    ClosingServer,
    ClosingClient,
    Closed,
}

/// Commands delivered to a client's owning task. Anything that wants to
/// touch a client from outside goes through this channel; the task is the
/// sole mutator of the session.
#[derive(Debug)]
pub(crate) enum ClientCommand {
    Send {
        opcode: OpCode,
        payload: Vec<u8>,
        use_compression: bool,
    },
    Close {
        code: u16,
        reason: String,
    },
    /// Server is going away: close with 1001 and drop after a bounded
    /// flush.
    Shutdown,
    /// Drop the client now, sending the usual close frame if one was not
    /// sent yet.
    Remove,
}

/// Identity of a connected client, fixed at handshake time.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub remote_ip: String,
    pub remote_port: String,
    /// Negotiated sub-protocol name.
    pub protocol: String,
    /// Raw `Authorization` header from the upgrade request, opaque to the
    /// core.
    pub authorization: Option<String>,
    pub connected_at: SystemTime,
}

/// One WebSocket connection, owned and driven by exactly one task.
///
/// The loop interleaves three event sources: the control channel, the
/// housekeeping timer and the socket. Outbound frames are staged by the
/// writer and flushed at the top of every iteration, so a close frame
/// produced while handling an event always reaches the wire before the
/// connection is torn down.
pub(crate) struct ClientSession {
    info: ClientInfo,
    state: ConnectionState,
    sock_r: ReadHalf<ServerStream>,
    sock_w: WriteHalf<ServerStream>,
    reader: FrameReader,
    writer: FrameWriter,
    assembler: MessageAssembler,
    inflater: Option<Decoder>,
    handler: Box<dyn ProtocolHandler>,
    control: UnboundedReceiver<ClientCommand>,
    registry: Arc<Registry>,
    last_activity: Instant,
    closing_since: Instant,
    /// Stop reading, flush the outbound buffer and remove the client once
    /// it drained.
    flush_and_remove: bool,
    socket_error: bool,
}

async fn read_some(
    sock: &mut ReadHalf<ServerStream>,
    reader: &mut FrameReader,
) -> Result<usize, Error> {
    let want = reader.read_hint();
    let space = reader.space(want)?;
    let n = sock.read(space).await?;
    reader.commit(n);
    Ok(n)
}

async fn flush(sock: &mut WriteHalf<ServerStream>, writer: &mut FrameWriter) -> Result<(), Error> {
    sock.write_all(writer.staged()).await?;
    writer.clear_staged();
    sock.flush().await?;
    Ok(())
}

impl ClientSession {
    pub fn new(
        info: ClientInfo,
        stream: ServerStream,
        compression: Option<CompressionConfig>,
        max_outbound_frame_size: usize,
        handler: Box<dyn ProtocolHandler>,
        control: UnboundedReceiver<ClientCommand>,
        registry: Arc<Registry>,
    ) -> Self {
        let (sock_r, sock_w) = tokio::io::split(stream);
        let reader = FrameReader::new(compression.is_some());
        let writer = FrameWriter::new(compression.as_ref(), max_outbound_frame_size);
        let inflater = compression.as_ref().map(|config| {
            Decoder::new(
                config.client_max_window_bits,
                config.client_context_takeover,
                MAX_DECOMPRESSED_SIZE,
            )
        });

        Self {
            info,
            // the upgrade response was already written by the accept path
            state: ConnectionState::Open,
            sock_r,
            sock_w,
            reader,
            writer,
            assembler: MessageAssembler::new(),
            inflater,
            handler,
            control,
            registry,
            last_activity: Instant::now(),
            closing_since: Instant::now(),
            flush_and_remove: false,
            socket_error: false,
        }
    }

    pub async fn run(mut self) {
        debug!(
            "client {}: session started on {}:{} (protocol {})",
            self.info.id, self.info.remote_ip, self.info.remote_port, self.info.protocol
        );

        {
            let mut ctx = ClientContext::new(&mut self.writer, &self.info, &self.registry);
            self.handler.on_connect(&mut ctx);
        }
        self.apply_requested_close();

        let mut housekeeping = interval_at(
            Instant::now() + HOUSEKEEPING_INTERVAL,
            HOUSEKEEPING_INTERVAL,
        );

        enum Event {
            Command(Option<ClientCommand>),
            Housekeeping,
            Inbound(Result<usize, Error>),
        }

        loop {
            if self.writer.has_staged() {
                if let Err(err) = flush(&mut self.sock_w, &mut self.writer).await {
                    debug!("client {}: write failed: {err}", self.info.id);
                    self.socket_error = true;
                    self.state = ConnectionState::Closed;
                }
            }

            if self.flush_and_remove || self.state == ConnectionState::Closed {
                break;
            }

            let event = tokio::select! {
                biased;
                cmd = self.control.recv() => Event::Command(cmd),
                _ = housekeeping.tick() => Event::Housekeeping,
                res = read_some(&mut self.sock_r, &mut self.reader) => Event::Inbound(res),
            };

            match event {
                Event::Command(None) => self.state = ConnectionState::Closed,
                Event::Command(Some(command)) => self.handle_command(command),
                Event::Housekeeping => self.check_timeouts(),
                Event::Inbound(Ok(0)) => {
                    // half-close from the peer, no close frame owed
                    debug!("client {}: connection closed by peer", self.info.id);
                    self.socket_error = true;
                    self.state = ConnectionState::Closed;
                }
                Event::Inbound(Ok(_)) => {
                    self.last_activity = Instant::now();
                    self.process_inbound();
                }
                Event::Inbound(Err(Error::IOError { source })) => {
                    debug!("client {}: read failed: {source}", self.info.id);
                    self.socket_error = true;
                    self.state = ConnectionState::Closed;
                }
                Event::Inbound(Err(err)) => self.protocol_exception(err),
            }
        }

        self.teardown().await;
    }

    fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Send {
                opcode,
                payload,
                use_compression,
            } => {
                if self.state != ConnectionState::Open {
                    return;
                }
                if let Err(err) = self.writer.send_payload(&payload, opcode, use_compression) {
                    warn!("client {}: send failed: {err}", self.info.id);
                }
            }
            ClientCommand::Close { code, reason } => {
                if self.state == ConnectionState::Open {
                    self.initiate_close(code, &reason);
                    self.state = ConnectionState::ClosingServer;
                    self.closing_since = Instant::now();
                }
            }
            ClientCommand::Shutdown => {
                if self.state == ConnectionState::Open {
                    self.initiate_close(CloseCode::GoingAway.as_u16(), "Server shutting down");
                }
                self.flush_and_remove = true;
            }
            ClientCommand::Remove => self.state = ConnectionState::Closed,
        }
    }

    /// Drain every complete frame currently buffered.
    fn process_inbound(&mut self) {
        loop {
            if self.state == ConnectionState::Closed || self.flush_and_remove {
                return;
            }
            match self.reader.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(err) = self.handle_frame(frame) {
                        self.protocol_exception(err);
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    self.protocol_exception(err);
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Error> {
        match frame.opcode {
            OpCode::Ping => self.handle_ping(&frame.payload),
            OpCode::Pong => {
                // only an open connection cares about liveness updates
                if self.state == ConnectionState::Open {
                    self.last_activity = Instant::now();
                }
                Ok(())
            }
            OpCode::Close => self.handle_close_frame(&frame.payload),
            _ => self.handle_data_frame(frame),
        }
    }

    fn handle_ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        match self.state {
            // we still answer pings while waiting for the peer to confirm
            // a close we initiated
            ConnectionState::Open | ConnectionState::ClosingServer => {
                self.writer.send_pong(payload)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_close_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        match self.state {
            ConnectionState::Open => {
                let (code, reason) = parse_close_payload(payload)?;
                debug!(
                    "client {}: received CLOSE {code} \"{reason}\", replying",
                    self.info.id
                );
                self.initiate_close(code, &reason);
                self.state = ConnectionState::ClosingClient;
                self.closing_since = Instant::now();
                self.flush_and_remove = true;
            }
            ConnectionState::ClosingServer => {
                debug!(
                    "client {}: closing handshake complete (server initiated)",
                    self.info.id
                );
                self.state = ConnectionState::Closed;
            }
            ConnectionState::ClosingClient => {
                // a second close from the peer is tolerated
                debug!("client {}: duplicate CLOSE frame", self.info.id);
                self.state = ConnectionState::Closed;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_data_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.state != ConnectionState::Open {
            // once the closing handshake started, data frames are dropped
            return Ok(());
        }

        match self.assembler.accept(&frame)? {
            AssemblyStep::Incomplete => Ok(()),
            AssemblyStep::Ready => self.deliver_message(),
        }
    }

    fn deliver_message(&mut self) -> Result<(), Error> {
        let opcode = self.assembler.opcode();
        let compressed = self.assembler.is_compressed();
        let raw = self.assembler.take_payload();

        let data = if compressed {
            let inflater = self
                .inflater
                .as_mut()
                .ok_or(Error::CompressionNotNegotiated)?;
            inflater.decompress(&raw)?
        } else {
            raw
        };

        if opcode == OpCode::Text && std::str::from_utf8(&data).is_err() {
            return Err(Error::InvalidUtf8);
        }

        debug!(
            "client {}: message {} complete ({} bytes in {} frames, opcode {:?})",
            self.info.id,
            self.assembler.message_id(),
            data.len(),
            self.assembler.frame_id(),
            opcode
        );

        {
            let mut ctx = ClientContext::new(&mut self.writer, &self.info, &self.registry);
            self.handler.on_message(&mut ctx, &data, opcode);
        }
        self.assembler.finish_message();
        self.apply_requested_close();
        Ok(())
    }

    /// Stage a CLOSE frame, giving the protocol handler its pre-close
    /// callback first. Does nothing if a close frame already went out.
    fn initiate_close(&mut self, code: u16, reason: &str) {
        if self.writer.close_sent() {
            return;
        }
        {
            let mut ctx = ClientContext::new(&mut self.writer, &self.info, &self.registry);
            self.handler.on_close(&mut ctx, code, reason);
        }
        // a close requested from inside on_close is subsumed by this one
        let _ = self.writer.take_requested_close();
        if let Err(err) = self.writer.send_close(code, reason) {
            debug!("client {}: failed to stage close frame: {err}", self.info.id);
        }
    }

    /// Apply a close a protocol callback asked for.
    fn apply_requested_close(&mut self) {
        if let Some((code, reason)) = self.writer.take_requested_close() {
            if self.state == ConnectionState::Open {
                self.initiate_close(code, &reason);
                self.state = ConnectionState::ClosingServer;
                self.closing_since = Instant::now();
            }
        }
    }

    /// Map a receive-path error to the closing behaviour of the protocol:
    /// send a close frame with the matching code, transition state, and
    /// for severe violations drop the connection as soon as the close
    /// frame is flushed.
    fn protocol_exception(&mut self, err: Error) {
        let code = err.close_code();
        warn!(
            "client {}: protocol exception: {err} (closing with {})",
            self.info.id,
            code.as_u16()
        );

        self.initiate_close(code.as_u16(), &err.to_string());

        match self.state {
            ConnectionState::Open => {
                self.state = ConnectionState::ClosingServer;
                self.closing_since = Instant::now();
            }
            ConnectionState::ClosingServer | ConnectionState::ClosingClient => {}
            _ => self.state = ConnectionState::Closed,
        }

        if matches!(
            code,
            CloseCode::ProtocolError | CloseCode::InvalidPayload | CloseCode::PolicyViolation
        ) {
            self.flush_and_remove = true;
        }
    }

    fn check_timeouts(&mut self) {
        match self.state {
            ConnectionState::Open => {
                let idle = self.last_activity.elapsed();
                if idle > INACTIVITY_TIMEOUT {
                    warn!(
                        "client {}: timed out after {}s of inactivity",
                        self.info.id,
                        idle.as_secs()
                    );
                    self.initiate_close(CloseCode::GoingAway.as_u16(), "Timeout - no activity");
                    self.state = ConnectionState::ClosingServer;
                    self.closing_since = Instant::now();
                } else if idle > IDLE_PING_TIMEOUT {
                    debug!("client {}: idle, sending keepalive ping", self.info.id);
                    if let Err(err) = self.writer.send_ping(&[]) {
                        debug!("client {}: failed to stage ping: {err}", self.info.id);
                    }
                }
            }
            ConnectionState::ClosingServer | ConnectionState::ClosingClient => {
                if self.closing_since.elapsed() > CLOSING_STATE_TIMEOUT {
                    warn!(
                        "client {}: forcing close, stuck in {:?} state",
                        self.info.id, self.state
                    );
                    self.state = ConnectionState::Closed;
                }
            }
            _ => {}
        }
    }

    async fn teardown(mut self) {
        {
            let mut ctx = ClientContext::new(&mut self.writer, &self.info, &self.registry);
            self.handler.on_disconnect(&mut ctx);
        }

        if !self.socket_error {
            // the graceful path still owes the peer a close frame
            self.initiate_close(CloseCode::Normal.as_u16(), "Connection closed by server");
            if self.writer.has_staged() {
                let _ = timeout(
                    SHUTDOWN_CLIENT_BUDGET,
                    flush(&mut self.sock_w, &mut self.writer),
                )
                .await;
            }
            let _ = timeout(SHUTDOWN_CLIENT_BUDGET, self.sock_w.shutdown()).await;
        }

        self.registry.unregister(self.info.id);
        info!(
            "client {} disconnected ({}:{})",
            self.info.id, self.info.remote_ip, self.info.remote_port
        );
    }
}
