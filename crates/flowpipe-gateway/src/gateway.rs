//! The connection-multiplexing gateway.
//!
//! Task layout per running gateway:
//! - accept loop (sole inserter into the table); raw streams are admitted in
//!   accept order, TLS and WebSocket handshakes run in a `JoinSet`
//! - one reader and one writer task per connection
//! - retirement task (sole remover), emitting `CloseNotification`
//! - shared output writer, sole owner of the output pipe
//! - downstream dispatch, driven from [`Gateway::serve`] itself

use std::sync::Arc;
use std::time::Duration;

use flowpipe_frame::{is_port_close, FbpCodec, Frame, FrameError};
use flowpipe_transport::Listener;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::lifecycle::{
    close_notification, conn_id_of, open_notification, packet, ConnId, CLOSE_CONNECTION,
    CLOSE_NOTIFICATION, OPEN_NOTIFICATION,
};
use crate::session::{Protocol, SessionReader, SessionWriter};
use crate::table::{ConnectionRecord, ConnectionTable, Outbound};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bridges a listener's connections to one framed input and one framed output.
pub struct Gateway {
    config: GatewayConfig,
    protocol: Arc<Protocol>,
    table: Arc<ConnectionTable>,
}

impl Gateway {
    /// Build a gateway, loading TLS material if the endpoint needs it.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let protocol = Protocol::for_endpoint(&config.endpoint, config.tls.as_ref())?;
        Ok(Self::with_protocol(config, protocol))
    }

    pub fn with_protocol(config: GatewayConfig, protocol: Protocol) -> Self {
        Self {
            config,
            protocol: Arc::new(protocol),
            table: Arc::new(ConnectionTable::new()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Body type of upstream payload frames (`TCPPacket`, `WSPacket`, ...).
    pub fn packet_body_type(&self) -> &'static str {
        self.protocol.body_type()
    }

    /// The live connection table.
    pub fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    /// Run until the input ends (EOF or `PortClose`) or a fatal error.
    pub async fn serve<R, W>(&self, listener: Listener, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_framed(listener, FramedRead::new(input, FbpCodec::new()), output)
            .await
    }

    /// Like [`serve`](Self::serve), for callers that already consumed
    /// frames from the input (an IIP, for instance).
    pub async fn serve_framed<S, W>(&self, listener: Listener, input: S, output: W) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Frame, FrameError>> + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.run(listener, input, output, self.config.drop_late_frames)
            .await
    }

    /// Serve with an explicit late-frame policy. In-process consumers that
    /// cannot observe retirement (the HTTP transcoder) always drop.
    pub(crate) async fn run<S, W>(
        &self,
        listener: Listener,
        input: S,
        output: W,
        drop_late_frames: bool,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Frame, FrameError>> + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(self.config.output_queue.max(1));
        let (retire_tx, retire_rx) = mpsc::unbounded_channel();

        let mut writer = tokio::spawn(write_output(output, out_rx));
        let mut retirement = tokio::spawn(retire_connections(
            Arc::clone(&self.table),
            retire_rx,
            out_tx.clone(),
        ));
        let acceptor = AcceptLoop {
            listener,
            protocol: Arc::clone(&self.protocol),
            table: Arc::clone(&self.table),
            out_tx,
            retire_tx,
            read_buffer: self.config.read_buffer,
            handshake_timeout: self.config.handshake_timeout,
            connection_queue: self.config.connection_queue.max(1),
        };
        let mut accept = tokio::spawn(acceptor.run());

        info!(
            endpoint = %self.config.endpoint,
            protocol = ?self.protocol,
            "gateway running"
        );

        let result = tokio::select! {
            res = dispatch_downstream(input, &self.table, drop_late_frames) => res,
            res = &mut writer => res.map_err(GatewayError::from).and_then(|r| r),
            res = &mut accept => res.map_err(GatewayError::from).and_then(|r| r),
            res = &mut retirement => res.map_err(GatewayError::from).and_then(|r| r),
        };

        accept.abort();
        retirement.abort();
        writer.abort();
        result
    }
}

/// Write queued frames to the shared output, flushing once the queue drains.
async fn write_output<W>(output: W, mut rx: mpsc::Receiver<Frame>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(output, FbpCodec::new());
    while let Some(frame) = rx.recv().await {
        sink.feed(frame).await?;
        if rx.is_empty() {
            sink.flush().await?;
        }
    }
    sink.flush().await?;
    Ok(())
}

async fn retire_connections(
    table: Arc<ConnectionTable>,
    mut rx: mpsc::UnboundedReceiver<ConnId>,
    out_tx: mpsc::Sender<Frame>,
) -> Result<()> {
    while let Some(id) = rx.recv().await {
        if let Some(record) = table.retire(id) {
            info!(conn_id = %id, remote = %record.remote_address(), "connection closed");
            out_tx
                .send(close_notification(id))
                .await
                .map_err(|_| GatewayError::OutputClosed)?;
        }
    }
    Ok(())
}

async fn dispatch_downstream<S>(
    mut input: S,
    table: &ConnectionTable,
    drop_late_frames: bool,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Frame, FrameError>> + Unpin,
{
    while let Some(frame) = input.next().await {
        let frame = frame?;
        if frame.is_control() {
            if is_port_close(&frame) {
                info!(port = ?frame.port, "input port closed");
                return Ok(());
            }
            debug!(body_type = %frame.body_type, "ignoring control frame");
            continue;
        }

        let id = conn_id_of(&frame)?;
        let Some(handle) = table.handle(id) else {
            if frame.body_type == CLOSE_NOTIFICATION {
                debug!(conn_id = %id, "discarding echoed close notification");
                continue;
            }
            if drop_late_frames && table.was_issued(id) {
                warn!(conn_id = %id, body_type = %frame.body_type, "dropping frame for retired connection");
                continue;
            }
            return Err(GatewayError::Protocol(format!(
                "{} frame for unknown conn-id {id}",
                frame.body_type
            )));
        };

        match frame.body_type.as_str() {
            CLOSE_CONNECTION => {
                debug!(conn_id = %id, "close requested");
                table.mark_closing(id);
                handle.close().await;
            }
            OPEN_NOTIFICATION | CLOSE_NOTIFICATION => {
                debug!(conn_id = %id, body_type = %frame.body_type, "ignoring echoed notification");
            }
            _ => {
                if !handle.send(frame.body).await {
                    debug!(conn_id = %id, "connection writer gone; frame dropped");
                }
            }
        }
    }
    info!("input ended");
    Ok(())
}

struct AcceptLoop {
    listener: Listener,
    protocol: Arc<Protocol>,
    table: Arc<ConnectionTable>,
    out_tx: mpsc::Sender<Frame>,
    retire_tx: mpsc::UnboundedSender<ConnId>,
    read_buffer: usize,
    handshake_timeout: Duration,
    connection_queue: usize,
}

type Handshake = (
    String,
    std::result::Result<Result<(SessionReader, SessionWriter)>, tokio::time::error::Elapsed>,
);

impl AcceptLoop {
    async fn run(self) -> Result<()> {
        let mut handshakes: JoinSet<Handshake> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) if !self.protocol.has_handshake() => {
                        debug!(%remote, "accepted");
                        let (reader, writer) =
                            self.protocol.establish(stream, &remote, self.read_buffer).await?;
                        self.admit(remote, reader, writer).await?;
                    }
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted; handshaking");
                        let protocol = Arc::clone(&self.protocol);
                        let timeout = self.handshake_timeout;
                        let read_buffer = self.read_buffer;
                        handshakes.spawn(async move {
                            let outcome = tokio::time::timeout(
                                timeout,
                                protocol.establish(stream, &remote, read_buffer),
                            )
                            .await;
                            (remote, outcome)
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = handshakes.join_next() => match joined {
                    Ok((remote, Ok(Ok((reader, writer))))) => self.admit(remote, reader, writer).await?,
                    Ok((remote, Ok(Err(err)))) => {
                        warn!(%remote, error = %err, "handshake failed");
                    }
                    Ok((remote, Err(_))) => {
                        warn!(%remote, timeout = ?self.handshake_timeout, "handshake timed out");
                    }
                    Err(err) => warn!(error = %err, "handshake task failed"),
                },
            }
        }
    }

    async fn admit(
        &self,
        remote: String,
        reader: SessionReader,
        writer: SessionWriter,
    ) -> Result<()> {
        let id = self.table.allocate_id();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.connection_queue);
        let cancel = CancellationToken::new();
        self.table.insert(
            id,
            ConnectionRecord::new(remote.clone(), outbound_tx, cancel.clone()),
        );
        info!(conn_id = %id, %remote, "connection opened");

        self.out_tx
            .send(open_notification(id, &remote))
            .await
            .map_err(|_| GatewayError::OutputClosed)?;

        tokio::spawn(write_connection(id, writer, outbound_rx, cancel.clone()));
        tokio::spawn(read_connection(
            id,
            reader,
            self.protocol.body_type(),
            self.out_tx.clone(),
            Arc::clone(&self.table),
            self.retire_tx.clone(),
            cancel,
        ));
        Ok(())
    }
}

async fn read_connection(
    id: ConnId,
    mut reader: SessionReader,
    body_type: &'static str,
    out_tx: mpsc::Sender<Frame>,
    table: Arc<ConnectionTable>,
    retire_tx: mpsc::UnboundedSender<ConnId>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn_id = %id, "reader cancelled");
                break;
            }
            message = reader.next_message() => message,
        };
        match message {
            Ok(Some(body)) => {
                if out_tx.send(packet(body_type, id, body)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(conn_id = %id, "peer closed");
                break;
            }
            Err(err) => {
                warn!(conn_id = %id, error = %err, "read failed");
                break;
            }
        }
    }
    table.mark_closing(id);
    cancel.cancel();
    let _ = retire_tx.send(id);
}

async fn write_connection(
    id: ConnId,
    mut writer: SessionWriter,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => command,
        };
        match command {
            Some(Outbound::Data(body)) => {
                if let Err(err) = writer.send(body).await {
                    warn!(conn_id = %id, error = %err, "write failed");
                    break;
                }
            }
            Some(Outbound::Close) => {
                debug!(conn_id = %id, "closing");
                break;
            }
            None => break,
        }
    }
    if let Err(err) = writer.close().await {
        debug!(conn_id = %id, error = %err, "close failed");
    }
    cancel.cancel();
}
