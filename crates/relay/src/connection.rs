//! Per-socket connection state machine.
//!
//! A [`Connection`] is driven by one task that reads frames from the socket,
//! a writer task that drains the outbound queue into the socket, and a
//! publisher task that sends this connection's broker publishes in order.
//! Fan-out deliveries go through the bounded outbound queue; the final close
//! frame has its own slot so a full queue cannot drop it.

use crate::multiplexer::ConnectionHandle;
use crate::protocol::{pong_payload, BrokerEvent, ControlToken};
use crate::server::AppState;
use crate::session::Session;
use axum::extract::ws::{close_code, CloseFrame, Message};
use broker_client::Broker;
use bytes::Bytes;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest close reason a WebSocket close frame can carry, in bytes.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// How long the close path waits for the writer to flush the final frame.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Process-wide sequence for `pong <n>` replies.
#[derive(Debug, Default)]
pub struct PingCounter(AtomicU64);

impl PingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number; the first is 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Build a close reason from an error classification and message, cut to fit
/// a close frame.
pub fn compose_close_reason(kind: &str, message: &str) -> String {
    let mut reason = format!("{}: {}", kind, message);
    if reason.len() > MAX_CLOSE_REASON_BYTES {
        let mut end = MAX_CLOSE_REASON_BYTES;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// A broker publish queued by a connection.
struct Publish {
    payload: String,
    what: &'static str,
}

/// Receiving ends handed to the background tasks when the connection runs.
struct TaskInputs {
    outbound_rx: mpsc::Receiver<Message>,
    close_rx: oneshot::Receiver<CloseFrame>,
    publish_rx: mpsc::UnboundedReceiver<Publish>,
}

/// One client's bridge between its socket and its channel.
pub struct Connection {
    handle: ConnectionHandle,
    session: Option<Session>,
    state: ConnectionState,
    app: Arc<AppState>,
    close_tx: Option<oneshot::Sender<CloseFrame>>,
    publish_tx: mpsc::UnboundedSender<Publish>,
    inputs: Option<TaskInputs>,
}

impl Connection {
    /// Create a connection for `channel`; nothing is registered until
    /// [`Connection::run`].
    pub fn new(channel: String, session: Option<Session>, app: Arc<AppState>) -> Self {
        let (handle, outbound_rx) = ConnectionHandle::new(channel, app.client_buffer_size);
        let (close_tx, close_rx) = oneshot::channel();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            session,
            state: ConnectionState::Connecting,
            app,
            close_tx: Some(close_tx),
            publish_tx,
            inputs: Some(TaskInputs {
                outbound_rx,
                close_rx,
                publish_rx,
            }),
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serve the socket until it closes.
    ///
    /// `sink` and `stream` are the two halves of the upgraded socket.
    pub async fn run<Si, St, E>(mut self, sink: Si, mut stream: St)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let inputs = match self.inputs.take() {
            Some(inputs) => inputs,
            None => return,
        };
        let mut writer = tokio::spawn(write_outbound(sink, inputs.outbound_rx, inputs.close_rx));
        tokio::spawn(publish_in_order(
            self.app.broker.clone(),
            self.handle.channel.clone(),
            inputs.publish_rx,
        ));
        let mut writer_done = false;

        self.open().await;

        while self.state == ConnectionState::Open {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(msg)) => self.handle_frame(msg),
                    Some(Err(e)) => self.fail("transport error", &e.to_string()),
                    None => {
                        debug!("Connection {} stream ended", self.handle.id);
                        self.state = ConnectionState::Closing;
                    }
                },

                result = &mut writer => {
                    writer_done = true;
                    match result {
                        Ok(Err(e)) => self.fail("send error", &e),
                        Ok(Ok(())) => self.state = ConnectionState::Closing,
                        Err(e) => {
                            error!("Connection {} writer task failed: {}", self.handle.id, e);
                            self.fail("writer task", &e.to_string());
                        }
                    }
                }
            }
        }

        self.finish(writer, writer_done).await;
    }

    /// `Connecting → Open`: register, then announce learners on the roster.
    async fn open(&mut self) {
        self.app.registry.register(&self.handle).await;
        self.state = ConnectionState::Open;

        counter!("relay_connections_total").increment(1);
        gauge!("relay_active_connections").set(self.app.registry.connection_count() as f64);
        info!(
            "Connection {} opened on '{}' ({})",
            self.handle.id,
            self.handle.channel,
            match &self.session {
                Some(session) => session.ref_id.as_deref().unwrap_or("no ref id"),
                None => "anonymous",
            }
        );

        let ref_id = self
            .session
            .as_ref()
            .and_then(|s| s.roster_ref_id())
            .map(str::to_string);
        if let Some(ref_id) = ref_id {
            match serde_json::to_string(&BrokerEvent::joined(ref_id)) {
                Ok(json) => self.publish(json, "roster event"),
                Err(e) => warn!("Failed to serialize roster event: {}", e),
            }
        }
    }

    fn handle_frame(&mut self, msg: Message) {
        match msg {
            Message::Text(text) => match ControlToken::parse(text.as_str()) {
                Some(ControlToken::Ping) => {
                    let sequence = self.app.pings.next();
                    counter!("relay_pings_total").increment(1);
                    debug!("Connection {} ping #{}", self.handle.id, sequence);
                    self.publish(pong_payload(sequence), "pong");
                }
                Some(ControlToken::Close) => {
                    debug!("Connection {} asked to close", self.handle.id);
                    self.close(close_code::NORMAL, String::new());
                }
                None => {
                    debug!(
                        "Connection {} sent {} bytes of unrelayed text",
                        self.handle.id,
                        text.len()
                    );
                }
            },
            Message::Binary(data) => {
                debug!(
                    "Connection {} sent {} bytes of unrelayed binary",
                    self.handle.id,
                    data.len()
                );
            }
            // Answered by the WebSocket layer.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                debug!("Connection {} received close frame: {:?}", self.handle.id, frame);
                self.state = ConnectionState::Closing;
            }
        }
    }

    /// Socket error: log, close with 1002 and the composed reason.
    fn fail(&mut self, kind: &str, message: &str) {
        let reason = compose_close_reason(kind, message);
        warn!(
            "Connection {} on '{}' failed: {}",
            self.handle.id, self.handle.channel, reason
        );
        self.close(close_code::PROTOCOL, reason);
    }

    fn close(&mut self, code: u16, reason: String) {
        self.state = ConnectionState::Closing;
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let sent = match self.close_tx.take() {
            Some(close_tx) => close_tx.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            debug!("Connection {} close frame not delivered, writer gone", self.handle.id);
        }
    }

    /// Queue a broker publish; the publisher task sends them in order.
    fn publish(&self, payload: String, what: &'static str) {
        if self.publish_tx.send(Publish { payload, what }).is_err() {
            warn!("Connection {} publisher gone, dropping {}", self.handle.id, what);
        }
    }

    /// `Closing → Closed`: unregister and release the socket.
    async fn finish(mut self, writer: JoinHandle<Result<(), String>>, writer_done: bool) {
        self.app.registry.unregister(&self.handle).await;
        self.state = ConnectionState::Closed;

        // Dropping our senders lets the writer and the publisher drain and
        // stop; queued publishes are not awaited.
        let Connection { handle, app, .. } = self;
        let id = handle.id;
        let channel = handle.channel.clone();
        let connected_at = handle.connected_at;
        drop(handle);

        if !writer_done {
            let abort = writer.abort_handle();
            if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
                debug!("Connection {} writer did not finish, aborting", id);
                abort.abort();
            }
        }

        counter!("relay_disconnections_total").increment(1);
        gauge!("relay_active_connections").set(app.registry.connection_count() as f64);
        info!(
            "Connection {} closed on '{}' after {}ms",
            id,
            channel,
            Utc::now().timestamp_millis() - connected_at
        );
    }
}

/// Drain the outbound queue into the socket.
///
/// A close frame takes precedence over queued deliveries and ends the writer.
/// Also stops when every sender is gone or on a send error.
async fn write_outbound<Si>(
    mut sink: Si,
    mut rx: mpsc::Receiver<Message>,
    mut close_rx: oneshot::Receiver<CloseFrame>,
) -> Result<(), String>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut close_pending = true;
    loop {
        tokio::select! {
            biased;

            frame = &mut close_rx, if close_pending => {
                close_pending = false;
                if let Ok(frame) = frame {
                    sink.send(Message::Close(Some(frame)))
                        .await
                        .map_err(|e| e.to_string())?;
                    return Ok(());
                }
            }

            msg = rx.recv() => match msg {
                Some(msg) => sink.send(msg).await.map_err(|e| e.to_string())?,
                None => break,
            }
        }
    }

    let _ = sink.close().await;
    Ok(())
}

/// Send a connection's publishes to the broker one at a time, in queue order.
async fn publish_in_order(
    broker: Arc<dyn Broker>,
    channel: String,
    mut rx: mpsc::UnboundedReceiver<Publish>,
) {
    while let Some(Publish { payload, what }) = rx.recv().await {
        if let Err(e) = broker.publish(&channel, Bytes::from(payload)).await {
            warn!("Failed to publish {} to '{}': {}", what, channel, e);
            counter!("relay_broker_errors_total").increment(1);
        }
    }
}
