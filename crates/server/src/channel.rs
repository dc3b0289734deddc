use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::future::join_all;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rtpcast_protocol::{ChannelConfig, SignalFrame, close_code};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::latch::CloseLatch;

/// Why a signal channel closed, and which side started it.
#[derive(Debug, Clone)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
    pub remote: bool,
}

impl CloseReason {
    pub fn local(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            remote: false,
        }
    }

    pub fn remote(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            remote: true,
        }
    }
}

/// Returned by [`SignalChannel::send`] once the channel is closing: no new
/// outbound frames are accepted after the first close trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl std::fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("signal channel closed")
    }
}

impl std::error::Error for ChannelClosed {}

enum WriteCmd {
    Frame(SignalFrame),
    Ping,
}

/// Duplex framed JSON transport over one WebSocket, with ping/pong liveness
/// and a cooperative close handshake.
///
/// Four tasks cooperate: a reader owning the stream half, a writer owning the
/// sink half (signal frames, pings and the close frame all leave through it,
/// so exactly one task ever writes to the connection), a pinger feeding the
/// writer, and a closer that bounds teardown with the disconnect timeout.
/// Close triggers race into a one-shot latch; the first wins and the rest are
/// absorbed.
pub struct SignalChannel {
    outbound: mpsc::Sender<WriteCmd>,
    latch: Arc<CloseLatch<CloseReason>>,
    done: Arc<CloseLatch<()>>,
}

impl SignalChannel {
    /// Take ownership of an upgraded WebSocket and start the channel tasks.
    /// Returns the channel handle and the inbound signal queue; the queue
    /// ends (recv -> None) when the channel closes for any reason.
    pub fn spawn(socket: WebSocket, config: &ChannelConfig) -> (Arc<Self>, mpsc::Receiver<SignalFrame>) {
        let (sink, source) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer);
        let latch = Arc::new(CloseLatch::new());
        let pending_pings = Arc::new(AtomicUsize::new(0));

        let reader = tokio::spawn(read_loop(
            source,
            inbound_tx,
            Arc::clone(&pending_pings),
            Arc::clone(&latch),
        ));
        let writer = tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&latch)));
        // The pinger holds the queue weakly: when the owner drops the channel
        // handle, the writer still observes the clean end-of-queue.
        let pinger = tokio::spawn(ping_loop(
            outbound_tx.downgrade(),
            pending_pings,
            Arc::clone(&latch),
            config.ping_interval(),
            config.max_pending_pings,
        ));
        let done = Arc::new(CloseLatch::new());
        tokio::spawn(close_loop(
            Arc::clone(&latch),
            vec![reader, writer, pinger],
            config.disconnect_timeout(),
            Arc::clone(&done),
        ));

        (
            Arc::new(Self {
                outbound: outbound_tx,
                latch,
                done,
            }),
            inbound_rx,
        )
    }

    /// Enqueue a signal frame for the writer. Fails once a close has been
    /// triggered or the writer is gone.
    pub async fn send(&self, frame: SignalFrame) -> Result<(), ChannelClosed> {
        if self.latch.is_triggered() {
            return Err(ChannelClosed);
        }
        self.outbound
            .send(WriteCmd::Frame(frame))
            .await
            .map_err(|_| ChannelClosed)
    }

    /// Initiate a close with an explicit code and reason. Idempotent: later
    /// calls (and racing internal triggers) are absorbed.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.latch.trigger(CloseReason::local(code, reason));
    }

    pub fn is_closed(&self) -> bool {
        self.latch.is_triggered()
    }

    /// The close reason, once a close has been triggered.
    pub fn reason(&self) -> Option<CloseReason> {
        self.latch.reason().cloned()
    }

    /// Wait for the channel to close and learn why.
    pub async fn closed(&self) -> CloseReason {
        self.latch.triggered().await.clone()
    }

    /// Wait for the close handshake to finish (bounded internally by the
    /// disconnect timeout).
    pub async fn done(&self) {
        self.done.triggered().await;
    }

    #[cfg(test)]
    fn stub() -> (Self, mpsc::Receiver<WriteCmd>) {
        let (outbound, rx) = mpsc::channel(4);
        (
            Self {
                outbound,
                latch: Arc::new(CloseLatch::new()),
                done: Arc::new(CloseLatch::new()),
            },
            rx,
        )
    }
}

/// Reader: decodes inbound text frames into signals, observes pongs and the
/// remote close frame. Once the latch fires it keeps reading only to drain
/// control frames so the close handshake can complete.
async fn read_loop(
    mut source: SplitStream<WebSocket>,
    inbound: mpsc::Sender<SignalFrame>,
    pending_pings: Arc<AtomicUsize>,
    latch: Arc<CloseLatch<CloseReason>>,
) {
    tracing::debug!("channel reader started");
    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => match SignalFrame::decode(&text) {
                    Ok(frame) => {
                        tracing::trace!(name = %frame.name, "signal received");
                        if latch.is_triggered() {
                            continue;
                        }
                        if inbound.send(frame).await.is_err() {
                            // owner dropped the inbound queue
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("dropping connection on malformed frame: {e}");
                        latch.trigger(CloseReason::local(
                            close_code::POLICY_VIOLATION,
                            "malformed signal frame",
                        ));
                        break;
                    }
                },
                Some(Ok(Message::Pong(_))) => {
                    // any pong clears all outstanding pings
                    pending_pings.store(0, Ordering::Release);
                    tracing::trace!("pong received");
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.to_string()))
                        .unwrap_or((close_code::NORMAL_CLOSURE, String::new()));
                    tracing::debug!(code, %reason, "remote close frame");
                    latch.trigger(CloseReason::remote(code, reason));
                    break;
                }
                // pings are answered by the WebSocket layer; binary is not
                // part of the signaling protocol
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("channel read failed: {e}");
                    latch.trigger(CloseReason::local(
                        close_code::INTERNAL_ERROR,
                        "read error",
                    ));
                    break;
                }
                None => {
                    latch.trigger(CloseReason::remote(
                        close_code::NORMAL_CLOSURE,
                        "connection ended",
                    ));
                    break;
                }
            },
            _ = latch.triggered() => {
                while let Some(result) = source.next().await {
                    match result {
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                break;
            }
        }
    }
    tracing::debug!("channel reader stopped");
}

/// Writer: the only task that writes to the connection. After the latch
/// fires it drains frames already queued, writes the single close frame with
/// the winning reason, and exits.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<WriteCmd>,
    latch: Arc<CloseLatch<CloseReason>>,
) {
    tracing::debug!("channel writer started");
    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(WriteCmd::Frame(frame)) => {
                    let json = match frame.encode() {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!("failed to encode outbound signal: {e}");
                            continue;
                        }
                    };
                    tracing::trace!(name = %frame.name, "signal sent");
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        tracing::warn!("channel write failed: {e}");
                        latch.trigger(CloseReason::local(
                            close_code::INTERNAL_ERROR,
                            "write error",
                        ));
                        break;
                    }
                }
                Some(WriteCmd::Ping) => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        tracing::warn!("channel ping failed: {e}");
                        latch.trigger(CloseReason::local(
                            close_code::INTERNAL_ERROR,
                            "ping write error",
                        ));
                        break;
                    }
                }
                None => {
                    // owner dropped the channel handle: clean EOF
                    latch.trigger(CloseReason::local(
                        close_code::NORMAL_CLOSURE,
                        "no more signals",
                    ));
                    break;
                }
            },
            _ = latch.triggered() => break,
        }
    }

    // Drain frames enqueued before the close won the race.
    while let Ok(cmd) = outbound.try_recv() {
        if let WriteCmd::Frame(frame) = cmd
            && let Ok(json) = frame.encode()
            && sink.send(Message::Text(json.into())).await.is_err()
        {
            tracing::debug!("drain write failed, skipping close frame");
            return;
        }
    }

    let close_frame = match latch.reason() {
        Some(reason) if !reason.remote => CloseFrame {
            code: reason.code,
            reason: reason.reason.clone().into(),
        },
        // remote initiated: acknowledge with a normal closure
        _ => CloseFrame {
            code: close_code::NORMAL_CLOSURE,
            reason: "remote closed the connection".into(),
        },
    };
    if let Err(e) = sink.send(Message::Close(Some(close_frame))).await {
        tracing::debug!("failed to send close frame: {e}");
    }
    tracing::debug!("channel writer stopped");
}

/// Pinger: one ping per interval through the writer. A pong clears the whole
/// in-flight count; silence for more than `max_pending` intervals closes the
/// channel as a policy violation.
async fn ping_loop(
    outbound: mpsc::WeakSender<WriteCmd>,
    pending_pings: Arc<AtomicUsize>,
    latch: Arc<CloseLatch<CloseReason>>,
    interval: Duration,
    max_pending: usize,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let in_flight = pending_pings.fetch_add(1, Ordering::AcqRel) + 1;
                if in_flight > max_pending {
                    tracing::warn!(in_flight, max_pending, "too many pending pings");
                    latch.trigger(CloseReason::local(
                        close_code::POLICY_VIOLATION,
                        "too many pending pings",
                    ));
                    break;
                }
                let Some(outbound) = outbound.upgrade() else { break };
                if outbound.try_send(WriteCmd::Ping).is_err() {
                    // writer congested or gone; the unanswered counter stands
                    tracing::trace!("ping skipped, outbound queue unavailable");
                }
            }
            _ = latch.triggered() => break,
        }
    }
    tracing::debug!("channel pinger stopped");
}

/// Closer: waits for the close latch, then bounds the quiescence of the
/// other tasks. Whatever is still running after the disconnect timeout is
/// aborted, which drops the socket halves and force-closes the connection.
async fn close_loop(
    latch: Arc<CloseLatch<CloseReason>>,
    tasks: Vec<JoinHandle<()>>,
    disconnect_timeout: Duration,
    done: Arc<CloseLatch<()>>,
) {
    let reason = latch.triggered().await;
    tracing::debug!(code = reason.code, reason = %reason.reason, remote = reason.remote, "channel closing");

    let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
    if tokio::time::timeout(disconnect_timeout, join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("close handshake timed out, forcing connection shutdown");
        for abort in aborts {
            abort.abort();
        }
    }
    done.trigger(());
    tracing::debug!("channel closed");
}
