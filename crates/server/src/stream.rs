use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use rtpcast_protocol::CodecConfig;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::fanout::FanOut;
use crate::ingress;
use crate::latch::CloseLatch;

/// One UDP ingress plus its fan-out and the track descriptor advertised to
/// peers. Streams are created at startup and live for the process lifetime.
pub struct Stream {
    key: String,
    local_addr: SocketAddr,
    track_id: String,
    stream_group: String,
    codec: CodecConfig,
    fanout: Arc<FanOut>,
    shutdown: Arc<CloseLatch<()>>,
}

impl Stream {
    /// Bind the ingress socket and start the read loop. Returns the stream
    /// and the channel on which a terminal ingress read error is surfaced;
    /// the stream does not reconnect, restart is an operator responsibility.
    pub async fn bind(
        addr: &str,
        mtu: usize,
        queue_capacity: usize,
        codec: CodecConfig,
    ) -> Result<(Self, mpsc::Receiver<io::Error>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind ingress socket {addr}"))?;
        let local_addr = socket
            .local_addr()
            .context("failed to read ingress socket address")?;

        let fanout = Arc::new(FanOut::new(queue_capacity));
        let shutdown = Arc::new(CloseLatch::new());
        let (error_tx, error_rx) = mpsc::channel(1);

        tokio::spawn(ingress::run(
            socket,
            mtu,
            Arc::clone(&fanout),
            error_tx,
            Arc::clone(&shutdown),
        ));

        tracing::info!(%addr, %local_addr, "stream ingress bound");
        Ok((
            Self {
                key: addr.to_string(),
                local_addr,
                track_id: "video".to_string(),
                stream_group: format!("stream_{addr}"),
                codec,
                fanout,
                shutdown,
            },
            error_rx,
        ))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The address the ingress socket actually bound, which differs from the
    /// key when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Track id advertised in the WebRTC offer for this stream.
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Stream-group id (msid) advertised alongside the track id.
    pub fn stream_group(&self) -> &str {
        &self.stream_group
    }

    pub fn codec(&self) -> &CodecConfig {
        &self.codec
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<Bytes>) {
        self.fanout.subscribe()
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.fanout.unsubscribe(id)
    }

    pub fn consumer_count(&self) -> usize {
        self.fanout.len()
    }

    /// Stop the ingress loop and close every consumer queue. Only called on
    /// process shutdown.
    pub fn close(&self) {
        self.shutdown.trigger(());
        self.fanout.close();
        tracing::info!(key = %self.key, "stream closed");
    }
}
