use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::fanout::FanOut;
use crate::latch::CloseLatch;

/// UDP read loop feeding one stream's fan-out.
///
/// A fresh buffer is allocated per datagram so consumers can hold the bytes
/// without racing the reader. Datagrams larger than the MTU are truncated by
/// the kernel; that is documented behavior, not mitigated here.
pub async fn run(
    socket: UdpSocket,
    mtu: usize,
    fanout: Arc<FanOut>,
    errors: mpsc::Sender<io::Error>,
    shutdown: Arc<CloseLatch<()>>,
) {
    let addr = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    tracing::debug!(%addr, "ingress listening");

    loop {
        let mut buf = vec![0u8; mtu];
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, _)) => {
                    buf.truncate(n);
                    fanout.broadcast(Bytes::from(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(%addr, "ingress read failed: {e}");
                    let _ = errors.try_send(e);
                    break;
                }
            },
            _ = shutdown.triggered() => break,
        }
    }

    tracing::debug!(%addr, "ingress stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn spawn_ingress(
        mtu: usize,
        capacity: usize,
    ) -> (std::net::SocketAddr, Arc<FanOut>, Arc<CloseLatch<()>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let fanout = Arc::new(FanOut::new(capacity));
        let shutdown = Arc::new(CloseLatch::new());
        let (errors, _error_rx) = mpsc::channel(1);
        tokio::spawn(run(
            socket,
            mtu,
            Arc::clone(&fanout),
            errors,
            Arc::clone(&shutdown),
        ));
        (addr, fanout, shutdown)
    }

    #[tokio::test]
    async fn datagrams_reach_subscribers_intact() {
        let (addr, fanout, shutdown) = spawn_ingress(1500, 16).await;
        let (_, mut rx) = fanout.subscribe();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"fake-rtp-packet", addr).await.unwrap();

        let datagram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        assert_eq!(datagram, "fake-rtp-packet");
        shutdown.trigger(());
    }

    #[tokio::test]
    async fn oversized_payload_truncates_to_mtu() {
        let (addr, fanout, shutdown) = spawn_ingress(600, 16).await;
        let (_, mut rx) = fanout.subscribe();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&vec![0xABu8; 1200], addr).await.unwrap();

        let datagram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        assert_eq!(datagram.len(), 600);
        shutdown.trigger(());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (addr, fanout, shutdown) = spawn_ingress(1500, 16).await;
        let (_, mut rx) = fanout.subscribe();
        shutdown.trigger(());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // datagrams sent after shutdown are not delivered
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"late", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
