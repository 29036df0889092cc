//! Background receive loop.
//!
//! Owns the read half of the connection and its accumulation buffer. Each
//! chunk read is appended to the buffer, complete frames are decoded and
//! routed, and the trailing partial frame is kept for the next read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ipc::framing::{self, DELIMITER, MAX_FRAME_SIZE};
use crate::ipc::router::Router;

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Peer closed the stream (zero-length read).
    Closed,
    /// `disconnect()` asked the loop to stop.
    Stopped,
    /// Read failed or the peer sent an oversized frame.
    Failed,
}

pub(crate) struct ReceiveLoop<R> {
    reader: R,
    router: Arc<Router>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    chunk_size: usize,
}

impl<R> ReceiveLoop<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub(crate) fn new(
        reader: R,
        router: Arc<Router>,
        running: Arc<AtomicBool>,
        cancel: CancellationToken,
        chunk_size: usize,
    ) -> Self {
        Self {
            reader,
            router,
            running,
            cancel,
            chunk_size: chunk_size.max(1),
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<LoopExit> {
        tokio::spawn(self.run())
    }

    pub(crate) async fn run(mut self) -> LoopExit {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut buffer: Vec<u8> = Vec::new();

        let exit = loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break LoopExit::Stopped,
                read = self.reader.read(&mut chunk) => read,
            };

            match read {
                Ok(0) => {
                    info!("Connection closed by worker");
                    break LoopExit::Closed;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    // The leftover never holds a delimiter, so only new bytes can finish a frame
                    if chunk[..n].contains(&DELIMITER) {
                        self.drain_frames(&mut buffer);
                    }

                    if buffer.len() > MAX_FRAME_SIZE {
                        error!(
                            "Partial frame of {} bytes exceeds maximum {} bytes",
                            buffer.len(),
                            MAX_FRAME_SIZE
                        );
                        break LoopExit::Failed;
                    }
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("Receive error: {}", e);
                    }
                    break LoopExit::Failed;
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        let abandoned = self.router.pending().clear();
        if abandoned > 0 {
            warn!(abandoned, "Connection lost with requests still awaiting replies");
        }
        debug!(?exit, "Receive loop exited");
        exit
    }

    /// Decode and route every complete frame, keeping the remainder.
    fn drain_frames(&self, buffer: &mut Vec<u8>) {
        let (frames, rest) = framing::decode(buffer);
        let consumed = buffer.len() - rest.len();

        for frame in frames {
            match frame {
                Ok(message) => self.router.dispatch(message),
                Err(e) => warn!("Failed to parse message: {}", e),
            }
        }

        buffer.drain(..consumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pending::{Completion, PendingRequests};
    use crate::ipc::router::Topic;
    use crate::models::{CorrelationId, Message, MessageKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        peer: DuplexStream,
        router: Arc<Router>,
        running: Arc<AtomicBool>,
        cancel: CancellationToken,
        handle: JoinHandle<LoopExit>,
    }

    fn start(chunk_size: usize) -> Harness {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let router = Arc::new(Router::new(Arc::new(PendingRequests::new())));
        let running = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let handle = ReceiveLoop::new(
            local,
            Arc::clone(&router),
            Arc::clone(&running),
            cancel.clone(),
            chunk_size,
        )
        .spawn();
        Harness {
            peer,
            router,
            running,
            cancel,
            handle,
        }
    }

    fn event(n: i64) -> Message {
        Message::new(
            MessageKind::Event,
            "deauth",
            "progress",
            json!({"packets": n}),
            CorrelationId::from(format!("e{}", n)),
        )
    }

    #[tokio::test]
    async fn test_frames_split_across_small_reads() {
        // 7-byte reads force every frame to span several iterations
        let mut h = start(7);
        let mut events = h.router.subscribe_channel(Topic::Event);

        let mut bytes = framing::encode(&event(1)).unwrap();
        bytes.extend(framing::encode(&event(2)).unwrap());
        h.peer.write_all(&bytes).await.unwrap();

        for n in 1..=2 {
            let msg = timeout(TEST_TIMEOUT, events.recv())
                .await
                .expect("Test timed out")
                .expect("Channel closed");
            assert_eq!(msg, event(n));
        }

        drop(h.peer);
        let exit = timeout(TEST_TIMEOUT, h.handle).await.expect("Test timed out").unwrap();
        assert_eq!(exit, LoopExit::Closed);
        assert!(!h.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_corrupt_frame_does_not_stop_loop() {
        let mut h = start(4096);
        let mut events = h.router.subscribe_channel(Topic::Event);

        let mut bytes = b"{not json}\n".to_vec();
        bytes.extend(framing::encode(&event(3)).unwrap());
        h.peer.write_all(&bytes).await.unwrap();

        let msg = timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("Test timed out")
            .expect("Channel closed");
        assert_eq!(msg, event(3));
        assert!(h.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_response_resolves_pending_entry() {
        let mut h = start(4096);
        let id = CorrelationId::from("t1");
        let mut waiter = h.router.pending().register(id.clone()).unwrap();

        let reply = Message::response("mitm", "get_status", json!({"is_poisoning": true}), id);
        h.peer.write_all(&framing::encode(&reply).unwrap()).await.unwrap();

        match timeout(TEST_TIMEOUT, waiter.recv()).await.expect("Test timed out") {
            Some(Completion::Reply(msg)) => assert_eq!(msg, reply),
            other => panic!("Expected reply, got {:?}", other),
        }
        assert!(h.router.pending().is_empty());
    }

    #[tokio::test]
    async fn test_large_frame_across_many_reads() {
        let mut h = start(4096);
        let mut events = h.router.subscribe_channel(Topic::Event);

        let big = Message::new(
            MessageKind::Event,
            "server",
            "log",
            json!({"text": "y".repeat(512 * 1024)}),
            CorrelationId::from("big"),
        );
        let bytes = framing::encode(&big).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() - 1);

        h.peer.write_all(head).await.unwrap();
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());

        h.peer.write_all(tail).await.unwrap();
        let msg = timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("Test timed out")
            .expect("Channel closed");
        assert_eq!(msg, big);
    }

    #[tokio::test]
    async fn test_peer_close_releases_waiters() {
        let h = start(4096);
        let mut waiter = h
            .router
            .pending()
            .register(CorrelationId::from("t1"))
            .unwrap();

        drop(h.peer);
        let exit = timeout(TEST_TIMEOUT, h.handle).await.expect("Test timed out").unwrap();
        assert_eq!(exit, LoopExit::Closed);
        assert!(waiter.recv().await.is_none());
        assert!(h.router.pending().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_and_clears_flag() {
        let h = start(4096);

        h.cancel.cancel();
        let exit = timeout(TEST_TIMEOUT, h.handle).await.expect("Test timed out").unwrap();
        assert_eq!(exit, LoopExit::Stopped);
        assert!(!h.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_oversized_partial_frame_fails_loop() {
        let Harness {
            mut peer,
            running,
            handle,
            ..
        } = start(64 * 1024);
        let junk = vec![b'x'; 64 * 1024];

        let writer = tokio::spawn(async move {
            // The loop bails before draining everything; ignore the broken pipe
            for _ in 0..=(MAX_FRAME_SIZE / junk.len()) {
                if peer.write_all(&junk).await.is_err() {
                    break;
                }
            }
        });

        let exit = timeout(Duration::from_secs(30), handle)
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(exit, LoopExit::Failed);
        assert!(!running.load(Ordering::SeqCst));
        writer.abort();
    }
}
