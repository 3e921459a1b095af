//! Client side of a framed, heartbeating connection.
//!
//! A [`ClientEndpoint`] owns three loop-side tasks: a writer draining the
//! outbound frame queue, a reader decoding `ServerEvent`s, and the heartbeat
//! ticker. The reader's handler is installed through a one-shot channel; no
//! frame is consumed until the handler lands, so nothing needs buffering.
//!
//! Death is a one-way transition guarded by an atomic swap: whichever path
//! loses the transport first flips the flag and synthesizes exactly one
//! `Disconnected` event. Every later signal is a no-op, and sends after
//! death are dropped without touching the queue.

use crate::error::{NetError, Result};
use crate::NetConfig;
use protocol::{wire, ClientRequest, ServerEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Sender half the session installs into the endpoint's reader task.
pub type EventHandler = mpsc::UnboundedSender<ServerEvent>;
/// One-shot slot for installing the handler.
pub type HandlerSlot = oneshot::Sender<EventHandler>;

struct EndpointShared {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    dead: AtomicBool,
    heartbeat: Duration,
    max_frame_bytes: usize,
}

pub struct ClientEndpoint {
    shared: Arc<EndpointShared>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl ClientEndpoint {
    /// Open a transport and wrap it. Must execute on the event loop.
    pub async fn connect(
        host: &str,
        port: u16,
        config: &NetConfig,
    ) -> std::io::Result<(Self, HandlerSlot)> {
        let stream = TcpStream::connect((host, port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(Self::from_stream(stream, config))
    }

    /// Wrap an established stream. Spawns the reader, writer and heartbeat
    /// tasks on the current runtime, so this must execute on the event loop.
    pub fn from_stream(stream: TcpStream, config: &NetConfig) -> (Self, HandlerSlot) {
        let (read_half, write_half) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (handler_tx, handler_rx) = oneshot::channel();

        let shared = Arc::new(EndpointShared {
            frames: frames_tx,
            dead: AtomicBool::new(false),
            heartbeat: config.heartbeat,
            max_frame_bytes: config.max_frame_bytes,
        });

        let writer = tokio::spawn(write_loop(write_half, frames_rx));
        let reader = tokio::spawn(read_loop(read_half, handler_rx, shared.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone()));

        (
            Self {
                shared,
                reader,
                writer,
                heartbeat,
            },
            handler_tx,
        )
    }

    /// Queue one request for transmission. Callable from any thread; each
    /// caller's frames go out in its call order.
    pub fn send(&self, request: &ClientRequest) -> Result<()> {
        if self.shared.dead.load(Ordering::Acquire) {
            return Err(NetError::Disconnected);
        }
        let frame = wire::encode_frame(request, self.shared.max_frame_bytes)?;
        self.shared
            .frames
            .send(frame)
            .map_err(|_| NetError::Disconnected)
    }

    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    /// Close locally. The caller asked, so no `Disconnected` is synthesized;
    /// pending outbound frames are dropped.
    pub fn close(&self) {
        self.shared.dead.swap(true, Ordering::AcqRel);
        self.reader.abort();
        self.writer.abort();
        self.heartbeat.abort();
    }
}

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    handler_rx: oneshot::Receiver<EventHandler>,
    shared: Arc<EndpointShared>,
) {
    // No frame is consumed until the session installs its handler; inbound
    // bytes queue in the socket buffer meanwhile.
    let handler = match handler_rx.await {
        Ok(handler) => handler,
        Err(_) => return,
    };

    loop {
        match wire::read_frame::<_, ServerEvent>(&mut read_half, shared.max_frame_bytes).await {
            Ok(Some(event)) => {
                if handler.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "transport error on client connection");
                break;
            }
        }
    }

    // Exactly once: only the first path to flip the flag delivers the signal.
    if !shared.dead.swap(true, Ordering::AcqRel) {
        let _ = handler.send(ServerEvent::Disconnected);
    }
}

async fn heartbeat_loop(shared: Arc<EndpointShared>) {
    loop {
        tokio::time::sleep(shared.heartbeat).await;
        if shared.dead.load(Ordering::Acquire) {
            break;
        }
        let frame = match wire::encode_frame(&ClientRequest::Heartbeat, shared.max_frame_bytes) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        if shared.frames.send(frame).is_err() {
            break;
        }
        trace!("heartbeat sent");
    }
}

/// Drain pre-encoded frames onto the transport. Shared with the server side.
pub(crate) async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = wire::write_frame(&mut write_half, &frame).await {
            debug!(error = %e, "write failed, remaining outbound frames dropped");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair(config: &NetConfig) -> (ClientEndpoint, HandlerSlot, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let (endpoint, slot) = ClientEndpoint::connect("127.0.0.1", addr.port(), config)
            .await
            .unwrap();
        let server_side = accept.await.unwrap();
        (endpoint, slot, server_side)
    }

    #[tokio::test]
    async fn disconnected_is_synthesized_exactly_once() {
        let config = NetConfig {
            heartbeat: Duration::from_secs(60),
            ..Default::default()
        };
        let (endpoint, slot, server_side) = connected_pair(&config).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.send(tx).unwrap();

        drop(server_side);

        let first = rx.recv().await.unwrap();
        assert_eq!(first, ServerEvent::Disconnected);

        // A later local close must not produce a second signal.
        endpoint.close();
        assert!(rx.recv().await.is_none());
        assert!(endpoint.is_dead());
    }

    #[tokio::test]
    async fn heartbeats_flow_on_the_configured_interval() {
        let config = NetConfig {
            heartbeat: Duration::from_millis(20),
            ..Default::default()
        };
        let (_endpoint, slot, mut server_side) = connected_pair(&config).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        slot.send(tx).unwrap();

        let mut beats = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while beats < 3 {
            let request = tokio::time::timeout_at(
                deadline,
                wire::read_frame::<_, ClientRequest>(&mut server_side, config.max_frame_bytes),
            )
            .await
            .expect("no heartbeat before deadline")
            .unwrap()
            .unwrap();
            assert_eq!(request, ClientRequest::Heartbeat);
            beats += 1;
        }
    }

    #[tokio::test]
    async fn sends_after_close_are_rejected_without_touching_the_queue() {
        let config = NetConfig::default();
        let (endpoint, slot, mut server_side) = connected_pair(&config).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        slot.send(tx).unwrap();

        endpoint.close();
        let err = endpoint
            .send(&ClientRequest::Subscribe {
                space: "services".into(),
            })
            .unwrap_err();
        assert!(matches!(err, NetError::Disconnected));

        // The transport sees the close, not a late frame.
        let mut buf = [0u8; 16];
        let n = server_side.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
