//! WebSocket signaling transport.
//!
//! One WebSocket per peer pair, opened by the caller and kept for the life
//! of the connection. Frames are queued to a writer task and read by a
//! reader task so negotiation code only deals with [`SignalFrame`]s.

use std::net::SocketAddr;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ConnectionError, ConnectionManager};
use crate::identity::PeerKey;
use crate::protocol::{ProtocolError, SignalFrame};

/// Time an inbound socket gets to upgrade and say Hello.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_QUEUE: usize = 32;
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// TCP listener for inbound signaling.
pub struct SignalingListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl SignalingListener {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Signaling listening on {local_addr}");
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A peer that opened signaling and introduced itself.
pub struct InboundRequest {
    pub(super) remote: SocketAddr,
    pub(super) version: u16,
    pub(super) instance_id: Uuid,
    pub(super) name: String,
    pub(super) listen_port: u16,
    channel: SignalingChannel,
}

impl InboundRequest {
    /// Key of the remote: its source IP and the port it listens on.
    pub fn peer_key(&self) -> PeerKey {
        SocketAddr::new(self.remote.ip(), self.listen_port)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) async fn refuse(self, reason: &str) {
        let _ = self.channel.send(SignalFrame::reject(reason)).await;
    }

    pub(super) fn into_channel(self) -> SignalingChannel {
        self.channel
    }
}

/// Framed signaling over one WebSocket.
pub(crate) struct SignalingChannel {
    outgoing: mpsc::Sender<SignalFrame>,
    incoming: mpsc::Receiver<SignalFrame>,
    reader: JoinHandle<()>,
}

impl SignalingChannel {
    pub(crate) fn spawn<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<SignalFrame>(FRAME_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<SignalFrame>(FRAME_QUEUE);

        // Writer: drains the queue, then closes the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping {} frame: {e}", frame.kind());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SignalFrame::decode(&data) {
                        Ok(frame) => {
                            log::debug!("Signaling frame in: {}", frame.kind());
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable signaling frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Self {
            outgoing: out_tx,
            incoming: in_rx,
            reader,
        }
    }

    pub(crate) async fn send(&self, frame: SignalFrame) -> Result<(), ProtocolError> {
        log::debug!("Signaling frame out: {}", frame.kind());
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Queue without waiting; used on teardown.
    pub(crate) fn try_send(&self, frame: SignalFrame) -> bool {
        self.outgoing.try_send(frame).is_ok()
    }

    /// Next frame, `None` once the socket is gone.
    pub(crate) async fn recv(&mut self) -> Option<SignalFrame> {
        self.incoming.recv().await
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Accept signaling sockets until cancelled.
pub(super) async fn accept_loop(signaling: SignalingListener, manager: ConnectionManager, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = signaling.listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                log::debug!("Signaling connection from {remote}");
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, remote, manager).await {
                        log::warn!("Inbound signaling from {remote} failed: {e}");
                    }
                });
            }
            Err(e) => {
                log::warn!("Signaling accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
    log::info!("Signaling listener on {} stopped", signaling.local_addr);
}

async fn handle_inbound(stream: TcpStream, remote: SocketAddr, manager: ConnectionManager) -> Result<(), ConnectionError> {
    let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| ConnectionError::Timeout)??;
    let mut channel = SignalingChannel::spawn(ws);

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.recv())
        .await
        .map_err(|_| ConnectionError::Timeout)?;
    match first {
        Some(SignalFrame::Hello {
            version,
            instance_id,
            name,
            listen_port,
        }) => {
            let request = InboundRequest {
                remote,
                version,
                instance_id,
                name,
                listen_port,
                channel,
            };
            manager.accept_inbound(request).await;
            Ok(())
        }
        Some(other) => Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
        None => Err(ProtocolError::ConnectionClosed.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PROTOCOL_VERSION, REJECT_VERSION};

    async fn pair() -> (SignalingChannel, SignalingChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        let server = server.await.unwrap();
        (SignalingChannel::spawn(client), SignalingChannel::spawn(server))
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (a, mut b) = pair().await;
        a.send(SignalFrame::Offer { sdp: "one".into() }).await.unwrap();
        a.send(SignalFrame::Hangup).await.unwrap();
        a.send(SignalFrame::Bye).await.unwrap();

        assert_eq!(b.recv().await, Some(SignalFrame::Offer { sdp: "one".into() }));
        assert_eq!(b.recv().await, Some(SignalFrame::Hangup));
        assert_eq!(b.recv().await, Some(SignalFrame::Bye));
    }

    #[tokio::test]
    async fn test_queued_frames_flush_before_close() {
        let (a, mut b) = pair().await;
        assert!(a.try_send(SignalFrame::Bye));
        drop(a);

        assert_eq!(b.recv().await, Some(SignalFrame::Bye));
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_listener_reports_bound_port() {
        let listener = SignalingListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_refused() {
        let identity = crate::identity::LocalIdentity::new("Local", std::net::Ipv4Addr::LOCALHOST, 1);
        let (manager, _events) = ConnectionManager::new(identity, Default::default());
        let listener = SignalingListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        manager.serve(listener);

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        let mut channel = SignalingChannel::spawn(ws);
        channel
            .send(SignalFrame::Hello {
                version: PROTOCOL_VERSION + 1,
                instance_id: Uuid::new_v4(),
                name: "Future".into(),
                listen_port: 9999,
            })
            .await
            .unwrap();

        assert_eq!(channel.recv().await, Some(SignalFrame::reject(REJECT_VERSION)));
        assert!(manager.peers().await.is_empty());
        manager.shutdown().await;
    }
}
