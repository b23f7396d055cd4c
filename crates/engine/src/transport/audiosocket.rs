//! AudioSocket transport
//!
//! The PBX dials a TCP connection into our listener for each call. The
//! first frame must be an ID frame whose 16-byte payload is the UUID we
//! put in the originate; that binds the connection to the waiting
//! session. After binding, a reader task decodes inbound frames onto the
//! session's event channel and a writer task encodes outbound PCM16
//! frames back onto the socket.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use arivox_media_core::audiosocket::{encode_audio, AsFrame, FrameDecoder};
use arivox_media_core::frame::pcm16_from_le_bytes;

use crate::config::AudioTransportKind;
use crate::error::{EngineError, Result};

use super::{TransportEvent, TransportHandle, OUT_CHANNEL_FRAMES};

/// How long a fresh connection may take to identify itself
const ID_DEADLINE: Duration = Duration::from_secs(5);

/// Shared AudioSocket listener
pub struct AudioSocketServer {
    pending: Arc<DashMap<Uuid, oneshot::Sender<TransportHandle>>>,
}

impl AudioSocketServer {
    /// Bind the listener and start accepting
    pub async fn bind(listen_addr: &str) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| EngineError::Transport(format!("audiosocket bind {listen_addr}: {e}")))?;
        info!(addr = %listen_addr, "AudioSocket listener bound");

        let server = Arc::new(Self {
            pending: Arc::new(DashMap::new()),
        });
        let accept_server = server.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "audiosocket connection accepted");
                        let server = accept_server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handshake(stream).await {
                                warn!(%peer, "audiosocket handshake failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("audiosocket accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(server)
    }

    /// Register interest in a connection that will identify as `id`
    pub fn expect(&self, id: Uuid) -> oneshot::Receiver<TransportHandle> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        rx
    }

    /// Drop interest (call abandoned before the PBX connected)
    pub fn abandon(&self, id: &Uuid) {
        self.pending.remove(id);
    }

    /// Read the ID frame and hand the connection to its session
    async fn handshake(&self, mut stream: TcpStream) -> Result<()> {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];

        let id = timeout(ID_DEADLINE, async {
            loop {
                match decoder.next_frame()? {
                    Some(AsFrame::Id(raw)) => return Ok::<_, EngineError>(Uuid::from_bytes(raw)),
                    Some(other) => {
                        return Err(EngineError::Transport(format!(
                            "expected ID frame first, got type 0x{:02x}",
                            other.kind()
                        )))
                    }
                    None => {}
                }
                let n = stream
                    .read(&mut buf)
                    .await
                    .map_err(|e| EngineError::Transport(format!("id read: {e}")))?;
                if n == 0 {
                    return Err(EngineError::Transport("closed before ID frame".into()));
                }
                decoder.extend(&buf[..n]);
            }
        })
        .await
        .map_err(|_| EngineError::Transport("no ID frame within deadline".into()))??;

        let Some((_, waiter)) = self.pending.remove(&id) else {
            warn!(%id, "audiosocket connection for unknown call");
            let _ = stream.shutdown().await;
            return Ok(());
        };

        let (events_tx, events_rx) = mpsc::channel(64);
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<i16>>(OUT_CHANNEL_FRAMES);
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(read_loop(read_half, decoder, events_tx));
        tokio::spawn(write_loop(write_half, frames_rx));

        let handle = TransportHandle {
            kind: AudioTransportKind::Audiosocket,
            events: events_rx,
            frames_out: frames_tx,
        };
        if waiter.send(handle).is_err() {
            debug!(%id, "session vanished before media attached");
        }
        Ok(())
    }
}

async fn read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    mut decoder: FrameDecoder,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut buf = [0u8; 2048];
    loop {
        // drain complete frames before the next read
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    let event = match frame {
                        AsFrame::Audio(payload) => match pcm16_from_le_bytes(&payload) {
                            Ok(samples) => TransportEvent::CallerAudio(samples),
                            Err(e) => TransportEvent::Error(e.to_string()),
                        },
                        AsFrame::Silence => TransportEvent::SilenceHint,
                        AsFrame::Hangup => TransportEvent::Hangup,
                        AsFrame::Error(detail) => {
                            TransportEvent::Error(format!("pbx error frame: {detail:?}"))
                        }
                        AsFrame::Id(_) => {
                            TransportEvent::Error("unexpected second ID frame".into())
                        }
                    };
                    let terminal = matches!(
                        event,
                        TransportEvent::Hangup | TransportEvent::Error(_)
                    );
                    if events.send(event).await.is_err() || terminal {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    return;
                }
            }
        }
        match read_half.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(TransportEvent::Hangup).await;
                return;
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                let _ = events
                    .send(TransportEvent::Error(format!("socket read: {e}")))
                    .await;
                return;
            }
        }
    }
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<i16>>,
) {
    let mut wire = BytesMut::new();
    while let Some(samples) = frames.recv().await {
        encode_audio(&samples, &mut wire);
        if let Err(e) = write_half.write_all(&wire).await {
            debug!("audiosocket write ended: {e}");
            return;
        }
    }
    // session dropped the sender; say goodbye to the PBX
    let mut bye = BytesMut::new();
    arivox_media_core::audiosocket::encode_frame(&AsFrame::Hangup, &mut bye);
    let _ = write_half.write_all(&bye).await;
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream as ClientStream;

    async fn server_on_free_port() -> (Arc<AudioSocketServer>, String) {
        // find a free port by binding :0 through the server itself
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let server = AudioSocketServer::bind(&addr).await.unwrap();
        (server, addr)
    }

    fn id_frame(id: Uuid) -> Vec<u8> {
        let mut wire = vec![0x01, 0x00, 0x10];
        wire.extend_from_slice(id.as_bytes());
        wire
    }

    #[tokio::test]
    async fn binds_connection_to_waiting_session() {
        let (server, addr) = server_on_free_port().await;
        let id = Uuid::new_v4();
        let waiter = server.expect(id);

        let mut client = ClientStream::connect(&addr).await.unwrap();
        client.write_all(&id_frame(id)).await.unwrap();
        // one audio frame behind the ID
        let mut audio = vec![0x10, 0x01, 0x40];
        audio.extend_from_slice(&[0u8; 320]);
        client.write_all(&audio).await.unwrap();

        let mut handle = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("handshake deadline")
            .expect("handle delivered");
        assert_eq!(handle.kind, AudioTransportKind::Audiosocket);

        match timeout(Duration::from_secs(1), handle.events.recv()).await {
            Ok(Some(TransportEvent::CallerAudio(samples))) => assert_eq!(samples.len(), 160),
            other => panic!("expected caller audio, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_id_is_dropped() {
        let (_server, addr) = server_on_free_port().await;
        let mut client = ClientStream::connect(&addr).await.unwrap();
        client.write_all(&id_frame(Uuid::new_v4())).await.unwrap();
        // server closes on us
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("read deadline")
            .unwrap();
        assert_eq!(n, 0, "connection should be closed");
    }

    #[tokio::test]
    async fn hangup_frame_surfaces_and_ends_stream() {
        let (server, addr) = server_on_free_port().await;
        let id = Uuid::new_v4();
        let waiter = server.expect(id);

        let mut client = ClientStream::connect(&addr).await.unwrap();
        client.write_all(&id_frame(id)).await.unwrap();
        client.write_all(&[0x00, 0x00, 0x00]).await.unwrap();

        let mut handle = waiter.await.unwrap();
        match timeout(Duration::from_secs(1), handle.events.recv()).await {
            Ok(Some(TransportEvent::Hangup)) => {}
            other => panic!("expected hangup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_socket() {
        let (server, addr) = server_on_free_port().await;
        let id = Uuid::new_v4();
        let waiter = server.expect(id);

        let mut client = ClientStream::connect(&addr).await.unwrap();
        client.write_all(&id_frame(id)).await.unwrap();
        let handle = waiter.await.unwrap();

        handle.frames_out.send(vec![7i16; 160]).await.unwrap();
        let mut header = [0u8; 3];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x10);
        assert_eq!(u16::from_be_bytes([header[1], header[2]]), 320);
        let mut payload = vec![0u8; 320];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(i16::from_le_bytes([payload[0], payload[1]]), 7);
    }
}
