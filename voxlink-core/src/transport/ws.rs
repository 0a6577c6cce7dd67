//! WebSocket transport over tokio-tungstenite.
//!
//! ## Tasks
//!
//! ```text
//! capture thread ──send()──► unbounded mpsc ──► writer task ──► socket
//! socket ──► reader task ──► TransportEvent channel ──► session loop
//! ```
//!
//! `send` only enqueues, so the capture thread never waits on the network.
//! `close` queues a Close frame for the writer and aborts the reader, so
//! nothing outlives the transport waiting on a silent peer.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{
    wire::{ClientMessage, ServerMessage, SetupPayload},
    Connector, EventSender, Transport, TransportEvent,
};
use crate::{
    buffering::chunk::EncodedChunk,
    error::{LiveError, Result},
    session::SessionConfig,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Connects to the live audio endpoint named in [`SessionConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &SessionConfig, events: EventSender) -> Result<Arc<dyn Transport>> {
        info!(endpoint = %config.endpoint, model = %config.model, "connecting");

        let (stream, _response) = timeout(config.connect_timeout, connect_async(config.connect_url()))
            .await
            .map_err(|_| LiveError::Connection("connect timed out".into()))?
            .map_err(|e| LiveError::Connection(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let setup = ClientMessage::Setup(SetupPayload {
            model: &config.model,
            voice: &config.voice,
            instructions: &config.instructions,
        })
        .to_json()?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| LiveError::Connection(format!("send setup: {e}")))?;

        timeout(config.connect_timeout, await_setup_complete(&mut read))
            .await
            .map_err(|_| LiveError::Connection("handshake timed out".into()))??;
        info!("session handshake complete");

        // Open goes out before the reader can queue any message.
        let _ = events.send(TransportEvent::Open);

        let closed = Arc::new(AtomicBool::new(false));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(write, out_rx));
        let reader = tokio::spawn(run_reader(read, events, Arc::clone(&closed)));

        Ok(Arc::new(WsTransport {
            out_tx,
            closed,
            reader: Mutex::new(Some(reader)),
        }))
    }
}

pub struct WsTransport {
    out_tx: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Transport for WsTransport {
    fn send(&self, chunk: EncodedChunk) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LiveError::Transport("connection closed".into()));
        }
        let json = ClientMessage::Media(&chunk).to_json()?;
        self.out_tx
            .send(Message::Text(json))
            .map_err(|_| LiveError::Transport("writer task gone".into()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing websocket");
        let _ = self.out_tx.send(Message::Close(None));
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn await_setup_complete(read: &mut WsRead) -> Result<()> {
    while let Some(frame) = read.next().await {
        let payload = match frame.map_err(|e| LiveError::Connection(e.to_string()))? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(LiveError::Connection(format!("closed during setup: {reason}")));
            }
            _ => continue,
        };
        match ServerMessage::parse(&payload) {
            Ok(msg) if msg.is_setup_complete() => return Ok(()),
            Ok(_) => debug!("ignoring message before setupComplete"),
            Err(e) => warn!(error = %e, "unparseable message during setup"),
        }
    }
    Err(LiveError::Connection("connection ended during setup".into()))
}

async fn run_writer(mut write: WsWrite, mut out_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = out_rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = write.close().await;
    debug!("websocket writer finished");
}

async fn run_reader(mut read: WsRead, events: EventSender, closed: Arc<AtomicBool>) {
    while let Some(frame) = read.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string());
                info!(reason = ?reason, "websocket closed by remote");
                let _ = events.send(TransportEvent::Close(reason));
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                if !closed.load(Ordering::Acquire) {
                    warn!(error = %e, "websocket read failed");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                }
                return;
            }
        };
        match ServerMessage::parse(&payload) {
            Ok(msg) => {
                for item in msg.into_inbound() {
                    if events.send(TransportEvent::Message(item)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "dropping unparseable server message"),
        }
    }
    let _ = events.send(TransportEvent::Close(None));
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::net::TcpListener;

    use super::*;
    use crate::transport::InboundMessage;

    /// Accepts one client, completes the handshake, sends `after_setup`,
    /// then holds the socket open without reading or closing.
    async fn silent_peer(after_setup: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let setup = ws.next().await.unwrap().unwrap();
            assert!(setup.into_text().unwrap().contains("\"setup\""));
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.into()))
                .await
                .unwrap();
            for text in after_setup {
                ws.send(Message::Text(text.into())).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        });
        format!("ws://{addr}/")
    }

    fn config(endpoint: String) -> SessionConfig {
        SessionConfig {
            endpoint,
            connect_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn server_messages_follow_open() {
        let endpoint = silent_peer(vec![r#"{"content":{"interrupted":true}}"#]).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let _transport = WsConnector.connect(&config(endpoint), events_tx).await.unwrap();

        assert!(matches!(events_rx.recv().await, Some(TransportEvent::Open)));
        let next = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            next,
            Some(TransportEvent::Message(InboundMessage::Interrupted))
        ));
    }

    #[tokio::test]
    async fn local_close_ends_reader_on_a_silent_peer() {
        let endpoint = silent_peer(Vec::new()).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let transport = WsConnector.connect(&config(endpoint), events_tx).await.unwrap();
        assert!(matches!(events_rx.recv().await, Some(TransportEvent::Open)));

        transport.close();
        transport.close();

        // The reader held the only event sender; aborting it closes the channel.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match events_rx.try_recv() {
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Ok(event) => panic!("no event after a local close, got {event:?}"),
                Err(mpsc::error::TryRecvError::Empty) => {
                    assert!(Instant::now() < deadline, "reader still running");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
        assert!(transport.send(EncodedChunk::new(crate::AudioFormat::CAPTURE, "")).is_err());
    }
}
