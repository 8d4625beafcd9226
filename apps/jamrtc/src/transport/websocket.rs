use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::{
    Assembler, Dialer, Fragment, OutboundQueue, TransportConfig, TransportError, TransportEvent,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Shared {
    queue: Mutex<OutboundQueue>,
    wake: Notify,
    closed: AtomicBool,
    draining: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn report_closed(&self, reason: Option<TransportError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.queue.lock().clear();
        debug!(
            target = "jamrtc::transport",
            dropped,
            reason = ?reason,
            "signaling connection lost"
        );
        self.wake.notify_one();
        let _ = self.events.send(TransportEvent::Disconnected(reason));
    }
}

/// A live signaling connection.
pub struct Transport {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Split an upgraded socket into reader and writer tasks.
    pub fn spawn<S>(
        socket: WebSocketStream<S>,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let shared = Arc::new(Shared {
            queue: Mutex::new(OutboundQueue::new()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            events,
        });

        let writer = tokio::spawn(write_loop(
            sink,
            Arc::clone(&shared),
            config.max_fragment_bytes,
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&shared),
            config.max_message_bytes,
        ));

        Self {
            shared,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Append a document to the outbound queue and wake the writer.
    pub fn enqueue(&self, document: String) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.shared.queue.lock().push(document);
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Flush what is already queued, close the socket and join both tasks.
    ///
    /// Never reports [`TransportEvent::Disconnected`]. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.shared.draining.store(true, Ordering::Release);
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake.notify_one();

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                warn!(
                    target = "jamrtc::transport",
                    "outbound queue did not drain in time; aborting writer"
                );
                writer.abort();
            }
        }
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
        let dropped = self.shared.queue.lock().clear();
        if dropped > 0 {
            debug!(target = "jamrtc::transport", dropped, "discarded unsent documents");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for slot in [&self.writer, &self.reader] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

fn frame_for(fragment: Fragment) -> Message {
    let opcode = if fragment.first {
        OpCode::Data(Data::Text)
    } else {
        OpCode::Data(Data::Continue)
    };
    Message::Frame(Frame::message(fragment.bytes, opcode, fragment.last))
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    shared: Arc<Shared>,
    max_fragment_bytes: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = shared.queue.lock().next_fragment(max_fragment_bytes);
        match next {
            Some(fragment) => {
                let written = fragment.bytes.len();
                let last = fragment.last;
                if let Err(err) = sink.send(frame_for(fragment)).await {
                    shared.report_closed(Some(TransportError::Io(err.to_string())));
                    break;
                }
                trace!(
                    target = "jamrtc::transport",
                    event = "ws_out",
                    len = written,
                    last
                );
                shared.queue.lock().advance(written);
            }
            None if shared.draining.load(Ordering::Acquire) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            None if shared.closed.load(Ordering::Acquire) => break,
            None => shared.wake.notified().await,
        }
    }
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    max_message_bytes: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut assembler = Assembler::new(max_message_bytes);
    while let Some(message) = stream.next().await {
        let (chunk, is_final) = match message {
            Ok(Message::Text(text)) => (text.into_bytes(), true),
            Ok(Message::Binary(data)) => (data, true),
            Ok(Message::Frame(frame)) => {
                let is_final = frame.header().is_final;
                (frame.into_data(), is_final)
            }
            Ok(Message::Close(frame)) => {
                debug!(
                    target = "jamrtc::transport",
                    frame = ?frame,
                    "server closed signaling websocket"
                );
                shared.report_closed(None);
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                        debug!(target = "jamrtc::transport", "signaling websocket closed: {err}");
                    }
                    _ => {
                        warn!(target = "jamrtc::transport", "signaling websocket error: {err}");
                    }
                }
                shared.report_closed(Some(TransportError::Io(err.to_string())));
                return;
            }
        };
        match assembler.push(&chunk, is_final) {
            Ok(Some(document)) => {
                trace!(
                    target = "jamrtc::transport",
                    event = "ws_in",
                    len = document.len()
                );
                if shared.events.send(TransportEvent::Message(document)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target = "jamrtc::transport",
                    error = %err,
                    "dropping inbound document"
                );
            }
        }
    }
    shared.report_closed(None);
}

/// Dials `ws://` or `wss://` endpoints with the Janus subprotocol.
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(
        &self,
        endpoint: &Url,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Transport, TransportError> {
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(janus_proto::SUBPROTOCOL),
        );
        let (socket, response) = connect_async(request)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(
            target = "jamrtc::transport",
            url = %endpoint,
            status = %response.status(),
            "signaling websocket connected"
        );
        Ok(Transport::spawn(socket, config, events))
    }
}
