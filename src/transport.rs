//! # WebSocket Transport
//!
//! The real signaling socket, built on tokio-tungstenite.
//!
//! ## Tasks per connection:
//! - **writer**: drains an unbounded channel of outbound frames into the socket
//! - **reader**: forwards text/binary frames to the runtime as [`NetworkEvent`]s
//!   and reports exactly one `Closed` when the socket ends
//!
//! The controller only ever sees [`WsTransport`], a handle that queues frames
//! for the writer and tracks whether the socket is still open.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::Participant;
use crate::signaling::{Transport, CLOSE_ABNORMAL};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Close code reported when the peer sent a close frame without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Results of asynchronous work, fed back into the controller by the runtime.
pub enum NetworkEvent {
    PreviewLoaded(VoiceResult<Vec<Participant>>),
    TokenRefreshed { request: u64, result: VoiceResult<String> },
    Opened { attempt: u64, transport: WsTransport },
    Text { attempt: u64, text: String },
    Binary { attempt: u64, data: Vec<u8> },
    Closed { attempt: u64, code: u16, reason: String },
}

/// Handle to an open socket.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    fn send_text(&mut self, text: String) -> VoiceResult<()> {
        if !self.is_open() {
            return Err(VoiceError::NotConnected);
        }
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| VoiceError::NotConnected)
    }

    fn close(&mut self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }
}

/// Open the socket for `attempt` in the background.
///
/// A failed handshake is reported as a `Closed` event with code 1006, the same
/// way an abruptly dropped connection is.
pub fn spawn_connection(attempt: u64, url: String, events: mpsc::UnboundedSender<NetworkEvent>) {
    tokio::spawn(async move {
        let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                warn!(attempt, "WebSocket handshake failed: {}", e);
                let _ = events.send(NetworkEvent::Closed {
                    attempt,
                    code: CLOSE_ABNORMAL,
                    reason: e.to_string(),
                });
                return;
            }
        };
        info!(attempt, "WebSocket connected");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));

        let transport = WsTransport {
            outbound: outbound_tx,
            open: Arc::clone(&open),
        };
        if events.send(NetworkEvent::Opened { attempt, transport }).is_err() {
            return;
        }

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(attempt, "WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let (code, reason) = read_until_closed(attempt, &mut source, &events).await;
        open.store(false, Ordering::SeqCst);
        writer.abort();

        debug!(attempt, code, %reason, "WebSocket reader finished");
        let _ = events.send(NetworkEvent::Closed { attempt, code, reason });
    });
}

async fn read_until_closed<S>(
    attempt: u64,
    source: &mut S,
    events: &mpsc::UnboundedSender<NetworkEvent>,
) -> (u16, String)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = source.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => NetworkEvent::Text {
                attempt,
                text: text.to_string(),
            },
            Ok(Message::Binary(data)) => NetworkEvent::Binary {
                attempt,
                data: data.to_vec(),
            },
            Ok(Message::Close(Some(frame))) => {
                return (u16::from(frame.code), frame.reason.to_string());
            }
            Ok(Message::Close(None)) => return (CLOSE_NO_STATUS, String::new()),
            // Ping replies are handled by tungstenite
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Err(e) => return (CLOSE_ABNORMAL, e.to_string()),
        };
        if events.send(event).is_err() {
            return (CLOSE_ABNORMAL, "Runtime stopped".to_string());
        }
    }
    (CLOSE_ABNORMAL, String::new())
}
