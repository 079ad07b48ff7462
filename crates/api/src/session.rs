//! Websocket side of the controller protocol.
//!
//! The controller pushes [`AgentCommand`]s as JSON text frames; the agent
//! publishes [`ControllerFrame`]s back on the same connection. Reading and
//! writing run on their own tasks so a slow publisher never stalls command
//! delivery.

use std::time::Duration;

use flowci_engine::ControllerError;
use flowci_types::{AgentCommand, ControllerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::TOKEN_HEADER;

const COMMAND_CAPACITY: usize = 16;
const OUTBOUND_CAPACITY: usize = 1000;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Websocket endpoint for `server_url`: `http` becomes `ws`. TLS endpoints are rejected.
pub fn websocket_url(server_url: &str) -> Result<Url, ControllerError> {
    let mut url = Url::parse(server_url).map_err(|error| ControllerError::protocol(format!("invalid server url '{server_url}': {error}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => {
            return Err(ControllerError::protocol(format!(
                "unsupported server url '{server_url}', only plain http is supported"
            )));
        }
        other => return Err(ControllerError::protocol(format!("unsupported server url scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ControllerError::protocol(format!("cannot switch '{server_url}' to {scheme}")))?;
    url.path_segments_mut()
        .map_err(|_| ControllerError::protocol(format!("server url '{server_url}' cannot be a base")))?
        .pop_if_empty()
        .extend(["agent", "ws"]);
    Ok(url)
}

/// Serializes an outbound frame into a websocket text message.
pub fn frame_message(frame: &ControllerFrame) -> Result<Message, ControllerError> {
    let text = serde_json::to_string(frame).map_err(|error| ControllerError::protocol(error.to_string()))?;
    Ok(Message::Text(text))
}

/// Open websocket connection to the controller.
pub struct ControllerSession {
    outbound: mpsc::Sender<Message>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
}

impl ControllerSession {
    /// Connects and returns the session with the stream of inbound commands.
    ///
    /// The command stream ends when the controller closes the connection.
    pub async fn connect(server_url: &str, token: &str) -> Result<(Self, mpsc::Receiver<AgentCommand>), ControllerError> {
        let url = websocket_url(server_url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|error| ControllerError::protocol(error.to_string()))?;
        let token = HeaderValue::from_str(token).map_err(|error| ControllerError::protocol(format!("invalid agent token: {error}")))?;
        request.headers_mut().insert(TOKEN_HEADER, token);

        let (stream, _) = connect_async(request).await.map_err(|error| ControllerError::http(error.to_string()))?;
        info!(%url, "controller session connected");
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(error) = sink.send(message).await {
                    warn!(error = %error, "failed to write to controller session");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "controller closed the session");
                        break;
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        warn!(error = %error, "controller session failed");
                        break;
                    }
                };
                match serde_json::from_str::<AgentCommand>(&text) {
                    Ok(command) => {
                        if commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(error = %error, "ignoring malformed controller command"),
                }
            }
        });

        let session = Self {
            outbound,
            writer: Mutex::new(Some(writer)),
            reader,
        };
        Ok((session, commands_rx))
    }

    pub async fn publish(&self, frame: &ControllerFrame) -> Result<(), ControllerError> {
        let message = frame_message(frame)?;
        self.outbound.send(message).await.map_err(|_| ControllerError::Closed)
    }

    /// Sends a close frame and waits briefly for the writer to flush; later publishes fail.
    pub async fn close(&self) {
        let Some(writer) = self.writer.lock().await.take() else {
            return;
        };
        let _ = self.outbound.send(Message::Close(None)).await;
        if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
            warn!("controller session did not close in time");
        }
        self.reader.abort();
    }
}
