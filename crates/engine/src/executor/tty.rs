//! Interactive session handed to a backend.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the input queue of an interactive session.
pub(crate) const TTY_INPUT_CAPACITY: usize = 100;

type StartedCallback = Box<dyn FnOnce(&str) + Send>;

/// One open interactive session.
///
/// `token` is the session sub-context: a child of the step context that is
/// also cancelled on detach. Output is forwarded base64 encoded.
pub struct TtySession {
    pub id: String,
    pub input: mpsc::Receiver<String>,
    pub token: CancellationToken,
    output: mpsc::Sender<String>,
    // Wrapped in a mutex only so the session is `Sync` and `&self` methods
    // can be awaited inside `Send` futures.
    on_started: std::sync::Mutex<Option<StartedCallback>>,
}

impl TtySession {
    pub fn new(
        id: impl Into<String>,
        input: mpsc::Receiver<String>,
        output: mpsc::Sender<String>,
        token: CancellationToken,
        on_started: StartedCallback,
    ) -> Self {
        Self {
            id: id.into(),
            input,
            token,
            output,
            on_started: std::sync::Mutex::new(Some(on_started)),
        }
    }

    /// Signals that the backend attached successfully. Only the first call has an effect.
    pub fn started(&mut self) {
        if let Some(callback) = self.on_started.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            callback(&self.id);
        }
    }

    /// Encodes and forwards a chunk of terminal output; `false` once the consumer is gone.
    pub async fn send_output(&self, chunk: &[u8]) -> bool {
        self.output.send(STANDARD.encode(chunk)).await.is_ok()
    }

    /// Sender half for pumps running on their own task.
    pub fn output_sender(&self) -> TtyOutput {
        TtyOutput {
            sender: self.output.clone(),
        }
    }
}

/// Cloneable output handle of a session.
#[derive(Clone)]
pub struct TtyOutput {
    sender: mpsc::Sender<String>,
}

impl TtyOutput {
    pub async fn send(&self, chunk: &[u8]) -> bool {
        self.sender.send(STANDARD.encode(chunk)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn started_fires_once_and_output_is_base64() {
        let (_input_tx, input_rx) = mpsc::channel(1);
        let (output_tx, mut output_rx) = mpsc::channel(4);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let mut session = TtySession::new(
            "t1",
            input_rx,
            output_tx,
            CancellationToken::new(),
            Box::new(move |id| recorded.lock().unwrap().push(id.to_string())),
        );

        session.started();
        session.started();
        assert_eq!(*calls.lock().unwrap(), vec!["t1".to_string()]);

        assert!(session.send_output(b"ls\r\n").await);
        assert!(session.output_sender().send(b"hi").await);
        assert_eq!(output_rx.recv().await.unwrap(), "bHMNCg==");
        assert_eq!(output_rx.recv().await.unwrap(), "aGk=");
    }
}
