//! Serialized uplink: one worker task sends actions to the remote session
//! strictly one at a time, in submission order.
//!
//! Audio chunks and tool acknowledgments share the same FIFO, so an
//! acknowledgment never overtakes audio queued before it. A failed send is
//! logged and the worker moves on. Once the queue is closed, anything still
//! waiting is dropped without being sent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::remote::{AudioEnvelope, FunctionResponse, RemoteSession};

#[derive(Debug, Clone, PartialEq)]
pub enum UplinkAction {
    Audio(AudioEnvelope),
    ToolResponse(FunctionResponse),
}

impl UplinkAction {
    fn kind(&self) -> &'static str {
        match self {
            UplinkAction::Audio(_) => "audio",
            UplinkAction::ToolResponse(_) => "tool response",
        }
    }
}

pub struct UplinkQueue {
    tx: mpsc::UnboundedSender<UplinkAction>,
    open: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl UplinkQueue {
    /// Spawn the worker for `session`. Must be called inside a tokio runtime.
    pub fn start(session: Arc<dyn RemoteSession>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(drain(
            rx,
            session,
            Arc::clone(&open),
            Arc::clone(&pending),
        ));

        Self {
            tx,
            open,
            pending,
            worker,
        }
    }

    /// Queue `action`. Returns `false` if the queue is already closed.
    pub fn enqueue(&self, action: UplinkAction) -> bool {
        if !self.is_open() {
            log::debug!("uplink: closed, dropping {}", action.kind());
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(action).is_err() {
            decrement(&self.pending);
            return false;
        }
        true
    }

    /// Actions queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop sending and forget everything queued. Idempotent.
    pub fn close(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.worker.abort();
        }
        self.pending.store(0, Ordering::SeqCst);
    }
}

impl Drop for UplinkQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn decrement(pending: &AtomicUsize) {
    let _ = pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<UplinkAction>,
    session: Arc<dyn RemoteSession>,
    open: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(action) = rx.recv().await {
        if !open.load(Ordering::SeqCst) {
            log::debug!("uplink: session gone, dropping {}", action.kind());
            decrement(&pending);
            continue;
        }

        let kind = action.kind();
        let result = match action {
            UplinkAction::Audio(chunk) => session.send_audio(chunk).await,
            UplinkAction::ToolResponse(response) => session.send_tool_response(response).await,
        };
        decrement(&pending);

        if let Err(e) = result {
            log::warn!("uplink: {kind} send failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
