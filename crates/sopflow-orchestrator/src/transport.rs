use parking_lot::RwLock;
use sopflow_core::{CollaborationMessage, SopflowError, SopflowResult};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Delivers delegation messages to a worker's inbound channel.
///
/// Implementations must preserve FIFO order per sender/receiver pair. No
/// global ordering is required. `deliver` never blocks.
pub trait Transport: Send + Sync {
    fn deliver(&self, message: CollaborationMessage) -> SopflowResult<()>;
}

/// In-process transport: one unbounded channel per registered worker.
pub struct InMemoryTransport {
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<CollaborationMessage>>>,
}

impl InMemoryTransport {
    /// A transport with no registered inboxes.
    pub fn new() -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or reopen) the inbound channel of `agent_id`.
    ///
    /// Reopening drops the previous receiver; messages still queued on it are lost.
    pub fn register(&self, agent_id: &str) -> mpsc::UnboundedReceiver<CollaborationMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(agent_id.to_string(), tx);
        rx
    }

    /// Whether `agent_id` has an inbox.
    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.inboxes.read().contains_key(agent_id)
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for InMemoryTransport {
    fn deliver(&self, message: CollaborationMessage) -> SopflowResult<()> {
        let inboxes = self.inboxes.read();
        let inbox = inboxes.get(&message.target).ok_or_else(|| {
            SopflowError::Transport(format!("no inbound channel for '{}'", message.target))
        })?;

        debug!(request_id = %message.request_id, target = %message.target, "Delivering collaboration message");
        let target = message.target.clone();
        inbox
            .send(message)
            .map_err(|_| SopflowError::Transport(format!("inbound channel of '{target}' is closed")))
    }
}
