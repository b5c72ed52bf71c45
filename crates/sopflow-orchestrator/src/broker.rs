use crate::transport::Transport;
use crate::types::CollaborationRequest;
use chrono::Utc;
use parking_lot::Mutex;
use sopflow_core::{
    CollaborationMessage, CollaborationResponse, RequestStatus, SopflowError, SopflowResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of a collaboration request, routed back to the requesting context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The resolved request.
    pub request_id: Uuid,
    /// Worker whose context is suspended on the request.
    pub requester: String,
    /// Terminal status reached.
    pub status: RequestStatus,
    /// Responder output, or the timeout reason.
    pub result: String,
}

struct Entry {
    request: CollaborationRequest,
    deadline: Instant,
}

/// Every request ever submitted, plus the pending one of each requester.
#[derive(Default)]
struct RequestTable {
    entries: HashMap<Uuid, Entry>,
    pending: HashMap<String, Uuid>,
}

impl RequestTable {
    /// Move a pending request to a terminal status and drop it from the
    /// per-requester index.
    fn resolve(&mut self, request_id: Uuid, status: RequestStatus, result: String) {
        if let Some(entry) = self.entries.get_mut(&request_id) {
            entry.request.status = status;
            entry.request.result = Some(result);
            entry.request.responded_at = Some(Utc::now());
            if self.pending.get(&entry.request.requester) == Some(&request_id) {
                self.pending.remove(&entry.request.requester);
            }
        }
    }
}

/// Tracks delegation requests between workers.
///
/// Every submitted request is resolved exactly once, either by
/// [`on_response`](Self::on_response) or by [`sweep_timeouts`](Self::sweep_timeouts),
/// and each resolution produces exactly one [`Resolution`] on the
/// notification channel. None of the methods block on I/O.
pub struct CollaborationBroker {
    table: Mutex<RequestTable>,
    transport: Arc<dyn Transport>,
    notify_tx: mpsc::UnboundedSender<Resolution>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Resolution>>>,
}

impl CollaborationBroker {
    /// Create a broker that delivers delegations through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            table: Mutex::new(RequestTable::default()),
            transport,
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    /// Hand out the receiving end of the resolution channel. Only the first
    /// caller gets it.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Resolution>> {
        self.notify_rx.lock().take()
    }

    /// Record a pending request and enqueue the delegation for `target`.
    ///
    /// Returns as soon as the message is queued. A requester may only wait on
    /// one request at a time.
    pub fn submit(
        &self,
        requester: &str,
        target: &str,
        description: &str,
        context: serde_json::Value,
        timeout: Duration,
    ) -> SopflowResult<Uuid> {
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            SopflowError::InvalidStructure(format!(
                "collaboration timeout of {}s is out of range",
                timeout.as_secs()
            ))
        })?;
        let mut table = self.table.lock();

        if let Some(existing) = table.pending.get(requester) {
            return Err(SopflowError::PendingRequestExists {
                agent_id: requester.to_string(),
                request_id: *existing,
            });
        }

        let request_id = Uuid::new_v4();
        let request = CollaborationRequest {
            request_id,
            requester: requester.to_string(),
            target: target.to_string(),
            description: description.to_string(),
            context: context.clone(),
            status: RequestStatus::Pending,
            result: None,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            created_at: Utc::now(),
            responded_at: None,
        };
        table.entries.insert(request_id, Entry { request, deadline });
        table.pending.insert(requester.to_string(), request_id);

        // Still under the lock: a responder cannot observe the id before the
        // record exists, and a failed delivery leaves nothing behind.
        let message = CollaborationMessage {
            request_id,
            requester: requester.to_string(),
            target: target.to_string(),
            description: description.to_string(),
            context,
        };
        if let Err(e) = self.transport.deliver(message) {
            table.entries.remove(&request_id);
            table.pending.remove(requester);
            return Err(e);
        }

        info!(
            request_id = %request_id,
            requester = %requester,
            target = %target,
            timeout_ms = timeout.as_millis() as u64,
            "Collaboration request submitted"
        );
        Ok(request_id)
    }

    /// Apply a response from the target worker.
    pub fn on_response(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        result: impl Into<String>,
    ) -> SopflowResult<CollaborationRequest> {
        if !status.is_terminal() {
            return Err(SopflowError::InvalidTransition(format!(
                "request {request_id}: a response must carry a terminal status, got {status}"
            )));
        }

        let mut table = self.table.lock();
        let current = table
            .entries
            .get(&request_id)
            .map(|e| e.request.status)
            .ok_or(SopflowError::UnknownRequest(request_id))?;

        if current.is_terminal() {
            warn!(
                request_id = %request_id,
                status = %current,
                "Response for an already resolved request ignored"
            );
            return Err(SopflowError::AlreadyResolved(request_id));
        }

        let result = result.into();
        table.resolve(request_id, status, result.clone());
        info!(request_id = %request_id, status = %status, "Collaboration request resolved");

        let request = table
            .entries
            .get(&request_id)
            .map(|e| e.request.clone())
            .ok_or(SopflowError::UnknownRequest(request_id))?;
        self.notify(&request, result);
        Ok(request)
    }

    /// Convenience wrapper taking the wire payload.
    pub fn on_response_payload(
        &self,
        response: CollaborationResponse,
    ) -> SopflowResult<CollaborationRequest> {
        self.on_response(response.request_id, response.status, response.result)
    }

    /// Time out every pending request whose deadline has passed.
    ///
    /// Returns the ids that were transitioned by this sweep.
    pub fn sweep_timeouts(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut table = self.table.lock();

        let due: Vec<Uuid> = table
            .pending
            .values()
            .copied()
            .filter(|id| table.entries.get(id).is_some_and(|e| e.deadline <= now))
            .collect();

        for request_id in &due {
            let Some(request) = table.entries.get(request_id).map(|e| e.request.clone()) else {
                continue;
            };
            let reason = format!(
                "no response from '{}' within {}ms",
                request.target, request.timeout_ms
            );
            table.resolve(*request_id, RequestStatus::TimedOut, reason.clone());
            warn!(
                request_id = %request_id,
                requester = %request.requester,
                target = %request.target,
                "Collaboration request timed out"
            );
            if let Some(entry) = table.entries.get(request_id) {
                self.notify(&entry.request, reason);
            }
        }

        due
    }

    /// Run [`sweep_timeouts`](Self::sweep_timeouts) every `interval` on a
    /// background task. The task ends once the broker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let broker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match broker.upgrade() {
                    Some(broker) => {
                        broker.sweep_timeouts();
                    }
                    None => break,
                }
            }
        })
    }

    /// Snapshot of one request, pending or resolved.
    pub fn get_request(&self, request_id: Uuid) -> SopflowResult<CollaborationRequest> {
        self.table
            .lock()
            .entries
            .get(&request_id)
            .map(|e| e.request.clone())
            .ok_or_else(|| SopflowError::NotFound(format!("request {request_id}")))
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    /// Pending request held by `requester`, if any.
    pub fn pending_for(&self, requester: &str) -> Option<Uuid> {
        self.table.lock().pending.get(requester).copied()
    }

    /// All requests, oldest first.
    pub fn list_requests(&self) -> Vec<CollaborationRequest> {
        let mut all: Vec<CollaborationRequest> = self
            .table
            .lock()
            .entries
            .values()
            .map(|e| e.request.clone())
            .collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    fn notify(&self, request: &CollaborationRequest, result: String) {
        let resolution = Resolution {
            request_id: request.request_id,
            requester: request.requester.clone(),
            status: request.status,
            result,
        };
        if self.notify_tx.send(resolution).is_err() {
            warn!(request_id = %request.request_id, "Resolution dropped: no listener");
        }
    }
}
