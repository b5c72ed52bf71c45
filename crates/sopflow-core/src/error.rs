use uuid::Uuid;

/// Top-level error type for the Sopflow engine.
///
/// Structural and transition errors are reported without mutating any shared
/// state: a call that returns one of them is a no-op.
#[derive(Debug, thiserror::Error)]
pub enum SopflowError {
    /// A plan with this id already exists.
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// A plan structure was rejected (empty step, colliding ids, ...).
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),

    /// A plan, task, agent or request could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A status change that the state machine does not allow.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A response or resume referenced a request id nobody issued.
    #[error("Unknown request: {0}")]
    UnknownRequest(Uuid),

    /// A response arrived for a request that already reached a terminal status.
    #[error("Request {0} already resolved")]
    AlreadyResolved(Uuid),

    /// A collaboration request expired before it was answered.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An internal step of a worker's sub-plan failed.
    #[error("Step execution failure: {0}")]
    StepExecutionFailure(String),

    /// The requester already waits on another collaboration request.
    #[error("Agent '{agent_id}' already has pending request {request_id}")]
    PendingRequestExists {
        /// The requesting agent.
        agent_id: String,
        /// The request it is still waiting on.
        request_id: Uuid,
    },

    /// The dispatch loop cannot make progress.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A message could not be handed to a worker's inbound channel.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`SopflowError`].
pub type SopflowResult<T> = Result<T, SopflowError>;
