use thiserror::Error;

/// Kind of entity a handle refers to. Used only for diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HandleKind {
    Node,
    Publisher,
    Subscription,
    Timer,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleKind::Node => "node",
            HandleKind::Publisher => "publisher",
            HandleKind::Subscription => "subscription",
            HandleKind::Timer => "timer",
        }
    }
}

/// Errors surfaced by the runtime API.
///
/// Failures inside user callbacks (handler errors, panics, empty message
/// buffers) never reach this type: they are logged and contained at the
/// invocation boundary so a spin loop keeps running.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RclError {
    /// Null, stale or foreign handle passed to an operation.
    #[error("invalid {} handle", kind.as_str())]
    InvalidHandle { kind: HandleKind },

    /// Unknown or duplicate message type, or the transport refused to create an endpoint.
    #[error("registration failed for '{name}': {reason}")]
    RegistrationFailure { name: String, reason: String },

    /// The entity is still in use (attached to an executor or being spun).
    #[error("busy: {reason}")]
    Busy { reason: String },

    /// Bad argument, e.g. a zero timer period.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Signal handlers could not be installed; graceful shutdown cannot be guaranteed.
    #[error("startup failed: {0}")]
    StartupFatal(String),

    /// Worker thread could not be spawned.
    #[error("thread spawn failed: {0}")]
    Thread(#[from] std::io::Error),

    /// Error reported by the transport or the wire codec.
    #[error("transport error: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl RclError {
    pub fn invalid_handle(kind: HandleKind) -> Self {
        RclError::InvalidHandle { kind }
    }

    pub fn registration(name: impl Into<String>, reason: impl ToString) -> Self {
        RclError::RegistrationFailure {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        RclError::Busy {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RclError::InvalidHandle { .. } => "invalid_handle",
            RclError::RegistrationFailure { .. } => "registration_failure",
            RclError::Busy { .. } => "busy",
            RclError::InvalidArgument(_) => "invalid_argument",
            RclError::StartupFatal(_) => "startup_fatal",
            RclError::Thread(_) => "thread_spawn",
            RclError::Transport(_) => "transport",
        }
    }

    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, RclError::InvalidHandle { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, RclError::Busy { .. })
    }
}

pub type RclResult<T> = Result<T, RclError>;
