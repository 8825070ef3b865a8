use crate::error::RclError;
use parking_lot::Mutex;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps.
pub const CANCEL_POLL_TICK: Duration = Duration::from_millis(1);

/// Process-wide token, installed once by [`init_process_token`].
static PROCESS_TOKEN: Mutex<Option<CancelToken>> = Mutex::new(None);

/// Internal cancellation state, shared via [`Arc`].
/// Each state may optionally have a parent, so that
/// cancelling a parent cancels all of its descendants.
struct CancelState {
    cancelled: Arc<AtomicBool>,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    /// Create a root state (no parent).
    #[inline]
    fn new_root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: None,
        })
    }

    /// Create a child state linked to a parent.
    #[inline]
    fn child_of(parent: Arc<CancelState>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: Some(parent),
        })
    }

    /// Mark this state as cancelled.
    #[inline]
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether this or any ancestor has been cancelled.
    #[inline]
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if let Some(ref p) = self.parent {
            return p.is_cancelled();
        }
        false
    }
}

/// Hierarchical cancellation token.
///
/// A `CancelToken` can be cloned cheaply and checked at any time.
/// Cancelling a parent token cancels all of its children, never the reverse.
/// Tokens are never reset.
///
/// The process-wide root is obtained from [`init_process_token`], which also
/// wires SIGINT/SIGTERM/SIGQUIT to it. Nodes derive their local stop flag as a
/// child of that root, so a signal stops every loop while `Node::stop` only
/// stops one.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Create a new root cancellation token, not connected to any signal.
    #[inline]
    pub fn new_root() -> Self {
        Self {
            state: CancelState::new_root(),
        }
    }

    /// Cancel this token (and propagate to all children).
    #[inline]
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Check if this token (or any ancestor) has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Create a new child token linked to this one.
    #[inline]
    pub fn new_child(&self) -> Self {
        Self {
            state: CancelState::child_of(self.state.clone()),
        }
    }

    /// Route OS termination signals into this token's own flag.
    ///
    /// The handler itself only performs an atomic store, so it is
    /// async-signal-safe; loops observe it on their next poll.
    pub fn install_signal_handlers(&self) -> Result<(), RclError> {
        for sig in TERM_SIGNALS {
            flag::register(*sig, self.state.cancelled.clone()).map_err(|e| {
                RclError::StartupFatal(format!("cannot register handler for signal {sig}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Sleep until the token is cancelled or the specified duration has elapsed.
    /// If the token is cancelled, return false, otherwise return true.
    #[inline]
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        self.sleep_until_cancellable(Instant::now() + total)
    }

    /// Sleep until `deadline`, waking every [`CANCEL_POLL_TICK`] to check for
    /// cancellation. Returns false if cancelled before the deadline.
    pub fn sleep_until_cancellable(&self, deadline: Instant) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_POLL_TICK.min(deadline - now));
        }
    }
}

/// Returns the process-wide cancellation token, installing the
/// SIGINT/SIGTERM handlers on first use.
///
/// Failing to install the handlers is the only fatal startup condition.
pub fn init_process_token() -> Result<CancelToken, RclError> {
    let mut slot = PROCESS_TOKEN.lock();
    if let Some(token) = slot.as_ref() {
        return Ok(token.clone());
    }

    let token = CancelToken::new_root();
    token.install_signal_handlers()?;
    tracing::debug!("[CancelToken] termination signal handlers installed");
    *slot = Some(token.clone());
    Ok(token)
}

/// Returns the process-wide token if [`init_process_token`] has run.
pub fn process_token() -> Option<CancelToken> {
    PROCESS_TOKEN.lock().clone()
}
