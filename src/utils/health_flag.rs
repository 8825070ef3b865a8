use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheaply clonable flag tracking whether a loop is running.
/// Wraps an `AtomicBool` in `Arc<CachePadded<...>>` to avoid false sharing.
#[derive(Clone)]
#[repr(transparent)]
pub struct HealthFlag(Arc<CachePadded<AtomicBool>>);

impl HealthFlag {
    /// Create a new flag with the given initial value.
    #[inline]
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(CachePadded::new(AtomicBool::new(initial))))
    }

    #[inline(always)]
    fn atomic(&self) -> &AtomicBool {
        &self.0
    }

    /// Current value.
    #[inline(always)]
    pub fn get(&self) -> bool {
        self.atomic().load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set(&self, v: bool) {
        self.atomic().store(v, Ordering::Release)
    }

    /// Convenience: mark as running.
    #[inline(always)]
    pub fn up(&self) {
        self.set(true);
    }

    /// Convenience: mark as stopped.
    #[inline(always)]
    pub fn down(&self) {
        self.set(false);
    }

    /// Raise the flag only if it is currently down.
    /// Returns false if someone else already holds it.
    #[inline]
    pub fn try_raise(&self) -> bool {
        self.atomic()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Lower the flag, returning whether it was up.
    #[inline]
    pub fn take(&self) -> bool {
        self.atomic().swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for HealthFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthFlag")
            .field("value", &self.get())
            .finish()
    }
}

/// Lowers a flag raised with [`HealthFlag::try_raise`] when dropped.
pub struct FlagGuard(HealthFlag);

impl FlagGuard {
    /// Raise `flag` and return a guard, or `None` if it was already up.
    pub fn acquire(flag: &HealthFlag) -> Option<Self> {
        flag.try_raise().then(|| Self(flag.clone()))
    }

    /// Take over a flag that the caller already raised.
    pub fn adopt(flag: &HealthFlag) -> Self {
        Self(flag.clone())
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        self.0.down();
    }
}
