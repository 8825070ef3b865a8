use crate::utils::SlotId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Strongly typed, generation-checked reference to an entity owned by a
/// [`Context`](crate::context::Context) or a [`Node`](crate::node::Node).
///
/// A handle is plain data: it owns nothing, and every operation resolves it
/// against its owner. Handles from another owner or to a destroyed entity
/// are rejected with `InvalidHandle` instead of being dereferenced.
pub struct Handle<K> {
    owner: u64,
    slot: SlotId,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    pub(crate) fn new(owner: u64, slot: SlotId) -> Self {
        Self {
            owner,
            slot,
            _kind: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    #[inline]
    pub(crate) fn slot(&self) -> SlotId {
        self.slot
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.slot == other.slot
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.slot.hash(state);
    }
}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("owner", &self.owner)
            .field("index", &self.slot.index())
            .field("generation", &self.slot.generation())
            .finish()
    }
}

/// Kind markers.
pub struct NodeKind;
pub struct PublisherKind<T>(PhantomData<fn() -> T>);
pub struct SubscriptionKind<T>(PhantomData<fn() -> T>);
pub struct TimerKind;

pub type NodeHandle = Handle<NodeKind>;
pub type PublisherHandle<T> = Handle<PublisherKind<T>>;
pub type SubscriptionHandle<T> = Handle<SubscriptionKind<T>>;
pub type TimerHandle = Handle<TimerKind>;
