use crate::error::ReleaseError;

/// A cache-owning component that can be asked to release memory.
///
/// The monitor only ever holds a weak reference to a participant. Owners are
/// expected to deregister before the participant is destroyed; a participant
/// dropped without deregistering is pruned on the next broadcast.
pub trait CacheParticipant: Send + Sync {
    /// Release as much cached memory as possible.
    ///
    /// Called synchronously from the sampling cycle, possibly on a background
    /// thread. Returning an error (or panicking) is logged and does not stop
    /// other participants from being notified.
    fn release_cache(&self) -> Result<(), ReleaseError>;

    /// Ask to be removed from monitoring.
    ///
    /// The monitor never calls this; implementations typically call
    /// [`MemoryMonitor::deregister`](crate::MemoryMonitor::deregister) on the
    /// monitor they registered with.
    fn request_detach(&self);

    /// Label used in log output.
    fn name(&self) -> &str {
        "cache participant"
    }
}

/// Identity of a registered participant.
///
/// Derived from the participant's address, so `&self` inside a participant and
/// the `Arc` it was registered through produce the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(usize);

impl ParticipantId {
    pub fn of<P: CacheParticipant + ?Sized>(participant: &P) -> Self {
        Self(participant as *const P as *const () as usize)
    }
}
