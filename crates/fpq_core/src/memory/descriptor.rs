//! Segment lifecycle: status state machine and reload throttling.

use crate::error::{QueueError, QueueResult};
use crate::memory::segment::Segment;
use crate::memory::spill::SpillHandle;
use crate::types::SegmentId;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Where a segment's entries live.
///
/// ```text
///            evict             spilled
///   Ready ----------> Saving ----------> Offline
///     ^                 |                  |
///     |  spill failed   |                  | reload due
///     +-----------------+                  v
///     +-------------------------------- Loading
///               loaded                     |
///                                          | load failed
///                          Offline <-------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Resident; pops may reserve from it.
    Ready,
    /// Being written to its spill file.
    Saving,
    /// Entries are on disk, apart from any a pop had already reserved.
    Offline,
    /// Being read back from its spill file.
    Loading,
}

impl SegmentStatus {
    /// Checks a transition and returns the new status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] for any transition not in the
    /// diagram above.
    pub fn transition(self, next: Self) -> QueueResult<Self> {
        use SegmentStatus::{Loading, Offline, Ready, Saving};
        match (self, next) {
            (Ready, Saving)
            | (Saving, Offline | Ready)
            | (Offline, Loading)
            | (Loading, Ready | Offline) => Ok(next),
            _ => Err(QueueError::invalid_state(format!(
                "segment cannot move from {self:?} to {next:?}"
            ))),
        }
    }

    /// True unless the entries are offloaded.
    #[must_use]
    pub fn is_resident(self) -> bool {
        self != Self::Offline
    }
}

const MIN_RELOAD_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RELOAD_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ThrottleState {
    next_attempt: Option<Instant>,
    backoff: Duration,
    in_flight: bool,
}

/// Keeps pops from queueing the same reload twice and spaces out retries
/// after a failed reload.
#[derive(Debug)]
pub struct ReloadThrottle {
    state: Mutex<ThrottleState>,
}

impl Default for ReloadThrottle {
    fn default() -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                next_attempt: None,
                backoff: MIN_RELOAD_BACKOFF,
                in_flight: false,
            }),
        }
    }
}

impl ReloadThrottle {
    /// Claims the next reload. False while one is queued or running, or
    /// while backing off after a failure.
    pub fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.in_flight || state.next_attempt.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        state.in_flight = true;
        true
    }

    /// Gives a claim back without attempting the reload.
    pub fn release(&self) {
        self.state.lock().in_flight = false;
    }

    /// Clears the claim and any backoff.
    pub fn succeeded(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        state.next_attempt = None;
        state.backoff = MIN_RELOAD_BACKOFF;
    }

    /// Clears the claim and delays the next one, doubling the delay each
    /// time up to one second.
    pub fn failed(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        state.next_attempt = Some(Instant::now() + state.backoff);
        state.backoff = (state.backoff * 2).min(MAX_RELOAD_BACKOFF);
    }

    /// Delay that the next failure will impose.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.state.lock().backoff
    }
}

/// Point-in-time view of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSnapshot {
    /// Segment id.
    pub id: SegmentId,
    /// Lifecycle status.
    pub status: SegmentStatus,
    /// Bytes admitted.
    pub bytes_used: u64,
    /// Byte budget.
    pub max_bytes: u64,
    /// Entries that can still be reserved.
    pub available: u64,
    /// Entries held in memory.
    pub resident: u64,
    /// Whether pushes are refused.
    pub closed_for_push: bool,
}

/// A segment plus its lifecycle state.
#[derive(Debug)]
pub struct SegmentDescriptor {
    id: SegmentId,
    status: Mutex<SegmentStatus>,
    segment: Segment,
    spill: Mutex<Option<SpillHandle>>,
    reload: ReloadThrottle,
}

impl SegmentDescriptor {
    /// Creates a ready, empty segment.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            id: SegmentId::generate(),
            status: Mutex::new(SegmentStatus::Ready),
            segment: Segment::new(max_bytes),
            spill: Mutex::new(None),
            reload: ReloadThrottle::default(),
        }
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the entry buffer.
    #[must_use]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> SegmentStatus {
        *self.status.lock()
    }

    /// Moves to `next` if the transition is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] otherwise; the status is
    /// unchanged.
    pub fn transition(&self, next: SegmentStatus) -> QueueResult<()> {
        let mut status = self.status.lock();
        *status = status.transition(next)?;
        Ok(())
    }

    /// Reserves up to `max` entries if the segment is ready.
    ///
    /// Holding the status lock across the check and the reservation means
    /// an eviction either sees the reservation or happens before it.
    pub fn try_reserve(&self, max: u64) -> u64 {
        let status = self.status.lock();
        if *status == SegmentStatus::Ready {
            self.segment.reserve(max)
        } else {
            0
        }
    }

    /// Returns the reload throttle.
    #[must_use]
    pub fn reload(&self) -> &ReloadThrottle {
        &self.reload
    }

    pub(crate) fn set_spill(&self, handle: SpillHandle) {
        *self.spill.lock() = Some(handle);
    }

    pub(crate) fn take_spill(&self) -> Option<SpillHandle> {
        self.spill.lock().take()
    }

    /// Entries waiting in the spill file.
    #[must_use]
    pub fn spilled_entries(&self) -> u64 {
        self.spill.lock().as_ref().map_or(0, SpillHandle::entries)
    }

    /// Returns a snapshot of the segment.
    #[must_use]
    pub fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            id: self.id,
            status: self.status(),
            bytes_used: self.segment.bytes_used(),
            max_bytes: self.segment.max_bytes(),
            available: self.segment.available(),
            resident: self.segment.resident_len(),
            closed_for_push: self.segment.is_closed_for_push(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn allowed_transitions() {
        use SegmentStatus::*;
        for (from, to) in [
            (Ready, Saving),
            (Saving, Offline),
            (Saving, Ready),
            (Offline, Loading),
            (Loading, Ready),
            (Loading, Offline),
        ] {
            assert_eq!(from.transition(to).unwrap(), to);
        }
    }

    #[test]
    fn rejected_transitions() {
        use SegmentStatus::*;
        for (from, to) in [
            (Ready, Offline),
            (Ready, Loading),
            (Offline, Ready),
            (Saving, Loading),
            (Loading, Saving),
            (Ready, Ready),
        ] {
            assert!(matches!(
                from.transition(to),
                Err(QueueError::InvalidState { .. })
            ));
        }
    }

    #[test]
    fn failed_transition_keeps_status() {
        let desc = SegmentDescriptor::new(1024);
        assert!(desc.transition(SegmentStatus::Loading).is_err());
        assert_eq!(desc.status(), SegmentStatus::Ready);
    }

    #[test]
    fn reserve_requires_ready() {
        let desc = SegmentDescriptor::new(1024);
        desc.transition(SegmentStatus::Saving).unwrap();
        assert_eq!(desc.try_reserve(10), 0);
    }

    #[test]
    fn throttle_single_claim() {
        let throttle = ReloadThrottle::default();
        assert!(throttle.try_claim());
        assert!(!throttle.try_claim());
        throttle.release();
        assert!(throttle.try_claim());
        throttle.succeeded();
        assert!(throttle.try_claim());
    }

    #[test]
    fn throttle_backs_off() {
        let throttle = ReloadThrottle::default();
        assert!(throttle.try_claim());
        throttle.failed();
        assert!(!throttle.try_claim());
        assert_eq!(throttle.backoff(), Duration::from_millis(20));

        thread::sleep(Duration::from_millis(15));
        assert!(throttle.try_claim());

        for _ in 0..10 {
            throttle.failed();
        }
        assert_eq!(throttle.backoff(), MAX_RELOAD_BACKOFF);
    }
}
