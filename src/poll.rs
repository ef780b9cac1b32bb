/*
 * Poll Waiter Registry
 *
 * Callers that want to sleep until a device becomes ready hand the device a
 * PollFd: the set of events they care about plus a small counting
 * semaphore the device posts to when one of those events happens.
 *
 * ## IRQ Safety
 *
 * Registration and removal run on caller threads. Notification usually
 * runs in interrupt context, right after the device noticed new data.
 * Each slot carries an atomic state; a caller claims a slot with a
 * compare-exchange before it fills or clears it, and only then write-locks
 * the slot's contents. Notification only reads READY slots with
 * `try_read`, so it never waits, and it can only miss a waiter that is in
 * the middle of being stored or removed. The caller re-checks readiness
 * after storing, which covers the one event such a miss could lose.
 */

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::RwLock;

use crate::error::{DeviceError, Result};

/// Maximum number of concurrent poll waiters per device
pub const MAX_POLL_WAITERS: usize = 8;

/// Marker stored in a PollFd that is not registered anywhere
const NO_SLOT: usize = usize::MAX;

bitflags! {
    /// Poll event set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollEvents: u16 {
        /// Data can be read without blocking
        const IN = 0x01;
        /// Urgent data can be read
        const PRI = 0x02;
        /// Data can be written without blocking
        const OUT = 0x04;
        /// The device hit an error
        const ERR = 0x08;
        /// The device hung up
        const HUP = 0x10;
        /// The descriptor is not valid
        const NVAL = 0x20;
    }
}

/// Index of the slot a waiter occupies, returned at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollHandle(usize);

impl PollHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A poll waiter
///
/// Owned by the caller and shared with the device for as long as it is
/// registered.
pub struct PollFd {
    events: PollEvents,
    revents: AtomicU16,
    posts: AtomicU32,
    slot: AtomicUsize,
}

impl PollFd {
    /// Create a waiter interested in `events`
    pub fn new(events: PollEvents) -> Arc<Self> {
        Arc::new(Self {
            events,
            revents: AtomicU16::new(0),
            posts: AtomicU32::new(0),
            slot: AtomicUsize::new(NO_SLOT),
        })
    }

    /// Requested events
    pub fn events(&self) -> PollEvents {
        self.events
    }

    /// Events reported so far
    pub fn revents(&self) -> PollEvents {
        PollEvents::from_bits_truncate(self.revents.load(Ordering::Acquire))
    }

    /// Return and clear the reported events
    pub fn take_revents(&self) -> PollEvents {
        PollEvents::from_bits_truncate(self.revents.swap(0, Ordering::AcqRel))
    }

    /// The slot this waiter occupies, if registered
    pub fn handle(&self) -> Option<PollHandle> {
        match self.slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            idx => Some(PollHandle(idx)),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.handle().is_some()
    }

    /// Merge `events` (filtered by the requested mask) into the reported set
    /// and wake the waiter if anything matched
    ///
    /// Returns true if the waiter was woken. IRQ-safe.
    pub fn notify(&self, events: PollEvents) -> bool {
        let hit = self.events & events;
        if hit.is_empty() {
            return false;
        }
        self.revents.fetch_or(hit.bits(), Ordering::AcqRel);
        self.post();
        true
    }

    /// Post the waiter's semaphore. IRQ-safe.
    pub fn post(&self) {
        self.posts.fetch_add(1, Ordering::Release);
    }

    /// Consume one post if there is one
    pub fn try_wait(&self) -> bool {
        self.posts
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Block until posted
    ///
    /// There is no timeout; callers needing one poll `try_wait` instead.
    pub fn wait(&self) {
        while !self.try_wait() {
            core::hint::spin_loop();
        }
    }

    /// Number of posts not yet consumed
    pub fn pending_posts(&self) -> u32 {
        self.posts.load(Ordering::Acquire)
    }
}

impl fmt::Debug for PollFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollFd")
            .field("events", &self.events)
            .field("revents", &self.revents())
            .field("slot", &self.handle())
            .finish()
    }
}

// Slot states. Only the caller that moved a slot to BUSY may touch its
// contents; notifiers look at READY slots only.
const SLOT_FREE: u8 = 0;
const SLOT_BUSY: u8 = 1;
const SLOT_READY: u8 = 2;

struct Slot {
    state: AtomicU8,
    /// Address of the waiter held while READY
    owner: AtomicUsize,
    fd: RwLock<Option<Arc<PollFd>>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_FREE),
            owner: AtomicUsize::new(0),
            fd: RwLock::new(None),
        }
    }

    fn holds(&self, fd: &Arc<PollFd>) -> bool {
        self.state.load(Ordering::Acquire) == SLOT_READY
            && self.owner.load(Ordering::Acquire) == Arc::as_ptr(fd) as usize
    }
}

/// Fixed-capacity set of registered waiters
///
/// Occupancy lives in per-slot atomics, so scanning the set (`store`,
/// `len`) never holds a slot a notifier needs. A slot's contents are only
/// write-locked while it is being filled or cleared, and notifiers only
/// ever read them, so a waiter that stays registered is never skipped.
pub struct PollSet {
    slots: [Slot; MAX_POLL_WAITERS],
}

impl PollSet {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::new()),
        }
    }

    /// Store a waiter in a free slot
    ///
    /// Storing a waiter that is already in this set returns its existing
    /// handle. Fails with [`DeviceError::CapacityExceeded`] when all slots
    /// are taken; the waiters already stored are left untouched.
    pub fn store(&self, fd: &Arc<PollFd>) -> Result<PollHandle> {
        if let Some(handle) = fd.handle() {
            if self.slots[handle.0].holds(fd) {
                return Ok(handle);
            }
        }

        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(SLOT_FREE, SLOT_BUSY, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            *slot.fd.write() = Some(fd.clone());
            slot.owner.store(Arc::as_ptr(fd) as usize, Ordering::Release);
            fd.slot.store(idx, Ordering::Release);
            slot.state.store(SLOT_READY, Ordering::Release);
            return Ok(PollHandle(idx));
        }

        Err(DeviceError::CapacityExceeded)
    }

    /// Remove a waiter
    ///
    /// Removing a waiter that is not stored (or was already removed) is a
    /// no-op.
    pub fn remove(&self, fd: &Arc<PollFd>) {
        let Some(handle) = fd.handle() else {
            return;
        };

        let slot = &self.slots[handle.0];
        if !slot.holds(fd) {
            return;
        }
        if slot
            .state
            .compare_exchange(SLOT_READY, SLOT_BUSY, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        // The slot may have been cleared and refilled by someone else
        // between the ownership check and the claim.
        if slot.owner.load(Ordering::Acquire) != Arc::as_ptr(fd) as usize {
            slot.state.store(SLOT_READY, Ordering::Release);
            return;
        }

        *slot.fd.write() = None;
        slot.owner.store(0, Ordering::Release);
        fd.slot.store(NO_SLOT, Ordering::Release);
        slot.state.store(SLOT_FREE, Ordering::Release);
    }

    /// Announce `events` to every waiter whose mask intersects them
    ///
    /// Returns the number of waiters woken. Safe to call from interrupt
    /// context. The post happens while the slot is read-held, so a waiter
    /// whose removal has completed is never woken afterwards.
    pub fn notify(&self, events: PollEvents) -> usize {
        self.notify_with(events, |fd, events| fd.notify(events))
    }

    /// Same as [`PollSet::notify`] with a custom per-waiter step
    pub(crate) fn notify_with<F>(&self, events: PollEvents, mut one: F) -> usize
    where
        F: FnMut(&PollFd, PollEvents) -> bool,
    {
        let mut woken = 0;
        for slot in &self.slots {
            if slot.state.load(Ordering::Acquire) != SLOT_READY {
                continue;
            }
            // Fails only while the slot is being filled or cleared.
            if let Some(held) = slot.fd.try_read() {
                if let Some(fd) = held.as_ref() {
                    if one(fd, events) {
                        woken += 1;
                    }
                }
            }
        }
        woken
    }

    /// Number of registered waiters
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.load(Ordering::Acquire) == SLOT_READY)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn ninth_waiter_is_rejected_and_first_eight_survive() {
        let set = PollSet::new();
        let fds: Vec<_> = (0..MAX_POLL_WAITERS).map(|_| PollFd::new(PollEvents::IN)).collect();

        for fd in &fds {
            set.store(fd).unwrap();
        }

        let ninth = PollFd::new(PollEvents::IN);
        assert_eq!(set.store(&ninth), Err(DeviceError::CapacityExceeded));
        assert!(!ninth.is_registered());
        assert_eq!(set.len(), MAX_POLL_WAITERS);

        for fd in &fds {
            assert!(fd.is_registered());
            set.remove(fd);
            assert!(!fd.is_registered());
        }
        assert!(set.is_empty());
    }

    #[test]
    fn notify_wakes_only_matching_waiters() {
        let set = PollSet::new();
        let reader = PollFd::new(PollEvents::IN);
        let writer = PollFd::new(PollEvents::OUT);
        let both = PollFd::new(PollEvents::IN | PollEvents::OUT);
        for fd in [&reader, &writer, &both] {
            set.store(fd).unwrap();
        }

        assert_eq!(set.notify(PollEvents::IN), 2);

        assert_eq!(reader.revents(), PollEvents::IN);
        assert!(reader.try_wait());
        assert!(writer.revents().is_empty());
        assert!(!writer.try_wait());
        assert_eq!(both.revents(), PollEvents::IN);
        assert!(both.try_wait());
    }

    #[test]
    fn removed_waiter_is_never_notified() {
        let set = PollSet::new();
        let fd = PollFd::new(PollEvents::IN);
        set.store(&fd).unwrap();
        set.remove(&fd);

        assert_eq!(set.notify(PollEvents::IN), 0);
        assert_eq!(fd.pending_posts(), 0);

        // Double removal is tolerated.
        set.remove(&fd);
    }

    #[test]
    fn storing_twice_keeps_a_single_slot() {
        let set = PollSet::new();
        let fd = PollFd::new(PollEvents::IN);
        let first = set.store(&fd).unwrap();
        let second = set.store(&fd).unwrap();
        assert_eq!(first, second);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn freed_slot_is_reused() {
        let set = PollSet::new();
        let a = PollFd::new(PollEvents::IN);
        let b = PollFd::new(PollEvents::IN);
        let ha = set.store(&a).unwrap();
        set.remove(&a);
        let hb = set.store(&b).unwrap();
        assert_eq!(ha.index(), hb.index());
    }

    #[test]
    fn removal_does_not_touch_a_slot_reused_by_another_waiter() {
        let set = PollSet::new();
        let a = PollFd::new(PollEvents::IN);
        let b = PollFd::new(PollEvents::IN);
        set.store(&a).unwrap();
        set.remove(&a);
        set.store(&b).unwrap();

        // `a` is no longer registered; removing it again must leave `b` alone.
        set.remove(&a);
        assert!(b.is_registered());
        assert_eq!(set.notify(PollEvents::IN), 1);
    }

    #[test]
    fn registered_waiter_is_never_skipped_while_others_churn() {
        use core::sync::atomic::AtomicBool;

        let set = Arc::new(PollSet::new());
        let reader = PollFd::new(PollEvents::IN);
        set.store(&reader).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mut helpers = Vec::new();
        {
            let set = set.clone();
            let stop = stop.clone();
            helpers.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    assert!(set.len() >= 1);
                }
            }));
        }
        for _ in 0..2 {
            let set = set.clone();
            let stop = stop.clone();
            helpers.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let writer = PollFd::new(PollEvents::OUT);
                    if set.store(&writer).is_ok() {
                        set.remove(&writer);
                    }
                }
            }));
        }

        const ROUNDS: u32 = 50_000;
        for _ in 0..ROUNDS {
            assert_eq!(set.notify(PollEvents::IN), 1);
        }
        stop.store(true, Ordering::Relaxed);
        for helper in helpers {
            helper.join().unwrap();
        }

        assert_eq!(reader.pending_posts(), ROUNDS);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn semaphore_counts_posts() {
        let fd = PollFd::new(PollEvents::IN);
        assert!(!fd.try_wait());
        fd.post();
        fd.post();
        assert!(fd.try_wait());
        fd.wait();
        assert!(!fd.try_wait());
        assert_eq!(fd.take_revents(), PollEvents::empty());
    }
}
