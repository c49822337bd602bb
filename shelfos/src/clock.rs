//! Wall-clock time. The host runtime is assumed to provide a millisecond
//! epoch clock; this module only wraps it the way the rest of the fabric
//! wants to consume it (comparable, subtractable, mockable in tests).
use std::cell::RefCell;
use std::rc::Rc;

pub use localtime::{LocalDuration, LocalTime};

/// Milliseconds since the Unix epoch, as carried on the wire.
pub type Timestamp = i64;

/// A clock the scheduler owns and threads (by reference) into the envelope,
/// pairing and discovery subsystems. Single-threaded cooperative loop, so
/// interior mutability is enough -- no locking.
#[derive(Debug, Clone)]
pub struct RefClock(Rc<RefCell<LocalTime>>);

impl RefClock {
    pub fn new(now: LocalTime) -> Self {
        Self(Rc::new(RefCell::new(now)))
    }

    /// A clock seeded at the current wall-clock time.
    pub fn now() -> Self {
        Self::new(LocalTime::now())
    }

    pub fn local_time(&self) -> LocalTime {
        *self.0.borrow()
    }

    pub fn timestamp_millis(&self) -> Timestamp {
        self.local_time().as_millis() as Timestamp
    }

    /// Advance (or set) the clock. Used by the scheduler on every tick, and
    /// by tests to simulate the passage of time without sleeping.
    pub fn set(&self, now: LocalTime) {
        *self.0.borrow_mut() = now;
    }

    pub fn elapse(&self, duration: LocalDuration) {
        let mut t = self.0.borrow_mut();
        *t = *t + duration;
    }
}

impl Default for RefClock {
    fn default() -> Self {
        Self::now()
    }
}
