use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

/// Single-shot timer owned by the reliable manager.
///
/// Arming replaces any previously armed expiry. The host calls back into the
/// manager on the same work queue when the timer fires.
pub trait TimerDriver {
    fn arm(&mut self, delay: Duration);
    fn cancel(&mut self);
}

/// Timer that only records what it was asked to do.
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    armed: Rc<Cell<Option<Duration>>>,
    arm_count: Rc<Cell<u64>>,
}

impl ManualTimer {
    /// Delay of the currently armed expiry, if any.
    pub fn armed(&self) -> Option<Duration> {
        self.armed.get()
    }

    pub fn arm_count(&self) -> u64 {
        self.arm_count.get()
    }
}

impl TimerDriver for ManualTimer {
    fn arm(&mut self, delay: Duration) {
        self.armed.set(Some(delay));
        self.arm_count.set(self.arm_count.get() + 1);
    }

    fn cancel(&mut self) {
        self.armed.set(None);
    }
}
