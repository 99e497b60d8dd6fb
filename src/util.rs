use std::fmt::{Debug, Formatter};

use tokio::task::JoinHandle;

/// Explicit owner for a spawned timer task, so cancellation is a call on a handle rather
///  than something implicit in closure lifetimes.
///
/// Every handle must be released on exactly one terminal path. Aborting an already
///  finished task is a no-op, so the normal-completion path may release as well.
pub struct TimerHandle {
    task: JoinHandle<()>,
}
impl TimerHandle {
    pub fn new(task: JoinHandle<()>) -> TimerHandle {
        TimerHandle { task }
    }

    pub fn release(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
impl Debug for TimerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimerHandle{{finished:{}}}", self.task.is_finished())
    }
}
