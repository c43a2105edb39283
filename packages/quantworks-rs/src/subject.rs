use core::fmt;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::dispatcher::DispatcherHandle;
use crate::error::Result;

/// Order in which subjects sharing a timestamp are dispatched.
///
/// Lower values go first. `Last` sorts after every numeric priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchPriority {
    At(i32),
    #[default]
    Last,
}

impl DispatchPriority {
    pub const FIRST: Self = DispatchPriority::At(0);
    pub const BROKER: Self = DispatchPriority::At(1000);
    pub const BAR_FEED: Self = DispatchPriority::At(2000);
}

impl PartialOrd for DispatchPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DispatchPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DispatchPriority::At(a), DispatchPriority::At(b)) => a.cmp(b),
            (DispatchPriority::At(_), DispatchPriority::Last) => Ordering::Less,
            (DispatchPriority::Last, DispatchPriority::At(_)) => Ordering::Greater,
            (DispatchPriority::Last, DispatchPriority::Last) => Ordering::Equal,
        }
    }
}

/// A time-ordered event source driven by the [`crate::dispatcher::Dispatcher`].
///
/// Per run: `start` once, then any number of `eof`/`peek_date_time`/`dispatch`
/// calls, then `stop` and `join` once each.
pub trait Subject {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Waits for the subject to finish after `stop`.
    fn join(&mut self) -> Result<()>;

    /// True once there are no more events.
    fn eof(&self) -> bool;

    /// Dispatches the pending event(s). Returns true if anything was dispatched.
    fn dispatch(&mut self) -> Result<bool>;

    /// Datetime of the next event, or `None` for realtime subjects whose
    /// next event time isn't known in advance.
    fn peek_date_time(&self) -> Option<DateTime<Utc>>;

    fn dispatch_priority(&self) -> DispatchPriority {
        DispatchPriority::Last
    }

    fn on_dispatcher_registered(&mut self, _dispatcher: &DispatcherHandle) {}
}

impl fmt::Debug for dyn Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("priority", &self.dispatch_priority())
            .field("eof", &self.eof())
            .finish_non_exhaustive()
    }
}

pub type SharedSubject = Rc<RefCell<dyn Subject>>;

/// Identity of a shared subject (its allocation address).
pub(crate) fn subject_id(subject: &SharedSubject) -> *const () {
    Rc::as_ptr(subject).cast::<()>()
}
