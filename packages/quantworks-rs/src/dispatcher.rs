//! Event loop that keeps every registered subject in time order.

use std::cell::Cell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::subject::{subject_id, DispatchPriority, SharedSubject};

#[derive(Debug, Default)]
struct State {
    stopped: Cell<bool>,
    current_date_time: Cell<Option<DateTime<Utc>>>,
    start_event: Event<()>,
    idle_event: Event<()>,
}

/// Cloneable view of a dispatcher, handed to subjects on registration and
/// usable from event handlers while the loop runs.
#[derive(Debug, Clone, Default)]
pub struct DispatcherHandle {
    state: Rc<State>,
}

impl DispatcherHandle {
    /// Requests the loop to stop. Honored at the top of the next round.
    pub fn stop(&self) {
        self.state.stopped.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.get()
    }

    /// Datetime of the round being dispatched. `None` outside `run` and in
    /// rounds where only realtime subjects are due.
    pub fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.state.current_date_time.get()
    }

    /// Emitted once after every subject has been started.
    pub fn start_event(&self) -> &Event<()> {
        &self.state.start_event
    }

    /// Emitted after a round in which no subject dispatched anything.
    pub fn idle_event(&self) -> &Event<()> {
        &self.state.idle_event
    }
}

/// Drives a set of [`crate::subject::Subject`]s in global time order.
///
/// Each round dispatches every subject whose next event is at the smallest
/// pending datetime, plus every realtime subject. Ties are dispatched in
/// priority order, then in registration order.
#[derive(Debug, Default)]
pub struct Dispatcher {
    subjects: Vec<SharedSubject>,
    handle: DispatcherHandle,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn subjects(&self) -> &[SharedSubject] {
        &self.subjects
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn current_date_time(&self) -> Option<DateTime<Utc>> {
        self.handle.current_date_time()
    }

    pub fn start_event(&self) -> &Event<()> {
        self.handle.start_event()
    }

    pub fn idle_event(&self) -> &Event<()> {
        self.handle.idle_event()
    }

    /// Registers a subject. Adding the same subject twice is a no-op.
    pub fn add_subject(&mut self, subject: SharedSubject) {
        let id = subject_id(&subject);
        if self.subjects.iter().any(|s| subject_id(s) == id) {
            return;
        }
        let prio = subject.borrow().dispatch_priority();
        let pos = match prio {
            DispatchPriority::Last => self.subjects.len(),
            DispatchPriority::At(_) => self
                .subjects
                .iter()
                .position(|s| s.borrow().dispatch_priority() > prio)
                .unwrap_or(self.subjects.len()),
        };
        self.subjects.insert(pos, Rc::clone(&subject));
        subject.borrow_mut().on_dispatcher_registered(&self.handle);
        debug!(position = pos, priority = ?prio, "subject registered");
    }

    /// Runs until every subject reaches eof or `stop` is requested.
    ///
    /// Every subject is stopped and then joined on exit, including when a
    /// subject or an event handler fails (or panics). The loop error wins
    /// over cleanup errors.
    pub fn run(&mut self) -> Result<()> {
        debug!(subjects = self.subjects.len(), "dispatcher running");
        let mut cleanup = Cleanup {
            subjects: &self.subjects,
            handle: &self.handle,
            armed: true,
        };
        let outcome = self.run_loop();
        let cleaned = cleanup.finish();
        debug!(ok = outcome.is_ok(), "dispatcher finished");
        match (outcome, cleaned) {
            (Err(err), Err(cleanup_err)) => {
                warn!(error = %cleanup_err, "subject cleanup failed after dispatch error");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), cleaned) => cleaned,
        }
    }

    fn run_loop(&self) -> Result<()> {
        for subject in &self.subjects {
            subject.borrow_mut().start()?;
        }
        self.handle.start_event().emit(&())?;
        while !self.handle.is_stopped() {
            let (eof, dispatched) = self.dispatch_round()?;
            if eof {
                self.handle.stop();
            } else if !dispatched {
                self.handle.idle_event().emit(&())?;
            }
        }
        Ok(())
    }

    fn dispatch_round(&self) -> Result<(bool, bool)> {
        let mut smallest: Option<DateTime<Utc>> = None;
        let mut eof = true;
        for subject in &self.subjects {
            let s = subject.borrow();
            if s.eof() {
                continue;
            }
            eof = false;
            if let Some(dt) = s.peek_date_time() {
                smallest = Some(smallest.map_or(dt, |m| m.min(dt)));
            }
        }

        let mut dispatched = false;
        if !eof {
            // None when only realtime subjects are due
            self.handle.state.current_date_time.set(smallest);
            for subject in &self.subjects {
                if dispatch_subject(subject, smallest)? {
                    dispatched = true;
                }
            }
        }
        trace!(?smallest, eof, dispatched, "dispatch round");
        Ok((eof, dispatched))
    }
}

// eof and peek are checked again: an earlier subject in the same round may
// have changed them.
fn dispatch_subject(subject: &SharedSubject, current: Option<DateTime<Utc>>) -> Result<bool> {
    let due = {
        let s = subject.borrow();
        if s.eof() {
            false
        } else {
            match s.peek_date_time() {
                None => true,
                peek => peek == current,
            }
        }
    };
    if !due {
        return Ok(false);
    }
    subject.borrow_mut().dispatch()
}

struct Cleanup<'a> {
    subjects: &'a [SharedSubject],
    handle: &'a DispatcherHandle,
    armed: bool,
}

impl Cleanup<'_> {
    /// Stops then joins every subject, in order. Returns the first error.
    fn finish(&mut self) -> Result<()> {
        self.armed = false;
        self.handle.state.current_date_time.set(None);
        let mut first: Option<Error> = None;
        for subject in self.subjects {
            if let Err(err) = subject.borrow_mut().stop() {
                warn!(error = %err, "subject stop failed");
                first.get_or_insert(err);
            }
        }
        for subject in self.subjects {
            if let Err(err) = subject.borrow_mut().join() {
                warn!(error = %err, "subject join failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // unwinding: best effort, skip subjects still borrowed
        self.handle.state.current_date_time.set(None);
        for subject in self.subjects {
            if let Ok(mut s) = subject.try_borrow_mut() {
                let _ = s.stop();
            }
        }
        for subject in self.subjects {
            if let Ok(mut s) = subject.try_borrow_mut() {
                let _ = s.join();
            }
        }
    }
}
