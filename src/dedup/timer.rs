//! Expiry timers.
//!
//! A `Scheduler` fires opaque `TimerToken`s at wall clock instants. The
//! manual scheduler is driven by the caller's clock; the thread scheduler
//! sleeps on a background thread and sends fired tokens over a channel.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use flowbus_core::{PartitionId, RequestKey, WallClock};

use super::error::DedupError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

/// What a timer was armed for. `generation` and `timer_id` let the owner
/// recognise callbacks that outlived the ownership they were armed under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerToken {
    pub partition: PartitionId,
    pub request_key: RequestKey,
    pub generation: u64,
    pub timer_id: u64,
}

pub trait Scheduler {
    fn schedule_at(&mut self, at: WallClock, token: TimerToken) -> TimerHandle;
    /// Cancelling a fired or unknown handle is a no-op.
    fn cancel(&mut self, handle: TimerHandle);
}

#[derive(Debug, Default)]
struct TimerQueue {
    due: BinaryHeap<Reverse<(WallClock, TimerHandle)>>,
    armed: HashMap<TimerHandle, TimerToken>,
}

impl TimerQueue {
    fn insert(&mut self, at: WallClock, handle: TimerHandle, token: TimerToken) {
        self.due.push(Reverse((at, handle)));
        self.armed.insert(handle, token);
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.armed.remove(&handle);
    }

    /// Pop every armed timer due at or before `now`, in due order.
    fn pop_due(&mut self, now: WallClock) -> Vec<TimerToken> {
        let mut fired = Vec::new();
        while let Some(Reverse((at, handle))) = self.due.peek().copied() {
            if at > now {
                break;
            }
            self.due.pop();
            if let Some(token) = self.armed.remove(&handle) {
                fired.push(token);
            }
        }
        fired
    }

    fn next_due(&mut self) -> Option<WallClock> {
        // Drop cancelled entries so they do not cause early wakeups.
        while let Some(Reverse((at, handle))) = self.due.peek().copied() {
            if self.armed.contains_key(&handle) {
                return Some(at);
            }
            self.due.pop();
        }
        None
    }
}

/// Caller-driven scheduler for replay and tests.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    queue: TimerQueue,
    next_handle: u64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every timer due at or before `now`.
    pub fn advance_to(&mut self, now: WallClock) -> Vec<TimerToken> {
        self.queue.pop_due(now)
    }

    pub fn pending(&self) -> usize {
        self.queue.armed.len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_at(&mut self, at: WallClock, token: TimerToken) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.queue.insert(at, handle, token);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.queue.cancel(handle);
    }
}

enum TimerCommand {
    Schedule {
        at: WallClock,
        handle: TimerHandle,
        token: TimerToken,
    },
    Cancel(TimerHandle),
}

/// Scheduler backed by one timer thread. Fired tokens are sent on the
/// channel given to `spawn`; the thread stops when the scheduler is dropped
/// or the fired channel closes.
pub struct ThreadScheduler {
    commands: Option<Sender<TimerCommand>>,
    thread: Option<JoinHandle<()>>,
    next_handle: u64,
}

impl ThreadScheduler {
    pub fn spawn(fired: Sender<TimerToken>) -> Result<Self, DedupError> {
        let (commands, rx) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("flowbus-dedup-timers".into())
            .spawn(move || run_timers(rx, fired))
            .map_err(DedupError::TimerThread)?;
        Ok(Self {
            commands: Some(commands),
            thread: Some(thread),
            next_handle: 0,
        })
    }

    fn send(&self, command: TimerCommand) {
        let sent = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(command).is_ok());
        if !sent {
            tracing::warn!("dedup timer thread is gone, timer command dropped");
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_at(&mut self, at: WallClock, token: TimerToken) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.send(TimerCommand::Schedule { at, handle, token });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.send(TimerCommand::Cancel(handle));
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("dedup timer thread panicked");
        }
    }
}

fn run_timers(commands: Receiver<TimerCommand>, fired: Sender<TimerToken>) {
    let mut queue = TimerQueue::default();
    loop {
        let now = WallClock::now();
        for token in queue.pop_due(now) {
            if fired.send(token).is_err() {
                return;
            }
        }

        let command = match queue.next_due() {
            Some(at) => match commands.recv_timeout(Duration::from_millis(at.since(now).max(1))) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
        };
        match command {
            TimerCommand::Schedule { at, handle, token } => queue.insert(at, handle, token),
            TimerCommand::Cancel(handle) => queue.cancel(handle),
        }
    }
}
