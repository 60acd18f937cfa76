//! Single-writer dedup loop.
//!
//! One thread owns the `DedupExpiryManager`; rebalance commands and
//! application requests share one ordered channel, which is multiplexed with
//! fired timers and shutdown through `crossbeam::select!`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use flowbus_core::{DedupWindow, RequestKey, WallClock};

use super::error::DedupError;
use super::manager::DedupExpiryManager;
use super::timer::{Scheduler, ThreadScheduler, TimerToken};
use crate::bus::{LogPublisher, PartitionCommand};
use crate::config::Config;

/// Rebalance commands and requests, applied in the order they were sent.
pub enum DedupInput {
    Partition(PartitionCommand),
    Request(DedupRequest),
}

pub enum DedupRequest {
    Track {
        request_key: RequestKey,
        respond: Sender<Result<DedupWindow, DedupError>>,
    },
    Clear {
        request_key: RequestKey,
        respond: Sender<Result<bool, DedupError>>,
    },
}

/// Handle to a running dedup loop. Dropping it stops the loop.
pub struct DedupService {
    inputs: Sender<DedupInput>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DedupService {
    pub fn spawn(config: &Config, publisher: Arc<dyn LogPublisher>) -> Result<Self, DedupError> {
        let (fired_tx, fired_rx) = channel::unbounded();
        let scheduler = ThreadScheduler::spawn(fired_tx)?;
        let manager = DedupExpiryManager::new(config, scheduler, publisher);

        let (inputs, inputs_rx) = channel::unbounded();
        let (shutdown, shutdown_rx) = channel::bounded(1);
        let thread = thread::Builder::new()
            .name("flowbus-dedup".into())
            .spawn(move || run_dedup_loop(manager, inputs_rx, fired_rx, shutdown_rx))
            .map_err(DedupError::TimerThread)?;
        Ok(Self {
            inputs,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn send(&self, command: PartitionCommand) -> Result<(), DedupError> {
        self.inputs
            .send(DedupInput::Partition(command))
            .map_err(|_| DedupError::Stopped)
    }

    pub fn track(&self, request_key: RequestKey) -> Result<DedupWindow, DedupError> {
        let (respond, response) = channel::bounded(1);
        self.inputs
            .send(DedupInput::Request(DedupRequest::Track {
                request_key,
                respond,
            }))
            .map_err(|_| DedupError::Stopped)?;
        response.recv().map_err(|_| DedupError::Stopped)?
    }

    pub fn clear(&self, request_key: RequestKey) -> Result<bool, DedupError> {
        let (respond, response) = channel::bounded(1);
        self.inputs
            .send(DedupInput::Request(DedupRequest::Clear {
                request_key,
                respond,
            }))
            .map_err(|_| DedupError::Stopped)?;
        response.recv().map_err(|_| DedupError::Stopped)?
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("dedup loop panicked");
        }
    }
}

impl Drop for DedupService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve inputs and fired timers until shutdown or until every input sender
/// is gone.
pub fn run_dedup_loop<S: Scheduler>(
    mut manager: DedupExpiryManager<S>,
    inputs: Receiver<DedupInput>,
    fired: Receiver<TimerToken>,
    shutdown: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(inputs) -> msg => {
                match msg {
                    Ok(DedupInput::Partition(command)) => {
                        apply_command(&mut manager, command, WallClock::now());
                    }
                    Ok(DedupInput::Request(request)) => {
                        handle_request(&mut manager, request, WallClock::now());
                    }
                    Err(_) => {
                        tracing::debug!("dedup input channel closed");
                        return;
                    }
                }
            }
            recv(fired) -> msg => {
                if let Ok(token) = msg
                    && let Err(err) = manager.on_timer_fired(token, WallClock::now())
                {
                    tracing::warn!("dedup expiry failed: {err}");
                }
            }
            recv(shutdown) -> _ => {
                tracing::debug!("dedup loop shutting down");
                return;
            }
        }
    }
}

fn apply_command<S: Scheduler>(
    manager: &mut DedupExpiryManager<S>,
    command: PartitionCommand,
    now: WallClock,
) {
    match command {
        PartitionCommand::Assign { partition, windows } => {
            if let Err(err) = manager.on_partition_acquired(partition, windows, now) {
                tracing::warn!(%partition, "dedup partition acquisition failed: {err}");
            }
        }
        PartitionCommand::Revoke { partition, keys } => {
            manager.on_partition_lost(partition, &keys);
        }
        PartitionCommand::Committed { partition, updated } => {
            manager.on_committed(partition, &updated);
        }
    }
}

fn handle_request<S: Scheduler>(
    manager: &mut DedupExpiryManager<S>,
    request: DedupRequest,
    now: WallClock,
) {
    // A requester that gave up waiting is not an error.
    match request {
        DedupRequest::Track {
            request_key,
            respond,
        } => {
            let _ = respond.send(manager.track(request_key, now));
        }
        DedupRequest::Clear {
            request_key,
            respond,
        } => {
            let _ = respond.send(manager.clear(&request_key));
        }
    }
}
