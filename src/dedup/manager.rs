//! Partition-aware dedup window expiry.
//!
//! Windows live per owned partition. Each acquisition of a partition starts a
//! new generation; timers carry the generation they were armed under, and a
//! fired timer only clears its window when the partition is still owned at
//! that generation and the window still holds that same timer.

use std::collections::HashMap;
use std::sync::Arc;

use flowbus_core::{DedupWindow, InstanceId, PartitionId, RequestKey, WallClock, partition_for};

use super::error::DedupError;
use super::timer::{Scheduler, TimerHandle, TimerToken};
use crate::bus::{LogPublisher, PublishError};
use crate::config::Config;
use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearReason {
    /// Already expired when the partition was acquired.
    Expired,
    /// The window's expiry timer fired.
    Timer,
    Explicit,
}

impl ClearReason {
    fn as_str(self) -> &'static str {
        match self {
            ClearReason::Expired => "expired",
            ClearReason::Timer => "timer",
            ClearReason::Explicit => "explicit",
        }
    }
}

/// A window removed from the dedup state topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupClear {
    pub partition: PartitionId,
    pub request_key: RequestKey,
    pub reason: ClearReason,
}

#[derive(Debug)]
struct Tracked {
    window: DedupWindow,
    timer: Option<(TimerHandle, u64)>,
}

#[derive(Debug, Default)]
struct OwnedPartition {
    generation: u64,
    windows: HashMap<RequestKey, Tracked>,
}

pub struct DedupExpiryManager<S: Scheduler> {
    instance: InstanceId,
    scheduler: S,
    publisher: Arc<dyn LogPublisher>,
    topic: String,
    window_ms: u64,
    clear_retry_ms: u64,
    partition_count: u32,
    /// Last generation handed out per partition, kept across losses.
    generations: HashMap<PartitionId, u64>,
    owned: HashMap<PartitionId, OwnedPartition>,
    next_timer_id: u64,
}

impl<S: Scheduler> DedupExpiryManager<S> {
    pub fn new(config: &Config, scheduler: S, publisher: Arc<dyn LogPublisher>) -> Self {
        Self {
            instance: config.instance.instance_id(),
            scheduler,
            publisher,
            topic: config.topics.dedup_state.clone(),
            window_ms: config.dedup.window_ms,
            clear_retry_ms: config.dedup.clear_retry_ms.max(1),
            partition_count: config.instance.partition_count.max(1),
            generations: HashMap::new(),
            owned: HashMap::new(),
            next_timer_id: 0,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn partition_of(&self, request_key: &RequestKey) -> PartitionId {
        partition_for(request_key.as_str(), self.partition_count)
    }

    pub fn owns(&self, partition: PartitionId) -> bool {
        self.owned.contains_key(&partition)
    }

    pub fn generation(&self, partition: PartitionId) -> u64 {
        self.generations.get(&partition).copied().unwrap_or(0)
    }

    pub fn is_tracked(&self, request_key: &RequestKey) -> bool {
        self.owned
            .get(&self.partition_of(request_key))
            .is_some_and(|owned| owned.windows.contains_key(request_key))
    }

    pub fn timers_active(&self) -> usize {
        self.owned
            .values()
            .flat_map(|owned| owned.windows.values())
            .filter(|tracked| tracked.timer.is_some())
            .count()
    }

    /// Take ownership of `partition` with the windows synced from the state
    /// topic. Expired windows are cleared at once, live ones get a timer.
    ///
    /// Every window is handled before an error is reported. Expired windows
    /// whose tombstone could not be published stay tracked with a retry
    /// timer and are named in `DedupError::ClearsDeferred`.
    pub fn on_partition_acquired(
        &mut self,
        partition: PartitionId,
        windows: Vec<DedupWindow>,
        now: WallClock,
    ) -> Result<Vec<DedupClear>, DedupError> {
        if self.owns(partition) {
            self.cancel_partition(partition);
        }
        let generation = self.generation(partition) + 1;
        self.generations.insert(partition, generation);
        self.owned.insert(
            partition,
            OwnedPartition {
                generation,
                windows: HashMap::new(),
            },
        );
        tracing::info!(
            instance = %self.instance,
            %partition,
            generation,
            windows = windows.len(),
            "dedup partition acquired"
        );

        let mut cleared = Vec::new();
        let mut deferred = Vec::new();
        let mut first_failure = None;
        for window in windows {
            if window.partition != partition {
                tracing::warn!(
                    %partition,
                    request_key = %window.request_key,
                    window_partition = %window.partition,
                    "skipping dedup window synced from another partition"
                );
                continue;
            }
            if !window.is_expired(now) {
                let expiry = window.expiry;
                self.arm(partition, window, expiry);
                continue;
            }
            match self.publish_clear(partition, &window.request_key, ClearReason::Expired) {
                Ok(()) => cleared.push(DedupClear {
                    partition,
                    request_key: window.request_key,
                    reason: ClearReason::Expired,
                }),
                Err(err) => {
                    deferred.push(window.request_key.clone());
                    first_failure.get_or_insert(err);
                    self.arm_retry(partition, window, now);
                }
            }
        }
        metrics::dedup_timers_active(self.instance, self.timers_active());
        match first_failure {
            None => Ok(cleared),
            Some(source) => Err(DedupError::ClearsDeferred {
                partition,
                keys: deferred,
                source,
            }),
        }
    }

    /// Drop ownership of `partition`. Every timer of the partition is
    /// cancelled and the generation moves on, so a callback that already
    /// fired is recognised as stale when it arrives.
    pub fn on_partition_lost(&mut self, partition: PartitionId, keys: &[RequestKey]) -> usize {
        let Some(owned) = self.owned.get(&partition) else {
            tracing::debug!(%partition, "lost a dedup partition that was not owned");
            return 0;
        };
        let untracked = keys
            .iter()
            .filter(|key| !owned.windows.contains_key(*key))
            .count();
        if untracked > 0 {
            tracing::debug!(%partition, untracked, "revoked keys without a tracked window");
        }
        let cancelled = self.cancel_partition(partition);
        self.owned.remove(&partition);
        let generation = self.generation(partition) + 1;
        self.generations.insert(partition, generation);
        tracing::info!(instance = %self.instance, %partition, cancelled, "dedup partition lost");
        metrics::dedup_timers_active(self.instance, self.timers_active());
        cancelled
    }

    /// Commits only confirm what this worker already knows.
    pub fn on_committed(
        &mut self,
        partition: PartitionId,
        updated: &[(RequestKey, Option<DedupWindow>)],
    ) {
        let removed = updated.iter().filter(|(_, window)| window.is_none()).count();
        tracing::debug!(
            %partition,
            updated = updated.len() - removed,
            removed,
            owned = self.owns(partition),
            "dedup state committed"
        );
    }

    /// Open a window for `request_key` on its (owned) partition.
    pub fn track(
        &mut self,
        request_key: RequestKey,
        now: WallClock,
    ) -> Result<DedupWindow, DedupError> {
        let partition = self.partition_of(&request_key);
        if !self.owns(partition) {
            return Err(DedupError::PartitionNotOwned { partition });
        }
        let window = DedupWindow::new(request_key, now.saturating_add_ms(self.window_ms), partition);
        let value = serde_json::to_vec(&window.to_record()).map_err(|source| DedupError::Encode {
            request_key: window.request_key.clone(),
            source,
        })?;
        self.publisher
            .publish(&self.topic, window.request_key.as_str(), Some(&value))?;
        if let Some(previous) = self
            .owned
            .get_mut(&partition)
            .and_then(|owned| owned.windows.remove(&window.request_key))
            && let Some((handle, _)) = previous.timer
        {
            self.scheduler.cancel(handle);
        }
        tracing::debug!(
            %partition,
            request_key = %window.request_key,
            expiry = %window.expiry,
            "dedup window tracked"
        );
        self.arm(partition, window.clone(), window.expiry);
        Ok(window)
    }

    /// Clear a window before it expires. Returns false if it was not tracked.
    /// A window whose tombstone fails to publish stays tracked.
    pub fn clear(&mut self, request_key: &RequestKey) -> Result<bool, DedupError> {
        let partition = self.partition_of(request_key);
        let Some(owned) = self.owned.get(&partition) else {
            return Err(DedupError::PartitionNotOwned { partition });
        };
        if !owned.windows.contains_key(request_key) {
            return Ok(false);
        }
        self.publish_clear(partition, request_key, ClearReason::Explicit)?;
        if let Some(tracked) = self.untrack(partition, request_key)
            && let Some((handle, _)) = tracked.timer
        {
            self.scheduler.cancel(handle);
        }
        Ok(true)
    }

    /// Handle a fired expiry timer. Stale callbacks are counted and ignored.
    /// When the tombstone cannot be published the window keeps its place and
    /// is re-armed `clear_retry_ms` later.
    pub fn on_timer_fired(
        &mut self,
        token: TimerToken,
        now: WallClock,
    ) -> Result<Option<DedupClear>, DedupError> {
        let current = self
            .owned
            .get(&token.partition)
            .filter(|owned| owned.generation == token.generation)
            .and_then(|owned| owned.windows.get(&token.request_key))
            .filter(|tracked| tracked.timer.is_some_and(|(_, id)| id == token.timer_id))
            .map(|tracked| tracked.window.clone());
        let Some(window) = current else {
            tracing::debug!(
                partition = %token.partition,
                request_key = %token.request_key,
                generation = token.generation,
                "ignoring stale dedup timer"
            );
            metrics::dedup_stale_timer();
            return Ok(None);
        };

        tracing::debug!(
            partition = %token.partition,
            request_key = %token.request_key,
            late_ms = now.since(window.expiry),
            "dedup window expired"
        );
        if let Err(err) = self.publish_clear(token.partition, &token.request_key, ClearReason::Timer) {
            self.arm_retry(token.partition, window, now);
            return Err(err.into());
        }
        self.untrack(token.partition, &token.request_key);
        metrics::dedup_timers_active(self.instance, self.timers_active());
        Ok(Some(DedupClear {
            partition: token.partition,
            request_key: token.request_key,
            reason: ClearReason::Timer,
        }))
    }

    /// Arm a timer for `window` at `at`, replacing whatever it held before.
    fn arm(&mut self, partition: PartitionId, window: DedupWindow, at: WallClock) {
        let Some(owned) = self.owned.get_mut(&partition) else {
            return;
        };
        self.next_timer_id += 1;
        let timer_id = self.next_timer_id;
        let token = TimerToken {
            partition,
            request_key: window.request_key.clone(),
            generation: owned.generation,
            timer_id,
        };
        let handle = self.scheduler.schedule_at(at, token);
        owned.windows.insert(
            window.request_key.clone(),
            Tracked {
                window,
                timer: Some((handle, timer_id)),
            },
        );
    }

    fn arm_retry(&mut self, partition: PartitionId, window: DedupWindow, now: WallClock) {
        let retry_at = now.saturating_add_ms(self.clear_retry_ms);
        tracing::warn!(
            %partition,
            request_key = %window.request_key,
            %retry_at,
            "dedup window clear failed, will retry"
        );
        self.arm(partition, window, retry_at);
    }

    fn untrack(&mut self, partition: PartitionId, request_key: &RequestKey) -> Option<Tracked> {
        self.owned.get_mut(&partition)?.windows.remove(request_key)
    }

    fn cancel_partition(&mut self, partition: PartitionId) -> usize {
        let Some(owned) = self.owned.get_mut(&partition) else {
            return 0;
        };
        let mut cancelled = 0;
        for tracked in owned.windows.values_mut() {
            if let Some((handle, _)) = tracked.timer.take() {
                self.scheduler.cancel(handle);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn publish_clear(
        &self,
        partition: PartitionId,
        request_key: &RequestKey,
        reason: ClearReason,
    ) -> Result<(), PublishError> {
        self.publisher.publish(&self.topic, request_key.as_str(), None)?;
        tracing::debug!(%partition, %request_key, reason = reason.as_str(), "dedup window cleared");
        metrics::dedup_cleared(partition, reason.as_str());
        Ok(())
    }
}
