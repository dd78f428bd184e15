//! Views: a grid table kept in sync with its source tables.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use changelog::{
    ChangeLog, ChangeLogExt, CheckpointStore, CheckpointStoreExt, EntityKey, SequenceId,
};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::{LastUpdateTimeCache, cache_key};
use crate::config::ViewConfig;
use crate::grid::{GridChanges, Projector};
use crate::storage::{HeldLock, MviewBackend};
use crate::subscription::Subscription;
use crate::{MviewError, Result};

/// Phase of a refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    #[default]
    Idle,
    Scanning,
    Applying,
    Checkpointing,
}

impl RefreshState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Scanning => "scanning",
            RefreshState::Applying => "applying",
            RefreshState::Checkpointing => "checkpointing",
        }
    }
}

impl std::fmt::Display for RefreshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a completed refresh did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub batches: usize,
    /// Distinct keys taken from the changelog.
    pub keys: usize,
    pub upserted: usize,
    pub deleted: usize,
    /// Keys refreshed because their `updated_at` moved past the cache
    /// without a changelog entry.
    pub reconciled: usize,
    /// Checkpoint after the refresh.
    pub checkpoint: SequenceId,
}

impl RefreshReport {
    fn starting_at(checkpoint: SequenceId) -> Self {
        Self {
            batches: 0,
            keys: 0,
            upserted: 0,
            deleted: 0,
            reconciled: 0,
            checkpoint,
        }
    }
}

/// Result of [`View::refresh_by_schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed(RefreshReport),
    /// Nothing changed since the last refresh.
    Skipped,
    /// Another refresh of the view is running.
    Busy,
    /// Failed with a transient error; the next scheduled run retries.
    /// Only reported by [`ViewProcessor::update`](crate::ViewProcessor::update).
    Retry { reason: String },
}

/// Snapshot of a view's progress.
#[derive(Debug, Clone, Serialize)]
pub struct ViewStatus {
    pub view_id: String,
    pub group: Option<String>,
    pub grid_table: String,
    pub walker: &'static str,
    pub state: RefreshState,
    pub checkpoint: SequenceId,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub changelog_head: SequenceId,
    /// Sequence ids between the checkpoint and the head. An upper bound
    /// on pending entries.
    pub lag: i64,
}

/// Current `updated_at` of one watched table next to its cached value.
#[derive(Debug)]
struct UpdateProbe {
    table: String,
    key_column: String,
    column: String,
    cache_key: String,
    cached: Option<DateTime<Utc>>,
    current: Option<DateTime<Utc>>,
}

impl UpdateProbe {
    fn unchanged(&self) -> bool {
        self.cached == self.current
    }

    /// The cached value, when the table moved past it.
    fn moved_since(&self) -> Option<DateTime<Utc>> {
        match (self.cached, self.current) {
            (Some(cached), Some(current)) if current > cached => Some(cached),
            _ => None,
        }
    }
}

/// Puts the view back to idle however the cycle ends.
struct BackToIdle<'a>(&'a StdMutex<RefreshState>);

impl Drop for BackToIdle<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *state = RefreshState::Idle;
    }
}

/// One materialized view bound to its database.
pub struct View<B: MviewBackend> {
    config: Arc<ViewConfig>,
    backend: B,
    changelog: B::ChangeLog,
    cache: LastUpdateTimeCache,
    refresh: Mutex<()>,
    state: StdMutex<RefreshState>,
}

impl<B: MviewBackend> View<B> {
    pub fn new(config: Arc<ViewConfig>, backend: B, cache: LastUpdateTimeCache) -> Result<Self> {
        let changelog = backend.changelog(&config.changelog_name)?;
        Ok(Self {
            config,
            backend,
            changelog,
            cache,
            refresh: Mutex::new(()),
            state: StdMutex::new(RefreshState::Idle),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &Arc<ViewConfig> {
        &self.config
    }

    pub fn changelog(&self) -> &B::ChangeLog {
        &self.changelog
    }

    pub fn state(&self) -> RefreshState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: RefreshState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Creates the changelog and installs capture on every watched table.
    /// Safe to repeat.
    #[tracing::instrument(skip(self), fields(view_id = %self.config.id))]
    pub async fn subscribe(&self) -> Result<()> {
        self.changelog.create().await?;
        for subscription in &self.config.subscriptions {
            Subscription::new(&self.backend, subscription)
                .subscribe()
                .await?;
        }
        tracing::info!(tables = self.config.subscriptions.len(), "view subscribed");
        Ok(())
    }

    /// Removes capture from every watched table. The changelog and the
    /// checkpoint stay.
    #[tracing::instrument(skip(self), fields(view_id = %self.config.id))]
    pub async fn unsubscribe(&self) -> Result<()> {
        for subscription in &self.config.subscriptions {
            Subscription::new(&self.backend, subscription)
                .unsubscribe()
                .await?;
        }
        tracing::info!("view unsubscribed");
        Ok(())
    }

    /// Unsubscribes and drops the changelog, the checkpoint and the cached
    /// update times.
    #[tracing::instrument(skip(self), fields(view_id = %self.config.id))]
    pub async fn teardown(&self) -> Result<()> {
        let _local = self.refresh.lock().await;
        self.unsubscribe().await?;
        self.changelog.remove().await?;
        self.backend.checkpoints().remove(&self.config.id).await?;
        for probe_key in self.cache_keys() {
            self.cache.remove(&probe_key);
        }
        tracing::info!("view torn down");
        Ok(())
    }

    /// Deletes changelog entries the checkpoint has passed.
    pub async fn prune(&self) -> Result<u64> {
        let pruned = self
            .changelog
            .prune_consumed(self.backend.checkpoints(), &[self.config.id.clone()])
            .await?;
        Ok(pruned)
    }

    pub async fn status(&self) -> Result<ViewStatus> {
        let checkpoint = self.backend.checkpoints().load(&self.config.id).await?;
        let position = checkpoint
            .as_ref()
            .map(|c| c.last_processed_sequence_id)
            .unwrap_or_else(SequenceId::initial);
        let head = if self.changelog.exists().await? {
            self.changelog.current_sequence().await?
        } else {
            SequenceId::initial()
        };

        Ok(ViewStatus {
            view_id: self.config.id.clone(),
            group: self.config.group.clone(),
            grid_table: self.config.grid.table.clone(),
            walker: self.config.walker.name(),
            state: self.state(),
            checkpoint: position,
            last_processed_at: checkpoint.map(|c| c.last_processed_at),
            changelog_head: head,
            lag: (head.as_i64() - position.as_i64()).max(0),
        })
    }

    /// Applies pending changes to the grid.
    ///
    /// Returns [`RefreshOutcome::Busy`] without waiting when another
    /// refresh of this view is running, here or in another process.
    #[tracing::instrument(skip(self), fields(view_id = %self.config.id))]
    pub async fn refresh_by_schedule(&self) -> Result<RefreshOutcome> {
        let Ok(_local) = self.refresh.try_lock() else {
            tracing::debug!("refresh already running in this process");
            return Ok(RefreshOutcome::Busy);
        };
        let Some(lock) = self.backend.try_lock_view(&self.config.id).await? else {
            tracing::debug!("refresh lock held by another worker");
            return Ok(RefreshOutcome::Busy);
        };

        let started = Instant::now();
        let result = self.run_incremental().await;
        self.finish(lock, result, started).await
    }

    /// Rebuilds the whole grid from the main table, then moves the
    /// checkpoint to the changelog head seen before the rebuild.
    ///
    /// Waits for a refresh running in this process; fails with
    /// [`MviewError::RefreshInProgress`] when another process holds the
    /// view.
    #[tracing::instrument(skip(self), fields(view_id = %self.config.id))]
    pub async fn refresh_complete(&self) -> Result<RefreshReport> {
        let _local = self.refresh.lock().await;
        let Some(lock) = self.backend.try_lock_view(&self.config.id).await? else {
            return Err(MviewError::RefreshInProgress(self.config.id.clone()));
        };

        let started = Instant::now();
        let result = self.run_complete().await;
        self.finish(lock, result, started).await
    }

    async fn finish<T>(
        &self,
        mut lock: Box<dyn HeldLock>,
        result: Result<T>,
        started: Instant,
    ) -> Result<T> {
        let released = lock.release().await;
        metrics::histogram!("mview_refresh_duration_seconds", "view_id" => self.config.id.clone())
            .record(started.elapsed().as_secs_f64());

        let value = result.inspect_err(|err| {
            if err.is_transient() {
                tracing::warn!(error = %err, "refresh failed, will retry");
            } else {
                tracing::error!(error = %err, "refresh failed");
            }
        })?;
        released?;
        Ok(value)
    }

    async fn run_incremental(&self) -> Result<RefreshOutcome> {
        let _idle = BackToIdle(&self.state);
        let view_id = self.config.id.as_str();
        let checkpoints = self.backend.checkpoints();

        self.set_state(RefreshState::Scanning);
        let mut checkpoint = checkpoints.position(view_id).await?;
        let head = self.changelog.current_sequence().await?;
        let probes = self.probe_updates().await?;

        if head <= checkpoint && probes.iter().all(UpdateProbe::unchanged) {
            metrics::counter!("mview_refresh_skipped", "view_id" => view_id.to_string())
                .increment(1);
            tracing::debug!(%checkpoint, "no changes, skipping");
            return Ok(RefreshOutcome::Skipped);
        }

        let projector = Projector::new(&self.config);
        let mut report = RefreshReport::starting_at(checkpoint);
        let mut processed: HashSet<EntityKey> = HashSet::new();

        let mut batches = self.config.walker.walk(&self.changelog, checkpoint);
        while let Some(batch) = batches.try_next().await? {
            self.set_state(RefreshState::Applying);
            let changes = projector.project(&self.backend, &batch.keys).await?;
            self.apply(&changes).await?;

            self.set_state(RefreshState::Checkpointing);
            checkpoints
                .advance(view_id, checkpoint, batch.last_sequence)
                .await?;
            checkpoint = batch.last_sequence;

            report.batches += 1;
            report.keys += batch.keys.len();
            report.upserted += changes.upserts.len();
            report.deleted += changes.deletes.len();
            metrics::counter!("mview_batches_applied", "view_id" => view_id.to_string())
                .increment(1);
            tracing::debug!(
                batch = report.batches,
                keys = batch.keys.len(),
                entries = batch.entries,
                %checkpoint,
                "batch applied"
            );
            processed.extend(batch.keys);
        }

        self.set_state(RefreshState::Applying);
        let batch_size = self.config.walker.batch_size().max(1);
        for probe in &probes {
            let Some(since) = probe.moved_since() else {
                continue;
            };
            let mut keys = self
                .backend
                .keys_updated_after(&probe.table, &probe.key_column, &probe.column, since)
                .await?;
            keys.retain(|key| !processed.contains(key));
            if keys.is_empty() {
                continue;
            }
            tracing::info!(
                table = %probe.table,
                keys = keys.len(),
                "reconciling rows changed without changelog entries"
            );
            for chunk in keys.chunks(batch_size) {
                let changes = projector.project(&self.backend, chunk).await?;
                self.apply(&changes).await?;
                report.reconciled += chunk.len();
                report.upserted += changes.upserts.len();
                report.deleted += changes.deletes.len();
                processed.extend(chunk.iter().copied());
            }
        }

        self.remember(probes);
        report.checkpoint = checkpoint;
        tracing::info!(
            batches = report.batches,
            keys = report.keys,
            reconciled = report.reconciled,
            %checkpoint,
            "view refreshed"
        );
        Ok(RefreshOutcome::Refreshed(report))
    }

    async fn run_complete(&self) -> Result<RefreshReport> {
        let _idle = BackToIdle(&self.state);
        let view_id = self.config.id.as_str();
        let checkpoints = self.backend.checkpoints();

        self.set_state(RefreshState::Scanning);
        let checkpoint = checkpoints.position(view_id).await?;
        let head = self.changelog.current_sequence().await?;
        let probes = self.probe_updates().await?;
        let main = self.config.main_subscription();
        let keys = self
            .backend
            .fetch_all_keys(&main.source_table, &main.entity_key_column)
            .await?;

        self.set_state(RefreshState::Applying);
        let projector = Projector::new(&self.config);
        let mut report = RefreshReport::starting_at(checkpoint);
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(self.config.walker.batch_size().max(1)) {
            let changes = projector.project(&self.backend, chunk).await?;
            report.batches += 1;
            rows.extend(changes.upserts);
        }
        self.backend.replace_all(&self.config.grid, &rows).await?;
        report.keys = keys.len();
        report.upserted = rows.len();
        metrics::counter!("mview_rows_upserted", "view_id" => view_id.to_string())
            .increment(rows.len() as u64);

        self.set_state(RefreshState::Checkpointing);
        if head > checkpoint {
            checkpoints.advance(view_id, checkpoint, head).await?;
            report.checkpoint = head;
        }

        self.remember(probes);
        tracing::info!(rows = rows.len(), checkpoint = %report.checkpoint, "view rebuilt");
        Ok(report)
    }

    async fn apply(&self, changes: &GridChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.backend
            .apply_batch(&self.config.grid, &changes.upserts, &changes.deletes)
            .await?;
        metrics::counter!("mview_rows_upserted", "view_id" => self.config.id.clone())
            .increment(changes.upserts.len() as u64);
        metrics::counter!("mview_rows_deleted", "view_id" => self.config.id.clone())
            .increment(changes.deletes.len() as u64);
        Ok(())
    }

    async fn probe_updates(&self) -> Result<Vec<UpdateProbe>> {
        let mut probes = Vec::new();
        for (index, subscription) in self.config.subscriptions.iter().enumerate() {
            let Some(column) = &subscription.updated_at_column else {
                continue;
            };
            let key = cache_key(&self.config.grid.table, &subscription.source_table, index == 0);
            let current = self
                .backend
                .max_updated_at(&subscription.source_table, column)
                .await?;
            probes.push(UpdateProbe {
                table: subscription.source_table.clone(),
                key_column: subscription.entity_key_column.clone(),
                column: column.clone(),
                cached: self.cache.get(&key),
                cache_key: key,
                current,
            });
        }
        Ok(probes)
    }

    /// Stores the update times read at scan start.
    fn remember(&self, probes: Vec<UpdateProbe>) {
        for probe in probes {
            match probe.current {
                Some(current) => self.cache.set(probe.cache_key, current),
                None => self.cache.remove(&probe.cache_key),
            }
        }
    }

    fn cache_keys(&self) -> Vec<String> {
        self.config
            .subscriptions
            .iter()
            .enumerate()
            .map(|(index, s)| cache_key(&self.config.grid.table, &s.source_table, index == 0))
            .collect()
    }
}
