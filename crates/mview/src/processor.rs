//! View processor: drives every configured view against one backend.

use std::sync::Arc;

use common::WorkerId;

use crate::cache::LastUpdateTimeCache;
use crate::config::MviewConfig;
use crate::storage::MviewBackend;
use crate::view::{RefreshOutcome, View, ViewStatus};
use crate::{MviewError, Result};

/// Outcome of one view within [`ViewProcessor::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRefresh {
    pub view_id: String,
    pub outcome: RefreshOutcome,
}

/// Owns the views built from an [`MviewConfig`].
///
/// The processor supports:
/// - Subscribing and unsubscribing every view
/// - Scheduled refresh of all views, or of one group
/// - Pruning consumed changelog entries
pub struct ViewProcessor<B: MviewBackend> {
    config: Arc<MviewConfig>,
    views: Vec<Arc<View<B>>>,
    cache: LastUpdateTimeCache,
    worker: WorkerId,
}

impl<B: MviewBackend> ViewProcessor<B> {
    /// Builds one view per configured view, sharing a fresh cache.
    pub fn new(backend: B, config: Arc<MviewConfig>) -> Result<Self> {
        Self::with_cache(backend, config, LastUpdateTimeCache::new())
    }

    pub fn with_cache(
        backend: B,
        config: Arc<MviewConfig>,
        cache: LastUpdateTimeCache,
    ) -> Result<Self> {
        let views = config
            .views()
            .map(|view| View::new(Arc::clone(view), backend.clone(), cache.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            views,
            cache,
            worker: WorkerId::new(),
        })
    }

    pub fn config(&self) -> &Arc<MviewConfig> {
        &self.config
    }

    pub fn cache(&self) -> &LastUpdateTimeCache {
        &self.cache
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Views ordered by id.
    pub fn views(&self) -> &[Arc<View<B>>] {
        &self.views
    }

    pub fn view(&self, id: &str) -> Result<&Arc<View<B>>> {
        self.views
            .iter()
            .find(|view| view.id() == id)
            .ok_or_else(|| MviewError::UnknownView(id.to_string()))
    }

    /// Subscribes every view.
    #[tracing::instrument(skip(self), fields(worker = %self.worker))]
    pub async fn subscribe_all(&self) -> Result<()> {
        for view in &self.views {
            view.subscribe().await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(worker = %self.worker))]
    pub async fn unsubscribe_all(&self) -> Result<()> {
        for view in &self.views {
            view.unsubscribe().await?;
        }
        Ok(())
    }

    /// Runs a scheduled refresh of every view, or of the views in `group`.
    ///
    /// Transient failures are logged and reported as
    /// [`RefreshOutcome::Retry`]. The first other failure is returned once
    /// every view had its turn.
    #[tracing::instrument(skip(self), fields(worker = %self.worker))]
    pub async fn update(&self, group: Option<&str>) -> Result<Vec<ViewRefresh>> {
        let mut refreshed = Vec::new();
        let mut first_error = None;

        for view in &self.views {
            if group.is_some() && view.config().group.as_deref() != group {
                continue;
            }
            match view.refresh_by_schedule().await {
                Ok(outcome) => refreshed.push(ViewRefresh {
                    view_id: view.id().to_string(),
                    outcome,
                }),
                Err(err) if err.is_transient() => {
                    tracing::warn!(view_id = view.id(), error = %err, "view left for next run");
                    refreshed.push(ViewRefresh {
                        view_id: view.id().to_string(),
                        outcome: RefreshOutcome::Retry {
                            reason: err.to_string(),
                        },
                    });
                }
                Err(err) => {
                    tracing::error!(view_id = view.id(), error = %err, "view refresh failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(refreshed),
        }
    }

    /// Prunes every view's changelog. Returns the number of entries removed.
    #[tracing::instrument(skip(self), fields(worker = %self.worker))]
    pub async fn prune_all(&self) -> Result<u64> {
        let mut pruned = 0;
        for view in &self.views {
            pruned += view.prune().await?;
        }
        if pruned > 0 {
            tracing::info!(pruned, "changelogs pruned");
        }
        Ok(pruned)
    }

    pub async fn statuses(&self) -> Result<Vec<ViewStatus>> {
        let mut statuses = Vec::with_capacity(self.views.len());
        for view in &self.views {
            statuses.push(view.status().await?);
        }
        Ok(statuses)
    }
}
