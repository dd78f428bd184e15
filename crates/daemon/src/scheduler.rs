//! Background refresh and prune loops.
//!
//! The [`Scheduler`] runs two periodic jobs against a [`ViewProcessor`]:
//! a scheduled refresh of every view, and a prune of consumed changelog
//! entries. Both stop when [`Scheduler::stop`] is called.

use std::sync::Arc;
use std::time::Duration;

use mview::{MviewBackend, RefreshOutcome, ViewProcessor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub struct Scheduler<B: MviewBackend> {
    processor: Arc<ViewProcessor<B>>,
    refresh_interval: Duration,
    prune_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl<B: MviewBackend> Scheduler<B> {
    pub fn new(
        processor: Arc<ViewProcessor<B>>,
        refresh_interval: Duration,
        prune_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            processor,
            refresh_interval,
            prune_interval,
            shutdown,
        }
    }

    /// Spawns the background task. The first refresh runs immediately,
    /// the first prune after one prune interval.
    pub fn start(&self) -> JoinHandle<()> {
        let processor = Arc::clone(&self.processor);
        let mut shutdown = self.shutdown.subscribe();
        let refresh_interval = self.refresh_interval;
        let prune_interval = self.prune_interval;

        tokio::spawn(async move {
            let mut refresh = tokio::time::interval(refresh_interval);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut prune =
                tokio::time::interval_at(Instant::now() + prune_interval, prune_interval);
            prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                refresh_secs = refresh_interval.as_secs_f64(),
                prune_secs = prune_interval.as_secs_f64(),
                "scheduler started"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = refresh.tick() => run_refresh(&processor).await,
                    _ = prune.tick() => run_prune(&processor).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("scheduler shutting down");
        })
    }

    /// Signals the background task to stop after its current job.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn run_refresh<B: MviewBackend>(processor: &ViewProcessor<B>) {
    match processor.update(None).await {
        Ok(refreshed) => {
            let applied = refreshed
                .iter()
                .filter(|r| matches!(r.outcome, RefreshOutcome::Refreshed(_)))
                .count();
            tracing::debug!(views = refreshed.len(), applied, "scheduled refresh done");
        }
        Err(err) => tracing::error!(error = %err, "scheduled refresh failed"),
    }
}

async fn run_prune<B: MviewBackend>(processor: &ViewProcessor<B>) {
    if let Err(err) = processor.prune_all().await {
        tracing::error!(error = %err, "changelog prune failed");
    }
}

#[cfg(test)]
mod tests {
    use changelog::{ChangeLog, SequenceId};
    use mview::{ConfigLoader, InMemoryDatabase, MviewDeclarations};
    use serde_json::json;

    use super::*;

    async fn processor(db: &InMemoryDatabase) -> Arc<ViewProcessor<InMemoryDatabase>> {
        db.create_table("customer", &["entity_id", "email"], Some("entity_id"))
            .await
            .unwrap();
        let declarations = MviewDeclarations::from_json(
            &json!({
                "views": [{
                    "id": "customer_grid",
                    "grid": {
                        "table": "customer_grid",
                        "key_column": "entity_id",
                        "columns": {"email": "customer.email"}
                    },
                    "subscriptions": [{"name": "customer", "entity_column": "entity_id"}]
                }]
            })
            .to_string(),
        )
        .unwrap();
        let config = ConfigLoader::new().load(&declarations, db).await.unwrap();
        let processor = ViewProcessor::new(db.clone(), Arc::new(config)).unwrap();
        processor.subscribe_all().await.unwrap();
        Arc::new(processor)
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_scheduler_refreshes_and_prunes_until_stopped() {
        let db = InMemoryDatabase::new();
        let processor = processor(&db).await;
        let scheduler = Scheduler::new(
            Arc::clone(&processor),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        let task = scheduler.start();

        for (id, email) in [(7, "a@example.com"), (8, "b@example.com")] {
            db.insert(
                "customer",
                json!({"entity_id": id, "email": email})
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .await
            .unwrap();
        }

        let grid = &db;
        wait_until(move || async move { grid.grid_rows("customer_grid").await.len() == 2 }).await;

        // Pruning keeps the entry at the checkpoint itself.
        let view = processor.view("customer_grid").unwrap();
        wait_until(move || async move {
            view.changelog()
                .entries_since(SequenceId::initial(), 10)
                .await
                .unwrap()
                .len()
                == 1
        })
        .await;

        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_exits_immediately() {
        let db = InMemoryDatabase::new();
        let scheduler = Scheduler::new(
            processor(&db).await,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        scheduler.stop();
        tokio::time::timeout(Duration::from_secs(5), scheduler.start())
            .await
            .unwrap()
            .unwrap();
    }
}
