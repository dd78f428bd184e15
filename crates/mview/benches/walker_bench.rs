use std::sync::Arc;

use changelog::{ChangeLog, EntityKey, InMemoryChangeLog, SequenceId};
use common::Row;
use criterion::{Criterion, criterion_group, criterion_main};
use futures_util::TryStreamExt;
use mview::{ConfigLoader, InMemoryDatabase, MviewDeclarations, ViewProcessor, WalkerKind};
use serde_json::json;

async fn populated(entries: i64) -> InMemoryChangeLog {
    let log = InMemoryChangeLog::new("bench_walk_cl");
    log.create().await.unwrap();
    for key in 0..entries {
        log.append(EntityKey::new(key % 500)).await.unwrap();
    }
    log
}

fn bench_walk(c: &mut Criterion, walker: WalkerKind, label: &str) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let log = rt.block_on(populated(10_000));

    c.bench_function(label, |b| {
        b.iter(|| {
            rt.block_on(async {
                let batches: Vec<_> = walker
                    .walk(&log, SequenceId::initial())
                    .try_collect()
                    .await
                    .unwrap();
                assert!(!batches.is_empty());
            });
        });
    });
}

fn bench_changelog_walker(c: &mut Criterion) {
    bench_walk(
        c,
        WalkerKind::Changelog { batch_size: 1000 },
        "walker/changelog_10000_entries",
    );
}

fn bench_version_range_walker(c: &mut Criterion) {
    bench_walk(
        c,
        WalkerKind::VersionRange { batch_size: 1000 },
        "walker/version_range_10000_entries",
    );
}

fn bench_complete_refresh_1000_rows(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let processor = rt.block_on(async {
        let db = InMemoryDatabase::new();
        db.create_table("orders", &["entity_id", "status"], Some("entity_id"))
            .await
            .unwrap();
        let declarations = MviewDeclarations::from_json(
            &json!({
                "views": [{
                    "id": "orders_grid",
                    "grid": {
                        "table": "orders_grid",
                        "key_column": "entity_id",
                        "columns": {"status": "orders.status"}
                    },
                    "subscriptions": [{"name": "orders", "entity_column": "entity_id"}]
                }]
            })
            .to_string(),
        )
        .unwrap();
        let config = ConfigLoader::new().load(&declarations, &db).await.unwrap();
        let processor = ViewProcessor::new(db.clone(), Arc::new(config)).unwrap();
        processor.subscribe_all().await.unwrap();
        for id in 0..1000 {
            let row: Row = json!({"entity_id": id, "status": "new"})
                .as_object()
                .unwrap()
                .clone();
            db.insert("orders", row).await.unwrap();
        }
        processor
    });

    c.bench_function("view/refresh_complete_1000_rows", |b| {
        b.iter(|| {
            rt.block_on(async {
                let view = processor.view("orders_grid").unwrap();
                view.refresh_complete().await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_changelog_walker,
    bench_version_range_walker,
    bench_complete_refresh_1000_rows
);
criterion_main!(benches);
