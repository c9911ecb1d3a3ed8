use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Compact the WAL once more than `threshold` transactions were appended since
/// the last compaction. Returns whether it compacted.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appended = engine.wal_appends_since_compact().await;
    if appended <= threshold {
        debug!("wal compaction skipped: {appended} appends");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("wal compacted after {appended} appends");
            true
        }
        Err(e) => {
            warn!("wal compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically checks whether the WAL needs compacting.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tourslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn location(id: LocationId) -> Location {
        Location {
            id,
            name: format!("Loc {id}"),
            capacity: 10,
            blocked_weekdays: WeekdaySet::empty(),
            closed_dates: Default::default(),
            open_hours: Default::default(),
            target_groups: TargetGroups::All,
            active: true,
        }
    }

    #[tokio::test]
    async fn compacts_past_threshold_and_keeps_state() {
        let path = test_wal_path("compactor_threshold.wal");
        let engine = Engine::new(path.clone(), SlotDefinitions::default()).unwrap();
        for id in 1..=5 {
            engine.upsert_location(location(id)).await.unwrap();
        }

        assert!(!compact_if_needed(&engine, 10).await);
        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        drop(engine);

        let reopened = Engine::new(path, SlotDefinitions::default()).unwrap();
        assert_eq!(reopened.read().await.locations.len(), 5);
    }
}
