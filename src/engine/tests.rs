use super::*;
use crate::limits::{MAX_PARTICIPANTS, MAX_RETAINED_RUNS};
use crate::lock::LockStore;
use crate::planner::{CapacityTracker, ConflictKind};
use crate::revision::RevisionStore;
use chrono::{NaiveDate, NaiveTime};

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn group(id: GroupId, size: u32, start: &str, end: &str) -> Group {
    Group {
        id,
        name: format!("Group {id}"),
        group_type: GroupType::Primary,
        start_date: d(start),
        end_date: d(end),
        student_count: size,
        teacher_count: 0,
        itinerary_plan_id: None,
        must_visit: vec![],
        status: GroupStatus::Preparing,
    }
}

fn location(id: LocationId, capacity: u32) -> Location {
    Location {
        id,
        name: format!("Location {id}"),
        capacity,
        blocked_weekdays: WeekdaySet::empty(),
        closed_dates: Default::default(),
        open_hours: Default::default(),
        target_groups: TargetGroups::All,
        active: true,
    }
}

fn input(group_id: GroupId, location_id: LocationId, date: &str, slot: Slot) -> AssignmentInput {
    AssignmentInput {
        group_id,
        location_id,
        date: d(date),
        slot,
        participant_count: None,
        tag: None,
        title: None,
    }
}

fn item(date: &str, start: NaiveTime, end: NaiveTime, title: &str, location_id: Option<LocationId>) -> ScheduleInput {
    ScheduleInput {
        date: d(date),
        start,
        end,
        title: title.into(),
        tag: None,
        location_id,
        participant_count: None,
    }
}

// ── Async engine tests ───────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tourslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn engine_with(name: &str, groups: Vec<Group>, locations: Vec<Location>) -> Engine {
    let engine = Engine::new(test_wal_path(name), SlotDefinitions::default()).unwrap();
    for g in groups {
        engine.upsert_group(g).await.unwrap();
    }
    for l in locations {
        engine.upsert_location(l).await.unwrap();
    }
    engine
}

#[tokio::test]
async fn create_assignment_mirrors_schedule_and_bumps_revision() {
    let engine = engine_with(
        "create_mirror.wal",
        vec![group(1, 20, "2025-07-01", "2025-07-03")],
        vec![location(10, 50)],
    )
    .await;

    let a = engine
        .create_assignment(input(1, 10, "2025-07-02", Slot::Afternoon), false)
        .await
        .unwrap();
    assert_eq!(a.participant_count, 20);
    assert_eq!(a.tag, "plan-sync-10");

    let (schedules, revision) = engine.group_schedules(1).await.unwrap();
    assert_eq!(revision, 1);
    assert_eq!(schedules.len(), 1);
    let s = &schedules[0];
    assert_eq!(s.id, a.id);
    assert_eq!((s.start, s.end), (t(13, 0), t(17, 0)));
    assert_eq!(s.title, "Location 10");
    assert_eq!(s.location_id, Some(10));
}

#[tokio::test]
async fn capacity_overflow_is_soft_and_overridable() {
    // 44 participants against capacity 40, nothing booked yet
    let engine = engine_with(
        "capacity_soft.wal",
        vec![group(1, 44, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;

    let err = engine
        .create_assignment(input(1, 10, "2025-07-01", Slot::Morning), false)
        .await
        .unwrap_err();
    let EngineError::Conflicts(list) = err else {
        panic!("expected conflicts, got {err:?}");
    };
    assert_eq!(list.kinds(), vec![ConflictKind::Capacity]);
    let message = &list.iter().next().unwrap().message;
    assert!(message.contains("current 0 vs capacity 40"), "{message}");
    assert!(message.contains("requested 44"), "{message}");
    assert!(engine.read().await.assignments.is_empty());

    engine
        .create_assignment(input(1, 10, "2025-07-01", Slot::Morning), true)
        .await
        .unwrap();
    assert_eq!(engine.read().await.assignments.len(), 1);
}

#[tokio::test]
async fn hard_conflicts_ignore_the_override() {
    let engine = engine_with(
        "hard_conflict.wal",
        vec![group(1, 10, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;

    let err = engine
        .create_assignment(input(1, 10, "2025-07-05", Slot::Morning), true)
        .await
        .unwrap_err();
    let EngineError::Conflicts(list) = err else {
        panic!("expected conflicts, got {err:?}");
    };
    assert!(list.kinds().contains(&ConflictKind::GroupDateRange));
    assert_eq!(engine.revision_of(1).await, 0);
}

#[tokio::test]
async fn double_booking_a_group_slot_is_rejected() {
    let engine = engine_with(
        "double_booking.wal",
        vec![group(1, 10, "2025-07-01", "2025-07-03")],
        vec![location(10, 40), location(11, 40)],
    )
    .await;
    engine
        .create_assignment(input(1, 10, "2025-07-01", Slot::Morning), false)
        .await
        .unwrap();
    let err = engine
        .create_assignment(input(1, 11, "2025-07-01", Slot::Morning), true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflicts(l) if l.kinds() == vec![ConflictKind::DuplicateGroupSlot]));
}

#[tokio::test]
async fn update_excludes_the_edited_assignment() {
    let engine = engine_with(
        "update_self.wal",
        vec![group(1, 40, "2025-07-01", "2025-07-03")],
        vec![location(10, 40), location(11, 40)],
    )
    .await;
    let a = engine
        .create_assignment(input(1, 10, "2025-07-01", Slot::Morning), false)
        .await
        .unwrap();

    // Same cell, same size: fits only if its own usage is not counted.
    let mut same = input(1, 10, "2025-07-01", Slot::Morning);
    same.title = Some("Renamed".into());
    engine.update_assignment(a.id, same, false).await.unwrap();

    let moved = engine
        .update_assignment(a.id, input(1, 11, "2025-07-02", Slot::Evening), false)
        .await
        .unwrap();
    assert_eq!(moved.id, a.id);
    let state = engine.read().await;
    assert_eq!(state.assignments.len(), 1);
    assert_eq!(state.schedules[&a.id].location_id, Some(11));
    assert_eq!(state.schedules[&a.id].start, t(18, 0));
    assert_eq!(state.revision(1), 3);
}

#[tokio::test]
async fn delete_removes_the_mirror() {
    let engine = engine_with(
        "delete_mirror.wal",
        vec![group(1, 10, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;
    let a = engine
        .create_assignment(input(1, 10, "2025-07-01", Slot::Morning), false)
        .await
        .unwrap();
    engine.delete_assignment(a.id).await.unwrap();

    let state = engine.read().await;
    assert!(state.assignments.is_empty());
    assert!(state.schedules.is_empty());
    assert_eq!(state.revision(1), 2);
    drop(state);

    assert!(matches!(
        engine.delete_assignment(a.id).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn stale_revision_leaves_store_unchanged() {
    let engine = engine_with(
        "stale_revision.wal",
        vec![group(1, 10, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;
    for _ in 0..3 {
        engine.bump(1).await.unwrap();
    }
    engine
        .replace_group_schedules(1, 3, vec![item("2025-07-01", t(9, 0), t(11, 0), "Museum", Some(10))])
        .await
        .unwrap();
    let before = engine.group_schedules(1).await.unwrap();
    assert_eq!(before.1, 4);

    let err = engine
        .replace_group_schedules(1, 3, vec![item("2025-07-02", t(9, 0), t(10, 0), "Zoo", None)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RevisionConflict { current: 4 }));
    assert_eq!(engine.group_schedules(1).await.unwrap(), before);
}

#[tokio::test]
async fn batch_replace_derives_assignments_from_bound_items() {
    let engine = engine_with(
        "batch_bound.wal",
        vec![group(1, 25, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;
    engine
        .create_assignment(input(1, 10, "2025-07-03", Slot::Morning), false)
        .await
        .unwrap();

    let (schedules, revision) = engine
        .replace_group_schedules(
            1,
            1,
            vec![
                item("2025-07-01", t(9, 30), t(11, 0), "Museum", Some(10)),
                item("2025-07-01", t(12, 0), t(13, 0), "Lunch", None),
            ],
        )
        .await
        .unwrap();
    assert_eq!(revision, 2);
    assert_eq!(schedules.len(), 2);
    assert_eq!(schedules[0].tag, "plan-sync-10");
    assert!(schedules[1].tag.starts_with("custom:"));

    let state = engine.read().await;
    assert_eq!(state.assignments.len(), 1);
    let a = state.assignments.values().next().unwrap();
    assert_eq!((a.date, a.slot, a.participant_count), (d("2025-07-01"), Slot::Morning, 25));
    assert_eq!(a.id, schedules[0].id);
}

#[tokio::test]
async fn batch_replace_rejects_items_outside_every_slot() {
    let engine = engine_with(
        "batch_no_slot.wal",
        vec![group(1, 25, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;
    let err = engine
        .replace_group_schedules(1, 0, vec![item("2025-07-01", t(22, 0), t(23, 0), "Night walk", Some(10))])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Structural(_)));
    assert_eq!(engine.revision_of(1).await, 0);
}

#[tokio::test]
async fn batch_replace_is_all_or_nothing_on_conflict() {
    let engine = engine_with(
        "batch_conflict.wal",
        vec![group(1, 30, "2025-07-01", "2025-07-03"), group(2, 30, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;
    engine
        .create_assignment(input(2, 10, "2025-07-02", Slot::Morning), false)
        .await
        .unwrap();
    engine
        .replace_group_schedules(1, 0, vec![item("2025-07-01", t(8, 0), t(12, 0), "A", Some(10))])
        .await
        .unwrap();

    // Second item would exceed capacity next to group 2.
    let err = engine
        .replace_group_schedules(
            1,
            1,
            vec![
                item("2025-07-01", t(8, 0), t(12, 0), "A", Some(10)),
                item("2025-07-02", t(8, 0), t(12, 0), "B", Some(10)),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflicts(_)));
    let (schedules, revision) = engine.group_schedules(1).await.unwrap();
    assert_eq!(revision, 1);
    assert_eq!(schedules.len(), 1);
}

#[tokio::test]
async fn batch_replace_never_overrides_capacity() {
    let engine = engine_with(
        "batch_over_capacity.wal",
        vec![group(1, 44, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;
    let err = engine
        .replace_group_schedules(1, 0, vec![item("2025-07-01", t(9, 0), t(11, 0), "Museum", Some(10))])
        .await
        .unwrap_err();
    let EngineError::Conflicts(list) = err else { panic!("expected conflicts, got {err:?}") };
    assert_eq!(list.kinds(), vec![ConflictKind::Capacity]);
    let state = engine.read().await;
    assert!(state.assignments.is_empty());
    assert_eq!(state.revision(1), 0);
}

#[tokio::test]
async fn oversized_participant_counts_saturate_instead_of_overflowing() {
    let path = test_wal_path("participant_limit.wal");
    {
        let engine = Engine::new(path.clone(), SlotDefinitions::default()).unwrap();
        for id in 1..=3 {
            engine.upsert_group(group(id, 10, "2025-07-01", "2025-07-03")).await.unwrap();
        }
        engine.upsert_location(location(10, 40)).await.unwrap();

        let err = engine
            .create_assignment(
                AssignmentInput {
                    participant_count: Some(MAX_PARTICIPANTS + 1),
                    ..input(1, 10, "2025-07-01", Slot::Morning)
                },
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Structural(_)));

        for id in 1..=2 {
            engine
                .create_assignment(
                    AssignmentInput {
                        participant_count: Some(MAX_PARTICIPANTS),
                        ..input(id, 10, "2025-07-01", Slot::Morning)
                    },
                    true,
                )
                .await
                .unwrap();
        }
        let err = engine
            .create_assignment(input(3, 10, "2025-07-01", Slot::Morning), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflicts(_)));
    }

    let engine = Engine::new(path, SlotDefinitions::default()).unwrap();
    let state = engine.read().await;
    let capacity = CapacityTracker::seeded(state.assignments.values(), None, |_| false);
    assert_eq!(capacity.used(d("2025-07-01"), Slot::Morning, 10), 2 * MAX_PARTICIPANTS);
}

#[tokio::test]
async fn cancelling_a_group_cascades() {
    let engine = engine_with(
        "cancel_cascade.wal",
        vec![group(1, 10, "2025-07-01", "2025-07-03"), group(2, 10, "2025-07-01", "2025-07-03")],
        vec![location(10, 40)],
    )
    .await;
    engine
        .replace_group_schedules(
            1,
            0,
            vec![
                item("2025-07-01", t(8, 0), t(12, 0), "Museum", Some(10)),
                item("2025-07-01", t(12, 0), t(13, 0), "Lunch", None),
                item("2025-07-01", t(18, 0), t(21, 0), "Concert", Some(10)),
            ],
        )
        .await
        .unwrap();
    engine
        .create_assignment(input(2, 10, "2025-07-01", Slot::Morning), false)
        .await
        .unwrap();

    let removed = engine.set_group_status(1, GroupStatus::Cancelled).await.unwrap();
    assert_eq!(removed, 2);

    let state = engine.read().await;
    assert!(state.groups[&1].is_cancelled());
    assert!(state.assignments.values().all(|a| a.group_id == 2));
    assert!(state.schedules.values().all(|s| s.group_id == 2));
    assert_eq!(state.schedules.len(), 1);
    assert_eq!(state.revision(1), 2);
    assert_eq!(state.revision(2), 1);
    drop(state);

    let err = engine
        .create_assignment(input(1, 10, "2025-07-02", Slot::Morning), true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflicts(l) if l.kinds().contains(&ConflictKind::GroupCancelled)));
}

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let id;
    {
        let engine = Engine::new(path.clone(), SlotDefinitions::default()).unwrap();
        engine.upsert_group(group(1, 10, "2025-07-01", "2025-07-03")).await.unwrap();
        engine.upsert_location(location(10, 40)).await.unwrap();
        id = engine
            .create_assignment(input(1, 10, "2025-07-01", Slot::Morning), false)
            .await
            .unwrap()
            .id;
        engine
            .save_lock(Some(LockRecord { holder: "alice".into(), acquired_at: 1, expires_at: 2 }))
            .await
            .unwrap();
    }

    let engine = Engine::new(path, SlotDefinitions::default()).unwrap();
    let state = engine.read().await;
    assert!(state.assignments.contains_key(&id));
    assert!(state.schedules.contains_key(&id));
    assert_eq!(state.revision(1), 1);
    assert_eq!(state.lock.as_ref().map(|l| l.holder.as_str()), Some("alice"));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    {
        let engine = engine_with(
            "compact_state.wal",
            vec![group(1, 10, "2025-07-01", "2025-07-03")],
            vec![location(10, 40)],
        )
        .await;
        engine
            .create_assignment(input(1, 10, "2025-07-02", Slot::Evening), false)
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await >= 3);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let id = *engine.read().await.assignments.keys().next().unwrap();
        engine.delete_assignment(id).await.unwrap();
    }

    let engine = Engine::new(path, SlotDefinitions::default()).unwrap();
    let state = engine.read().await;
    assert_eq!(state.groups.len(), 1);
    assert!(state.assignments.is_empty());
    assert_eq!(state.revision(1), 2);
}

#[test]
fn finished_runs_are_capped_oldest_first() {
    let run = |ms: u64, status: RunStatus| RunRecord {
        id: Ulid::from_parts(ms, 0),
        status,
        backend: "builtin".into(),
        request: "{}".into(),
        created_at: ms as i64,
        started_at: None,
        finished_at: None,
        error: None,
        log_tail: String::new(),
        result: None,
        summary: None,
    };
    let mut state = PlanState::default();
    state.apply(&Event::RunRecorded(run(1, RunStatus::Running)));
    for ms in 2..(MAX_RETAINED_RUNS as u64 + 7) {
        state.apply(&Event::RunRecorded(run(ms, RunStatus::Succeeded)));
    }
    assert_eq!(state.runs.len(), MAX_RETAINED_RUNS + 1);
    assert!(state.runs.contains_key(&Ulid::from_parts(1, 0)));
    assert!(!state.runs.contains_key(&Ulid::from_parts(2, 0)));
    assert!(!state.runs.contains_key(&Ulid::from_parts(6, 0)));
    assert!(state.runs.contains_key(&Ulid::from_parts(7, 0)));
}

#[tokio::test]
async fn revision_store_bumps_by_one() {
    let engine = engine_with("revision_store.wal", vec![group(1, 10, "2025-07-01", "2025-07-01")], vec![]).await;
    assert_eq!(engine.revision(1).await, 0);
    assert_eq!(engine.bump(1).await.unwrap(), 1);
    assert_eq!(engine.bump(1).await.unwrap(), 2);
    assert_eq!(RevisionStore::revision(&engine, 1).await, 2);
}

#[tokio::test]
async fn list_assignments_filters_and_orders() {
    let engine = engine_with(
        "list_filter.wal",
        vec![group(1, 10, "2025-07-01", "2025-07-05"), group(2, 10, "2025-07-01", "2025-07-05")],
        vec![location(10, 40)],
    )
    .await;
    for (g, date, slot) in [
        (1, "2025-07-03", Slot::Morning),
        (1, "2025-07-01", Slot::Evening),
        (2, "2025-07-01", Slot::Morning),
        (1, "2025-07-01", Slot::Morning),
    ] {
        engine.create_assignment(input(g, 10, date, slot), false).await.unwrap();
    }

    let all = engine.list_assignments(&AssignmentFilter::default()).await.unwrap();
    let keys: Vec<_> = all.iter().map(|a| (a.date, a.slot, a.group_id)).collect();
    assert_eq!(
        keys,
        vec![
            (d("2025-07-01"), Slot::Morning, 1),
            (d("2025-07-01"), Slot::Morning, 2),
            (d("2025-07-01"), Slot::Evening, 1),
            (d("2025-07-03"), Slot::Morning, 1),
        ]
    );

    let filter = AssignmentFilter {
        group_id: Some(1),
        start_date: Some(d("2025-07-01")),
        end_date: Some(d("2025-07-02")),
    };
    assert_eq!(engine.list_assignments(&filter).await.unwrap().len(), 2);

    let reversed = AssignmentFilter {
        group_id: None,
        start_date: Some(d("2025-07-03")),
        end_date: Some(d("2025-07-01")),
    };
    assert!(matches!(
        engine.list_assignments(&reversed).await,
        Err(EngineError::Structural(_))
    ));
}

#[tokio::test]
async fn upsert_rejects_zero_capacity_and_reversed_dates() {
    let engine = engine_with("upsert_checks.wal", vec![], vec![]).await;
    assert!(engine.upsert_location(location(1, 0)).await.is_err());
    assert!(engine
        .upsert_group(group(1, 10, "2025-07-03", "2025-07-01"))
        .await
        .is_err());
}
