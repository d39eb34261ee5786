mod common;

use common::RecordingApi;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use grading_tracker::api::ApiError;
use grading_tracker::model::QueueEntry;
use grading_tracker::queue::{
    Direction, EntryQueue, OrderSource, QueueEngine, ReorderOutcome, UserQueue,
};

async fn user_engine(api: &RecordingApi, order: Vec<i64>) -> QueueEngine<UserQueue> {
    *api.user_queue.lock().await = order;
    let engine = QueueEngine::new(UserQueue::new(Arc::new(api.clone())), 7);
    assert_eq!(engine.open(vec![]).await, OrderSource::Remote);
    engine
}

#[tokio::test]
async fn open_reads_server_positions() {
    let api = RecordingApi::default();
    let engine = user_engine(&api, vec![4, 2, 9]).await;
    // slots come back unsorted and are ordered by position
    assert_eq!(engine.order().await, vec![4, 2, 9]);
}

#[tokio::test]
async fn fetch_failure_uses_fallback_order() {
    let api = RecordingApi::default();
    api.fail_queue_fetch.store(true, Ordering::SeqCst);
    let engine = QueueEngine::new(UserQueue::new(Arc::new(api.clone())), 7);

    assert_eq!(engine.open(vec![3, 1, 2]).await, OrderSource::Fallback);
    assert_eq!(engine.order().await, vec![3, 1, 2]);
}

#[tokio::test]
async fn drop_persists_the_full_new_order() {
    let api = RecordingApi::default();
    let engine = user_engine(&api, vec![1, 2, 3, 4]).await;

    let outcome = engine.reorder(1, 3).await;

    assert!(matches!(outcome, ReorderOutcome::Committed(ref o) if *o == vec![2, 3, 1, 4]));
    assert_eq!(engine.order().await, vec![2, 3, 1, 4]);
    assert_eq!(api.queue_puts().await, vec![vec![2, 3, 1, 4]]);
    assert!(engine.take_notices().is_empty());
}

#[tokio::test]
async fn rejected_persist_restores_snapshot_and_notifies() {
    let api = RecordingApi::default();
    let engine = user_engine(&api, vec![1, 2, 3, 4]).await;
    api.push_persist_result(Err(ApiError::Status {
        status: 409,
        body: "conflict".into(),
    }))
    .await;

    let outcome = engine.reorder(4, 1).await;

    match outcome {
        ReorderOutcome::Reverted { restored, error } => {
            assert_eq!(restored, vec![1, 2, 3, 4]);
            assert!(matches!(error, ApiError::Status { status: 409, .. }));
        }
        other => panic!("expected revert, got {:?}", other),
    }
    assert_eq!(engine.order().await, vec![1, 2, 3, 4]);
    let notices = engine.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].batch_id, 7);
    assert!(notices[0].message.contains("409"));
    assert!(engine.take_notices().is_empty());
}

#[tokio::test]
async fn keyboard_moves_and_edges() {
    let api = RecordingApi::default();
    let engine = user_engine(&api, vec![1, 2, 3]).await;

    assert!(matches!(engine.step(1, Direction::Up).await, ReorderOutcome::Unchanged));
    assert!(matches!(engine.step(3, Direction::Down).await, ReorderOutcome::Unchanged));
    assert!(matches!(engine.reorder(2, 2).await, ReorderOutcome::Unchanged));
    assert!(matches!(engine.reorder(2, 99).await, ReorderOutcome::Unchanged));
    assert!(api.queue_puts().await.is_empty());

    engine.step(3, Direction::Up).await;
    assert_eq!(engine.order().await, vec![1, 3, 2]);
    engine.move_down(1).await;
    assert_eq!(engine.order().await, vec![3, 1, 2]);
    assert_eq!(api.queue_puts().await.len(), 2);
}

#[tokio::test]
async fn closed_engine_sends_nothing() {
    let api = RecordingApi::default();
    let engine = user_engine(&api, vec![1, 2, 3]).await;
    engine.close();

    assert!(matches!(engine.reorder(3, 1).await, ReorderOutcome::Unchanged));
    assert!(matches!(engine.move_up(2).await, ReorderOutcome::Unchanged));

    assert_eq!(engine.order().await, vec![1, 2, 3]);
    assert!(api.queue_puts().await.is_empty());
    assert!(engine.take_notices().is_empty());
}

#[tokio::test]
async fn reopening_replaces_a_stale_local_order() {
    let api = RecordingApi::default();
    let engine = user_engine(&api, vec![1, 2, 3]).await;
    engine.reorder(1, 3).await;
    assert_eq!(engine.order().await, vec![2, 3, 1]);

    // another admin saves a different order meanwhile
    *api.user_queue.lock().await = vec![3, 1, 2];

    assert_eq!(engine.open(vec![]).await, OrderSource::Remote);
    assert_eq!(engine.order().await, vec![3, 1, 2]);
}

#[tokio::test]
async fn concurrent_reorders_end_on_the_last_saved_order() {
    let api = RecordingApi::default();
    let engine = user_engine(&api, vec![1, 2, 3, 4]).await;

    let (a, b) = tokio::join!(engine.reorder(1, 4), engine.reorder(2, 3));

    let (ReorderOutcome::Committed(a), ReorderOutcome::Committed(b)) = (a, b) else {
        panic!("both reorders should commit");
    };
    let puts = api.queue_puts().await;
    assert_eq!(puts.len(), 2);
    assert!(puts.contains(&a));
    assert!(puts.contains(&b));

    // no merge: whichever save lands last is the order everyone sees
    let final_order = engine.order().await;
    assert_eq!(Some(&final_order), puts.last());
    assert_eq!(*api.user_queue.lock().await, final_order);
    assert!(
        [vec![3, 2, 4, 1], vec![2, 3, 4, 1], vec![1, 3, 2, 4]].contains(&final_order),
        "unexpected order {:?}",
        final_order
    );
}

#[tokio::test]
async fn entry_queue_orders_by_position_then_id() {
    let api = RecordingApi::default();
    *api.entries.lock().await = vec![
        QueueEntry { id: 30, batch_id: 7, user_id: 2, position: 2, user: None },
        QueueEntry { id: 11, batch_id: 7, user_id: 3, position: 1, user: None },
        QueueEntry { id: 10, batch_id: 7, user_id: 2, position: 2, user: None },
    ];
    let engine = QueueEngine::new(EntryQueue::new(Arc::new(api.clone())), 7);

    assert_eq!(engine.open(vec![]).await, OrderSource::Remote);
    assert_eq!(engine.order().await, vec![11, 10, 30]);

    engine.reorder(30, 11).await;
    assert_eq!(api.queue_puts().await, vec![vec![30, 11, 10]]);
    let positions: Vec<(i64, i64)> = api
        .entries
        .lock()
        .await
        .iter()
        .map(|e| (e.id, e.position))
        .collect();
    assert_eq!(positions, vec![(30, 1), (11, 2), (10, 3)]);
}
