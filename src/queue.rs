//! Per-batch queue ordering with optimistic updates.
//!
//! A reorder is applied locally first, then persisted. If the backend rejects
//! it, the exact pre-move order is restored. Reorders are not serialized: each
//! carries its own snapshot, and the backend sees last-write-wins.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::{ApiError, GradingApi};
use crate::model::{Id, QueueEntry};
use crate::payments::UserPaymentGroup;

/// Move the element at `from` so it ends up at index `to`.
/// Remove-then-insert, not swap. Out-of-range indices leave the order as is.
pub fn move_index<T: Clone>(order: &[T], from: usize, to: usize) -> Vec<T> {
    let mut next = order.to_vec();
    if from >= next.len() || to >= next.len() || from == to {
        return next;
    }
    let item = next.remove(from);
    next.insert(to, item);
    next
}

/// Move `from_id` to the position currently held by `to_id`.
/// `None` if either id is missing.
pub fn reorder<T: Clone + PartialEq>(order: &[T], from_id: &T, to_id: &T) -> Option<Vec<T>> {
    let from = order.iter().position(|x| x == from_id)?;
    let to = order.iter().position(|x| x == to_id)?;
    Some(move_index(order, from, to))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Keyboard move: swap places with the neighbour via [`reorder`].
/// `None` at the edges or for unknown ids.
pub fn step<T: Clone + PartialEq>(order: &[T], id: &T, direction: Direction) -> Option<Vec<T>> {
    let pos = order.iter().position(|x| x == id)?;
    let target = match direction {
        Direction::Up => pos.checked_sub(1)?,
        Direction::Down => Some(pos + 1).filter(|p| *p < order.len())?,
    };
    reorder(order, id, &order[target])
}

/// Pointer movement below this many pixels is a click, not a drag.
pub const DRAG_ACTIVATION_DISTANCE: f64 = 5.0;

/// Tracks one pointer drag from press to drop.
#[derive(Debug, Clone, Default)]
pub struct DragTracker<T> {
    pressed: Option<(T, (f64, f64))>,
    active: bool,
}

impl<T: Clone + PartialEq> DragTracker<T> {
    pub fn new() -> Self {
        Self {
            pressed: None,
            active: false,
        }
    }

    pub fn press(&mut self, id: T, x: f64, y: f64) {
        self.pressed = Some((id, (x, y)));
        self.active = false;
    }

    /// Returns whether the drag is active after this movement.
    pub fn moved(&mut self, x: f64, y: f64) -> bool {
        if let Some((_, (ox, oy))) = &self.pressed {
            if !self.active && (x - ox).hypot(y - oy) >= DRAG_ACTIVATION_DISTANCE {
                self.active = true;
            }
        }
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Release over `over`. Yields `(from, to)` for [`reorder`] when the drag
    /// was active and landed on a different item.
    pub fn drop_on(&mut self, over: Option<&T>) -> Option<(T, T)> {
        let pressed = self.pressed.take();
        let active = std::mem::replace(&mut self.active, false);
        let (from, _) = pressed?;
        let over = over?;
        (active && *over != from).then(|| (from, over.clone()))
    }

    pub fn cancel(&mut self) {
        self.pressed = None;
        self.active = false;
    }
}

/// A value with snapshot/apply/commit-or-revert updates.
#[derive(Debug, Default)]
pub struct Optimistic<T> {
    current: Mutex<T>,
    closed: AtomicBool,
}

/// An applied but unconfirmed update; holds the value to restore.
#[must_use = "an optimistic update must be committed or reverted"]
pub struct Pending<'a, T> {
    cell: &'a Optimistic<T>,
    snapshot: T,
}

impl<T: Clone> Optimistic<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: Mutex::new(value),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn get(&self) -> T {
        self.current.lock().await.clone()
    }

    /// Replace without a snapshot, e.g. with a fresh server copy.
    pub async fn set(&self, value: T) {
        if self.is_closed() {
            return;
        }
        *self.current.lock().await = value;
    }

    /// Snapshot the current value and apply `next` immediately.
    pub async fn begin(&self, next: T) -> Pending<'_, T> {
        let mut guard = self.current.lock().await;
        let snapshot = std::mem::replace(&mut *guard, next);
        Pending {
            cell: self,
            snapshot,
        }
    }

    /// Apply `next`, run `commit`, and restore the snapshot if it fails.
    pub async fn apply<F, Fut, E>(&self, next: T, commit: F) -> Result<(), E>
    where
        F: FnOnce(T) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        let pending = self.begin(next.clone()).await;
        match commit(next).await {
            Ok(()) => {
                pending.commit();
                Ok(())
            }
            Err(err) => {
                pending.revert().await;
                Err(err)
            }
        }
    }

    /// After closing, late completions no longer touch the value.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<'a, T> Pending<'a, T> {
    pub fn snapshot(&self) -> &T {
        &self.snapshot
    }

    pub fn commit(self) {}

    pub async fn revert(self) {
        if self.cell.closed.load(Ordering::SeqCst) {
            return;
        }
        *self.cell.current.lock().await = self.snapshot;
    }
}

/// Where a queue's order is read from and written to.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_order(&self, batch_id: Id) -> Result<Vec<Id>, ApiError>;
    async fn persist_order(&self, batch_id: Id, order: &[Id]) -> Result<(), ApiError>;
}

/// Users within a batch.
#[derive(Clone)]
pub struct UserQueue {
    api: Arc<dyn GradingApi>,
}

impl UserQueue {
    pub fn new(api: Arc<dyn GradingApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl QueueBackend for UserQueue {
    fn name(&self) -> &'static str {
        "user-queue"
    }

    async fn fetch_order(&self, batch_id: Id) -> Result<Vec<Id>, ApiError> {
        let mut slots = self.api.get_user_queue(batch_id).await?;
        slots.sort_by_key(|s| s.position);
        Ok(slots.into_iter().map(|s| s.user_id).collect())
    }

    async fn persist_order(&self, batch_id: Id, order: &[Id]) -> Result<(), ApiError> {
        self.api.put_user_queue(batch_id, order).await
    }
}

/// Individual queue entries within a batch.
#[derive(Clone)]
pub struct EntryQueue {
    api: Arc<dyn GradingApi>,
}

impl EntryQueue {
    pub fn new(api: Arc<dyn GradingApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl QueueBackend for EntryQueue {
    fn name(&self) -> &'static str {
        "entries"
    }

    async fn fetch_order(&self, batch_id: Id) -> Result<Vec<Id>, ApiError> {
        let entries = self.api.list_entries(batch_id).await?;
        Ok(order_from_entries(&entries))
    }

    async fn persist_order(&self, batch_id: Id, order: &[Id]) -> Result<(), ApiError> {
        self.api.reorder_entries(batch_id, order).await
    }
}

/// Fallback user order: the payment grouping order.
pub fn order_from_groups(groups: &[UserPaymentGroup]) -> Vec<Id> {
    groups.iter().map(|g| g.user_id()).collect()
}

/// Entry ids by position, ties by id.
pub fn order_from_entries(entries: &[QueueEntry]) -> Vec<Id> {
    let mut sorted: Vec<&QueueEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| (e.position, e.id));
    sorted.into_iter().map(|e| e.id).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSource {
    Remote,
    Fallback,
}

/// Transient message for the operator after a failed reorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNotice {
    pub batch_id: Id,
    pub message: String,
}

#[derive(Debug)]
pub enum ReorderOutcome {
    Committed(Vec<Id>),
    Reverted { restored: Vec<Id>, error: ApiError },
    /// Unknown ids, or a move onto itself or past an edge.
    Unchanged,
}

pub struct QueueEngine<B> {
    backend: B,
    batch_id: Id,
    order: Optimistic<Vec<Id>>,
    notices: StdMutex<Vec<QueueNotice>>,
}

impl<B: QueueBackend> QueueEngine<B> {
    pub fn new(backend: B, batch_id: Id) -> Self {
        Self {
            backend,
            batch_id,
            order: Optimistic::new(Vec::new()),
            notices: StdMutex::new(Vec::new()),
        }
    }

    pub fn batch_id(&self) -> Id {
        self.batch_id
    }

    pub async fn order(&self) -> Vec<Id> {
        self.order.get().await
    }

    /// Load the authoritative order. If that fails, fall back to `fallback`.
    pub async fn open(&self, fallback: Vec<Id>) -> OrderSource {
        match self.backend.fetch_order(self.batch_id).await {
            Ok(order) => {
                self.order.set(order).await;
                OrderSource::Remote
            }
            Err(err) => {
                warn!(
                    ?err,
                    batch_id = self.batch_id,
                    queue = self.backend.name(),
                    "queue fetch failed; using local order"
                );
                self.order.set(fallback).await;
                OrderSource::Fallback
            }
        }
    }

    /// Move `from_id` onto the slot of `to_id` (pointer drop).
    /// A closed engine returns `Unchanged` and sends nothing.
    pub async fn reorder(&self, from_id: Id, to_id: Id) -> ReorderOutcome {
        if self.order.is_closed() {
            return ReorderOutcome::Unchanged;
        }
        let current = self.order.get().await;
        match reorder(&current, &from_id, &to_id) {
            Some(next) if next != current => self.persist(next).await,
            _ => ReorderOutcome::Unchanged,
        }
    }

    /// Keyboard move by one slot.
    pub async fn step(&self, id: Id, direction: Direction) -> ReorderOutcome {
        let current = self.order.get().await;
        let Some(target) = neighbour(&current, id, direction) else {
            return ReorderOutcome::Unchanged;
        };
        self.reorder(id, target).await
    }

    pub async fn move_up(&self, id: Id) -> ReorderOutcome {
        self.step(id, Direction::Up).await
    }

    pub async fn move_down(&self, id: Id) -> ReorderOutcome {
        self.step(id, Direction::Down).await
    }

    async fn persist(&self, next: Vec<Id>) -> ReorderOutcome {
        let pending = self.order.begin(next.clone()).await;
        match self.backend.persist_order(self.batch_id, &next).await {
            Ok(()) => {
                pending.commit();
                info!(
                    batch_id = self.batch_id,
                    queue = self.backend.name(),
                    "queue order saved"
                );
                ReorderOutcome::Committed(next)
            }
            Err(error) => {
                let restored = pending.snapshot().clone();
                pending.revert().await;
                warn!(
                    ?error,
                    batch_id = self.batch_id,
                    queue = self.backend.name(),
                    "queue order rejected; reverted"
                );
                self.push_notice(format!("Could not save the new order: {}", error));
                ReorderOutcome::Reverted { restored, error }
            }
        }
    }

    fn push_notice(&self, message: String) {
        if self.order.is_closed() {
            return;
        }
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(QueueNotice {
                batch_id: self.batch_id,
                message,
            });
        }
    }

    /// Drain pending notices.
    pub fn take_notices(&self) -> Vec<QueueNotice> {
        self.notices
            .lock()
            .map(|mut n| std::mem::take(&mut *n))
            .unwrap_or_default()
    }

    /// Stop applying results of requests still in flight.
    pub fn close(&self) {
        self.order.close();
    }
}

fn neighbour(order: &[Id], id: Id, direction: Direction) -> Option<Id> {
    let pos = order.iter().position(|x| *x == id)?;
    let target = match direction {
        Direction::Up => pos.checked_sub(1)?,
        Direction::Down => pos + 1,
    };
    order.get(target).copied()
}
