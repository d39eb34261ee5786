#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use grading_tracker::api::{ApiError, GradingApi};
use grading_tracker::model::{
    Batch, BatchCategory, BatchPayment, BatchUpdate, CardSubmission, Id, LoginResponse, NewBatch,
    NewBatchPayment, NewSubmission, QueueEntry, Role, StatusEvent, User, UserQueueSlot,
};
use grading_tracker::pipeline::{CertificationUpdate, Status};

pub fn admin() -> User {
    User {
        id: 1,
        name: "Ayu".into(),
        email: "ayu@example.com".into(),
        role: Role::Admin,
    }
}

pub fn customer(id: Id) -> User {
    User {
        id,
        name: format!("Customer {}", id),
        email: format!("c{}@example.com", id),
        role: Role::User,
    }
}

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// A card in batch 7 owned by `user_id` whose latest event is `status`.
pub fn card_at(id: Id, user_id: Id, status: Status) -> CardSubmission {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    CardSubmission {
        id,
        user_id,
        batch_id: Some(7),
        name: format!("Charizard #{}", id),
        year: Some(1999),
        brand: "Pokemon".into(),
        serial_number: None,
        grade_target: "10".into(),
        grade: None,
        payment_url: None,
        image: None,
        certificates: vec![],
        latest_status: None,
        statuses: vec![
            StatusEvent {
                id: Some(1),
                status: Status::Submit.as_str().into(),
                created_at: t0,
            },
            StatusEvent {
                id: Some(2),
                status: status.as_str().into(),
                created_at: t0 + Duration::hours(1),
            },
        ],
        user: Some(customer(user_id)),
        created_at: t0,
    }
}

pub fn payment(id: Id, user_id: Id, url: Option<&str>, is_sent: bool) -> BatchPayment {
    BatchPayment {
        id,
        batch_id: 7,
        user_id,
        user: Some(customer(user_id)),
        payment_url: url.map(str::to_string),
        is_sent,
        sent_at: is_sent.then(Utc::now),
    }
}

/// In-memory backend that records every write.
#[derive(Clone, Default)]
pub struct RecordingApi {
    pub cards: Arc<Mutex<HashMap<Id, CardSubmission>>>,
    pub payments: Arc<Mutex<Vec<BatchPayment>>>,
    pub user_queue: Arc<Mutex<Vec<Id>>>,
    pub entries: Arc<Mutex<Vec<QueueEntry>>>,
    pub status_calls: Arc<Mutex<Vec<(Id, Status)>>>,
    pub cert_calls: Arc<Mutex<Vec<(Id, CertificationUpdate)>>>,
    pub queue_puts: Arc<Mutex<Vec<Vec<Id>>>>,
    pub persist_results: Arc<Mutex<VecDeque<Result<(), ApiError>>>>,
    pub fail_status: Arc<AtomicBool>,
    pub fail_queue_fetch: Arc<AtomicBool>,
    pub requests: Arc<AtomicUsize>,
}

impl RecordingApi {
    pub async fn with_cards(cards: Vec<CardSubmission>) -> Self {
        let api = Self::default();
        {
            let mut guard = api.cards.lock().await;
            for card in cards {
                guard.insert(card.id, card);
            }
        }
        api
    }

    pub async fn push_persist_result(&self, result: Result<(), ApiError>) {
        self.persist_results.lock().await.push_back(result);
    }

    pub async fn status_calls(&self) -> Vec<(Id, Status)> {
        self.status_calls.lock().await.clone()
    }

    pub async fn queue_puts(&self) -> Vec<Vec<Id>> {
        self.queue_puts.lock().await.clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    async fn card(&self, card_id: Id) -> Result<CardSubmission, ApiError> {
        self.cards
            .lock()
            .await
            .get(&card_id)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn next_persist_result(&self) -> Result<(), ApiError> {
        self.persist_results.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl GradingApi for RecordingApi {
    async fn login(&self, email: &str, _password: &str) -> Result<LoginResponse, ApiError> {
        self.hit();
        if email == admin().email {
            Ok(LoginResponse {
                token: "token-admin".into(),
                user: admin(),
            })
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.hit();
        Ok(())
    }

    async fn list_cards(&self) -> Result<Vec<CardSubmission>, ApiError> {
        self.hit();
        let mut cards: Vec<CardSubmission> = self.cards.lock().await.values().cloned().collect();
        cards.sort_by_key(|c| c.id);
        Ok(cards)
    }

    async fn get_card(&self, card_id: Id) -> Result<CardSubmission, ApiError> {
        self.hit();
        self.card(card_id).await
    }

    async fn list_user_cards(&self) -> Result<Vec<CardSubmission>, ApiError> {
        self.list_cards().await
    }

    async fn get_user_card(&self, card_id: Id) -> Result<CardSubmission, ApiError> {
        self.hit();
        self.card(card_id).await
    }

    async fn submit_card(&self, card: &NewSubmission) -> Result<CardSubmission, ApiError> {
        self.hit();
        let mut cards = self.cards.lock().await;
        let id = cards.keys().max().copied().unwrap_or(0) + 1;
        let mut created = card_at(id, 2, Status::Submit);
        created.name = card.name.clone();
        created.batch_id = card.batch_id;
        cards.insert(id, created.clone());
        Ok(created)
    }

    async fn set_status(&self, card_id: Id, status: Status) -> Result<(), ApiError> {
        self.hit();
        self.status_calls.lock().await.push((card_id, status));
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                body: "boom".into(),
            });
        }
        let mut cards = self.cards.lock().await;
        let card = cards.get_mut(&card_id).ok_or(ApiError::NotFound)?;
        let last = card
            .latest_event()
            .map(|e| e.created_at)
            .unwrap_or(card.created_at);
        card.statuses.push(StatusEvent {
            id: None,
            status: status.as_str().into(),
            created_at: last + Duration::minutes(5),
        });
        Ok(())
    }

    async fn update_certification(
        &self,
        card_id: Id,
        update: &CertificationUpdate,
    ) -> Result<(), ApiError> {
        self.hit();
        self.cert_calls.lock().await.push((card_id, update.clone()));
        let mut cards = self.cards.lock().await;
        let card = cards.get_mut(&card_id).ok_or(ApiError::NotFound)?;
        card.grade = Some(update.grade.clone());
        card.serial_number = Some(update.serial_number.clone());
        card.certificates = update.certificates.clone();
        Ok(())
    }

    async fn list_batches(&self) -> Result<Vec<Batch>, ApiError> {
        self.hit();
        Ok(vec![Batch {
            id: 7,
            name: "March PSA".into(),
            category: BatchCategory::PsaJapan,
            services: "Regular".into(),
            is_active: true,
            register_number: "R-7".into(),
            created_at: None,
        }])
    }

    async fn list_active_batches(&self) -> Result<Vec<Batch>, ApiError> {
        self.list_batches().await
    }

    async fn create_batch(&self, batch: &NewBatch) -> Result<Batch, ApiError> {
        self.hit();
        Ok(Batch {
            id: 8,
            name: batch.name.clone(),
            category: batch.category,
            services: batch.services.clone(),
            is_active: batch.is_active,
            register_number: batch.register_number.clone(),
            created_at: None,
        })
    }

    async fn update_batch(&self, batch_id: Id, update: &BatchUpdate) -> Result<Batch, ApiError> {
        self.hit();
        let mut batch = self
            .list_batches()
            .await?
            .into_iter()
            .find(|b| b.id == batch_id)
            .ok_or(ApiError::NotFound)?;
        if let Some(active) = update.is_active {
            batch.is_active = active;
        }
        Ok(batch)
    }

    async fn get_user_queue(&self, _batch_id: Id) -> Result<Vec<UserQueueSlot>, ApiError> {
        self.hit();
        if self.fail_queue_fetch.load(Ordering::SeqCst) {
            return Err(ApiError::Timeout);
        }
        Ok(self
            .user_queue
            .lock()
            .await
            .iter()
            .enumerate()
            .rev()
            .map(|(i, user_id)| UserQueueSlot {
                user_id: *user_id,
                position: i as i64 + 1,
                user: None,
            })
            .collect())
    }

    async fn put_user_queue(&self, _batch_id: Id, user_ids: &[Id]) -> Result<(), ApiError> {
        self.hit();
        self.queue_puts.lock().await.push(user_ids.to_vec());
        self.next_persist_result().await?;
        *self.user_queue.lock().await = user_ids.to_vec();
        Ok(())
    }

    async fn list_entries(&self, _batch_id: Id) -> Result<Vec<QueueEntry>, ApiError> {
        self.hit();
        if self.fail_queue_fetch.load(Ordering::SeqCst) {
            return Err(ApiError::Timeout);
        }
        Ok(self.entries.lock().await.clone())
    }

    async fn reorder_entries(&self, _batch_id: Id, entry_ids: &[Id]) -> Result<(), ApiError> {
        self.hit();
        self.queue_puts.lock().await.push(entry_ids.to_vec());
        self.next_persist_result().await?;
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if let Some(pos) = entry_ids.iter().position(|id| *id == entry.id) {
                entry.position = pos as i64 + 1;
            }
        }
        Ok(())
    }

    async fn list_batch_payments(&self, batch_id: Id) -> Result<Vec<BatchPayment>, ApiError> {
        self.hit();
        Ok(self
            .payments
            .lock()
            .await
            .iter()
            .filter(|p| p.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn create_batch_payment(
        &self,
        payment: &NewBatchPayment,
    ) -> Result<BatchPayment, ApiError> {
        self.hit();
        let mut payments = self.payments.lock().await;
        if let Some(existing) = payments
            .iter_mut()
            .find(|p| p.batch_id == payment.batch_id && p.user_id == payment.user_id)
        {
            existing.payment_url = Some(payment.payment_url.clone());
            return Ok(existing.clone());
        }
        let created = BatchPayment {
            id: 500 + payments.len() as Id,
            batch_id: payment.batch_id,
            user_id: payment.user_id,
            user: Some(customer(payment.user_id)),
            payment_url: Some(payment.payment_url.clone()),
            is_sent: false,
            sent_at: None,
        };
        payments.push(created.clone());
        Ok(created)
    }

    async fn send_batch_payment(&self, payment_id: Id) -> Result<BatchPayment, ApiError> {
        self.hit();
        let mut payments = self.payments.lock().await;
        let payment = payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or(ApiError::NotFound)?;
        payment.is_sent = true;
        payment.sent_at = Some(Utc::now());
        Ok(payment.clone())
    }
}
