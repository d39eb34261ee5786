use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{
    Batch, BatchPayment, BatchUpdate, CardSubmission, Id, LoginResponse, NewBatch,
    NewBatchPayment, NewSubmission, QueueEntry, UserQueueSlot,
};
use crate::pipeline::{CertificationUpdate, Status};
use crate::session::Session;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("not authorized; logged out")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, Vec<String>>,
    },
    #[error("backend error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("invalid endpoint: {0}")]
    Url(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err)
        }
    }
}

/// Every backend call the engines rely on. `ApiClient` is the real
/// implementation; tests substitute recording fakes.
#[async_trait]
pub trait GradingApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError>;
    async fn logout(&self) -> Result<(), ApiError>;

    async fn list_cards(&self) -> Result<Vec<CardSubmission>, ApiError>;
    async fn get_card(&self, card_id: Id) -> Result<CardSubmission, ApiError>;
    async fn list_user_cards(&self) -> Result<Vec<CardSubmission>, ApiError>;
    async fn get_user_card(&self, card_id: Id) -> Result<CardSubmission, ApiError>;
    async fn submit_card(&self, card: &NewSubmission) -> Result<CardSubmission, ApiError>;

    async fn set_status(&self, card_id: Id, status: Status) -> Result<(), ApiError>;
    async fn update_certification(
        &self,
        card_id: Id,
        update: &CertificationUpdate,
    ) -> Result<(), ApiError>;

    async fn list_batches(&self) -> Result<Vec<Batch>, ApiError>;
    async fn list_active_batches(&self) -> Result<Vec<Batch>, ApiError>;
    async fn create_batch(&self, batch: &NewBatch) -> Result<Batch, ApiError>;
    async fn update_batch(&self, batch_id: Id, update: &BatchUpdate) -> Result<Batch, ApiError>;

    async fn get_user_queue(&self, batch_id: Id) -> Result<Vec<UserQueueSlot>, ApiError>;
    async fn put_user_queue(&self, batch_id: Id, user_ids: &[Id]) -> Result<(), ApiError>;
    async fn list_entries(&self, batch_id: Id) -> Result<Vec<QueueEntry>, ApiError>;
    async fn reorder_entries(&self, batch_id: Id, entry_ids: &[Id]) -> Result<(), ApiError>;

    async fn list_batch_payments(&self, batch_id: Id) -> Result<Vec<BatchPayment>, ApiError>;
    async fn create_batch_payment(
        &self,
        payment: &NewBatchPayment,
    ) -> Result<BatchPayment, ApiError>;
    async fn send_batch_payment(&self, payment_id: Id) -> Result<BatchPayment, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    storage_base_url: Url,
    session: Session,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("storage_base_url", &self.storage_base_url)
            .finish_non_exhaustive()
    }
}

/// Bodies arrive either bare or wrapped in `{"data": ...}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(v) => v,
        }
    }
}

#[derive(Deserialize, Default)]
struct ValidationBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: BTreeMap<String, Vec<String>>,
}

/// Joined URLs keep the base path, so a base without a trailing slash gets one.
fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn parse_url(raw: &str) -> Result<Url, ApiError> {
    Url::parse(raw.trim()).map_err(|e| ApiError::Url(format!("{}: {}", raw, e)))
}

fn join_url(base: &Url, path: &str) -> Result<Url, ApiError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|e| ApiError::Url(format!("{}: {}", path, e)))
}

impl ApiClient {
    pub fn new(
        base_url: Url,
        storage_base_url: Url,
        timeout: Duration,
        session: Session,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("grading-tracker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_base(base_url),
            storage_base_url: normalize_base(storage_base_url),
            session,
        })
    }

    pub fn from_config(cfg: &Config, session: Session) -> Result<Self, ApiError> {
        let endpoints = cfg.active_endpoints();
        let base = parse_url(&endpoints.api_base_url)?;
        let storage = parse_url(&endpoints.storage_base_url)?;
        Self::new(base, storage, cfg.request_timeout(), session)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Absolute URL of a file kept in backend storage (card images).
    pub fn storage_url(&self, path: &str) -> Result<Url, ApiError> {
        join_url(&self.storage_base_url, path)
    }

    pub async fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request, ApiError> {
        let endpoint = join_url(&self.base_url, path)?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Accept", "application/json")
            .header("X-Request-Id", Uuid::new_v4().to_string());
        if let Some(token) = self.session.token().await {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.build()?)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, ApiError> {
        let request = self.build_request(method, path, body.as_ref()).await?;
        debug!(method = %request.method(), url = %request.url(), "sending request");
        let res = self.http.execute(request).await?;
        self.check(res).await
    }

    async fn check(&self, res: Response) -> Result<Response, ApiError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        match status {
            StatusCode::UNAUTHORIZED => {
                self.session.expire().await;
                Err(ApiError::Unauthorized)
            }
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = res.text().await.unwrap_or_default();
                let parsed: ValidationBody = serde_json::from_str(&body).unwrap_or_default();
                Err(ApiError::Validation {
                    message: parsed.message.unwrap_or_else(|| "invalid input".into()),
                    fields: parsed.errors,
                })
            }
            _ => {
                let body = res.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "backend error");
                Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let res = self.execute(method, path, body).await?;
        let text = res.text().await?;
        serde_json::from_str::<Envelope<T>>(&text)
            .map(Envelope::into_inner)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<(), ApiError> {
        self.execute(method, path, body).await.map(|_| ())
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl GradingApi for ApiClient {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let body = json!({ "email": email, "password": password });
        self.fetch(Method::POST, "login", Some(body)).await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.send(Method::POST, "logout", None).await
    }

    async fn list_cards(&self) -> Result<Vec<CardSubmission>, ApiError> {
        self.fetch(Method::GET, "card", None).await
    }

    async fn get_card(&self, card_id: Id) -> Result<CardSubmission, ApiError> {
        self.fetch(Method::GET, &format!("card/{}", card_id), None).await
    }

    async fn list_user_cards(&self) -> Result<Vec<CardSubmission>, ApiError> {
        self.fetch(Method::GET, "user-cards", None).await
    }

    async fn get_user_card(&self, card_id: Id) -> Result<CardSubmission, ApiError> {
        self.fetch(Method::GET, &format!("user-cards/{}", card_id), None).await
    }

    async fn submit_card(&self, card: &NewSubmission) -> Result<CardSubmission, ApiError> {
        self.fetch(Method::POST, "card", Some(to_body(card)?)).await
    }

    async fn set_status(&self, card_id: Id, status: Status) -> Result<(), ApiError> {
        let body = json!({ "card_id": card_id, "status": status.as_str() });
        self.send(Method::POST, "status", Some(body)).await
    }

    async fn update_certification(
        &self,
        card_id: Id,
        update: &CertificationUpdate,
    ) -> Result<(), ApiError> {
        self.send(Method::PUT, &format!("card/{}", card_id), Some(to_body(update)?))
            .await
    }

    async fn list_batches(&self) -> Result<Vec<Batch>, ApiError> {
        self.fetch(Method::GET, "batches", None).await
    }

    async fn list_active_batches(&self) -> Result<Vec<Batch>, ApiError> {
        self.fetch(Method::GET, "active-batches", None).await
    }

    async fn create_batch(&self, batch: &NewBatch) -> Result<Batch, ApiError> {
        self.fetch(Method::POST, "batches", Some(to_body(batch)?)).await
    }

    async fn update_batch(&self, batch_id: Id, update: &BatchUpdate) -> Result<Batch, ApiError> {
        self.fetch(Method::PUT, &format!("batches/{}", batch_id), Some(to_body(update)?))
            .await
    }

    async fn get_user_queue(&self, batch_id: Id) -> Result<Vec<UserQueueSlot>, ApiError> {
        self.fetch(Method::GET, &format!("batches/{}/user-queue", batch_id), None)
            .await
    }

    async fn put_user_queue(&self, batch_id: Id, user_ids: &[Id]) -> Result<(), ApiError> {
        let body = json!({ "user_ids": user_ids });
        self.send(Method::PUT, &format!("batches/{}/user-queue", batch_id), Some(body))
            .await
    }

    async fn list_entries(&self, batch_id: Id) -> Result<Vec<QueueEntry>, ApiError> {
        self.fetch(Method::GET, &format!("batches/{}/entries", batch_id), None)
            .await
    }

    async fn reorder_entries(&self, batch_id: Id, entry_ids: &[Id]) -> Result<(), ApiError> {
        let body = json!({ "entry_ids": entry_ids });
        self.send(
            Method::PATCH,
            &format!("batches/{}/entries/order", batch_id),
            Some(body),
        )
        .await
    }

    async fn list_batch_payments(&self, batch_id: Id) -> Result<Vec<BatchPayment>, ApiError> {
        self.fetch(Method::GET, &format!("batch-payments/batch/{}", batch_id), None)
            .await
    }

    async fn create_batch_payment(
        &self,
        payment: &NewBatchPayment,
    ) -> Result<BatchPayment, ApiError> {
        self.fetch(Method::POST, "batch-payments", Some(to_body(payment)?))
            .await
    }

    async fn send_batch_payment(&self, payment_id: Id) -> Result<BatchPayment, ApiError> {
        self.fetch(Method::PUT, &format!("batch-payments/{}/send", payment_id), None)
            .await
    }
}
