//! Status writes for a card.
//!
//! The guided operations (`advance`, `reject`, `submit_certification`,
//! `confirm_as_user`) only ever move a card one step along the pipeline.
//! `force_set_status` is the admin override and accepts any status.
//! Every write is confirm-then-refresh: nothing changes locally until the
//! backend accepts it, and the returned card is a fresh copy.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::api::{ApiError, GradingApi};
use crate::db::{self, Pool};
use crate::model::{
    BatchPayment, CardSubmission, Id, NewBatchPayment, Role, TransitionKind, TransitionOutcome,
    User,
};
use crate::pipeline::{
    admin_action, AdminAction, CertificationForm, FormError, PaymentGate, Status, UnknownStatus,
};
use crate::session::Session;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("admin role required")]
    NotAdmin,
    #[error("card {0} belongs to another user")]
    NotOwner(Id),
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),
    #[error("no further action for status '{0}'")]
    NoFurtherAction(Status),
    #[error("status '{0}' is waiting on the card owner")]
    WaitingOnUser(Status),
    #[error("status '{0}' needs the grade and certificate form")]
    RequiresForm(Status),
    #[error("status '{status}' is gated by the batch payment: {gate:?}")]
    RequiresBatchPayment { status: Status, gate: PaymentGate },
    #[error("status '{0}' cannot be rejected")]
    NotRejectable(Status),
    #[error("the certificate form applies to delivery_process_to_id, card is at '{0}'")]
    FormNotExpected(Status),
    #[error("card {0} is not in a batch")]
    NoBatch(Id),
    #[error("no unsent payment link for this card's owner")]
    NoPaymentLinkToSend,
    #[error("payment link is empty")]
    EmptyPaymentUrl,
    #[error(transparent)]
    Form(#[from] FormError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A card together with the admin action available for it.
#[derive(Debug, Clone)]
pub struct CardAction {
    pub card: CardSubmission,
    pub status: Status,
    pub action: AdminAction,
}

pub struct Workflow {
    api: Arc<dyn GradingApi>,
    session: Session,
    log: Option<Pool>,
}

impl Workflow {
    pub fn new(api: Arc<dyn GradingApi>, session: Session) -> Self {
        Self {
            api,
            session,
            log: None,
        }
    }

    /// Record every transition attempt in the local store.
    pub fn with_log(mut self, pool: Pool) -> Self {
        self.log = Some(pool);
        self
    }

    async fn require_admin(&self) -> Result<User, WorkflowError> {
        let user = self.session.user().await.ok_or(WorkflowError::NotLoggedIn)?;
        if user.role != Role::Admin {
            return Err(WorkflowError::NotAdmin);
        }
        Ok(user)
    }

    /// Payment record of the card owner in the card's batch, if any.
    pub async fn owner_payment(
        &self,
        card: &CardSubmission,
    ) -> Result<Option<BatchPayment>, WorkflowError> {
        let batch_id = card.batch_id.ok_or(WorkflowError::NoBatch(card.id))?;
        let payments = self.api.list_batch_payments(batch_id).await?;
        Ok(payments.into_iter().find(|p| p.user_id == card.user_id))
    }

    /// Resolve what an admin can do with the card right now.
    #[instrument(skip(self))]
    pub async fn next_action(&self, card_id: Id) -> Result<CardAction, WorkflowError> {
        let card = self.api.get_card(card_id).await?;
        let status = card.current_status()?;
        let payment = match status.next_step() {
            Some(step) if step.is_batch_payment_status => self.owner_payment(&card).await?,
            _ => None,
        };
        let action = admin_action(status, payment.as_ref());
        Ok(CardAction {
            card,
            status,
            action,
        })
    }

    /// Move the card one step forward. Refuses whenever the step needs a
    /// form, the payment gate, or the card owner.
    #[instrument(skip(self))]
    pub async fn advance(&self, card_id: Id) -> Result<CardSubmission, WorkflowError> {
        self.require_admin().await?;
        let CardAction { card, status, action } = self.next_action(card_id).await?;
        let to = match action {
            AdminAction::Advance { to, .. } => to,
            AdminAction::BatchPayment(PaymentGate::Proceed { to, .. }) => to,
            AdminAction::BatchPayment(gate) => {
                return Err(WorkflowError::RequiresBatchPayment { status, gate })
            }
            AdminAction::SpecialForm { .. } => return Err(WorkflowError::RequiresForm(status)),
            AdminAction::WaitingOnUser { .. } => return Err(WorkflowError::WaitingOnUser(status)),
            AdminAction::Terminal => return Err(WorkflowError::NoFurtherAction(status)),
        };
        self.transition(&card, Some(status), to, TransitionKind::Advance)
            .await?;
        Ok(self.api.get_card(card.id).await?)
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, card_id: Id) -> Result<CardSubmission, WorkflowError> {
        self.require_admin().await?;
        let card = self.api.get_card(card_id).await?;
        let status = card.current_status()?;
        match status.next_step() {
            Some(step) if step.has_reject => {}
            _ => return Err(WorkflowError::NotRejectable(status)),
        }
        self.transition(&card, Some(status), Status::Rejected, TransitionKind::Reject)
            .await?;
        Ok(self.api.get_card(card.id).await?)
    }

    /// Capture grade, serial number and certificates, then move the card to
    /// `received_by_wh_id`. The form is validated before any request is made.
    #[instrument(skip(self, form))]
    pub async fn submit_certification(
        &self,
        card_id: Id,
        form: &CertificationForm,
    ) -> Result<CardSubmission, WorkflowError> {
        let update = form.validate()?;
        self.require_admin().await?;
        let card = self.api.get_card(card_id).await?;
        let status = card.current_status()?;
        let Some(step) = status.next_step().filter(|s| s.has_special_form) else {
            return Err(WorkflowError::FormNotExpected(status));
        };
        self.api.update_certification(card.id, &update).await?;
        self.transition(&card, Some(status), step.next_status, TransitionKind::Certify)
            .await?;
        Ok(self.api.get_card(card.id).await?)
    }

    /// Create or replace the payment link for the card owner's batch payment.
    /// Does not move the card.
    #[instrument(skip(self, payment_url))]
    pub async fn set_payment_url(
        &self,
        batch_id: Id,
        user_id: Id,
        payment_url: &str,
    ) -> Result<BatchPayment, WorkflowError> {
        let payment_url = payment_url.trim();
        if payment_url.is_empty() {
            return Err(WorkflowError::EmptyPaymentUrl);
        }
        self.require_admin().await?;
        let payment = self
            .api
            .create_batch_payment(&NewBatchPayment {
                batch_id,
                user_id,
                payment_url: payment_url.to_string(),
            })
            .await?;
        info!(batch_id, user_id, payment_id = payment.id, "payment link set");
        Ok(payment)
    }

    /// Mark the link as sent. Only valid in the `SendLink` gate state with a
    /// link already set.
    #[instrument(skip(self))]
    pub async fn send_payment_link(&self, card_id: Id) -> Result<BatchPayment, WorkflowError> {
        self.require_admin().await?;
        let CardAction { action, .. } = self.next_action(card_id).await?;
        let AdminAction::BatchPayment(PaymentGate::SendLink {
            payment_id,
            has_url: true,
        }) = action
        else {
            return Err(WorkflowError::NoPaymentLinkToSend);
        };
        let payment = self.api.send_batch_payment(payment_id).await?;
        info!(card_id, payment_id, "payment link sent");
        Ok(payment)
    }

    /// Send the link of one user's batch payment from the batch overview.
    #[instrument(skip(self))]
    pub async fn send_link_for_user(
        &self,
        batch_id: Id,
        user_id: Id,
    ) -> Result<BatchPayment, WorkflowError> {
        self.require_admin().await?;
        let payments = self.api.list_batch_payments(batch_id).await?;
        let Some(payment) = payments
            .into_iter()
            .find(|p| p.user_id == user_id)
            .filter(|p| !p.is_sent && p.has_link())
        else {
            return Err(WorkflowError::NoPaymentLinkToSend);
        };
        let sent = self.api.send_batch_payment(payment.id).await?;
        info!(batch_id, user_id, payment_id = sent.id, "payment link sent");
        Ok(sent)
    }

    /// Owner-side step for statuses that wait on the user.
    #[instrument(skip(self))]
    pub async fn confirm_as_user(&self, card_id: Id) -> Result<CardSubmission, WorkflowError> {
        let user = self.session.user().await.ok_or(WorkflowError::NotLoggedIn)?;
        let card = self.api.get_user_card(card_id).await?;
        if card.user_id != user.id {
            return Err(WorkflowError::NotOwner(card_id));
        }
        let status = card.current_status()?;
        let step = match status.next_step() {
            Some(step) if step.is_waiting_user => step,
            _ => return Err(WorkflowError::NoFurtherAction(status)),
        };
        self.transition(&card, Some(status), step.next_status, TransitionKind::UserConfirm)
            .await?;
        Ok(self.api.get_user_card(card.id).await?)
    }

    /// Admin override: set any status, skipping the guided path.
    #[instrument(skip(self))]
    pub async fn force_set_status(
        &self,
        card_id: Id,
        status: Status,
    ) -> Result<CardSubmission, WorkflowError> {
        self.require_admin().await?;
        let card = self.api.get_card(card_id).await?;
        let from = card.current_status().ok();
        warn!(card_id, from = ?from, to = %status, "admin override");
        self.transition(&card, from, status, TransitionKind::Override)
            .await?;
        Ok(self.api.get_card(card.id).await?)
    }

    async fn transition(
        &self,
        card: &CardSubmission,
        from: Option<Status>,
        to: Status,
        kind: TransitionKind,
    ) -> Result<(), WorkflowError> {
        let result = self.api.set_status(card.id, to).await;
        let (outcome, error) = match &result {
            Ok(()) => {
                info!(
                    card_id = card.id,
                    from = ?from,
                    to = %to,
                    kind = kind.as_str(),
                    "status updated"
                );
                (TransitionOutcome::Applied, None)
            }
            Err(err) => {
                warn!(
                    ?err,
                    card_id = card.id,
                    to = %to,
                    kind = kind.as_str(),
                    "status update failed"
                );
                (TransitionOutcome::Failed, Some(err.to_string()))
            }
        };
        if let Some(pool) = &self.log {
            if let Err(err) = db::record_transition(
                pool,
                card.id,
                from.map(|s| s.as_str()),
                to.as_str(),
                kind,
                outcome,
                error.as_deref(),
            )
            .await
            {
                warn!(?err, "failed to record transition");
            }
        }
        result.map_err(WorkflowError::from)
    }
}
