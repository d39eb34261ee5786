//! Status pipeline for a card submission.
//!
//! The pipeline is a fixed, forward-only sequence of statuses. Every status
//! except `done` and `rejected` has exactly one successor, described by a
//! [`NextStep`]. The table lives in [`Status::next_step`] as an exhaustive
//! `match`, so adding a status without a table entry does not compile.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::model::{BatchPayment, Certificate, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Submit,
    SubmitApproved,
    WaitingToJp,
    OnDeliveryToJp,
    ReceivedByJpWh,
    SubmittedToPsa,
    PsaArrived,
    PsaOrderProcessed,
    PsaResearch,
    PsaGrading,
    PsaHolderSealed,
    PsaQc,
    PsaCompleted,
    ReceivedByJpFromPsa,
    DeliveryProcessToId,
    ReceivedByWhId,
    PaymentRequest,
    PaymentConfirmed,
    Packing,
    DeliveryToCustomer,
    ReceivedByCustomer,
    Done,
    Rejected,
}

/// The guided pipeline, in order. `rejected` is a branch, not a step.
pub const PIPELINE: [Status; 22] = [
    Status::Submit,
    Status::SubmitApproved,
    Status::WaitingToJp,
    Status::OnDeliveryToJp,
    Status::ReceivedByJpWh,
    Status::SubmittedToPsa,
    Status::PsaArrived,
    Status::PsaOrderProcessed,
    Status::PsaResearch,
    Status::PsaGrading,
    Status::PsaHolderSealed,
    Status::PsaQc,
    Status::PsaCompleted,
    Status::ReceivedByJpFromPsa,
    Status::DeliveryProcessToId,
    Status::ReceivedByWhId,
    Status::PaymentRequest,
    Status::PaymentConfirmed,
    Status::Packing,
    Status::DeliveryToCustomer,
    Status::ReceivedByCustomer,
    Status::Done,
];

/// Human labels for every status, in pipeline order, `rejected` last.
pub const STATUS_LABELS: [(Status, &str); 23] = [
    (Status::Submit, "Submitted"),
    (Status::SubmitApproved, "Submission Approved"),
    (Status::WaitingToJp, "Waiting to Ship to Japan"),
    (Status::OnDeliveryToJp, "On Delivery to Japan"),
    (Status::ReceivedByJpWh, "Received by Japan Warehouse"),
    (Status::SubmittedToPsa, "Submitted to PSA"),
    (Status::PsaArrived, "Arrived at PSA"),
    (Status::PsaOrderProcessed, "PSA Order Processed"),
    (Status::PsaResearch, "PSA Research & ID"),
    (Status::PsaGrading, "PSA Grading"),
    (Status::PsaHolderSealed, "PSA Holder Sealed"),
    (Status::PsaQc, "PSA Quality Check"),
    (Status::PsaCompleted, "PSA Grading Completed"),
    (Status::ReceivedByJpFromPsa, "Back at Japan Warehouse"),
    (Status::DeliveryProcessToId, "Delivery Process to Indonesia"),
    (Status::ReceivedByWhId, "Received by Indonesia Warehouse"),
    (Status::PaymentRequest, "Payment Requested"),
    (Status::PaymentConfirmed, "Payment Confirmed"),
    (Status::Packing, "Packing"),
    (Status::DeliveryToCustomer, "Delivery to Customer"),
    (Status::ReceivedByCustomer, "Received by Customer"),
    (Status::Done, "Done"),
    (Status::Rejected, "Rejected"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

/// Transition descriptor for one pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextStep {
    pub next_status: Status,
    pub next_label: &'static str,
    pub has_reject: bool,
    pub has_special_form: bool,
    /// The card owner, not an admin, performs this step.
    pub is_waiting_user: bool,
    /// Gated behind the batch payment of the card's owner.
    pub is_batch_payment_status: bool,
}

impl NextStep {
    const fn to(next_status: Status, next_label: &'static str) -> Self {
        Self {
            next_status,
            next_label,
            has_reject: false,
            has_special_form: false,
            is_waiting_user: false,
            is_batch_payment_status: false,
        }
    }

    const fn with_reject(mut self) -> Self {
        self.has_reject = true;
        self
    }

    const fn with_special_form(mut self) -> Self {
        self.has_special_form = true;
        self
    }

    const fn waiting_user(mut self) -> Self {
        self.is_waiting_user = true;
        self
    }

    const fn batch_payment(mut self) -> Self {
        self.is_batch_payment_status = true;
        self
    }
}

impl Status {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Submit => "submit",
            Status::SubmitApproved => "submit_approved",
            Status::WaitingToJp => "waiting_to_jp",
            Status::OnDeliveryToJp => "on_delivery_to_jp",
            Status::ReceivedByJpWh => "received_by_jp_wh",
            Status::SubmittedToPsa => "submitted_to_psa",
            Status::PsaArrived => "psa_arrived",
            Status::PsaOrderProcessed => "psa_order_processed",
            Status::PsaResearch => "psa_research",
            Status::PsaGrading => "psa_grading",
            Status::PsaHolderSealed => "psa_holder_sealed",
            Status::PsaQc => "psa_qc",
            Status::PsaCompleted => "psa_completed",
            Status::ReceivedByJpFromPsa => "received_by_jp_from_psa",
            Status::DeliveryProcessToId => "delivery_process_to_id",
            Status::ReceivedByWhId => "received_by_wh_id",
            Status::PaymentRequest => "payment_request",
            Status::PaymentConfirmed => "payment_confirmed",
            Status::Packing => "packing",
            Status::DeliveryToCustomer => "delivery_to_customer",
            Status::ReceivedByCustomer => "received_by_customer",
            Status::Done => "done",
            Status::Rejected => "rejected",
        }
    }

    pub const fn next_step(&self) -> Option<NextStep> {
        use Status::*;
        let step = match self {
            Submit => NextStep::to(SubmitApproved, "Approve Submission").with_reject(),
            SubmitApproved => NextStep::to(WaitingToJp, "Ready to Ship to Japan"),
            WaitingToJp => NextStep::to(OnDeliveryToJp, "Mark Shipped to Japan"),
            OnDeliveryToJp => NextStep::to(ReceivedByJpWh, "Received by JP Warehouse"),
            ReceivedByJpWh => NextStep::to(SubmittedToPsa, "Submit to PSA").with_reject(),
            SubmittedToPsa => NextStep::to(PsaArrived, "PSA Arrived"),
            PsaArrived => NextStep::to(PsaOrderProcessed, "Order Processed"),
            PsaOrderProcessed => NextStep::to(PsaResearch, "Research & ID"),
            PsaResearch => NextStep::to(PsaGrading, "Start Grading"),
            PsaGrading => NextStep::to(PsaHolderSealed, "Holder Sealed"),
            PsaHolderSealed => NextStep::to(PsaQc, "Quality Check"),
            PsaQc => NextStep::to(PsaCompleted, "Grading Completed").with_reject(),
            PsaCompleted => NextStep::to(ReceivedByJpFromPsa, "Back at JP Warehouse"),
            ReceivedByJpFromPsa => NextStep::to(DeliveryProcessToId, "Ship to Indonesia"),
            DeliveryProcessToId => {
                NextStep::to(ReceivedByWhId, "Received by ID Warehouse").with_special_form()
            }
            ReceivedByWhId => NextStep::to(PaymentRequest, "Request Payment").batch_payment(),
            PaymentRequest => NextStep::to(PaymentConfirmed, "Confirm Payment").waiting_user(),
            PaymentConfirmed => NextStep::to(Packing, "Start Packing"),
            Packing => NextStep::to(DeliveryToCustomer, "Ship to Customer"),
            DeliveryToCustomer => NextStep::to(ReceivedByCustomer, "Mark Delivered"),
            ReceivedByCustomer => NextStep::to(Done, "Confirm Received").waiting_user(),
            Done | Rejected => return None,
        };
        Some(step)
    }

    pub fn label(&self) -> &'static str {
        STATUS_LABELS
            .iter()
            .find(|(status, _)| status == self)
            .map(|(_, label)| *label)
            .unwrap_or_else(|| self.as_str())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Rejected)
    }

    /// Position in [`PIPELINE`]; `None` for `rejected`.
    pub fn position(&self) -> Option<usize> {
        PIPELINE.iter().position(|s| s == self)
    }

    pub fn all() -> impl Iterator<Item = Status> {
        STATUS_LABELS.iter().map(|(s, _)| *s)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        Status::all()
            .find(|status| status.as_str() == key)
            .ok_or_else(|| UnknownStatus(key.to_string()))
    }
}

/// Next step for a raw status key, `None` when no further action exists.
pub fn resolve_next_step(key: &str) -> Option<NextStep> {
    key.parse::<Status>().ok().and_then(|s| s.next_step())
}

/// Whether the guided path may move a card from `from` straight to `to`.
pub fn is_guided_transition(from: Status, to: Status) -> bool {
    match from.next_step() {
        Some(step) => step.next_status == to || (step.has_reject && to == Status::Rejected),
        None => false,
    }
}

/// Display text for a status key. Unknown keys are humanized.
pub fn status_display_text(key: &str) -> Cow<'static, str> {
    match key.parse::<Status>() {
        Ok(status) => Cow::Borrowed(status.label()),
        Err(_) => Cow::Owned(humanize(key)),
    }
}

fn humanize(key: &str) -> String {
    key.replace('_', " ")
}

/// Sub-state of the `received_by_wh_id` step, driven by the owner's batch payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentGate {
    /// No payment record yet; the link has to be created in batch payment management.
    NoBatchPayment,
    /// A record exists but the link was not sent. Sending does not move the card.
    SendLink { payment_id: Id, has_url: bool },
    /// The link was sent; the card can move to `payment_request`.
    Proceed { to: Status, label: &'static str },
}

impl PaymentGate {
    pub fn resolve(step: &NextStep, payment: Option<&BatchPayment>) -> Self {
        match payment {
            None => PaymentGate::NoBatchPayment,
            Some(p) if !p.is_sent => PaymentGate::SendLink {
                payment_id: p.id,
                has_url: p.has_link(),
            },
            Some(_) => PaymentGate::Proceed {
                to: step.next_status,
                label: step.next_label,
            },
        }
    }
}

/// What an admin can do with a card in its current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAction {
    Advance {
        to: Status,
        label: &'static str,
        can_reject: bool,
    },
    /// Grade, serial number and certificate links must be captured first.
    SpecialForm {
        to: Status,
        label: &'static str,
        can_reject: bool,
    },
    BatchPayment(PaymentGate),
    /// Blocked until the card owner confirms.
    WaitingOnUser { label: &'static str },
    Terminal,
}

pub fn admin_action(status: Status, payment: Option<&BatchPayment>) -> AdminAction {
    let Some(step) = status.next_step() else {
        return AdminAction::Terminal;
    };
    if step.is_waiting_user {
        return AdminAction::WaitingOnUser {
            label: step.next_label,
        };
    }
    if step.has_special_form {
        return AdminAction::SpecialForm {
            to: step.next_status,
            label: step.next_label,
            can_reject: step.has_reject,
        };
    }
    if step.is_batch_payment_status {
        return AdminAction::BatchPayment(PaymentGate::resolve(&step, payment));
    }
    AdminAction::Advance {
        to: step.next_status,
        label: step.next_label,
        can_reject: step.has_reject,
    }
}

pub const MAX_CERTIFICATES: usize = 5;

static CERT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("valid certificate url regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("grade is required")]
    MissingGrade,
    #[error("serial number is required")]
    MissingSerialNumber,
    #[error("at least one certificate link is required")]
    NoCertificates,
    #[error("at most 5 certificate links are allowed, got {0}")]
    TooManyCertificates(usize),
    #[error("certificate link #{0} is empty")]
    EmptyCertificateUrl(usize),
    #[error("certificate link #{index} is not an http(s) URL: {url}")]
    InvalidCertificateUrl { index: usize, url: String },
}

/// Input captured at `delivery_process_to_id` before the card can move on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificationForm {
    pub grade: String,
    pub serial_number: String,
    pub certificates: Vec<Certificate>,
}

/// A form that passed validation; this is the `PUT /card/{id}` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificationUpdate {
    pub grade: String,
    pub serial_number: String,
    pub certificates: Vec<Certificate>,
}

impl CertificationForm {
    pub fn validate(&self) -> Result<CertificationUpdate, FormError> {
        let grade = self.grade.trim();
        if grade.is_empty() {
            return Err(FormError::MissingGrade);
        }
        let serial_number = self.serial_number.trim();
        if serial_number.is_empty() {
            return Err(FormError::MissingSerialNumber);
        }
        if self.certificates.is_empty() {
            return Err(FormError::NoCertificates);
        }
        if self.certificates.len() > MAX_CERTIFICATES {
            return Err(FormError::TooManyCertificates(self.certificates.len()));
        }
        let mut certificates = Vec::with_capacity(self.certificates.len());
        for (i, cert) in self.certificates.iter().enumerate() {
            let url = cert.cert_url.trim();
            if url.is_empty() {
                return Err(FormError::EmptyCertificateUrl(i + 1));
            }
            if !CERT_URL_RE.is_match(url) {
                return Err(FormError::InvalidCertificateUrl {
                    index: i + 1,
                    url: url.to_string(),
                });
            }
            certificates.push(Certificate {
                id: cert.id,
                cert_url: url.to_string(),
            });
        }
        Ok(CertificationUpdate {
            grade: grade.to_string(),
            serial_number: serial_number.to_string(),
            certificates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn payment(is_sent: bool, url: Option<&str>) -> BatchPayment {
        BatchPayment {
            id: 11,
            batch_id: 1,
            user_id: 2,
            user: None,
            payment_url: url.map(str::to_string),
            is_sent,
            sent_at: None,
        }
    }

    #[test]
    fn every_non_terminal_status_has_a_labelled_step() {
        for status in PIPELINE.iter().filter(|s| !s.is_terminal()) {
            let step = resolve_next_step(status.as_str())
                .unwrap_or_else(|| panic!("{} has no next step", status));
            assert!(!step.next_label.is_empty());
        }
    }

    #[test]
    fn terminal_statuses_have_no_step() {
        assert!(resolve_next_step("done").is_none());
        assert!(resolve_next_step("rejected").is_none());
        assert!(resolve_next_step("not_a_status").is_none());
    }

    #[test]
    fn table_is_a_strict_total_order() {
        for pair in PIPELINE.windows(2) {
            let step = pair[0].next_step().unwrap();
            assert_eq!(step.next_status, pair[1], "successor of {}", pair[0]);
        }
        assert_eq!(PIPELINE.len(), 22);
    }

    #[test]
    fn labels_cover_the_pipeline_in_order() {
        for (i, status) in PIPELINE.iter().enumerate() {
            assert_eq!(STATUS_LABELS[i].0, *status);
            let text = status_display_text(status.as_str());
            assert_ne!(text, humanize(status.as_str()), "{} falls back", status);
        }
        assert_eq!(STATUS_LABELS[22].0, Status::Rejected);
        let unique: HashSet<_> = STATUS_LABELS.iter().map(|(s, _)| *s).collect();
        assert_eq!(unique.len(), STATUS_LABELS.len());
    }

    #[test]
    fn unknown_keys_are_humanized() {
        assert_eq!(status_display_text("lost_in_transit"), "lost in transit");
        assert_eq!(status_display_text("psa_grading"), "PSA Grading");
    }

    #[test]
    fn keys_round_trip_through_serde_and_from_str() {
        for status in Status::all() {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
    }

    #[test]
    fn guided_transitions_never_skip() {
        assert!(is_guided_transition(Status::Submit, Status::SubmitApproved));
        assert!(is_guided_transition(Status::Submit, Status::Rejected));
        assert!(!is_guided_transition(Status::Submit, Status::WaitingToJp));
        assert!(!is_guided_transition(Status::PsaGrading, Status::Rejected));
        assert!(!is_guided_transition(Status::Done, Status::Submit));
    }

    #[test]
    fn special_steps_resolve_to_their_actions() {
        assert!(matches!(
            admin_action(Status::DeliveryProcessToId, None),
            AdminAction::SpecialForm { to: Status::ReceivedByWhId, .. }
        ));
        assert_eq!(
            admin_action(Status::PaymentRequest, None),
            AdminAction::WaitingOnUser { label: "Confirm Payment" }
        );
        assert_eq!(admin_action(Status::Done, None), AdminAction::Terminal);
        assert_eq!(admin_action(Status::Rejected, None), AdminAction::Terminal);
        assert!(matches!(
            admin_action(Status::Submit, None),
            AdminAction::Advance { to: Status::SubmitApproved, can_reject: true, .. }
        ));
    }

    #[test]
    fn payment_gate_follows_the_batch_payment() {
        assert_eq!(
            admin_action(Status::ReceivedByWhId, None),
            AdminAction::BatchPayment(PaymentGate::NoBatchPayment)
        );
        let unsent = payment(false, Some("https://pay.example/1"));
        assert_eq!(
            admin_action(Status::ReceivedByWhId, Some(&unsent)),
            AdminAction::BatchPayment(PaymentGate::SendLink { payment_id: 11, has_url: true })
        );
        let sent = payment(true, Some("https://pay.example/1"));
        assert_eq!(
            admin_action(Status::ReceivedByWhId, Some(&sent)),
            AdminAction::BatchPayment(PaymentGate::Proceed {
                to: Status::PaymentRequest,
                label: "Request Payment"
            })
        );
    }

    fn form(urls: &[&str]) -> CertificationForm {
        CertificationForm {
            grade: "9".into(),
            serial_number: "PSA-123".into(),
            certificates: urls.iter().map(|u| Certificate::new(*u)).collect(),
        }
    }

    #[test]
    fn certification_form_validation() {
        assert_eq!(form(&[""]).validate(), Err(FormError::EmptyCertificateUrl(1)));
        assert_eq!(form(&[]).validate(), Err(FormError::NoCertificates));
        let six = ["https://c.example/1"; 6];
        assert_eq!(form(&six).validate(), Err(FormError::TooManyCertificates(6)));
        assert!(matches!(
            form(&["ftp://nope"]).validate(),
            Err(FormError::InvalidCertificateUrl { index: 1, .. })
        ));

        let mut missing_grade = form(&["https://c.example/1"]);
        missing_grade.grade = "  ".into();
        assert_eq!(missing_grade.validate(), Err(FormError::MissingGrade));

        let ok = form(&[" https://c.example/1 ", "https://c.example/2"]).validate().unwrap();
        assert_eq!(ok.certificates[0].cert_url, "https://c.example/1");
        assert_eq!(ok.certificates.len(), 2);
    }
}
