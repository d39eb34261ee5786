//! Per-user payment grouping inside a batch.
//!
//! Groups are derived data: they are rebuilt from the submission and payment
//! lists on every call and carry no identity beyond the user id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::model::{BatchPayment, CardSubmission, Id, User};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPaymentGroup {
    pub user: User,
    pub submissions: Vec<CardSubmission>,
    pub payment: Option<BatchPayment>,
}

impl UserPaymentGroup {
    pub fn user_id(&self) -> Id {
        self.user.id
    }

    pub fn stage(&self) -> PaymentStage {
        PaymentStage::of(self.payment.as_ref())
    }

    pub fn button(&self) -> ButtonState {
        resolve_button_state(self.payment.as_ref())
    }
}

/// Group submissions by owner. Relative order inside a group follows the
/// input; groups are sorted by case-insensitive user name, then user id.
pub fn group_by_user(
    submissions: &[CardSubmission],
    payments: &[BatchPayment],
) -> Vec<UserPaymentGroup> {
    let mut index: HashMap<Id, usize> = HashMap::new();
    let mut groups: Vec<UserPaymentGroup> = Vec::new();

    for card in submissions {
        let slot = *index.entry(card.user_id).or_insert_with(|| {
            let payment = payments.iter().find(|p| p.user_id == card.user_id).cloned();
            let user = payment
                .as_ref()
                .and_then(|p| p.user.clone())
                .unwrap_or_else(|| User::placeholder(card.user_id));
            groups.push(UserPaymentGroup {
                user,
                submissions: Vec::new(),
                payment,
            });
            groups.len() - 1
        });
        groups[slot].submissions.push(card.clone());
    }

    groups.sort_by(|a, b| {
        a.user
            .name
            .to_lowercase()
            .cmp(&b.user.name.to_lowercase())
            .then(a.user.id.cmp(&b.user.id))
    });
    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAction {
    Create,
    Update,
    Send,
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonVariant {
    Primary,
    Warning,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ButtonState {
    pub text: &'static str,
    pub variant: ButtonVariant,
    pub disabled: bool,
    pub action: PaymentAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

pub fn resolve_button_state(payment: Option<&BatchPayment>) -> ButtonState {
    match payment {
        None => ButtonState {
            text: "Send Payment Link",
            variant: ButtonVariant::Primary,
            disabled: false,
            action: PaymentAction::Create,
            sent_at: None,
        },
        Some(p) if p.is_sent => ButtonState {
            text: "Payment Sent ✓",
            variant: ButtonVariant::Success,
            disabled: true,
            action: PaymentAction::Sent,
            sent_at: p.sent_at,
        },
        Some(p) if p.has_link() => ButtonState {
            text: "Send Payment Link",
            variant: ButtonVariant::Primary,
            disabled: false,
            action: PaymentAction::Send,
            sent_at: None,
        },
        Some(_) => ButtonState {
            text: "Set Payment URL",
            variant: ButtonVariant::Warning,
            disabled: false,
            action: PaymentAction::Update,
            sent_at: None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStage {
    Unsent,
    LinkSet,
    Sent,
}

impl PaymentStage {
    pub fn of(payment: Option<&BatchPayment>) -> Self {
        match payment {
            Some(p) if p.is_sent => PaymentStage::Sent,
            Some(p) if p.has_link() => PaymentStage::LinkSet,
            _ => PaymentStage::Unsent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStage::Unsent => "unsent",
            PaymentStage::LinkSet => "link set",
            PaymentStage::Sent => "sent",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentSummary {
    pub unsent: usize,
    pub link_set: usize,
    pub sent: usize,
}

pub fn payment_summary(groups: &[UserPaymentGroup]) -> PaymentSummary {
    groups
        .iter()
        .fold(PaymentSummary::default(), |mut acc, g| {
            match g.stage() {
                PaymentStage::Unsent => acc.unsent += 1,
                PaymentStage::LinkSet => acc.link_set += 1,
                PaymentStage::Sent => acc.sent += 1,
            }
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use chrono::TimeZone;

    fn card(id: Id, user_id: Id) -> CardSubmission {
        CardSubmission {
            id,
            user_id,
            batch_id: Some(1),
            name: format!("card-{}", id),
            year: Some(2001),
            brand: "Pokemon".into(),
            serial_number: None,
            grade_target: "10".into(),
            grade: None,
            payment_url: None,
            image: None,
            certificates: vec![],
            latest_status: None,
            statuses: vec![],
            user: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn payment(user_id: Id, name: &str, url: Option<&str>, is_sent: bool) -> BatchPayment {
        BatchPayment {
            id: 100 + user_id,
            batch_id: 1,
            user_id,
            user: Some(User {
                id: user_id,
                name: name.into(),
                email: format!("{}@example.com", name.to_lowercase()),
                role: Role::User,
            }),
            payment_url: url.map(str::to_string),
            is_sent,
            sent_at: is_sent.then(|| Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn groups_keep_relative_order() {
        let cards = vec![card(1, 1), card(2, 1), card(3, 2)];
        let groups = group_by_user(&cards, &[]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].user.name, "User 1");
        assert_eq!(groups[0].user.email, "");
        let ids: Vec<Id> = groups[0].submissions.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(groups[1].submissions[0].id, 3);
    }

    #[test]
    fn groups_sort_by_resolved_name() {
        let cards = vec![card(1, 1), card(2, 2), card(3, 3)];
        let payments = vec![payment(1, "zed", None, false), payment(2, "Amir", None, false)];
        let names: Vec<String> = group_by_user(&cards, &payments)
            .into_iter()
            .map(|g| g.user.name)
            .collect();
        assert_eq!(names, vec!["Amir", "User 3", "zed"]);
    }

    #[test]
    fn button_state_branches() {
        let create = resolve_button_state(None);
        assert_eq!(create.action, PaymentAction::Create);
        assert!(!create.disabled);

        let sent = payment(1, "A", Some("https://pay/1"), true);
        let state = resolve_button_state(Some(&sent));
        assert_eq!(state.action, PaymentAction::Sent);
        assert!(state.disabled);
        assert_eq!(state.text, "Payment Sent ✓");
        assert_eq!(state.sent_at, sent.sent_at);

        let link = payment(1, "A", Some("x"), false);
        assert_eq!(resolve_button_state(Some(&link)).action, PaymentAction::Send);

        let bare = payment(1, "A", None, false);
        let state = resolve_button_state(Some(&bare));
        assert_eq!(state.action, PaymentAction::Update);
        assert_eq!(state.text, "Set Payment URL");

        let blank = payment(1, "A", Some("   "), false);
        assert_eq!(resolve_button_state(Some(&blank)).action, PaymentAction::Update);
        assert_eq!(PaymentStage::of(Some(&blank)), PaymentStage::Unsent);
    }

    #[test]
    fn summary_counts_stages() {
        let cards = vec![card(1, 1), card(2, 2), card(3, 3), card(4, 4)];
        let payments = vec![
            payment(2, "B", Some("https://pay/2"), false),
            payment(3, "C", Some("https://pay/3"), true),
            payment(4, "D", None, false),
        ];
        let summary = payment_summary(&group_by_user(&cards, &payments));
        assert_eq!(
            summary,
            PaymentSummary {
                unsent: 2,
                link_set: 1,
                sent: 1
            }
        );
    }
}
