use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use grading_tracker::api::{ApiClient, GradingApi};
use grading_tracker::config;
use grading_tracker::db;
use grading_tracker::model::{
    BatchCategory, BatchUpdate, CardSubmission, Certificate, Id, NewBatch, NewSubmission,
};
use grading_tracker::payments::{group_by_user, payment_summary};
use grading_tracker::pipeline::{
    status_display_text, AdminAction, CertificationForm, PaymentGate, Status,
};
use grading_tracker::queue::{
    order_from_entries, order_from_groups, EntryQueue, OrderSource, QueueBackend,
    QueueEngine, ReorderOutcome, UserQueue,
};
use grading_tracker::session::Session;
use grading_tracker::workflow::Workflow;

#[derive(Debug, Parser)]
#[command(author, version, about = "Admin console for the card grading tracker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in and keep the session in the local store
    Login {
        #[arg(long)]
        email: String,
        /// Falls back to GRADING_PASSWORD
        #[arg(long, env = "GRADING_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    Whoami,
    /// List submissions (all for admins, own with --mine)
    Cards {
        #[arg(long)]
        mine: bool,
        #[arg(long)]
        batch: Option<Id>,
    },
    /// Show one card, its history and the next admin action
    Show { card_id: Id },
    /// Submit a new card for grading
    Submit {
        #[arg(long)]
        name: String,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        brand: String,
        #[arg(long)]
        grade_target: String,
        #[arg(long)]
        batch: Option<Id>,
    },
    /// Move a card one step along the pipeline
    Advance { card_id: Id },
    Reject { card_id: Id },
    /// Record grade, serial number and certificate links (1 to 5)
    Certify {
        card_id: Id,
        #[arg(long)]
        grade: String,
        #[arg(long)]
        serial: String,
        #[arg(long = "cert")]
        certs: Vec<String>,
    },
    /// Set any status, bypassing the guided pipeline
    Override { card_id: Id, status: String },
    /// Confirm a step that waits on the card owner
    Confirm { card_id: Id },
    #[command(subcommand)]
    Batches(BatchCommand),
    #[command(subcommand)]
    Payments(PaymentCommand),
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Transitions issued from this machine
    History {
        #[arg(long)]
        card: Option<Id>,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Debug, Subcommand)]
enum BatchCommand {
    List {
        #[arg(long)]
        active: bool,
    },
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: BatchCategory,
        #[arg(long, default_value = "")]
        services: String,
        #[arg(long)]
        register_number: String,
    },
    Open { batch_id: Id },
    Close { batch_id: Id },
}

#[derive(Debug, Subcommand)]
enum PaymentCommand {
    /// Per-user payment overview of a batch
    Show { batch_id: Id },
    SetUrl {
        #[arg(long)]
        batch: Id,
        #[arg(long)]
        user: Id,
        #[arg(long)]
        url: String,
    },
    Send {
        #[arg(long)]
        batch: Id,
        #[arg(long)]
        user: Id,
    },
    /// Send the payment link gating a card at received_by_wh_id
    SendForCard { card_id: Id },
}

#[derive(Debug, ClapArgs)]
struct QueueTarget {
    batch_id: Id,
    /// Order individual entries instead of users
    #[arg(long)]
    entries: bool,
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    Show {
        #[command(flatten)]
        target: QueueTarget,
    },
    /// Drop `from` onto the slot of `to`
    Move {
        #[command(flatten)]
        target: QueueTarget,
        from: Id,
        to: Id,
    },
    Up {
        #[command(flatten)]
        target: QueueTarget,
        id: Id,
    },
    Down {
        #[command(flatten)]
        target: QueueTarget,
        id: Id,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let session = Session::restore(pool.clone()).await?;
    let client = Arc::new(ApiClient::from_config(&cfg, session.clone())?);
    let api: Arc<dyn GradingApi> = client.clone();
    let workflow = Workflow::new(api.clone(), session.clone()).with_log(pool.clone());

    match args.command {
        Command::Login { email, password } => {
            let user = session.login(api.as_ref(), &email, &password).await?;
            println!("Logged in as {} ({})", user.name, user.role.as_str());
        }
        Command::Logout => {
            session.logout(Some(api.as_ref())).await?;
            println!("Logged out");
        }
        Command::Whoami => match session.user().await {
            Some(user) => println!("{} <{}> {}", user.name, user.email, user.role.as_str()),
            None => println!("Not logged in"),
        },
        Command::Cards { mine, batch } => {
            let cards = if mine || !session.is_admin().await {
                api.list_user_cards().await?
            } else {
                api.list_cards().await?
            };
            for card in cards.iter().filter(|c| batch.is_none() || c.batch_id == batch) {
                print_card_line(card);
            }
        }
        Command::Show { card_id } => {
            let action = workflow.next_action(card_id).await?;
            let card = &action.card;
            print_card_line(card);
            if let Some(image) = &card.image {
                println!("  image: {}", client.storage_url(image)?);
            }
            let mut history = card.statuses.clone();
            history.sort_by_key(|e| e.created_at);
            for event in &history {
                println!(
                    "  {}  {}",
                    event.created_at.format("%Y-%m-%d %H:%M"),
                    status_display_text(&event.status)
                );
            }
            println!("  next: {}", describe_action(&action.action));
        }
        Command::Submit {
            name,
            year,
            brand,
            grade_target,
            batch,
        } => {
            let card = api
                .submit_card(&NewSubmission {
                    name,
                    year,
                    brand,
                    grade_target,
                    batch_id: batch,
                })
                .await?;
            print_card_line(&card);
        }
        Command::Advance { card_id } => print_card_line(&workflow.advance(card_id).await?),
        Command::Reject { card_id } => print_card_line(&workflow.reject(card_id).await?),
        Command::Certify {
            card_id,
            grade,
            serial,
            certs,
        } => {
            let form = CertificationForm {
                grade,
                serial_number: serial,
                certificates: certs.into_iter().map(Certificate::new).collect(),
            };
            print_card_line(&workflow.submit_certification(card_id, &form).await?);
        }
        Command::Override { card_id, status } => {
            let status: Status = status.parse()?;
            print_card_line(&workflow.force_set_status(card_id, status).await?);
        }
        Command::Confirm { card_id } => print_card_line(&workflow.confirm_as_user(card_id).await?),
        Command::Batches(cmd) => run_batches(api.as_ref(), cmd).await?,
        Command::Payments(cmd) => run_payments(api.as_ref(), &workflow, cmd).await?,
        Command::Queue(cmd) => run_queue(api, cmd).await?,
        Command::History { card, limit } => {
            for rec in db::recent_transitions(&pool, card, limit).await? {
                println!(
                    "{}  card {}  {} -> {}  [{} {}]{}",
                    rec.created_at.format("%Y-%m-%d %H:%M:%S"),
                    rec.card_id,
                    rec.from_status.as_deref().unwrap_or("?"),
                    rec.to_status,
                    rec.kind.as_str(),
                    rec.outcome.as_str(),
                    rec.error.map(|e| format!(" {}", e)).unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

fn print_card_line(card: &CardSubmission) {
    let status = card
        .latest_event()
        .map(|e| status_display_text(&e.status).into_owned())
        .unwrap_or_else(|| Status::Submit.label().to_string());
    println!(
        "#{} {} {} {} (target {}, grade {}) owner {}: {}",
        card.id,
        card.year.map(|y| y.to_string()).unwrap_or_default(),
        card.brand,
        card.name,
        card.grade_target,
        card.grade.as_deref().unwrap_or("-"),
        card.owner_name(),
        status
    );
}

fn describe_action(action: &AdminAction) -> String {
    match action {
        AdminAction::Advance { label, can_reject, to } => format!(
            "{} -> {}{}",
            label,
            to,
            if *can_reject { " (or reject)" } else { "" }
        ),
        AdminAction::SpecialForm { label, .. } => {
            format!("{} (certify with grade, serial and certificate links)", label)
        }
        AdminAction::BatchPayment(PaymentGate::NoBatchPayment) => {
            "no batch payment for this user yet; set one with `payments set-url`".into()
        }
        AdminAction::BatchPayment(PaymentGate::SendLink { has_url, .. }) => {
            if *has_url {
                "send the payment link (`payments send-for-card`)".into()
            } else {
                "payment record has no link; set one with `payments set-url`".into()
            }
        }
        AdminAction::BatchPayment(PaymentGate::Proceed { label, to }) => {
            format!("{} -> {}", label, to)
        }
        AdminAction::WaitingOnUser { label } => format!("waiting on the owner: {}", label),
        AdminAction::Terminal => "none".into(),
    }
}

async fn run_batches(api: &dyn GradingApi, cmd: BatchCommand) -> Result<()> {
    match cmd {
        BatchCommand::List { active } => {
            let batches = if active {
                api.list_active_batches().await?
            } else {
                api.list_batches().await?
            };
            for b in batches {
                println!(
                    "#{} {} [{}] reg {} {} {}",
                    b.id,
                    b.name,
                    b.category,
                    b.register_number,
                    if b.is_active { "open" } else { "closed" },
                    b.services
                );
            }
        }
        BatchCommand::Create {
            name,
            category,
            services,
            register_number,
        } => {
            let batch = api
                .create_batch(&NewBatch {
                    name,
                    category,
                    services,
                    register_number,
                    is_active: true,
                })
                .await?;
            info!(batch_id = batch.id, "batch created");
            println!("Created batch #{} {}", batch.id, batch.name);
        }
        BatchCommand::Open { batch_id } => set_batch_active(api, batch_id, true).await?,
        BatchCommand::Close { batch_id } => set_batch_active(api, batch_id, false).await?,
    }
    Ok(())
}

async fn set_batch_active(api: &dyn GradingApi, batch_id: Id, active: bool) -> Result<()> {
    let update = BatchUpdate {
        is_active: Some(active),
        ..Default::default()
    };
    let batch = api.update_batch(batch_id, &update).await?;
    println!(
        "Batch #{} is now {}",
        batch.id,
        if batch.is_active { "open" } else { "closed" }
    );
    Ok(())
}

async fn run_payments(
    api: &dyn GradingApi,
    workflow: &Workflow,
    cmd: PaymentCommand,
) -> Result<()> {
    match cmd {
        PaymentCommand::Show { batch_id } => {
            let (cards, payments) =
                futures::try_join!(api.list_cards(), api.list_batch_payments(batch_id))?;
            let in_batch: Vec<CardSubmission> =
                cards.into_iter().filter(|c| c.batch_id == Some(batch_id)).collect();
            let groups = group_by_user(&in_batch, &payments);
            for g in &groups {
                let button = g.button();
                println!(
                    "{} <{}>  {} card(s)  [{}{}]{}",
                    g.user.name,
                    g.user.email,
                    g.submissions.len(),
                    button.text,
                    if button.disabled { ", disabled" } else { "" },
                    button
                        .sent_at
                        .map(|t| format!(" sent {}", t.format("%Y-%m-%d")))
                        .unwrap_or_default()
                );
            }
            let summary = payment_summary(&groups);
            println!(
                "{} unsent, {} link set, {} sent",
                summary.unsent, summary.link_set, summary.sent
            );
        }
        PaymentCommand::SetUrl { batch, user, url } => {
            let payment = workflow.set_payment_url(batch, user, &url).await?;
            println!("Payment #{} link set", payment.id);
        }
        PaymentCommand::Send { batch, user } => {
            let payment = workflow.send_link_for_user(batch, user).await?;
            println!("Payment #{} sent", payment.id);
        }
        PaymentCommand::SendForCard { card_id } => {
            let payment = workflow.send_payment_link(card_id).await?;
            println!("Payment #{} sent", payment.id);
        }
    }
    Ok(())
}

async fn run_queue(api: Arc<dyn GradingApi>, cmd: QueueCommand) -> Result<()> {
    let target = match &cmd {
        QueueCommand::Show { target }
        | QueueCommand::Move { target, .. }
        | QueueCommand::Up { target, .. }
        | QueueCommand::Down { target, .. } => target,
    };
    let batch_id = target.batch_id;
    if target.entries {
        let fallback = match api.list_entries(batch_id).await {
            Ok(entries) => order_from_entries(&entries),
            Err(_) => Vec::new(),
        };
        let engine = QueueEngine::new(EntryQueue::new(api.clone()), batch_id);
        drive_queue(&engine, fallback, &cmd).await
    } else {
        let (cards, payments) = futures::join!(api.list_cards(), api.list_batch_payments(batch_id));
        let in_batch: Vec<CardSubmission> = cards
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.batch_id == Some(batch_id))
            .collect();
        let groups = group_by_user(&in_batch, &payments.unwrap_or_default());
        let engine = QueueEngine::new(UserQueue::new(api.clone()), batch_id);
        drive_queue(&engine, order_from_groups(&groups), &cmd).await
    }
}

async fn drive_queue<B: QueueBackend>(
    engine: &QueueEngine<B>,
    fallback: Vec<Id>,
    cmd: &QueueCommand,
) -> Result<()> {
    if engine.open(fallback).await == OrderSource::Fallback {
        println!("(server order unavailable, showing local order)");
    }
    let outcome = match cmd {
        QueueCommand::Show { .. } => None,
        QueueCommand::Move { from, to, .. } => Some(engine.reorder(*from, *to).await),
        QueueCommand::Up { id, .. } => Some(engine.move_up(*id).await),
        QueueCommand::Down { id, .. } => Some(engine.move_down(*id).await),
    };
    for notice in engine.take_notices() {
        eprintln!("! {}", notice.message);
    }
    let order = engine.order().await;
    println!(
        "{}",
        order.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" ")
    );
    match outcome {
        Some(ReorderOutcome::Reverted { error, .. }) => bail!("reorder failed: {}", error),
        Some(ReorderOutcome::Unchanged) => println!("(order unchanged)"),
        _ => {}
    }
    Ok(())
}
