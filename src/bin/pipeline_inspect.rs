use anyhow::Result;
use clap::Parser;

use grading_tracker::pipeline::{resolve_next_step, status_display_text, Status};

/// Print the status pipeline, or the next step for one status key.
#[derive(Parser, Debug)]
struct Args {
    /// Status key to resolve, e.g. `psa_qc`
    #[arg(long)]
    status: Option<String>,
}

fn flags(status: Status) -> String {
    let Some(step) = status.next_step() else {
        return "terminal".into();
    };
    let mut out = Vec::new();
    if step.has_reject {
        out.push("reject");
    }
    if step.has_special_form {
        out.push("form");
    }
    if step.is_waiting_user {
        out.push("waits-on-user");
    }
    if step.is_batch_payment_status {
        out.push("batch-payment");
    }
    out.join(",")
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(key) = args.status {
        println!("{}: {}", key, status_display_text(&key));
        match resolve_next_step(&key) {
            Some(step) => println!(
                "  next: {} ({}) [{}]",
                step.next_status,
                step.next_label,
                flags(key.parse()?)
            ),
            None => println!("  no next step"),
        }
        return Ok(());
    }

    for status in Status::all() {
        let pos = status
            .position()
            .map(|p| format!("{:>2}", p + 1))
            .unwrap_or_else(|| " -".into());
        let next = status
            .next_step()
            .map(|s| s.next_status.as_str())
            .unwrap_or("");
        println!(
            "{} {:<26} {:<34} -> {:<26} {}",
            pos,
            status.as_str(),
            status.label(),
            next,
            flags(status)
        );
    }
    Ok(())
}
