use super::model::{StoredSession, TransitionRecord};
use crate::model::{Id, Role, TransitionKind, TransitionOutcome, User};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::Row;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url: {}", normalized))?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = crate::config::expand_home(path_part);

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn save_session(pool: &Pool, token: &str, user: &User) -> Result<()> {
    sqlx::query(
        "INSERT INTO session (id, token, user_id, name, email, role, logged_in_at) \
         VALUES (1, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET token = excluded.token, user_id = excluded.user_id, \
         name = excluded.name, email = excluded.email, role = excluded.role, \
         logged_in_at = excluded.logged_in_at",
    )
    .bind(token)
    .bind(user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(user.role.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_session(pool: &Pool) -> Result<Option<StoredSession>> {
    let row = sqlx::query(
        "SELECT token, user_id, name, email, role, logged_in_at FROM session WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let role_raw: String = row.get("role");
    let role = Role::parse(&role_raw)
        .ok_or_else(|| anyhow!("stored role '{}' is invalid", role_raw))?;
    Ok(Some(StoredSession {
        token: row.get("token"),
        user: User {
            id: row.get("user_id"),
            name: row.get("name"),
            email: row.get("email"),
            role,
        },
        logged_in_at: row.get::<DateTime<Utc>, _>("logged_in_at"),
    }))
}

#[instrument(skip_all)]
pub async fn clear_session(pool: &Pool) -> Result<()> {
    sqlx::query("DELETE FROM session").execute(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_transition(
    pool: &Pool,
    card_id: Id,
    from_status: Option<&str>,
    to_status: &str,
    kind: TransitionKind,
    outcome: TransitionOutcome,
    error: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO transition_log (card_id, from_status, to_status, kind, outcome, error, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(card_id)
    .bind(from_status)
    .bind(to_status)
    .bind(kind.as_str())
    .bind(outcome.as_str())
    .bind(error)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Most recent transitions first, optionally for a single card.
#[instrument(skip_all)]
pub async fn recent_transitions(
    pool: &Pool,
    card_id: Option<Id>,
    limit: i64,
) -> Result<Vec<TransitionRecord>> {
    let rows = match card_id {
        Some(card_id) => {
            sqlx::query(
                "SELECT id, card_id, from_status, to_status, kind, outcome, error, created_at \
                 FROM transition_log WHERE card_id = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(card_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, card_id, from_status, to_status, kind, outcome, error, created_at \
                 FROM transition_log ORDER BY id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter().map(transition_from_row).collect()
}

fn transition_from_row(row: &SqliteRow) -> Result<TransitionRecord> {
    let kind_raw: String = row.get("kind");
    let kind = TransitionKind::parse(&kind_raw)
        .ok_or_else(|| anyhow!("unknown transition kind '{}'", kind_raw))?;
    let outcome = match row.get::<String, _>("outcome").as_str() {
        "applied" => TransitionOutcome::Applied,
        _ => TransitionOutcome::Failed,
    };
    Ok(TransitionRecord {
        id: row.get("id"),
        card_id: row.get("card_id"),
        from_status: row.get("from_status"),
        to_status: row.get("to_status"),
        kind,
        outcome,
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}
