//! Local SQLite state kept between CLI runs.
//!
//! `session` holds at most one row (`id = 1`): the bearer token and the user it
//! belongs to. `save_session` replaces it and `clear_session` deletes it, so a
//! logout or a 401 leaves no stale token behind.
//!
//! `transition_log` gets one row per status write attempt, applied or failed,
//! tagged with whether it was a guided step, a reject or an override.
//! `recent_transitions` reads it newest first, optionally for a single card.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{StoredSession, TransitionRecord};
