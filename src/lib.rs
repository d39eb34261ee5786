//! Client library for the card-grading submission tracker.
//!
//! - `pipeline`: the status state machine and the certification form.
//! - `queue`: per-batch ordering with optimistic updates and rollback.
//! - `payments`: per-user payment grouping and payment button state.
//! - `workflow`: guided status writes and the admin override.
//! - `api`, `session`, `db`, `config`: the backend client and local state.

pub mod api;
pub mod config;
pub mod db;
pub mod model;
pub mod payments;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod workflow;
