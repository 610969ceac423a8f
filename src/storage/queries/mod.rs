//! Per-entity query modules, mirroring the teacher's `storage::queries`
//! layout (one module per table family) but backed by `sqlx` instead of
//! `rusqlite`.

pub mod connectors;
pub mod events;
pub mod identities;
pub mod messages;
pub mod oauth_states;
pub mod push_subscriptions;
pub mod send_idempotency;
pub mod sync_states;
