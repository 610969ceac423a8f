//! Per-user sync event stream (§4.D), grounded on the teacher's
//! `services/sync_service.rs` `tokio::sync::broadcast::Sender<SyncEvent>`
//! fan-out, adapted to a `LISTEN/NOTIFY`-backed multi-process bus instead
//! of a single-process broadcast channel, since multiple worker processes
//! share one Postgres database (SPEC_FULL.md §11).

pub mod bus;

pub use bus::{EventBus, LISTENER_RECONNECT_BACKOFF, WAIT_DEFAULT_TIMEOUT};
