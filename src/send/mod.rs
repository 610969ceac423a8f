//! Outbound send pipeline and idempotency hashing (§4.K, §4.L).

pub mod idempotency;
pub mod pipeline;

pub use idempotency::make_send_request_hash;
pub use pipeline::{send_through_connector, SendPipelineDeps};
