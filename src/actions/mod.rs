//! Per-message and per-thread mutation execution (§4.J).

pub mod executor;

pub use executor::{
    apply_thread_message_actions, ActionExecutorDeps, ThreadActionRequest, delete_message_from_mailbox,
    move_message_in_mailbox, set_message_read_state, set_message_starred_state,
};
