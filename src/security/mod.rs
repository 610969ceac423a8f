//! Cross-cutting safety concerns (§4.A outbound host guard).

pub mod host_guard;

pub use host_guard::{
    assert_safe_push_endpoint, resolve_safe_outbound_host, HostGuardError, ResolvedHost,
};
