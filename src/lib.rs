//! `inletd`: multi-account mail ingestion and action service.
//!
//! Module layout generalizes the teacher's flat `services`/`providers`/
//! `storage` split into one module per SPEC_FULL.md §4 component, with a
//! `runtime::Runtime` aggregate standing in for the teacher's
//! single-process `AppState`.

pub mod actions;
pub mod attachments;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod gmail;
pub mod idle;
pub mod imap;
pub mod jobs;
pub mod oauth;
pub mod runtime;
pub mod security;
pub mod send;
pub mod storage;

pub use error::ServiceError;
pub use runtime::Runtime;
