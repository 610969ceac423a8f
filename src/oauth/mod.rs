//! OAuth token manager (§4.B).

pub mod token_manager;

pub use token_manager::{
    ensure_valid_google_access_token, is_google_token_expiring_soon, GoogleTokenClient,
    TokenManagerError, TokenRefreshOutcome,
};
