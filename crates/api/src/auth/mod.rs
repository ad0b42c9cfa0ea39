//! Authentication for the inbound webhook and API surfaces

pub mod middleware;

pub use middleware::{
    require_admin_token, require_lead_webhook_token, require_replacement_token, token_matches,
    AuthError, TokenScope,
};
