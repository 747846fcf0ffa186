//! External identity federation: OAuth/SAML callback reconciliation and
//! session issuance.
//!
//! A flow starts at `/v1/oauth/authorize`, which persists a Verification and
//! signs a state token; the provider sends the browser back to
//! `/v1/oauth_callback`, where the profile is matched against existing
//! identifications and the sign-in, sign-up, connect or reauthorize is
//! finished in one transaction.

pub mod authorize;
pub mod callback;
pub mod disconnect;
pub mod errors;
pub mod finalize;
pub mod handshake;
pub mod providers;
pub mod redirect;
pub mod resolver;
pub mod restrictions;
pub mod sessions;
pub mod state;
pub mod state_token;
pub mod utils;

pub use errors::ApiError;
pub use state::{Environment, InstanceConfig, OAuthState};
