//! # Authgate (external identity federation)
//!
//! `authgate` finishes OAuth 1.0a, OAuth 2.0 and SAML flows for a multi-tenant
//! authentication service. The identity provider redirects the browser back to
//! `/v1/oauth_callback`; the server reconciles the returned profile with the
//! identifications it already knows and completes the flow that started it.
//!
//! ## Flows
//!
//! - **Sign-in:** an external account linked to a user signs the user in. An
//!   unlinked account whose email belongs to nobody is turned into an account
//!   transfer so the frontend can offer a sign-up instead.
//! - **Sign-up:** creates the user from the provider profile, or hands back a
//!   transfer when the account already belongs to someone.
//! - **Connect / reauthorize:** attach a new provider to the signed-in user, or
//!   refresh an existing link.
//!
//! ## Guarantees
//!
//! - Each flow runs in a single store transaction. Business outcomes (account
//!   transfer, claimed identification) commit their writes and record the
//!   error on the Verification; internal errors roll back.
//! - A Verification is consumed by its first successful attempt. Replayed
//!   callbacks redirect without creating another session.
//! - Session creation enqueues a `session.created` event in the same
//!   transaction; a background worker delivers it.

pub mod api;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
