//! Instance identity, state-token signing and session policy.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command, builder::PossibleValuesParser};
use secrecy::SecretString;

pub const ARG_INSTANCE_ID: &str = "instance-id";
pub const ARG_ENVIRONMENT: &str = "environment";
pub const ARG_SIGNING_KEY: &str = "signing-key";
pub const ARG_KEY_ID: &str = "key-id";
pub const ARG_STRATEGIES: &str = "strategies";
pub const ARG_REDIRECT_URLS: &str = "redirect-urls";
pub const ARG_PROVIDERS_FILE: &str = "providers-file";
pub const ARG_SINGLE_SESSION: &str = "single-session";
pub const ARG_SESSION_LIFETIME_SECONDS: &str = "session-lifetime-seconds";
pub const ARG_SESSION_INACTIVITY_SECONDS: &str = "session-inactivity-seconds";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_DEV_COOKIE_HOP_URL: &str = "dev-cookie-hop-url";
pub const ARG_SECURE_COOKIES: &str = "secure-cookies";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_identity_args(command);
    with_session_args(command)
}

fn with_identity_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_INSTANCE_ID)
                .long(ARG_INSTANCE_ID)
                .help("Instance identifier embedded in state tokens")
                .env("AUTHGATE_INSTANCE_ID")
                .default_value("ins_default"),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Instance environment; production enforces the redirect allowlist")
                .env("AUTHGATE_ENVIRONMENT")
                .default_value("development")
                .value_parser(PossibleValuesParser::new([
                    "production",
                    "staging",
                    "development",
                ])),
        )
        .arg(
            Arg::new(ARG_SIGNING_KEY)
                .long(ARG_SIGNING_KEY)
                .help("Base64 Ed25519 seed used to sign state tokens")
                .long_help(
                    "Base64 (standard alphabet) 32-byte Ed25519 seed used to sign state tokens. Required in production; other environments generate an ephemeral key when it is missing.",
                )
                .env("AUTHGATE_SIGNING_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_KEY_ID)
                .long(ARG_KEY_ID)
                .help("Key id written to the state token header")
                .env("AUTHGATE_KEY_ID")
                .default_value("state-1"),
        )
        .arg(
            Arg::new(ARG_STRATEGIES)
                .long(ARG_STRATEGIES)
                .help("Enabled strategies, comma separated (e.g. oauth_google,oauth_github)")
                .env("AUTHGATE_STRATEGIES")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_REDIRECT_URLS)
                .long(ARG_REDIRECT_URLS)
                .help("Allowed redirect URLs, comma separated")
                .env("AUTHGATE_REDIRECT_URLS")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_PROVIDERS_FILE)
                .long(ARG_PROVIDERS_FILE)
                .help("JSON file with OAuth2 provider definitions")
                .env("AUTHGATE_PROVIDERS_FILE"),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SINGLE_SESSION)
                .long(ARG_SINGLE_SESSION)
                .help("Reject sign-ins for another user while a session is active")
                .env("AUTHGATE_SINGLE_SESSION")
                .num_args(0..=1)
                .default_value("false")
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_SESSION_LIFETIME_SECONDS)
                .long(ARG_SESSION_LIFETIME_SECONDS)
                .help("Maximum session lifetime in seconds")
                .env("AUTHGATE_SESSION_LIFETIME_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_SESSION_INACTIVITY_SECONDS)
                .long(ARG_SESSION_INACTIVITY_SECONDS)
                .help("Idle time in seconds before a session is abandoned")
                .env("AUTHGATE_SESSION_INACTIVITY_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Domain attribute for the client cookie")
                .env("AUTHGATE_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_DEV_COOKIE_HOP_URL)
                .long(ARG_DEV_COOKIE_HOP_URL)
                .help("Cookie-setting hop used by non-production instances")
                .env("AUTHGATE_DEV_COOKIE_HOP_URL"),
        )
        .arg(
            Arg::new(ARG_SECURE_COOKIES)
                .long(ARG_SECURE_COOKIES)
                .help("Mark cookies Secure")
                .env("AUTHGATE_SECURE_COOKIES")
                .num_args(0..=1)
                .default_value("true")
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub instance_id: String,
    pub environment: String,
    pub signing_key: Option<SecretString>,
    pub key_id: String,
    pub strategies: Vec<String>,
    pub redirect_urls: Vec<String>,
    pub providers_file: Option<String>,
    pub single_session: bool,
    pub session_lifetime_seconds: i64,
    pub session_inactivity_seconds: i64,
    pub cookie_domain: Option<String>,
    pub dev_cookie_hop_url: Option<String>,
    pub secure_cookies: bool,
}

impl Options {
    /// # Errors
    /// Returns an error if a defaulted argument is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        Ok(Self {
            instance_id: matches
                .get_one::<String>(ARG_INSTANCE_ID)
                .cloned()
                .context("missing required argument: --instance-id")?,
            environment: matches
                .get_one::<String>(ARG_ENVIRONMENT)
                .cloned()
                .context("missing required argument: --environment")?,
            signing_key: matches
                .get_one::<String>(ARG_SIGNING_KEY)
                .map(|key| SecretString::from(key.clone())),
            key_id: matches
                .get_one::<String>(ARG_KEY_ID)
                .cloned()
                .context("missing required argument: --key-id")?,
            strategies: list(matches, ARG_STRATEGIES),
            redirect_urls: list(matches, ARG_REDIRECT_URLS),
            providers_file: matches.get_one::<String>(ARG_PROVIDERS_FILE).cloned(),
            single_session: matches
                .get_one::<bool>(ARG_SINGLE_SESSION)
                .copied()
                .unwrap_or(false),
            session_lifetime_seconds: matches
                .get_one::<i64>(ARG_SESSION_LIFETIME_SECONDS)
                .copied()
                .unwrap_or(604_800),
            session_inactivity_seconds: matches
                .get_one::<i64>(ARG_SESSION_INACTIVITY_SECONDS)
                .copied()
                .unwrap_or(86_400),
            cookie_domain: matches.get_one::<String>(ARG_COOKIE_DOMAIN).cloned(),
            dev_cookie_hop_url: matches.get_one::<String>(ARG_DEV_COOKIE_HOP_URL).cloned(),
            secure_cookies: matches
                .get_one::<bool>(ARG_SECURE_COOKIES)
                .copied()
                .unwrap_or(true),
        })
    }
}

/// Collect a delimited multi-value argument, dropping blanks.
pub(super) fn list(matches: &clap::ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| {
            values
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
