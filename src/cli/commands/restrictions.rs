//! Sign-up and sign-in email restrictions.

use clap::{Arg, ArgAction, Command};

use super::instance::list;

pub const ARG_ALLOWLIST: &str = "allowlist";
pub const ARG_BLOCKLIST: &str = "blocklist";
pub const ARG_DISPOSABLE_DOMAINS: &str = "disposable-domains";
pub const ARG_BLOCK_SUBADDRESSES: &str = "block-subaddresses";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ALLOWLIST)
                .long(ARG_ALLOWLIST)
                .help("Allowed emails or domains (@example.com), comma separated")
                .env("AUTHGATE_ALLOWLIST")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_BLOCKLIST)
                .long(ARG_BLOCKLIST)
                .help("Blocked emails or domains (@example.com), comma separated")
                .env("AUTHGATE_BLOCKLIST")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_DISPOSABLE_DOMAINS)
                .long(ARG_DISPOSABLE_DOMAINS)
                .help("Disposable email domains to reject, comma separated")
                .env("AUTHGATE_DISPOSABLE_DOMAINS")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_BLOCK_SUBADDRESSES)
                .long(ARG_BLOCK_SUBADDRESSES)
                .help("Reject emails with a +subaddress")
                .env("AUTHGATE_BLOCK_SUBADDRESSES")
                .num_args(0..=1)
                .default_value("false")
                .default_missing_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
}

#[derive(Debug, Default)]
pub struct Options {
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,
    pub disposable_domains: Vec<String>,
    pub block_subaddresses: bool,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &clap::ArgMatches) -> Self {
        Self {
            allowlist: list(matches, ARG_ALLOWLIST),
            blocklist: list(matches, ARG_BLOCKLIST),
            disposable_domains: list(matches, ARG_DISPOSABLE_DOMAINS),
            block_subaddresses: matches
                .get_one::<bool>(ARG_BLOCK_SUBADDRESSES)
                .copied()
                .unwrap_or(false),
        }
    }
}
