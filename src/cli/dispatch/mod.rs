//! Map validated CLI matches to an action.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{instance, outbox, restrictions};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches.get_one::<String>("dsn").cloned();
    let request_timeout_seconds = matches
        .get_one::<u64>("request-timeout-seconds")
        .copied()
        .unwrap_or(30);

    let instance = instance::Options::parse(matches)?;
    let restrictions = restrictions::Options::parse(matches);
    let outbox = outbox::Options::parse(matches);

    Ok(Action::Server(Args {
        port,
        dsn,
        request_timeout_seconds,
        instance,
        restrictions,
        outbox,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_action_without_dsn() {
        temp_env::with_vars(
            [
                ("AUTHGATE_DSN", None::<&str>),
                ("AUTHGATE_PORT", None::<&str>),
                ("AUTHGATE_WEBHOOK_URL", None::<&str>),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["authgate"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.port, 8080);
                    assert!(args.dsn.is_none());
                    assert_eq!(args.request_timeout_seconds, 30);
                    assert_eq!(args.outbox.max_attempts, 5);
                    assert!(args.outbox.webhook_url.is_none());
                }
            },
        );
    }
}
