//! Event outbox worker and delivery target.

use clap::{Arg, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("webhook-url")
                .long("webhook-url")
                .help("Deliver outbox events to this URL; events are only logged when unset")
                .env("AUTHGATE_WEBHOOK_URL"),
        )
        .arg(
            Arg::new("job-poll-seconds")
                .long("job-poll-seconds")
                .help("Job outbox poll interval in seconds")
                .env("AUTHGATE_JOB_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("job-batch-size")
                .long("job-batch-size")
                .help("Job outbox batch size per poll")
                .env("AUTHGATE_JOB_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("job-max-attempts")
                .long("job-max-attempts")
                .help("Max attempts before marking a job as failed")
                .env("AUTHGATE_JOB_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("job-backoff-base-seconds")
                .long("job-backoff-base-seconds")
                .help("Base delay for job retry backoff")
                .env("AUTHGATE_JOB_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("job-backoff-max-seconds")
                .long("job-backoff-max-seconds")
                .help("Max delay for job retry backoff")
                .env("AUTHGATE_JOB_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub webhook_url: Option<String>,
    pub poll_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &clap::ArgMatches) -> Self {
        Self {
            webhook_url: matches.get_one::<String>("webhook-url").cloned(),
            poll_seconds: matches
                .get_one::<u64>("job-poll-seconds")
                .copied()
                .unwrap_or(5),
            batch_size: matches
                .get_one::<usize>("job-batch-size")
                .copied()
                .unwrap_or(10),
            max_attempts: matches
                .get_one::<u32>("job-max-attempts")
                .copied()
                .unwrap_or(5),
            backoff_base_seconds: matches
                .get_one::<u64>("job-backoff-base-seconds")
                .copied()
                .unwrap_or(5),
            backoff_max_seconds: matches
                .get_one::<u64>("job-backoff-max-seconds")
                .copied()
                .unwrap_or(300),
        }
    }
}
