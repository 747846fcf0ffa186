use crate::{
    api::{
        self,
        handlers::oauth::{
            providers::ProviderRegistry,
            restrictions::Restrictions,
            state::{Environment, InstanceConfig, OAuthState},
        },
        jobs::{EventSink, JobWorkerConfig, LogEventSink, WebhookEventSink},
    },
    cli::commands::{instance, outbox, restrictions},
    store::{Store, memory::MemoryStore, postgres::PgStore},
};
use anyhow::{Result, anyhow, bail};
use base64ct::{Base64, Encoding};
use ed25519_dalek::SigningKey;
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub request_timeout_seconds: u64,
    pub instance: instance::Options,
    pub restrictions: restrictions::Options,
    pub outbox: outbox::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid, the store is unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let environment: Environment = args.instance.environment.parse()?;
    let signing_key = signing_key(args.instance.signing_key.as_ref(), environment)?;

    let instance = InstanceConfig::new(args.instance.instance_id, environment, signing_key)
        .with_key_id(args.instance.key_id)
        .with_strategies(args.instance.strategies)
        .with_allowed_redirect_urls(&args.instance.redirect_urls)
        .with_single_session_mode(args.instance.single_session)
        .with_session_lifetime_seconds(args.instance.session_lifetime_seconds)
        .with_session_inactivity_seconds(args.instance.session_inactivity_seconds)
        .with_cookie_domain(args.instance.cookie_domain)
        .with_dev_cookie_hop_url(args.instance.dev_cookie_hop_url)
        .with_secure_cookies(args.instance.secure_cookies);

    let restrictions = Restrictions::new()
        .with_allowlist(args.restrictions.allowlist)
        .with_blocklist(args.restrictions.blocklist)
        .with_disposable_domains(args.restrictions.disposable_domains)
        .with_block_subaddresses(args.restrictions.block_subaddresses);

    let providers = match &args.instance.providers_file {
        Some(path) => ProviderRegistry::from_file(Path::new(path))?,
        None => {
            warn!("No providers file configured, every strategy will be rejected");
            ProviderRegistry::new()
        }
    };
    for strategy in providers.strategies() {
        if !instance.is_strategy_enabled(strategy) {
            info!(strategy, "Provider loaded but strategy is not enabled");
        }
    }

    let store: Arc<dyn Store> = match &args.dsn {
        Some(dsn) => Arc::new(PgStore::connect(dsn).await?),
        None => {
            warn!("No DSN configured, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let sink: Arc<dyn EventSink> = match args.outbox.webhook_url {
        Some(url) => Arc::new(WebhookEventSink::new(url)?),
        None => Arc::new(LogEventSink),
    };

    let job_config = JobWorkerConfig::new()
        .with_poll_interval_seconds(args.outbox.poll_seconds)
        .with_batch_size(args.outbox.batch_size)
        .with_max_attempts(args.outbox.max_attempts)
        .with_backoff_base_seconds(args.outbox.backoff_base_seconds)
        .with_backoff_max_seconds(args.outbox.backoff_max_seconds);

    let server_config = api::ServerConfig::new(args.port)
        .with_request_timeout_seconds(args.request_timeout_seconds)
        .with_cors_origins(args.instance.redirect_urls);

    let state = Arc::new(OAuthState::new(instance, store, providers, restrictions));

    api::new(state, sink, job_config, server_config).await
}

/// Decode the configured seed, or generate an ephemeral key outside production.
fn signing_key(secret: Option<&SecretString>, environment: Environment) -> Result<SigningKey> {
    let Some(secret) = secret else {
        if environment.is_production() {
            bail!("missing required argument: --signing-key (required in production)");
        }
        warn!("No signing key configured, state tokens will not survive a restart");
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        return Ok(SigningKey::from_bytes(&seed));
    };

    let bytes = Base64::decode_vec(secret.expose_secret().trim())
        .map_err(|err| anyhow!("signing key is not valid base64: {err}"))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("signing key must decode to 32 bytes"))?;
    Ok(SigningKey::from_bytes(&seed))
}
