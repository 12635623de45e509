//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve settings and materialize the configuration document
//! - Construct the proxy through the factory trait
//! - Run it on `host:port` until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Steps run strictly in order; the listener starts last

use crate::config::{self, Environment, ResolvedConfig, Settings};
use crate::error::Error;
use crate::lifecycle::shutdown::Shutdown;
use crate::proxy::{ProxyFactory, ProxyHandle, StartupError, Transport, PROXY_NAME};

/// Resolve settings from `env` and materialize the configuration they name.
pub fn prepare(env: &Environment) -> Result<(Settings, ResolvedConfig), Error> {
    let settings = Settings::resolve(env)?;
    tracing::info!(
        source = settings.source.kind(),
        bind_address = %settings.bind_address(),
        persist_path = ?settings.persist_path,
        request_timeout_secs = settings.request_timeout.as_secs(),
        "Settings resolved"
    );

    let resolved = config::materialize(&settings)?;
    tracing::debug!(source = settings.source.kind(), "Configuration materialized");
    Ok((settings, resolved))
}

/// Construct the proxy and serve streamable HTTP until `shutdown` fires.
pub async fn launch<F>(
    factory: &F,
    settings: &Settings,
    config: &ResolvedConfig,
    shutdown: Shutdown,
) -> Result<(), StartupError>
where
    F: ProxyFactory,
{
    let handle = factory.construct(config, PROXY_NAME)?;
    tracing::info!(
        name = PROXY_NAME,
        transport = %Transport::StreamableHttp,
        "Proxy constructed"
    );

    handle
        .run(
            Transport::StreamableHttp,
            &settings.host,
            settings.port,
            shutdown.signalled(),
        )
        .await?;

    tracing::info!("Proxy stopped");
    Ok(())
}
