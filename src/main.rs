use clap::Parser;
use omni_inspector::cli::{self, Cli};
use omni_inspector::config::Config;
use omni_inspector::lifecycle;
use omni_inspector::{PKG_NAME, VERSION};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("omni_inspector=info")),
        )
        .init();

    let cli = Cli::parse();

    let env_credential = cli::service_account_from_env();
    if let Some((var, _)) = &env_credential {
        info!(var = %var, "Service account supplied via environment");
    }

    let config = cli.into_config(env_credential).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        lifecycle::shutdown_signal().await;
        signal_cancel.cancel();
    });

    if let Err(e) = lifecycle::run(config, cancel).await {
        error!(error = %e, "Gateway failed");
        return Err(e.into());
    }

    info!("the server was stopped gracefully");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting inspector gateway");
    info!(
        bind = %config.server.bind,
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        "Server configuration"
    );
    info!(
        endpoint = %config.upstream.endpoint,
        insecure_skip_tls_verify = config.upstream.insecure_skip_tls_verify,
        ca_cert = ?config.upstream.ca_cert,
        descriptor_set = ?config.upstream.descriptor_set,
        "Upstream settings"
    );
    info!(
        name = %config.service_account.name,
        role = %config.service_account.role,
        supplied = config.service_account.key.is_some(),
        "Service account settings"
    );
    info!(
        dist_dir = %config.frontend.dist_dir.display(),
        preload = config.frontend.preload,
        max_age_secs = config.frontend.max_age_secs,
        "Frontend settings"
    );
}
