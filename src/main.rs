use std::sync::Arc;

use anyhow::{Context, Result};
use csv2adh::{
    auth::{BrowserLauncher, HeadlessBrowser, OidcAuthenticator, SystemBrowser, TokenManager},
    config::Config,
    readings,
    sds::SdsClient,
    RunMode, Runner,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        println!("Usage: csv2adh [CSV_PATH] [--test]");
        return Ok(());
    }

    let mode = if args.iter().any(|arg| arg == "--test") {
        RunMode::Test
    } else {
        RunMode::Upload
    };
    let csv_override = args.iter().find(|arg| !arg.starts_with("--")).cloned();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("csv2adh v{}", csv2adh::VERSION);

    let config = Config::load()?;
    info!("Configuration loaded");
    info!("  Resource: {}", config.data_hub.resource);
    info!("  Namespace: {}", config.data_hub.namespace_id);

    let launcher: Arc<dyn BrowserLauncher> = match mode {
        RunMode::Upload => Arc::new(SystemBrowser),
        RunMode::Test => Arc::new(HeadlessBrowser::new(config.http_timeout())),
    };
    let credentials = match mode {
        RunMode::Upload => None,
        RunMode::Test => {
            let credentials = config.test_credentials();
            if credentials.is_none() {
                warn!("No [test] credentials configured; headless login will fail if a sign-in form is shown");
            }
            credentials
        }
    };

    let authenticator = OidcAuthenticator::new(config.login_settings(), launcher, config.http_timeout())?
        .with_credentials(credentials)
        .with_max_attempts(config.oauth.max_login_attempts);

    let cancel = authenticator.cancellation_token();
    let tokens = Arc::new(TokenManager::with_skew(Arc::new(authenticator), config.expiry_skew()));
    let sds = SdsClient::new(
        &config.data_hub.resource,
        &config.data_hub.api_version,
        &config.data_hub.tenant_id,
        &config.data_hub.namespace_id,
        tokens,
        config.http_timeout(),
    )?;

    let csv_path = csv_override.unwrap_or_else(|| config.upload.csv_path.clone());
    let rows = readings::read_csv(&csv_path).with_context(|| format!("Failed to load {}", csv_path))?;
    let groups = readings::group_by_stream(&rows);
    info!("Read {} row(s) for {} stream(s) from {}", rows.len(), groups.len(), csv_path);

    let runner = Runner::new(&sds, config.upload.type_id.clone(), config.upload.create_streams);
    // Ctrl-C aborts a pending browser login and stops the run
    let interrupted = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        cancel.cancel();
    };
    let summary = runner.run_until(&groups, mode, interrupted).await?;

    println!(
        "Done: sent {} value(s) to {} stream(s)",
        summary.values_sent, summary.streams
    );

    Ok(())
}
