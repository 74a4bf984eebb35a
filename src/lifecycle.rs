//! Startup sequence and shutdown of the gateway
//!
//! Startup is strictly ordered: credential, upstream connection, API registration,
//! frontend bundle, listener. The first failure aborts startup before the listener
//! is bound, so a half-configured gateway never accepts traffic.

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assets::{AssetError, AssetStore};
use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionError, ConnectionFactory, TlsOptions, TransportSecurity};
use crate::credentials::{CredentialError, CredentialProvisioner};
use crate::interceptor::InterceptorChain;
use crate::router::Router;
use crate::server::{GatewayServer, ListenerError};
use crate::static_files::{StaticHandler, INDEX};
use crate::transcode::{TranscodeError, Transcoder};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to obtain service account: {0}")]
    Credential(#[source] CredentialError),
    #[error("failed to configure upstream connection: {0}")]
    Connection(#[from] ConnectionError),
    #[error("failed to register API services: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("failed to load frontend bundle from {path}: {source}")]
    Asset {
        path: PathBuf,
        #[source]
        source: AssetError,
    },
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("startup cancelled")]
    Cancelled,
}

impl From<CredentialError> for StartupError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Cancelled => StartupError::Cancelled,
            err => StartupError::Credential(err),
        }
    }
}

/// Run every startup stage and return a bound, not yet serving, server
pub async fn start(
    config: Config,
    cancel: &CancellationToken,
) -> Result<GatewayServer, StartupError> {
    let bind_addr = config
        .server
        .bind_addr()
        .map_err(|e| ConfigError::Invalid(vec![e]))?;

    let credential = CredentialProvisioner::new(config.clone())
        .obtain_credential(cancel)
        .await?;

    let connection_config = ConnectionFactory::build_config(
        &config.upstream.endpoint,
        Some(&credential),
        InterceptorChain::new(),
        &TlsOptions::from(&config.upstream),
    )?;
    let connection = ConnectionFactory::connect(&connection_config)?;
    info!(
        upstream = %connection.target(),
        identity = %credential.name(),
        tls = matches!(connection_config.security, TransportSecurity::Tls { .. }),
        interceptors = ?connection_config.interceptors.names(),
        "Upstream connection configured"
    );

    let transcoder = Transcoder::register(connection, config.upstream.descriptor_set.as_deref())?;

    let frontend = &config.frontend;
    let store = if frontend.preload {
        AssetStore::load(&frontend.dist_dir).map_err(|source| StartupError::Asset {
            path: frontend.dist_dir.clone(),
            source,
        })?
    } else {
        AssetStore::directory(&frontend.dist_dir)
    };

    if store.open(INDEX).await.is_err() {
        warn!(dir = %frontend.dist_dir.display(), "Frontend bundle has no index.html");
    }
    info!(
        dir = %frontend.dist_dir.display(),
        preloaded_files = store.len(),
        "Frontend bundle ready"
    );

    let assets = StaticHandler::new(store, frontend.max_age_secs);
    let router = Arc::new(Router::new(Arc::new(transcoder), Arc::new(assets)));

    if cancel.is_cancelled() {
        return Err(StartupError::Cancelled);
    }

    let server = GatewayServer::bind(bind_addr, router, config.server.shutdown_timeout()).await?;
    Ok(server)
}

/// Start the gateway and serve until `cancel` fires
///
/// An incomplete drain on shutdown is logged but is not a startup failure.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<(), StartupError> {
    let server = start(config, &cancel).await?;

    if let Err(e) = server.run(cancel).await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ServiceAccountCredential, ServiceAccountKey, ServiceAccountName};

    fn supplied_credential() -> String {
        let key = ServiceAccountKey::generate(chrono::Duration::days(1)).unwrap();
        let name = ServiceAccountName::parse("omni-inspector").unwrap();
        ServiceAccountCredential::new(name, key).encode().unwrap()
    }

    fn config(dist_dir: PathBuf) -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1:0".to_string();
        config.upstream.endpoint = "grpc://127.0.0.1:9".to_string();
        config.service_account.key = Some(supplied_credential());
        config.frontend.dist_dir = dist_dir;
        config
    }

    #[tokio::test]
    async fn test_start_binds_listener() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        let server = start(config(dir.path().to_path_buf()), &CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upstream_connection_logged_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        start(config(dir.path().to_path_buf()), &CancellationToken::new())
            .await
            .unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.matches("Upstream connection configured").count(), 1);
        assert!(output.contains("identity=omni-inspector"));
        assert!(output.contains("tls=false"));
    }

    #[tokio::test]
    async fn test_malformed_credential_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path().to_path_buf());
        config.service_account.key = Some("not-a-credential".to_string());

        let err = start(config, &CancellationToken::new()).await.err().unwrap();
        assert!(matches!(
            err,
            StartupError::Credential(CredentialError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_bundle_aborts_preload() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path().join("missing"));
        config.frontend.preload = true;

        let err = start(config, &CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, StartupError::Asset { .. }));
    }

    #[tokio::test]
    async fn test_missing_descriptor_set_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path().to_path_buf());
        config.upstream.descriptor_set = Some(dir.path().join("api.binpb"));

        let err = start(config, &CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, StartupError::Transcode(TranscodeError::Read { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_listen() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = start(config(dir.path().to_path_buf()), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_bootstrap_maps_to_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path().to_path_buf());
        config.service_account.key = None;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = start(config, &cancel).await.err().unwrap();
        assert!(matches!(err, StartupError::Cancelled));
    }
}
