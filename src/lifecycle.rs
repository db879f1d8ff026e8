use crate::accessory_server;
use crate::accessory_store::{AccessoryInfo, AccessoryStore};
use crate::config::Config;
use crate::inverter_accessory::{AccessoryHandle, InverterAccessory};
use crate::solarman_client::{SolarmanClient, TelemetryClient};
use crate::sync_engine::{SyncEngine, SHUTDOWN_GRACE};
use anyhow::Context;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status used when a repeated signal cuts shutdown short
pub const FORCED_EXIT_CODE: i32 = 130;

/// Everything constructed during startup, ready to run
pub struct Bridge<C> {
    pub engine: SyncEngine<C, AccessoryHandle>,
    pub accessory: InverterAccessory,
    pub listener: TcpListener,
}

impl Bridge<SolarmanClient> {
    /// Builds every component from the configuration.
    /// Any failure here is fatal, and nothing has talked to the provider yet.
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let store = AccessoryStore::open(&config.db_path)
            .context("failed to open accessory store")?;
        let info = store
            .load_or_create(AccessoryInfo::new(&config.accessory_name, &config.device_sn))
            .context("failed to load accessory identity")?;

        let client = SolarmanClient::new(&config.api_url, &config.credentials)
            .context("failed to create client")?;

        let (accessory, handle) = InverterAccessory::new(&info);
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to start server on {}", config.listen_addr))?;

        let engine = SyncEngine::new(client, handle, &config.device_sn, config.poll_interval)
            .with_failure_policy(config.fetch_failure_policy);

        Ok(Self {
            engine,
            accessory,
            listener,
        })
    }
}

impl<C> Bridge<C>
where
    C: TelemetryClient + 'static,
{
    /// Runs the accessory server and the sync engine until `shutdown` resolves.
    ///
    /// Shutdown cancels both. The engine gets a bounded grace period to finish
    /// an in-flight cycle. If the engine stops on its own with a fatal fetch
    /// error the server is shut down too and the error is returned.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();

        let signal_cancel = cancel.clone();
        let signal_task = tokio::spawn(async move {
            shutdown.await;
            info!("stopping server...");
            signal_cancel.cancel();
        });

        let mut engine_task = tokio::spawn(self.engine.run(cancel.clone()));
        let server = accessory_server::serve(self.listener, self.accessory, cancel.clone());
        tokio::pin!(server);

        info!("starting server...");
        let served = tokio::select! {
            served = &mut server => served,
            engine = &mut engine_task => {
                cancel.cancel();
                if let Err(e) = server.await {
                    warn!("accessory server failed while stopping: {e:#}");
                }
                signal_task.abort();
                return match engine {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(anyhow::Error::new(e).context("failed to get current data")),
                    Err(e) => Err(anyhow::Error::new(e).context("sync engine task failed")),
                };
            }
        };

        // The server stopped first, either on shutdown or because it failed
        cancel.cancel();
        signal_task.abort();
        match timeout(SHUTDOWN_GRACE * 2, &mut engine_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("sync engine stopped with error during shutdown: {e}"),
            Ok(Err(e)) => warn!("sync engine task failed during shutdown: {e}"),
            Err(_) => {
                warn!("sync engine did not stop in time, aborting");
                engine_task.abort();
            }
        }

        served.context("accessory server failed")
    }
}

/// Resolves on the next SIGINT or SIGTERM
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for SIGINT: {e}");
                    std::future::pending::<()>().await;
                }
                return;
            }
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("failed to listen for SIGINT: {e}");
                    terminate.recv().await;
                }
            }
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves on the first termination signal.
///
/// A second signal while shutdown is still in progress exits the process
/// at once with a failure code, skipping the remaining grace period.
pub async fn shutdown_signal() {
    termination_signal().await;
    tokio::spawn(async {
        termination_signal().await;
        warn!("second termination signal, exiting without finishing shutdown");
        std::process::exit(FORCED_EXIT_CODE);
    });
}

/// Builds the bridge and runs it until the process receives a termination signal
pub async fn run(config: Config) -> anyhow::Result<()> {
    let bridge = Bridge::build(&config).await?;
    bridge.run_until(shutdown_signal()).await
}
