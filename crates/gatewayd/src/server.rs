//! gatewayd server - trigger loop

use crate::applier::Applier;
use crate::config::Config;
use crate::keystore::{KeyStore, KeyStoreError};
use crate::network::{detect_uplink, Uplink};
use crate::queue::{Trigger, TriggerQueue};
use crate::reconciler::{PassReport, Reconciler};
use crate::relation::PeerFileSource;
use crate::status::FilePublisher;
use crate::storage::Storage;
use crate::subsystem::memory::{MemoryRouting, MemoryVrrp, MemoryWireguard};
use crate::subsystem::system::{SystemRouting, SystemVrrp, SystemWireguard};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wg_gateway_core::{LocalConfig, WgKey};

/// File the private key is handed to `wg` through
const WG_KEY_FILE: &str = "wg-private.key";

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("Identity error: {0}")]
    Identity(#[from] KeyStoreError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Rebuilds the local configuration from the flags and the settings file
#[derive(Clone)]
struct Reloader {
    base: Config,
    uplink: Option<Uplink>,
    public_key: WgKey,
    queue: Arc<TriggerQueue>,
}

impl Reloader {
    fn local_config(&self) -> Result<LocalConfig, ServerError> {
        self.base
            .with_settings_file()
            .and_then(|config| config.to_local_config(self.uplink.as_ref(), &self.public_key))
            .map_err(|e| ServerError::Config(e.to_string()))
    }

    fn reload(&self) -> Result<(), ServerError> {
        let config = self.local_config()?;
        self.queue.push(Trigger::ConfigChanged(Box::new(config)));
        Ok(())
    }
}

/// Server state
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    queue: Arc<TriggerQueue>,
    reloader: Reloader,
    reconciler: Arc<Mutex<Reconciler>>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);

        let mut keystore = KeyStore::new(storage.clone());
        if config.regenerate_key {
            keystore.regenerate(config.listen_port)?;
        }
        let public_key = keystore.ensure_identity(config.listen_port)?.public_key;

        let uplink = if config.needs_uplink() {
            match detect_uplink() {
                Ok(uplink) => {
                    info!(
                        "Detected uplink {} via {}",
                        uplink.router_id, uplink.interface
                    );
                    Some(uplink)
                }
                Err(e) => {
                    warn!("Uplink detection failed: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let queue = Arc::new(TriggerQueue::new());
        let reloader = Reloader {
            base: config.clone(),
            uplink,
            public_key,
            queue: queue.clone(),
        };
        let local = reloader.local_config()?;
        info!("Tunnel address {}", local.tunnel_address);

        let applier = if config.dry_run {
            info!("Dry run: commands are logged, not executed");
            Applier::new(
                Box::new(MemoryWireguard::new()),
                Box::new(MemoryRouting::new()),
                Box::new(MemoryVrrp::new()),
            )
        } else {
            Applier::new(
                Box::new(SystemWireguard::new(config.data_dir.join(WG_KEY_FILE))),
                Box::new(SystemRouting::new(&config.bird_config, &config.sysctl_config)),
                Box::new(SystemVrrp::new(&config.keepalived_config)),
            )
        };
        let publisher = Box::new(FilePublisher::new(config.status_dir()));

        let reconciler = Reconciler::new(keystore, local, applier, publisher);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            storage,
            queue,
            reloader,
            reconciler: Arc::new(Mutex::new(reconciler)),
            shutdown_tx,
        })
    }

    /// Queue a replacement local configuration
    pub fn reconfigure(&self, config: LocalConfig) {
        self.queue.push(Trigger::ConfigChanged(Box::new(config)));
    }

    /// Re-read the settings file and queue the result
    pub fn reload(&self) -> Result<(), ServerError> {
        self.reloader.reload()
    }

    /// Run the server until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(
            "Starting gatewayd on {} (port {}, tick {}s)",
            self.config.interface, self.config.listen_port, self.config.tick_interval_secs
        );

        self.queue.push(Trigger::Startup);

        let tick_handle = self.spawn_tick_task();
        let relation_handle = self
            .config
            .peers_file
            .clone()
            .map(|path| self.spawn_relation_task(path));
        let reload_handle = self.spawn_reload_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                batch = self.queue.next_batch() => {
                    if let Some(report) = self.run_pass(batch).await {
                        debug!("Pass finished: {} -> {}", report.reason, report.status);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        tick_handle.abort();
        for handle in [relation_handle, reload_handle].into_iter().flatten() {
            handle.abort();
        }

        self.storage.flush()?;

        Ok(())
    }

    /// One pass on a blocking thread; passes never overlap
    async fn run_pass(&self, batch: Vec<Trigger>) -> Option<PassReport> {
        let reconciler = self.reconciler.clone();
        let pass = tokio::task::spawn_blocking(move || {
            let mut reconciler = reconciler.lock();
            reconciler.handle(batch)
        });
        match pass.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Reconciliation pass panicked: {}", e);
                None
            }
        }
    }

    /// Spawn the periodic health tick
    fn spawn_tick_task(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let period = Duration::from_secs(self.config.tick_interval_secs);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already covers it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                queue.push(Trigger::Tick);
            }
        })
    }

    /// Spawn the relation snapshot poller
    fn spawn_relation_task(&self, path: PathBuf) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let period = Duration::from_secs(self.config.relation_poll_secs);
        info!("Watching relation snapshot {}", path.display());

        tokio::spawn(async move {
            let mut source = PeerFileSource::new(path);
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match source.poll() {
                    Ok(triggers) if triggers.is_empty() => {}
                    Ok(triggers) => {
                        debug!("Relation snapshot yielded {} triggers", triggers.len());
                        queue.extend(triggers);
                    }
                    Err(e) => warn!("Relation snapshot unreadable: {}", e),
                }
            }
        })
    }

    /// Spawn the SIGHUP listener that reloads the settings file
    #[cfg(unix)]
    fn spawn_reload_task(&self) -> Option<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!("Cannot listen for SIGHUP: {}", e);
                return None;
            }
        };
        let reloader = self.reloader.clone();

        Some(tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("Received SIGHUP, reloading configuration");
                if let Err(e) = reloader.reload() {
                    warn!("Configuration reload failed: {}", e);
                }
            }
        }))
    }

    #[cfg(not(unix))]
    fn spawn_reload_task(&self) -> Option<JoinHandle<()>> {
        None
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ADVERTISEMENT_FILE, STATUS_FILE};
    use clap::Parser;
    use tempfile::tempdir;
    use wg_gateway_core::{GatewayStatus, StatusKind};

    fn dry_run_config(dir: &std::path::Path, extra: &[&str]) -> Config {
        let data_dir = dir.to_string_lossy().to_string();
        let mut argv = vec![
            "gatewayd",
            "--data-dir",
            data_dir.as_str(),
            "--dry-run",
            "--router-id",
            "172.16.0.10",
            "--vrrp-interface",
            "eth0",
            "--vips",
            "203.0.113.2/24",
        ];
        argv.extend_from_slice(extra);
        Config::try_parse_from(argv).unwrap()
    }

    fn read_status(dir: &std::path::Path) -> GatewayStatus {
        let raw = std::fs::read_to_string(dir.join("status").join(STATUS_FILE)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_startup_pass_publishes() {
        let dir = tempdir().unwrap();
        let config = dry_run_config(dir.path(), &["--advertise-prefixes", "192.0.2.0/24"]);
        let server = Arc::new(Server::new(config).unwrap());

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let status_path = dir.path().join("status").join(STATUS_FILE);
        for _ in 0..100 {
            if status_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        server.shutdown();
        handle.await.unwrap().unwrap();

        let status = read_status(dir.path());
        assert_eq!(status.kind, StatusKind::Blocked);
        assert_eq!(status.message, "no usable peers");
        assert!(dir.path().join("status").join(ADVERTISEMENT_FILE).exists());
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = tempdir().unwrap();

        let first = {
            let server = Server::new(dry_run_config(dir.path(), &[])).unwrap();
            server.run_pass(vec![Trigger::Startup]).await.unwrap();
            let key = server.reconciler.lock().advertisement().unwrap().public_key;
            key
        };

        let server = Server::new(dry_run_config(dir.path(), &[])).unwrap();
        server.run_pass(vec![Trigger::Startup]).await.unwrap();
        let second = server.reconciler.lock().advertisement().unwrap().public_key;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_regenerate_key_replaces_identity() {
        let dir = tempdir().unwrap();

        let first = {
            let server = Server::new(dry_run_config(dir.path(), &[])).unwrap();
            server.run_pass(vec![Trigger::Startup]).await.unwrap();
            let key = server.reconciler.lock().advertisement().unwrap().public_key;
            key
        };

        let server =
            Server::new(dry_run_config(dir.path(), &["--regenerate-key"])).unwrap();
        server.run_pass(vec![Trigger::Startup]).await.unwrap();
        let second = server.reconciler.lock().advertisement().unwrap().public_key;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_reconfigure_is_applied_on_next_pass() {
        let dir = tempdir().unwrap();
        let server = Server::new(dry_run_config(dir.path(), &[])).unwrap();

        let report = server.run_pass(vec![Trigger::Startup]).await.unwrap();
        assert_eq!(report.status.message, "no advertise-prefixes configured");

        let key = server.reloader.public_key;
        let updated = dry_run_config(dir.path(), &["--advertise-prefixes", "192.0.2.0/24"])
            .to_local_config(None, &key)
            .unwrap();
        server.reconfigure(updated);
        let batch = server.queue.next_batch().await;
        let report = server.run_pass(batch).await.unwrap();
        assert_eq!(report.reason, "config-changed");
        assert_eq!(report.status.message, "no usable peers");
    }

    #[tokio::test]
    async fn test_default_tunnel_address_follows_identity() {
        let dir = tempdir().unwrap();
        let server = Server::new(dry_run_config(dir.path(), &[])).unwrap();
        server.run_pass(vec![Trigger::Startup]).await.unwrap();

        let advertisement = server.reconciler.lock().advertisement().unwrap();
        let derived = advertisement.public_key.link_local();
        assert_eq!(advertisement.tunnel_address, derived.addr());
    }

    #[tokio::test]
    async fn test_reload_reads_settings_file() {
        let dir = tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        let settings_arg = settings.to_string_lossy().to_string();
        let config = dry_run_config(dir.path(), &["--config-file", settings_arg.as_str()]);
        let server = Server::new(config).unwrap();

        let report = server.run_pass(vec![Trigger::Startup]).await.unwrap();
        assert_eq!(report.status.message, "no advertise-prefixes configured");

        std::fs::write(&settings, r#"{"advertise-prefixes": ["192.0.2.0/24"]}"#).unwrap();
        server.reload().unwrap();
        let batch = server.queue.next_batch().await;
        let report = server.run_pass(batch).await.unwrap();
        assert_eq!(report.reason, "config-changed");
        assert_eq!(report.status.message, "no usable peers");

        // A broken file is reported and leaves the running config alone
        std::fs::write(&settings, "{").unwrap();
        assert!(matches!(server.reload(), Err(ServerError::Config(_))));
        assert_eq!(server.reconciler.lock().config().advertise_prefixes.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sighup_triggers_reload() {
        let dir = tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        let settings_arg = settings.to_string_lossy().to_string();
        let config = dry_run_config(dir.path(), &["--config-file", settings_arg.as_str()]);
        let server = Arc::new(Server::new(config).unwrap());

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        // The startup pass only runs once the SIGHUP listener is installed
        let status_path = dir.path().join("status").join(STATUS_FILE);
        for _ in 0..100 {
            if status_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(read_status(dir.path()).message, "no advertise-prefixes configured");

        std::fs::write(&settings, r#"{"advertise-prefixes": ["192.0.2.0/24"]}"#).unwrap();
        let pid = std::process::id().to_string();
        let sent = std::process::Command::new("kill")
            .args(["-HUP", pid.as_str()])
            .status()
            .unwrap();
        assert!(sent.success());

        let mut message = String::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            message = read_status(dir.path()).message;
            if message == "no usable peers" {
                break;
            }
        }

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert_eq!(message, "no usable peers");
    }
}
