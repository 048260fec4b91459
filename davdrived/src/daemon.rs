use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use davdrive_core::{ChangeFeed, Credentials, DavClient};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::sync::context::{DriveContext, SyncConfig};
use crate::sync::engine::SyncEngine;
use crate::sync::events::SyncEvent;
use crate::sync::local_watcher::{LocalEvent, start_notify_watcher};
use crate::sync::mapping::Mapping;
use crate::sync::monitor::{MonitorConfig, MonitorMode, RemoteMonitor, filter_for};
use crate::sync::placeholder::{DirPlaceholderFs, PlaceholderFs};
use crate::sync::side_store::SideStore;

const DEFAULT_SYNC_DIR_NAME: &str = "DavDrive";
const DEFAULT_REMOTE_ROOT: &str = "/";
const DEFAULT_FULL_SYNC_SECS: u64 = 60;
const DEFAULT_RECONNECT_SECS: u64 = 2;
const CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    /// Change feed endpoint when it is not `<server>/v1/changes`.
    pub changes_url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub sync_root: PathBuf,
    pub data_root: PathBuf,
    pub remote_root: String,
    pub full_sync_interval: Duration,
    pub monitor_mode: MonitorMode,
    pub queue_capacity: usize,
    pub reconnect_delay: Duration,
    pub enable_local_watcher: bool,
    pub auto_lock: bool,
    pub set_lock_read_only: bool,
    /// Pin the sync root so every file is kept hydrated.
    pub pin_root: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let server_url =
            std::env::var("DAVDRIVE_SERVER_URL").context("DAVDRIVE_SERVER_URL is not set")?;
        let changes_url = read_string_env("DAVDRIVE_CHANGES_URL");
        let user = read_string_env("DAVDRIVE_USER");
        let password = read_string_env("DAVDRIVE_PASSWORD");
        let sync_root = std::env::var("DAVDRIVE_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let data_root = std::env::var("DAVDRIVE_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_data_root);
        let remote_root = std::env::var("DAVDRIVE_REMOTE_ROOT")
            .unwrap_or_else(|_| DEFAULT_REMOTE_ROOT.to_string());
        let full_sync_interval = Duration::from_secs(read_u64_env(
            "DAVDRIVE_FULL_SYNC_SECS",
            DEFAULT_FULL_SYNC_SECS,
        ));
        let monitor_mode = match std::env::var("DAVDRIVE_MONITOR_MODE") {
            Ok(value) => parse_monitor_mode(&value)?,
            Err(_) => MonitorMode::default(),
        };
        let queue_capacity = read_u64_env(
            "DAVDRIVE_QUEUE_CAPACITY",
            monitor_mode.default_queue_capacity() as u64,
        ) as usize;
        let reconnect_delay = Duration::from_secs(read_u64_env(
            "DAVDRIVE_RECONNECT_SECS",
            DEFAULT_RECONNECT_SECS,
        ));
        let enable_local_watcher = read_bool_env("DAVDRIVE_ENABLE_LOCAL_WATCHER", true);
        let auto_lock = read_bool_env("DAVDRIVE_AUTO_LOCK", false);
        let set_lock_read_only = read_bool_env("DAVDRIVE_SET_LOCK_READ_ONLY", true);
        let pin_root = read_bool_env("DAVDRIVE_PIN_ROOT", true);

        Ok(Self {
            server_url,
            changes_url,
            user,
            password,
            sync_root,
            data_root,
            remote_root,
            full_sync_interval,
            monitor_mode,
            queue_capacity,
            reconnect_delay,
            enable_local_watcher,
            auto_lock,
            set_lock_read_only,
            pin_root,
        })
    }

    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            current_user: self.user.clone(),
            auto_lock: self.auto_lock,
            set_lock_read_only: self.set_lock_read_only,
            ..SyncConfig::default()
        }
    }

    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            mode: self.monitor_mode,
            queue_capacity: self.queue_capacity,
            reconnect_delay: self.reconnect_delay,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    feed: Arc<ChangeFeed>,
    cancel: CancellationToken,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;
        tokio::fs::create_dir_all(&config.data_root)
            .await
            .with_context(|| format!("failed to create data root at {:?}", config.data_root))?;

        // No overall request timeout: the change feed is a long-lived response.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")?;
        let mut client = DavClient::with_http(http, &config.server_url)
            .context("invalid DAVDRIVE_SERVER_URL")?
            .with_instance_id(instance_id());
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            client = client.with_credentials(Credentials {
                user: user.clone(),
                password: password.clone(),
            });
        }
        let feed = match &config.changes_url {
            Some(url) => ChangeFeed::with_url(client.clone(), url),
            None => ChangeFeed::new(client.clone()),
        }
        .context("invalid change feed url")?;

        let fs = Arc::new(DirPlaceholderFs::new(
            &config.sync_root,
            config.data_root.join("placeholders"),
        ));
        if config.pin_root {
            pin(fs.as_ref(), &config.sync_root)
                .await
                .context("failed to pin the sync root")?;
        }
        let ctx = DriveContext::new(
            Mapping::new(&config.sync_root, &config.remote_root),
            SideStore::new(config.data_root.join("side-store")),
            fs,
            Arc::new(client),
            config.sync_config(),
        );
        let cancel = CancellationToken::new();
        let engine = Arc::new(SyncEngine::new(Arc::new(ctx), cancel.clone()));

        Ok(Self {
            config,
            engine,
            feed: Arc::new(feed),
            cancel,
        })
    }

    /// A single full pass, for `--once`.
    pub async fn run_once(self) -> anyhow::Result<()> {
        let report = self.engine.full_pass().await.context("full pass failed")?;
        tracing::info!(
            moved = report.moved,
            uploaded = report.uploaded,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            hydrated = report.hydrated,
            dehydrated = report.dehydrated,
            failures = report.failures,
            "full pass done"
        );
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            sync_root = %self.config.sync_root.display(),
            remote_root = %self.config.remote_root,
            mode = ?self.config.monitor_mode,
            local_watcher = self.config.enable_local_watcher,
            "started"
        );

        let events_handle = tokio::spawn(log_sync_events(
            self.engine.subscribe(),
            self.cancel.clone(),
        ));

        let ctx = Arc::clone(self.engine.context());
        let monitor = Arc::new(RemoteMonitor::new(
            self.feed.clone(),
            self.engine.clone(),
            filter_for(self.config.monitor_mode, Arc::clone(&ctx)),
            self.config.monitor_config(),
            ctx.events.clone(),
        ));
        let monitor_handle = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            let cancel = self.cancel.clone();
            async move { monitor.run(cancel).await }
        });

        let periodic_handle = tokio::spawn(
            self.engine
                .full_sync()
                .run_periodically(self.config.full_sync_interval, self.cancel.clone()),
        );

        let (watcher, local_rx): (
            Option<notify::RecommendedWatcher>,
            Option<mpsc::UnboundedReceiver<LocalEvent>>,
        ) = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.sync_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };
        let local_handle = local_rx.map(|rx| {
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move { engine.run_local_events(rx).await })
        });

        let _watcher = watcher;
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutting down");
        self.cancel.cancel();

        match monitor_handle.await {
            Ok(dropped) => tracing::debug!(dropped, "change monitor stopped"),
            Err(err) => tracing::warn!(error = %err, "change monitor task failed"),
        }
        if let Err(err) = periodic_handle.await {
            tracing::warn!(error = %err, "periodic pass task failed");
        }
        if let Some(handle) = local_handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "local event task failed");
        }
        if let Err(err) = events_handle.await {
            tracing::warn!(error = %err, "event logger task failed");
        }
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
