fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("davdrive")
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn parse_monitor_mode(value: &str) -> anyhow::Result<MonitorMode> {
    MonitorMode::parse(value)
        .with_context(|| format!("unknown DAVDRIVE_MONITOR_MODE: {value} (expected crud or sync-id)"))
}

/// Random per-process id sent with every request.
fn instance_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

async fn pin(fs: &dyn PlaceholderFs, path: &Path) -> std::io::Result<()> {
    let mut attributes = fs.attributes(path).await?;
    if attributes.pinned && !attributes.unpinned {
        return Ok(());
    }
    attributes.pinned = true;
    attributes.unpinned = false;
    fs.set_attributes(path, attributes).await
}

async fn log_sync_events(mut events: broadcast::Receiver<SyncEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SyncEvent::ItemSynced { path, direction }) => {
                tracing::debug!(path = %path.display(), ?direction, "item synced");
            }
            Ok(SyncEvent::Conflict { path }) => {
                tracing::warn!(path = %path.display(), "needs conflict resolution");
            }
            Ok(SyncEvent::FullPassCompleted {
                mutations,
                failures,
            }) if mutations > 0 || failures > 0 => {
                tracing::info!(mutations, failures, "full pass completed");
            }
            // Already logged where they are raised.
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
