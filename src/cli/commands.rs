//! Command handlers for the download manager CLI
//!
//! Each handler loads the configuration, starts a manager service for the
//! duration of the command and drives it through the public handles, the
//! same way any other client would.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::store::MetadataStore;
use crate::app::transfer::temp_path_for;
use crate::app::{
    DownloadManager, DownloadRequest, GroupItem, GroupRequest, JsonFileStore, ManagerHandle,
    ManualProbe, Metadata, NetworkMode, Notification, ReqwestTransport, StaticResolver,
    TransferEvent, TransferHandle, TransferId, TransferState,
};
use crate::cli::{FetchArgs, GroupArgs, TransferProgress};
use crate::config::AppConfig;
use crate::constants::{metadata, rpc};
use crate::errors::{AppError, Result};

/// How a batch of transfers ended
#[derive(Debug, Default)]
pub struct Outcome {
    pub finished: Vec<PathBuf>,
    pub failed: Vec<(TransferId, String)>,
    /// Ctrl-C paused the batch before it settled
    pub interrupted: bool,
}

impl Outcome {
    fn print(&self, elapsed: std::time::Duration) {
        println!("\n📊 Transfer Summary:");
        println!("  Finished: {}", self.finished.len());
        for path in &self.finished {
            println!("    • {}", path.display());
        }
        println!("  Failed: {}", self.failed.len());
        for (id, error) in &self.failed {
            println!("    • {}: {}", id, error);
        }
        println!("  Time: {:?}", elapsed);
        if self.interrupted {
            println!("\n⏸  Paused. Run 'download-manager resume' to continue.");
        }
    }
}

/// Handle the fetch command
pub async fn handle_fetch(args: FetchArgs, config: AppConfig, quiet: bool) -> Result<()> {
    args.validate().map_err(AppError::generic)?;
    let headers = args.parsed_headers().map_err(AppError::generic)?;
    let start_time = Instant::now();

    let (manager, task) = start_manager(&config, args.output_dir.clone()).await?;
    let mut events = manager.subscribe();
    let mut progress = TransferProgress::new(!quiet);

    let mut handles = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let mut metadata = Metadata::new();
        if let Some(output) = &args.output {
            metadata.insert(metadata::LOCAL_PATH, output.to_string_lossy().into_owned());
        }
        if let Some(command) = args.post_command() {
            metadata.insert(metadata::COMMAND, command);
        }
        let request = DownloadRequest {
            url: url.clone(),
            hash: args.hash.clone(),
            algorithm: args.algorithm.clone(),
            metadata,
            headers: headers.clone(),
        };

        let handle = manager.create_download(rpc::CLI_CALLER, request).await?;
        if let Some(throttle) = args.throttle {
            handle.set_throttle(throttle).await?;
        }
        if args.allow_mobile {
            handle.allow_mobile_download(true).await?;
        }
        progress.add(handle.id(), &label_for(url));
        handles.push(handle);
    }

    info!("Starting {} download(s)", handles.len());
    for handle in &handles {
        handle.start().await?;
    }

    let outcome = wait_for(&handles, &mut events, &mut progress).await?;
    finish(manager, task, &handles, &outcome).await?;
    outcome.print(start_time.elapsed());

    if outcome.failed.is_empty() || outcome.interrupted {
        Ok(())
    } else {
        Err(AppError::generic(format!(
            "{} download(s) failed",
            outcome.failed.len()
        )))
    }
}

/// Handle the group command
pub async fn handle_group(args: GroupArgs, config: AppConfig, quiet: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(&args.manifest)
        .await
        .map_err(|e| {
            AppError::generic(format!(
                "Failed to read manifest {}: {}",
                args.manifest.display(),
                e
            ))
        })?;
    let items: Vec<GroupItem> = serde_json::from_str(&content).map_err(|e| {
        AppError::generic(format!(
            "Manifest {} is not a list of downloads: {}",
            args.manifest.display(),
            e
        ))
    })?;
    if items.is_empty() {
        println!("ℹ️  Manifest lists no downloads");
        return Ok(());
    }
    let start_time = Instant::now();

    let (manager, task) = start_manager(&config, args.output_dir.clone()).await?;
    let mut events = manager.subscribe();
    let mut progress = TransferProgress::new(!quiet);

    let request = GroupRequest {
        items,
        algorithm: args.algorithm.clone(),
        allow_mobile_data: args.allow_mobile || config.downloads.allow_mobile_data,
        ..Default::default()
    };
    let count = request.items.len();
    let handle = manager
        .create_download_group(rpc::CLI_CALLER, request)
        .await?;
    if let Some(throttle) = args.throttle {
        handle.set_throttle(throttle).await?;
    }
    progress.add(handle.id(), &format!("group of {}", count));

    info!("Starting group {} with {} file(s)", handle.id(), count);
    handle.start().await?;

    let handles = vec![handle];
    let outcome = wait_for(&handles, &mut events, &mut progress).await?;
    finish(manager, task, &handles, &outcome).await?;
    outcome.print(start_time.elapsed());

    match outcome.failed.first() {
        Some((_, error)) if !outcome.interrupted => {
            Err(AppError::generic(format!("Group failed: {}", error)))
        }
        _ => Ok(()),
    }
}

/// Handle the resume command
pub async fn handle_resume(config: AppConfig, quiet: bool) -> Result<()> {
    let start_time = Instant::now();
    let (manager, task) = start_manager(&config, None).await?;
    let mut events = manager.subscribe();
    let mut progress = TransferProgress::new(!quiet);

    let restored = manager.restore().await?;
    if restored.is_empty() {
        println!("ℹ️  No transfers to resume");
        manager.shutdown().await?;
        return Ok(());
    }

    let mut pending = Vec::new();
    for handle in restored {
        let info = handle.info().await?;
        let label = info
            .local_path
            .as_ref()
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| handle.id().to_string());
        match info.state {
            TransferState::Uncollected => {
                println!("✅ Already finished: {}", label);
                handle.collected().await?;
                continue;
            }
            TransferState::Pause => handle.resume().await?,
            TransferState::Idle => handle.start().await?,
            _ => {}
        }
        progress.add(handle.id(), &label);
        progress.update(&handle.id(), info.received, info.total);
        pending.push(handle);
    }
    println!("🔄 Resuming {} transfer(s)...", pending.len());

    let outcome = wait_for(&pending, &mut events, &mut progress).await?;
    finish(manager, task, &pending, &outcome).await?;
    outcome.print(start_time.elapsed());
    Ok(())
}

/// Handle the list command
pub async fn handle_list(config: AppConfig) -> Result<()> {
    let store = JsonFileStore::new(config.metadata_dir());
    let records = store.load_all().await?;
    if records.is_empty() {
        println!("No persisted transfers in {}", store.directory().display());
        return Ok(());
    }

    println!(
        "{:<36}  {:<11}  {:>12}  {:>12}  URL",
        "ID", "STATE", "RECEIVED", "TOTAL"
    );
    for record in records {
        let received = tokio::fs::metadata(temp_path_for(&record.local_path))
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        println!(
            "{:<36}  {:<11}  {:>12}  {:>12}  {}",
            record.id, record.state, received, record.total_size, record.url
        );
        println!("    -> {}", record.local_path.display());
    }
    Ok(())
}

/// Start a manager for this invocation
async fn start_manager(
    config: &AppConfig,
    output_dir: Option<PathBuf>,
) -> Result<(ManagerHandle, JoinHandle<()>)> {
    let (client_config, mut manager_config) = config.to_runtime_config();
    if let Some(dir) = output_dir {
        manager_config.download_root = dir;
    }
    tokio::fs::create_dir_all(&manager_config.download_root).await?;

    let transport = ReqwestTransport::from_config(&client_config)?;
    let store = JsonFileStore::new(config.metadata_dir());
    let resolver = StaticResolver::unconfined(&manager_config.download_root);
    // The command line has no connectivity service to ask
    let probe = ManualProbe::new(NetworkMode::Ethernet);

    debug!(
        "Downloads go to {}, records to {}",
        manager_config.download_root.display(),
        store.directory().display()
    );
    Ok(DownloadManager::spawn(
        manager_config,
        Arc::new(transport),
        Arc::new(resolver),
        Arc::new(store),
        &probe,
    ))
}

/// Follow notifications until every handle settled or Ctrl-C arrives
async fn wait_for(
    handles: &[TransferHandle],
    events: &mut broadcast::Receiver<Notification>,
    progress: &mut TransferProgress,
) -> Result<Outcome> {
    let mut pending: HashSet<TransferId> = handles.iter().map(TransferHandle::id).collect();
    let mut outcome = Outcome::default();

    while !pending.is_empty() {
        tokio::select! {
            received = events.recv() => match received {
                Ok(Notification { id, event }) => {
                    if !pending.contains(&id) {
                        continue;
                    }
                    match event {
                        TransferEvent::Progress { received, total } => {
                            progress.update(&id, received, total)
                        }
                        TransferEvent::Processing(_) => progress.processing(&id),
                        TransferEvent::Paused(true) => progress.paused(&id),
                        TransferEvent::Finished(path) => {
                            progress.finish(&id, &path);
                            outcome.finished.push(path);
                            pending.remove(&id);
                        }
                        TransferEvent::GroupFinished(paths) => {
                            let label = format!("{} file(s)", paths.len());
                            progress.finish(&id, &PathBuf::from(label));
                            outcome.finished.extend(paths);
                            pending.remove(&id);
                        }
                        TransferEvent::Error(error) => {
                            progress.fail(&id, &error.to_string());
                            warn!("Transfer {} failed ({}): {}", id, error.kind(), error);
                            outcome.failed.push((id, error.to_string()));
                            pending.remove(&id);
                        }
                        TransferEvent::Canceled(true) => {
                            pending.remove(&id);
                        }
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(missed)) => debug!("Skipped {} notifications", missed),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                eprintln!("\n🛑 Ctrl-C received - pausing transfers");
                for handle in handles.iter().filter(|h| pending.contains(&h.id())) {
                    if let Err(e) = handle.pause().await {
                        debug!("Could not pause {}: {}", handle.id(), e);
                    }
                }
                progress.abandon_all("paused");
                outcome.interrupted = true;
                break;
            }
        }
    }
    Ok(outcome)
}

/// Acknowledge settled transfers and stop the manager
async fn finish(
    manager: ManagerHandle,
    task: JoinHandle<()>,
    handles: &[TransferHandle],
    outcome: &Outcome,
) -> Result<()> {
    let failed: HashSet<TransferId> = outcome.failed.iter().map(|(id, _)| *id).collect();
    for handle in handles {
        let state = handle.state().await.ok();
        if matches!(state, Some(TransferState::Uncollected | TransferState::Error))
            || failed.contains(&handle.id())
        {
            if let Err(e) = handle.collected().await {
                debug!("Could not collect {}: {}", handle.id(), e);
            }
        }
    }

    manager.shutdown().await?;
    task.await
        .map_err(|e| AppError::generic(format!("Manager task panicked: {}", e)))?;
    Ok(())
}

/// Bar label for a URL
fn label_for(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| url.to_string())
}
