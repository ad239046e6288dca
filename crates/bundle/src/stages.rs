//! The pipeline stages.
//!
//! Every stage forwards each bundle exactly once on each of its output
//! queues, whether it did real work, skipped it because the run has
//! failed, or failed itself. That keeps the join and the done counter
//! balanced.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bulkput_parallel::{PARALLEL_UPLOAD_MIN_SIZE, threads_for_transfer};
use bulkput_store::{ArchiveKind, ByteProgressFn, RemoteEntry, StoreError, UploadOptions, path};
use bulkput_transfer::{ArchiveCallback, ProgressUnit, calculate_file_checksum, create_archive};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bundle::{Bundle, Entry};
use crate::config::TransferMode;
use crate::error::{BundleError, Stage};
use crate::manager::RunState;
use crate::report::{TransferMethod, TransferRecord};

const ARCHIVE_QUEUE_DEPTH: usize = 1;
const QUEUE_DEPTH: usize = 5;
const EXTRACT_WORKERS: usize = 3;

type BundleTx = mpsc::Sender<Arc<Bundle>>;
type BundleRx = mpsc::Receiver<Arc<Bundle>>;
type SharedRx = Arc<Mutex<BundleRx>>;

/// Wires up the stage tasks behind `input`.
pub(crate) fn spawn(run: Arc<RunState>, input: BundleRx) -> JoinSet<()> {
    let (archive_tx, archive_rx) = mpsc::channel(ARCHIVE_QUEUE_DEPTH);
    let (preclean_tx, preclean_rx) = mpsc::channel(QUEUE_DEPTH);
    let (upload_tx, upload_rx) = mpsc::channel(QUEUE_DEPTH);
    let (uploaded_tx, uploaded_rx) = mpsc::channel(QUEUE_DEPTH);
    let (precleaned_tx, precleaned_rx) = mpsc::channel(QUEUE_DEPTH);
    let (extract_tx, extract_rx) = mpsc::channel(QUEUE_DEPTH);

    let mut tasks = JoinSet::new();
    tasks.spawn(intake(Arc::clone(&run), input, archive_tx, preclean_tx));
    tasks.spawn(archive(Arc::clone(&run), archive_rx, upload_tx));

    let upload_rx: SharedRx = Arc::new(Mutex::new(upload_rx));
    for _ in 0..run.config.upload_thread_count() {
        tasks.spawn(upload_worker(
            Arc::clone(&run),
            Arc::clone(&upload_rx),
            uploaded_tx.clone(),
        ));
    }
    drop(uploaded_tx);

    tasks.spawn(pre_clean(Arc::clone(&run), preclean_rx, precleaned_tx));
    tasks.spawn(async move {
        join(uploaded_rx, precleaned_rx, extract_tx).await;
    });

    let extract_rx: SharedRx = Arc::new(Mutex::new(extract_rx));
    for _ in 0..EXTRACT_WORKERS {
        tasks.spawn(extract_worker(Arc::clone(&run), Arc::clone(&extract_rx)));
    }
    tasks
}

async fn forward(tx: &BundleTx, bundle: Arc<Bundle>, stage: Stage) -> bool {
    let index = bundle.index();
    if tx.send(bundle).await.is_err() {
        warn!(bundle = index, stage = %stage, "downstream queue closed");
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

async fn intake(run: Arc<RunState>, mut input: BundleRx, archive_tx: BundleTx, preclean_tx: BundleTx) {
    let mut dest_ready = false;
    let mut staging_ready = false;

    while let Some(bundle) = input.recv().await {
        if !run.is_failed() {
            let result = async {
                if !dest_ready {
                    ensure_dir(&run, &run.dest).await?;
                    dest_ready = true;
                }
                if bundle.require_archive() && !staging_ready {
                    ensure_dir(&run, &run.staging).await?;
                    staging_ready = true;
                }
                Ok::<_, BundleError>(())
            }
            .await;
            if let Err(e) = result {
                run.fail(Stage::Intake, &bundle, e);
            }
        }

        if !forward(&archive_tx, Arc::clone(&bundle), Stage::Intake).await
            || !forward(&preclean_tx, bundle, Stage::Intake).await
        {
            break;
        }
    }
    debug!("intake stage finished");
}

async fn ensure_dir(run: &RunState, dir: &str) -> Result<(), BundleError> {
    if run.cache.exists_dir(dir).await {
        return Ok(());
    }
    run.store().make_dir(dir, true).await?;
    run.cache.invalidate(&path::parent(dir));
    debug!(dir = %dir, "created remote directory");
    Ok(())
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

async fn archive(run: Arc<RunState>, mut rx: BundleRx, upload_tx: BundleTx) {
    while let Some(bundle) = rx.recv().await {
        if bundle.require_archive()
            && !run.is_failed()
            && let Err(e) = build_archive(&run, &bundle).await
        {
            run.report(&bundle, Stage::Archive, -1, bundle.size(), ProgressUnit::Bytes, true);
            run.fail(Stage::Archive, &bundle, e);
        }
        if !forward(&upload_tx, bundle, Stage::Archive).await {
            break;
        }
    }
    debug!("archive stage finished");
}

async fn build_archive(run: &Arc<RunState>, bundle: &Arc<Bundle>) -> Result<(), BundleError> {
    let sources: Vec<PathBuf> = bundle.entries().iter().map(|e| e.local_path.clone()).collect();
    let base = run.config.local_root.clone();
    let target = bundle.local_archive_path().to_path_buf();
    tokio::fs::create_dir_all(&run.config.local_temp_dir).await?;

    let callback: ArchiveCallback = {
        let run = Arc::clone(run);
        let bundle = Arc::clone(bundle);
        Box::new(move |processed: i64, total: i64| {
            run.report(&bundle, Stage::Archive, processed, total, ProgressUnit::Bytes, false);
        })
    };

    let result = {
        let target = target.clone();
        tokio::task::spawn_blocking(move || create_archive(&base, &sources, &target, Some(callback)))
            .await
    };
    match result {
        Ok(Ok(())) => {
            debug!(bundle = bundle.index(), archive = %target.display(), "archive written");
            Ok(())
        }
        Ok(Err(e)) => {
            remove_local_file(&target).await;
            Err(e.into())
        }
        Err(e) => {
            remove_local_file(&target).await;
            Err(e.into())
        }
    }
}

async fn remove_local_file(file: &Path) {
    match tokio::fs::remove_file(file).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %file.display(), error = %e, "failed to remove local archive"),
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

async fn upload_worker(run: Arc<RunState>, rx: SharedRx, uploaded_tx: BundleTx) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(bundle) = next else { break };

        if !run.is_failed() && bundle.last_error().is_none() {
            let result = if bundle.require_archive() {
                upload_archive(&run, &bundle).await
            } else {
                upload_entries(&run, &bundle).await
            };
            if let Err(e) = result {
                run.report(&bundle, Stage::Upload, -1, bundle.size(), ProgressUnit::Bytes, true);
                run.fail(Stage::Upload, &bundle, e);
            }
        }
        if bundle.require_archive() {
            remove_local_file(bundle.local_archive_path()).await;
        }

        if !forward(&uploaded_tx, bundle, Stage::Upload).await {
            break;
        }
    }
}

fn byte_progress(run: &Arc<RunState>, bundle: &Arc<Bundle>, base: i64, total: i64) -> ByteProgressFn {
    let run = Arc::clone(run);
    let bundle = Arc::clone(bundle);
    Arc::new(move |processed: i64, _total: i64| {
        run.report(&bundle, Stage::Upload, base + processed, total, ProgressUnit::Bytes, false);
    })
}

fn upload_options(run: &RunState, overwrite: bool) -> UploadOptions {
    UploadOptions {
        resource: run.config.resource.clone(),
        replicate: run.config.replicate,
        overwrite,
    }
}

/// Streams per file for the configured transfer mode.
fn streams_for(run: &RunState, size: i64) -> usize {
    let max = run.config.max_threads_per_file;
    match run.config.transfer_mode {
        TransferMode::Single => 1,
        TransferMode::Parallel => threads_for_transfer(size, max),
        TransferMode::Auto
            if run.store().supports_parallel_upload() && size >= PARALLEL_UPLOAD_MIN_SIZE =>
        {
            threads_for_transfer(size, max)
        }
        TransferMode::Auto => 1,
    }
}

async fn transfer_file(
    run: &RunState,
    local: &Path,
    remote: &str,
    size: i64,
    options: &UploadOptions,
    progress: ByteProgressFn,
) -> Result<(), StoreError> {
    let threads = streams_for(run, size);
    if threads > 1 {
        run.store()
            .upload_file_parallel(local, remote, options, threads, Some(progress))
            .await
    } else {
        run.store()
            .upload_file(local, remote, options, Some(progress))
            .await
    }
}

async fn upload_archive(run: &Arc<RunState>, bundle: &Arc<Bundle>) -> Result<(), BundleError> {
    let local = bundle.local_archive_path();
    let remote = bundle.remote_archive_path();
    let size = tokio::fs::metadata(local).await?.len() as i64;

    if let Some(existing) = run.store().stat(remote).await?
        && existing.is_file()
        && existing.size == size
        && (!run.config.verify_checksum || staged_matches(&existing, local).await?)
    {
        info!(bundle = bundle.index(), archive = %remote, "archive already staged, skipping upload");
        run.report(bundle, Stage::Upload, size, size, ProgressUnit::Bytes, false);
        return Ok(());
    }

    run.report(bundle, Stage::Upload, 0, size, ProgressUnit::Bytes, false);
    let options = upload_options(run, true);
    let progress = byte_progress(run, bundle, 0, size);
    transfer_file(run, local, remote, size, &options, progress).await?;
    if run.config.verify_checksum {
        verify_upload(run, local, remote).await?;
    }
    debug!(bundle = bundle.index(), archive = %remote, size, "archive uploaded");
    Ok(())
}

async fn upload_entries(run: &Arc<RunState>, bundle: &Arc<Bundle>) -> Result<(), BundleError> {
    let total = bundle.size();
    let mut completed = 0;
    run.report(bundle, Stage::Upload, 0, total, ProgressUnit::Bytes, false);

    for entry in bundle.entries() {
        let target = entry.remote_path.as_str();
        let start_at = Utc::now();

        if entry.is_dir() {
            match run.cache.stat(target).await? {
                Some(remote) if remote.is_dir() => {}
                Some(_) => {
                    run.store().remove_file(target, true).await?;
                    run.cache.invalidate(target);
                    run.store().make_dir(target, true).await?;
                    run.cache.invalidate(target);
                }
                None => {
                    run.store().make_dir(target, true).await?;
                    run.cache.invalidate(&path::parent(target));
                }
            }
            record_entry(run, TransferMethod::Put, start_at, entry, None, vec!["directory".into()])?;
            continue;
        }

        let parent = path::parent(target);
        if !run.cache.exists_dir(&parent).await {
            run.store().make_dir(&parent, true).await?;
            run.cache.invalidate(&path::parent(&parent));
        }

        // A directory in the way always goes. Forced runs leave an existing
        // file for the store to overwrite.
        match run.cache.stat(target).await? {
            Some(remote) if remote.is_dir() => {
                debug!(path = %target, "removing directory in the way of a file");
                if let Err(e) = run.store().remove_dir(target, true, true).await
                    && !e.is_not_found()
                {
                    return Err(e.into());
                }
                run.cache.invalidate(target);
            }
            Some(_) if !run.config.force => {
                debug!(path = %target, "removing existing file");
                if let Err(e) = run.store().remove_file(target, true).await
                    && !e.is_not_found()
                {
                    return Err(e.into());
                }
                run.cache.invalidate(target);
            }
            _ => {}
        }

        let options = upload_options(run, true);
        let progress = byte_progress(run, bundle, completed, total);
        transfer_file(run, &entry.local_path, target, entry.size, &options, progress).await?;
        run.cache.invalidate(target);
        let checksum = if run.config.verify_checksum {
            Some(verify_upload(run, &entry.local_path, target).await?)
        } else {
            None
        };
        completed += entry.size;
        debug!(bundle = bundle.index(), path = %target, size = entry.size, "file uploaded");

        let notes = vec!["no-bundle".into(), format!("bundle_idx:{}", bundle.index())];
        record_entry(run, TransferMethod::Bput, start_at, entry, checksum, notes)?;
    }

    run.report(bundle, Stage::Upload, total, total, ProgressUnit::Bytes, false);
    Ok(())
}

async fn local_checksum(local: &Path) -> Result<String, BundleError> {
    let local = local.to_path_buf();
    Ok(tokio::task::spawn_blocking(move || calculate_file_checksum(&local)).await??)
}

/// True when a staged archive of the right size also has the right digest.
async fn staged_matches(existing: &RemoteEntry, local: &Path) -> Result<bool, BundleError> {
    let Some(remote) = existing.checksum.as_deref() else {
        return Ok(false);
    };
    Ok(local_checksum(local).await?.eq_ignore_ascii_case(remote))
}

/// Checks the store's digest of `remote` against `local` and returns it.
async fn verify_upload(run: &RunState, local: &Path, remote: &str) -> Result<String, BundleError> {
    let expected = local_checksum(local).await?;
    let actual = run
        .store()
        .stat(remote)
        .await?
        .and_then(|e| e.checksum)
        .ok_or_else(|| BundleError::ChecksumUnavailable(remote.to_string()))?;
    if !actual.eq_ignore_ascii_case(&expected) {
        return Err(BundleError::ChecksumMismatch {
            path: remote.to_string(),
            local: expected,
            remote: actual,
        });
    }
    debug!(path = %remote, checksum = %actual, "checksum verified");
    Ok(expected)
}

fn record_entry(
    run: &RunState,
    method: TransferMethod,
    start_at: DateTime<Utc>,
    entry: &Entry,
    checksum: Option<String>,
    notes: Vec<String>,
) -> Result<(), BundleError> {
    let record = TransferRecord {
        method,
        start_at,
        end_at: Utc::now(),
        source_path: entry.local_path.clone(),
        dest_path: entry.remote_path.clone(),
        source_size: entry.size,
        dest_size: entry.size,
        source_checksum: checksum.clone(),
        dest_checksum: checksum,
        notes,
    };
    run.reporter.record(&record)
}

// ---------------------------------------------------------------------------
// Pre-clean
// ---------------------------------------------------------------------------

async fn pre_clean(run: Arc<RunState>, mut rx: BundleRx, precleaned_tx: BundleTx) {
    while let Some(bundle) = rx.recv().await {
        if bundle.require_archive()
            && !run.is_failed()
            && let Err(e) = clean_conflicts(&run, &bundle).await
        {
            let total = bundle.entries().len() as i64;
            run.report(&bundle, Stage::PreClean, -1, total, ProgressUnit::Count, true);
            run.fail(Stage::PreClean, &bundle, e);
        }
        if !forward(&precleaned_tx, bundle, Stage::PreClean).await {
            break;
        }
    }
    debug!("pre-clean stage finished");
}

/// Removes remote paths that extraction would collide with.
async fn clean_conflicts(run: &RunState, bundle: &Bundle) -> Result<(), BundleError> {
    let total = bundle.entries().len() as i64;
    run.report(bundle, Stage::PreClean, 0, total, ProgressUnit::Count, false);

    for (i, entry) in bundle.entries().iter().enumerate() {
        let target = entry.remote_path.as_str();
        match run.cache.stat(target).await? {
            Some(remote) if remote.is_dir() && !entry.is_dir() => {
                debug!(path = %target, "removing directory in the way of a file");
                run.store().remove_dir(target, true, true).await?;
                run.cache.invalidate(target);
            }
            Some(remote) if remote.is_file() => {
                debug!(path = %target, "removing existing file");
                run.store().remove_file(target, true).await?;
                run.cache.invalidate(target);
            }
            _ => {}
        }
        run.report(bundle, Stage::PreClean, i as i64 + 1, total, ProgressUnit::Count, false);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Upload,
    PreClean,
}

/// Releases a bundle to extraction once both branches have delivered it.
///
/// Returns how many bundles only ever arrived on one branch.
async fn join(mut uploaded: BundleRx, mut precleaned: BundleRx, extract_tx: BundleTx) -> usize {
    let mut arrived: HashMap<u64, Branch> = HashMap::new();
    let mut uploaded_open = true;
    let mut precleaned_open = true;

    while uploaded_open || precleaned_open {
        let (bundle, branch) = tokio::select! {
            msg = uploaded.recv(), if uploaded_open => match msg {
                Some(bundle) => (bundle, Branch::Upload),
                None => {
                    uploaded_open = false;
                    continue;
                }
            },
            msg = precleaned.recv(), if precleaned_open => match msg {
                Some(bundle) => (bundle, Branch::PreClean),
                None => {
                    precleaned_open = false;
                    continue;
                }
            },
        };

        match arrived.entry(bundle.index()) {
            MapEntry::Vacant(slot) => {
                slot.insert(branch);
            }
            MapEntry::Occupied(slot) if *slot.get() == branch => {
                warn!(bundle = bundle.index(), branch = ?branch, "bundle arrived twice on one branch");
            }
            MapEntry::Occupied(slot) => {
                slot.remove();
                if !forward(&extract_tx, bundle, Stage::Extract).await {
                    break;
                }
            }
        }
    }

    if !arrived.is_empty() {
        warn!(pending = arrived.len(), "bundles left waiting at the join");
    }
    debug!("join finished");
    arrived.len()
}

// ---------------------------------------------------------------------------
// Extract
// ---------------------------------------------------------------------------

async fn extract_worker(run: Arc<RunState>, rx: SharedRx) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(bundle) = next else { break };

        if !bundle.require_archive() {
            if bundle.last_error().is_none() && !run.is_failed() {
                run.mark_done(&bundle);
            }
            continue;
        }
        extract_bundle(&run, &bundle).await;
    }
}

async fn extract_bundle(run: &RunState, bundle: &Bundle) {
    let archive = bundle.remote_archive_path();
    if run.is_failed() || bundle.last_error().is_some() {
        debug!(bundle = bundle.index(), archive = %archive, "run failed, discarding staged archive");
        remove_staged_archive(run, archive).await;
        return;
    }

    run.report(bundle, Stage::Extract, 0, 1, ProgressUnit::Count, false);
    let start_at = Utc::now();
    let result = run
        .store()
        .extract_archive(
            archive,
            &run.dest,
            ArchiveKind::Tar,
            !run.config.no_bulk_registration,
        )
        .await;

    for top in top_level_targets(&run.dest, bundle) {
        run.cache.invalidate(&top);
    }
    remove_staged_archive(run, archive).await;

    match result {
        Ok(()) => {
            run.report(bundle, Stage::Extract, 1, 1, ProgressUnit::Count, false);
            debug!(bundle = bundle.index(), entries = bundle.entries().len(), "bundle extracted");
            for entry in bundle.entries() {
                let notes = vec![
                    "bundle_extracted".into(),
                    format!("bundle_idx:{}", bundle.index()),
                    format!("bundle_path:{archive}"),
                ];
                if let Err(e) = record_entry(run, TransferMethod::Bput, start_at, entry, None, notes) {
                    warn!(path = %entry.remote_path, error = %e, "failed to record transfer");
                }
            }
            run.mark_done(bundle);
        }
        Err(e) => {
            run.report(bundle, Stage::Extract, -1, 1, ProgressUnit::Count, true);
            run.fail(Stage::Extract, bundle, e.into());
        }
    }
}

async fn remove_staged_archive(run: &RunState, archive: &str) {
    match run.store().remove_file(archive, true).await {
        Ok(()) => debug!(archive = %archive, "removed staged archive"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(archive = %archive, error = %e, "failed to remove staged archive"),
    }
}

/// Distinct destination children touched by a bundle's entries.
fn top_level_targets(dest: &str, bundle: &Bundle) -> Vec<String> {
    let mut tops: Vec<String> = Vec::new();
    for entry in bundle.entries() {
        let rel = entry
            .remote_path
            .strip_prefix(dest)
            .unwrap_or(&entry.remote_path)
            .trim_start_matches('/');
        let Some(first) = rel.split('/').next().filter(|s| !s.is_empty()) else {
            continue;
        };
        let top = path::join(dest, first);
        if !tops.contains(&top) {
            tops.push(top);
        }
    }
    tops
}
