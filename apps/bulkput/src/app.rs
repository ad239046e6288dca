//! One upload run: scan, schedule, wait.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bulkput_bundle::{
    JsonLinesReporter, NoopReporter, Scheduled, TransferManager, TransferReporter, staging,
};
use bulkput_parallel::{BoxError, JobFuture, ParallelJobScheduler, threads_for_transfer};
use bulkput_store::{ByteProgressFn, LocalStore, MetadataCache, RemoteStore, UploadOptions, path};
use bulkput_transfer::{ProgressSnapshot, ProgressTracker, ProgressUnit};

use crate::config::AppConfig;
use crate::scan::{ScannedEntry, scan_tree};

/// Runs one upload of `config.source` into the store.
pub async fn run(mut config: AppConfig) -> anyhow::Result<()> {
    let Some(source) = config.source.clone() else {
        anyhow::bail!(
            "no source directory configured; set `source` in {}",
            crate::config::config_path().display()
        );
    };
    let source = std::path::absolute(&source)?;
    config.bundle.local_root = source.clone();

    let mut store = LocalStore::new(&config.store_root)?;
    if !config.store_checksums {
        store = store.without_checksums();
    }
    let store: Arc<dyn RemoteStore> = Arc::new(store);
    let cache = Arc::new(MetadataCache::new(Arc::clone(&store)));

    if config.clean_leftovers {
        clean_leftovers(&config, store.as_ref()).await;
    }

    // -- Progress --
    let tracker = Arc::new(ProgressTracker::new(Some(Duration::from_millis(
        config.progress_interval_ms,
    ))));
    tracker.on_progress(Box::new(log_progress));
    tracker.start();

    // -- Scan --
    let scan_root = source.clone();
    let (entries, total_size) = tokio::task::spawn_blocking(move || scan_tree(&scan_root))
        .await?
        .with_context(|| format!("failed to scan {}", source.display()))?;
    tracing::info!(entries = entries.len(), bytes = total_size, "source scanned");

    let reporter: Arc<dyn TransferReporter> = match &config.report_path {
        Some(report) => Arc::new(
            JsonLinesReporter::append(report)
                .with_context(|| format!("failed to open transfer report {}", report.display()))?,
        ),
        None => Arc::new(NoopReporter),
    };
    let manager = TransferManager::start_with_reporter(
        config.bundle.clone(),
        Arc::clone(&cache),
        tracker.clone(),
        reporter,
    )?;
    let scheduler = Arc::new(ParallelJobScheduler::new(config.parallel_threads, tracker.clone()));

    let cancel_scheduler = Arc::clone(&scheduler);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, canceling large-file uploads");
            cancel_scheduler.cancel();
        }
    });

    let schedule_result = schedule_entries(&config, &entries, &manager, &scheduler, &cache).await;
    scheduler.done_scheduling();
    let bundled = manager.wait().await;
    let parallel = scheduler.wait().await;
    ctrl_c.abort();
    tracker.stop();

    let counters = manager.counters();
    let jobs = scheduler.counters();
    tracing::info!(
        bundles = counters.scheduled,
        bundles_done = counters.done,
        large_files = jobs.scheduled,
        large_files_done = jobs.done,
        "run summary"
    );
    for bundle in manager.bundles() {
        if let Some((stage, err)) = bundle.last_error() {
            tracing::warn!(bundle = bundle.index(), stage = %stage, error = %err, "bundle failed");
        }
    }

    schedule_result?;
    bundled?;
    parallel?;
    Ok(())
}

async fn schedule_entries(
    config: &AppConfig,
    entries: &[ScannedEntry],
    manager: &TransferManager,
    scheduler: &ParallelJobScheduler,
    cache: &Arc<MetadataCache>,
) -> anyhow::Result<()> {
    let mut skipped = 0usize;
    for entry in entries {
        if !entry.is_dir && entry.size >= config.large_file_size {
            let target = manager.target_path(&entry.path)?;
            schedule_large_file(config, scheduler, cache, entry.path.clone(), target, entry.size)?;
            continue;
        }
        match manager
            .schedule(&entry.path, entry.is_dir, entry.size, entry.mod_time)
            .await?
        {
            Scheduled::Added { .. } => {}
            Scheduled::Skipped => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::info!(skipped, "entries unchanged at destination");
    }
    Ok(())
}

fn schedule_large_file(
    config: &AppConfig,
    scheduler: &ParallelJobScheduler,
    cache: &Arc<MetadataCache>,
    local: PathBuf,
    target: String,
    size: i64,
) -> anyhow::Result<()> {
    let threads = threads_for_transfer(size, config.bundle.max_threads_per_file);
    let options = UploadOptions {
        resource: config.bundle.resource.clone(),
        replicate: config.bundle.replicate,
        overwrite: true,
    };
    let cache = Arc::clone(cache);

    scheduler.schedule(target.clone(), threads, ProgressUnit::Bytes, move |ctx| -> JobFuture {
        Box::pin(async move {
            if ctx.is_canceled() {
                return Ok::<(), BoxError>(());
            }
            let store = Arc::clone(cache.store());
            let parent = path::parent(&target);
            if !cache.exists_dir(&parent).await {
                store.make_dir(&parent, true).await?;
                cache.invalidate(&path::parent(&parent));
            }

            let reporter = ctx.clone();
            let progress: ByteProgressFn =
                Arc::new(move |processed: i64, total: i64| reporter.progress(processed, total));
            store
                .upload_file_parallel(&local, &target, &options, threads, Some(progress))
                .await?;
            cache.invalidate(&target);
            tracing::debug!(path = %target, size, threads, "large file uploaded");
            Ok(())
        })
    })?;
    Ok(())
}

/// Removes bundle archives an interrupted earlier run left behind.
async fn clean_leftovers(config: &AppConfig, store: &dyn RemoteStore) {
    if let Err(e) = staging::clean_up_local_bundles(&config.bundle.local_temp_dir) {
        tracing::warn!(error = %e, "failed to clean up local bundle files");
    }
    let staging_dir = config.bundle.staging_dir();
    let remove_dir = config.bundle.uses_default_staging();
    if let Err(e) = staging::clean_up_remote_bundles(store, &staging_dir, remove_dir).await {
        tracing::warn!(dir = %staging_dir, error = %e, "failed to clean up staged bundle files");
    }
}

fn log_progress(snapshot: &ProgressSnapshot) {
    if snapshot.errored {
        tracing::warn!(task = %snapshot.name, "failed");
    } else if snapshot.done {
        tracing::info!(task = %snapshot.name, total = snapshot.total, "done");
    } else {
        tracing::debug!(
            task = %snapshot.name,
            processed = snapshot.processed,
            total = snapshot.total,
            bytes_per_second = snapshot.bytes_per_second,
            "progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkput_bundle::BundleConfig;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(tmp: &TempDir) -> AppConfig {
        AppConfig {
            source: Some(tmp.path().join("src")),
            store_root: tmp.path().join("store"),
            large_file_size: 1024,
            progress_interval_ms: 10,
            clean_leftovers: true,
            bundle: BundleConfig {
                remote_dest: "/zone/home/alice/up".into(),
                local_temp_dir: tmp.path().join("work"),
                max_bundle_count: 3,
                ..BundleConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn uploads_tree_and_large_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested/deeper")).unwrap();
        for i in 0..7 {
            fs::write(src.join(format!("small{i}.txt")), format!("small {i}")).unwrap();
        }
        fs::write(src.join("nested/deeper/leaf.txt"), b"leaf").unwrap();
        fs::write(src.join("nested/big.bin"), vec![7u8; 4096]).unwrap();

        let report = tmp.path().join("report.jsonl");
        run(AppConfig {
            report_path: Some(report.clone()),
            ..config_for(&tmp)
        })
        .await
        .unwrap();

        let dest = tmp.path().join("store/zone/home/alice/up");
        for i in 0..7 {
            assert_eq!(
                fs::read_to_string(dest.join(format!("small{i}.txt"))).unwrap(),
                format!("small {i}")
            );
        }
        assert_eq!(fs::read(dest.join("nested/deeper/leaf.txt")).unwrap(), b"leaf");
        assert_eq!(fs::read(dest.join("nested/big.bin")).unwrap(), vec![7u8; 4096]);
        assert!(!dest.join(".bulkput_staging").exists());

        // Bundled entries are reported; the large file bypasses bundling.
        let lines = fs::read_to_string(&report).unwrap();
        for name in ["small0.txt", "small6.txt", "nested/deeper/leaf.txt"] {
            let target = format!("/zone/home/alice/up/{name}\"");
            assert!(lines.lines().any(|l| l.contains(&target)), "{name} not reported");
        }
        assert!(!lines.contains("big.bin"));
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config = AppConfig {
            source: None,
            ..config_for(&tmp)
        };
        assert!(run(config).await.is_err());
    }
}
