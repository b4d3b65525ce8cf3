//! Local filesystem backend
//!
//! Reference implementation of the [`TransferBackend`] and [`RemoteFs`]
//! ports over the local filesystem. The daemon uses it for `local:`
//! locations; integration tests drive the whole engine through it.
//!
//! Change notification is powered by the `notify` crate: raw OS events are
//! mapped to relative paths and forwarded to the watcher callback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use driftsync_core::domain::change::EntryKind;
use driftsync_core::domain::profile::{ConflictLoser, ConflictResolve, DeleteTiming};
use driftsync_core::ports::{
    BisyncOptions, ChangeCallback, FsFeatures, RemoteFs, TransferBackend, TransferContext,
};
use driftsync_core::CoreError;

/// Lock file used by bi-directional reconciliation.
const BISYNC_LOCK: &str = ".driftsync.lock";

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One resolved local directory endpoint.
pub struct LocalFs {
    location: String,
    root: PathBuf,
}

impl LocalFs {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RemoteFs for LocalFs {
    fn location(&self) -> &str {
        &self.location
    }

    fn features(&self) -> FsFeatures {
        FsFeatures {
            change_notify: true,
            provider: "local".into(),
        }
    }

    fn change_notify(
        &self,
        cancel: CancellationToken,
        callback: ChangeCallback,
        mut poll_rx: mpsc::Receiver<Duration>,
    ) {
        let root = self.root.clone();

        tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::channel::<(String, EntryKind)>(1024);

            let watch_root = root.clone();
            let mut watcher = match notify::recommended_watcher(
                move |res: Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        if !matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            return;
                        }
                        for path in &event.paths {
                            let Ok(rel) = path.strip_prefix(&watch_root) else {
                                continue;
                            };
                            let rel = rel.to_string_lossy().to_string();
                            if rel.is_empty() || rel == BISYNC_LOCK {
                                continue;
                            }
                            let entry = if path.is_dir() {
                                EntryKind::Directory
                            } else {
                                EntryKind::Object
                            };
                            let _ = event_tx.blocking_send((rel, entry));
                        }
                    }
                    Err(err) => warn!(error = %err, "Local change watcher error"),
                },
            ) {
                Ok(w) => w,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "Failed to create watcher");
                    return;
                }
            };

            if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
                warn!(root = %root.display(), error = %e, "Failed to watch root");
                return;
            }

            // The poll interval is advisory for inotify-style backends; the
            // channel is still read so closing it stops the worker.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    interval = poll_rx.recv() => {
                        match interval {
                            Some(interval) => {
                                debug!(secs = interval.as_secs(), "Poll interval updated");
                            }
                            None => break,
                        }
                    }
                    event = event_rx.recv() => {
                        match event {
                            Some((path, entry)) => callback(&path, entry),
                            None => break,
                        }
                    }
                }
            }

            debug!(root = %root.display(), "Local change watcher exited");
        });
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LocalEntry {
    rel: String,
    abs: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Walks a root, applying the context filter, and returns the included
/// files (directories are traversed, not returned).
async fn list_files(
    root: &Path,
    ctx: &TransferContext,
) -> Result<Vec<LocalEntry>, CoreError> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    let mut stack: Vec<(PathBuf, u32)> = vec![(root.to_path_buf(), 0)];
    while let Some((dir, depth)) = stack.pop() {
        if ctx.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let abs = entry.path();
            let rel = abs
                .strip_prefix(root)
                .map_err(|_| CoreError::Internal("walk escaped the root".into()))?
                .to_string_lossy()
                .to_string();
            if rel == BISYNC_LOCK {
                continue;
            }

            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                if ctx.filter.include_path(&rel, true) {
                    stack.push((abs, depth + 1));
                }
            } else {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                let age = SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO);
                if ctx
                    .filter
                    .include_entry(&rel, metadata.len(), age, depth + 1)
                {
                    files.push(LocalEntry {
                        rel,
                        abs,
                        size: metadata.len(),
                        modified,
                    });
                }
            }
        }
    }

    files.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(files)
}

/// Content equality check: same size, then same bytes.
async fn files_equal(a: &Path, b: &Path, size_a: u64) -> Result<bool, CoreError> {
    let meta_b = match tokio::fs::metadata(b).await {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };
    if meta_b.len() != size_a {
        return Ok(false);
    }
    let bytes_a = tokio::fs::read(a).await?;
    let bytes_b = tokio::fs::read(b).await?;
    Ok(bytes_a == bytes_b)
}

async fn copy_file(src: &Path, dst: &Path) -> Result<u64, CoreError> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::copy(src, dst).await?)
}

fn downcast(fs: &Arc<dyn RemoteFs>) -> Result<&LocalFs, CoreError> {
    fs.as_any()
        .downcast_ref::<LocalFs>()
        .ok_or_else(|| CoreError::fs_permanent("endpoint is not a local filesystem"))
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Transfer backend over local directories.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        LocalBackend
    }

    /// Transfer phase shared by sync/copy/move: compares each source file
    /// with the destination and copies the ones that differ.
    async fn transfer_phase(
        &self,
        ctx: &TransferContext,
        dst_root: &Path,
        src_files: &[LocalEntry],
    ) -> Result<(), CoreError> {
        // Classify first so totals are known before the copies start
        let mut to_copy = Vec::new();
        for file in src_files {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let dst_path = dst_root.join(&file.rel);
            ctx.stats.begin_check(&file.rel);
            let equal = files_equal(&file.abs, &dst_path, file.size).await?;
            if equal {
                ctx.stats.end_check(&file.rel, file.size);
            } else {
                // Not a check: the file is queued as a transfer instead
                ctx.stats.abandon_check(&file.rel);
                if ctx.options.immutable && dst_path.exists() {
                    ctx.stats
                        .add_error(format!("{}: destination is immutable", file.rel));
                    ctx.logs
                        .append(format!("ERROR : {}: destination is immutable", file.rel));
                    continue;
                }
                ctx.stats.add_totals(1, file.size);
                to_copy.push((file.clone(), dst_path));
            }
        }

        let mut transferred_bytes: u64 = 0;
        for (file, dst_path) in to_copy {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if ctx.options.max_transfer > 0 && transferred_bytes >= ctx.options.max_transfer {
                ctx.logs
                    .append("NOTICE: max transfer size reached, stopping".to_string());
                break;
            }

            ctx.stats.begin_transfer(&file.rel, file.size);
            if ctx.options.dry_run {
                ctx.logs
                    .append(format!("NOTICE: {}: skipped copy as --dry-run is set", file.rel));
                ctx.stats.end_transfer(&file.rel, file.size, None);
                continue;
            }

            match copy_file(&file.abs, &dst_path).await {
                Ok(bytes) => {
                    transferred_bytes += bytes;
                    ctx.stats.end_transfer(&file.rel, bytes, None);
                    ctx.logs.append(format!("INFO  : {}: copied", file.rel));
                }
                Err(e) => {
                    ctx.stats
                        .end_transfer(&file.rel, 0, Some(e.to_string()));
                    ctx.logs
                        .append(format!("ERROR : {}: copy failed: {e}", file.rel));
                }
            }
        }

        Ok(())
    }

    /// Deletes destination files that have no source counterpart.
    async fn delete_phase(
        &self,
        ctx: &TransferContext,
        src_files: &[LocalEntry],
        dst_root: &Path,
    ) -> Result<(), CoreError> {
        let dst_files = list_files(dst_root, ctx).await?;
        let src_set: std::collections::HashSet<&str> =
            src_files.iter().map(|f| f.rel.as_str()).collect();

        let doomed: Vec<&LocalEntry> = dst_files
            .iter()
            .filter(|f| !src_set.contains(f.rel.as_str()))
            .collect();

        if ctx.options.max_delete > 0 && doomed.len() as u32 > ctx.options.max_delete {
            return Err(CoreError::fs_permanent(format!(
                "refusing to delete {} files (max_delete is {})",
                doomed.len(),
                ctx.options.max_delete
            )));
        }
        if ctx.options.max_delete_size > 0 {
            let total: u64 = doomed.iter().map(|f| f.size).sum();
            if total > ctx.options.max_delete_size {
                return Err(CoreError::fs_permanent(format!(
                    "refusing to delete {total} bytes (max_delete_size is {})",
                    ctx.options.max_delete_size
                )));
            }
        }

        for file in doomed {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if ctx.options.dry_run {
                ctx.logs.append(format!(
                    "NOTICE: {}: skipped delete as --dry-run is set",
                    file.rel
                ));
                continue;
            }
            match &ctx.options.backup_suffix {
                Some(suffix) if !suffix.is_empty() => {
                    let renamed = backup_name(&file.rel, suffix, ctx.options.suffix_keep_extension);
                    let target = dst_root.join(&renamed);
                    tokio::fs::rename(&file.abs, &target).await?;
                    ctx.stats.add_rename();
                    ctx.logs
                        .append(format!("INFO  : {}: renamed to {renamed}", file.rel));
                }
                _ => {
                    tokio::fs::remove_file(&file.abs).await?;
                    ctx.stats.add_delete();
                    ctx.logs.append(format!("INFO  : {}: deleted", file.rel));
                }
            }
        }
        Ok(())
    }
}

/// Applies a backup suffix, optionally keeping the file extension last.
fn backup_name(rel: &str, suffix: &str, keep_extension: bool) -> String {
    if keep_extension {
        if let Some(idx) = rel.rfind('.') {
            let (stem, ext) = rel.split_at(idx);
            return format!("{stem}{suffix}{ext}");
        }
    }
    format!("{rel}{suffix}")
}

#[async_trait]
impl TransferBackend for LocalBackend {
    async fn new_fs(&self, location: &str) -> Result<Arc<dyn RemoteFs>, CoreError> {
        let path = location.strip_prefix("local:").unwrap_or(location);
        if path.is_empty() {
            return Err(CoreError::Validation("empty location".into()));
        }
        if path.contains(':') {
            return Err(CoreError::Validation(format!(
                "unknown remote in location: {location}"
            )));
        }

        Ok(Arc::new(LocalFs {
            location: location.to_string(),
            root: PathBuf::from(path),
        }))
    }

    fn clear_caches(&self) {
        // The local backend holds no listing or accounting caches; the
        // contract is a no-op here.
    }

    async fn sync(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError> {
        let src_root = downcast(&src)?.root().to_path_buf();
        let dst_root = downcast(&dst)?.root().to_path_buf();

        let src_files = list_files(&src_root, ctx).await?;

        if ctx.options.delete_timing == DeleteTiming::Before {
            self.delete_phase(ctx, &src_files, &dst_root).await?;
        }

        self.transfer_phase(ctx, &dst_root, &src_files)
            .await?;

        if ctx.options.delete_timing != DeleteTiming::Before {
            self.delete_phase(ctx, &src_files, &dst_root).await?;
        }
        Ok(())
    }

    async fn copy(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError> {
        let src_root = downcast(&src)?.root().to_path_buf();
        let dst_root = downcast(&dst)?.root().to_path_buf();
        let src_files = list_files(&src_root, ctx).await?;
        self.transfer_phase(ctx, &dst_root, &src_files)
            .await
    }

    async fn move_to(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError> {
        let src_root = downcast(&src)?.root().to_path_buf();
        let dst_root = downcast(&dst)?.root().to_path_buf();
        let src_files = list_files(&src_root, ctx).await?;
        self.transfer_phase(ctx, &dst_root, &src_files)
            .await?;

        if ctx.options.dry_run || ctx.stats.error_count() > 0 {
            return Ok(());
        }
        for file in &src_files {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            tokio::fs::remove_file(&file.abs).await?;
        }
        Ok(())
    }

    async fn check(
        &self,
        ctx: &TransferContext,
        dst: Arc<dyn RemoteFs>,
        src: Arc<dyn RemoteFs>,
    ) -> Result<(), CoreError> {
        let src_root = downcast(&src)?.root().to_path_buf();
        let dst_root = downcast(&dst)?.root().to_path_buf();

        let src_files = list_files(&src_root, ctx).await?;
        ctx.stats.add_total_checks(src_files.len() as u64);

        for file in &src_files {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            ctx.stats.begin_check(&file.rel);
            let dst_path = dst_root.join(&file.rel);
            if !dst_path.exists() {
                ctx.stats.end_check(&file.rel, file.size);
                ctx.stats
                    .add_error(format!("{}: missing at destination", file.rel));
                ctx.logs
                    .append(format!("ERROR : {}: missing at destination", file.rel));
            } else if files_equal(&file.abs, &dst_path, file.size).await? {
                ctx.stats.end_check(&file.rel, file.size);
            } else {
                ctx.stats.end_check(&file.rel, file.size);
                ctx.stats.add_error(format!("{}: differs", file.rel));
                ctx.logs.append(format!("ERROR : {}: differs", file.rel));
            }
        }
        Ok(())
    }

    async fn bisync(
        &self,
        ctx: &TransferContext,
        path1: Arc<dyn RemoteFs>,
        path2: Arc<dyn RemoteFs>,
        opts: &BisyncOptions,
    ) -> Result<(), CoreError> {
        let root1 = downcast(&path1)?.root().to_path_buf();
        let root2 = downcast(&path2)?.root().to_path_buf();

        let _lock = BisyncLock::acquire(&root1, opts.max_lock).await?;

        let files1 = list_files(&root1, ctx).await?;
        let files2 = list_files(&root2, ctx).await?;

        let map1: std::collections::HashMap<&str, &LocalEntry> =
            files1.iter().map(|f| (f.rel.as_str(), f)).collect();
        let map2: std::collections::HashMap<&str, &LocalEntry> =
            files2.iter().map(|f| (f.rel.as_str(), f)).collect();

        let mut rels: Vec<&str> = map1.keys().chain(map2.keys()).copied().collect();
        rels.sort_unstable();
        rels.dedup();

        for rel in rels {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            match (map1.get(rel), map2.get(rel)) {
                (Some(f1), None) => {
                    self.transfer_one(ctx, f1, &root2.join(rel)).await?;
                }
                (None, Some(f2)) => {
                    self.transfer_one(ctx, f2, &root1.join(rel)).await?;
                }
                (Some(f1), Some(f2)) => {
                    if files_equal(&f1.abs, &f2.abs, f1.size).await? {
                        ctx.stats.begin_check(rel);
                        ctx.stats.end_check(rel, f1.size);
                        continue;
                    }
                    let one_wins = winner_is_path1(f1, f2, opts.conflict_resolve);
                    let (winner, loser, loser_root) = if one_wins {
                        (f1, f2, &root2)
                    } else {
                        (f2, f1, &root1)
                    };

                    self.settle_loser(ctx, loser, loser_root, opts).await?;
                    self.transfer_one(ctx, winner, &loser_root.join(rel)).await?;
                }
                (None, None) => unreachable!(),
            }
        }

        let _ = opts.resync; // no prior listing state is kept by this backend
        Ok(())
    }
}

impl LocalBackend {
    async fn transfer_one(
        &self,
        ctx: &TransferContext,
        file: &LocalEntry,
        dst_path: &Path,
    ) -> Result<(), CoreError> {
        ctx.stats.add_totals(1, file.size);
        ctx.stats.begin_transfer(&file.rel, file.size);
        if ctx.options.dry_run {
            ctx.stats.end_transfer(&file.rel, file.size, None);
            return Ok(());
        }
        match copy_file(&file.abs, dst_path).await {
            Ok(bytes) => {
                ctx.stats.end_transfer(&file.rel, bytes, None);
                ctx.logs.append(format!("INFO  : {}: copied", file.rel));
                Ok(())
            }
            Err(e) => {
                ctx.stats.end_transfer(&file.rel, 0, Some(e.to_string()));
                ctx.logs
                    .append(format!("ERROR : {}: copy failed: {e}", file.rel));
                Ok(())
            }
        }
    }

    /// Applies the conflict-loser policy before the winner is copied over.
    async fn settle_loser(
        &self,
        ctx: &TransferContext,
        loser: &LocalEntry,
        loser_root: &Path,
        opts: &BisyncOptions,
    ) -> Result<(), CoreError> {
        if ctx.options.dry_run {
            return Ok(());
        }
        match opts.conflict_loser {
            ConflictLoser::Delete => {
                // Overwritten by the winner; nothing to keep
                Ok(())
            }
            ConflictLoser::Num => {
                let suffix = opts.conflict_suffix.as_deref().unwrap_or(".conflict");
                let renamed = format!("{}{suffix}1", loser.rel);
                tokio::fs::rename(&loser.abs, loser_root.join(&renamed)).await?;
                ctx.stats.add_rename();
                ctx.logs
                    .append(format!("INFO  : {}: conflict loser kept as {renamed}", loser.rel));
                Ok(())
            }
            ConflictLoser::Pathname => {
                let suffix = opts.conflict_suffix.as_deref().unwrap_or(".conflict");
                let renamed = format!("{}{suffix}", loser.rel);
                tokio::fs::rename(&loser.abs, loser_root.join(&renamed)).await?;
                ctx.stats.add_rename();
                ctx.logs
                    .append(format!("INFO  : {}: conflict loser kept as {renamed}", loser.rel));
                Ok(())
            }
        }
    }
}

/// Decides the winner of a bi-sync conflict.
fn winner_is_path1(f1: &LocalEntry, f2: &LocalEntry, resolve: ConflictResolve) -> bool {
    match resolve {
        ConflictResolve::Newer => f1.modified >= f2.modified,
        ConflictResolve::Older => f1.modified <= f2.modified,
        ConflictResolve::Larger => f1.size >= f2.size,
        ConflictResolve::Smaller => f1.size <= f2.size,
        ConflictResolve::Path1 => true,
        ConflictResolve::Path2 => false,
    }
}

/// Advisory reconciliation lock held for the duration of a bisync.
struct BisyncLock {
    path: PathBuf,
}

impl BisyncLock {
    async fn acquire(root: &Path, max_lock: Option<Duration>) -> Result<Self, CoreError> {
        let path = root.join(BISYNC_LOCK);
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or(Duration::MAX);
            let horizon = max_lock.unwrap_or(Duration::from_secs(15 * 60));
            if age < horizon {
                return Err(CoreError::fs_transient(
                    "reconciliation lock held by another peer",
                ));
            }
            // Stale lock from a dead peer
            let _ = tokio::fs::remove_file(&path).await;
        }

        tokio::fs::create_dir_all(root).await?;
        tokio::fs::write(&path, b"driftsync bisync lock").await?;
        Ok(BisyncLock { path })
    }
}

impl Drop for BisyncLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> TransferContext {
        TransferContext::new(CancellationToken::new())
    }

    async fn endpoint(backend: &LocalBackend, path: &Path) -> Arc<dyn RemoteFs> {
        backend.new_fs(path.to_str().unwrap()).await.unwrap()
    }

    async fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_fs_strips_local_prefix() {
        let backend = LocalBackend::new();
        let fs = backend.new_fs("local:/tmp/x").await.unwrap();
        assert_eq!(fs.location(), "local:/tmp/x");
        let local = fs.as_any().downcast_ref::<LocalFs>().unwrap();
        assert_eq!(local.root(), Path::new("/tmp/x"));
    }

    #[tokio::test]
    async fn test_new_fs_rejects_unknown_remote() {
        let backend = LocalBackend::new();
        assert!(matches!(
            backend.new_fs("gdrive:/data").await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_copies_and_checks() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.txt", "alpha").await;
        write(src.path(), "sub/b.txt", "beta").await;
        write(dst.path(), "a.txt", "alpha").await; // already identical

        let backend = LocalBackend::new();
        let ctx = ctx();
        backend
            .sync(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read_to_string(dst.path().join("sub/b.txt"))
                .await
                .unwrap(),
            "beta"
        );
        let snap = ctx.stats.snapshot();
        assert_eq!(snap.transfers, 1);
        assert_eq!(snap.checks, 1);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn test_sync_deletes_extraneous_destination_files() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "keep.txt", "k").await;
        write(dst.path(), "keep.txt", "k").await;
        write(dst.path(), "stale.txt", "s").await;

        let backend = LocalBackend::new();
        let ctx = ctx();
        backend
            .sync(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await
            .unwrap();

        assert!(!dst.path().join("stale.txt").exists());
        assert_eq!(ctx.stats.snapshot().deletes, 1);
    }

    #[tokio::test]
    async fn test_copy_does_not_delete() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.txt", "a").await;
        write(dst.path(), "extra.txt", "e").await;

        let backend = LocalBackend::new();
        let ctx = ctx();
        backend
            .copy(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await
            .unwrap();

        assert!(dst.path().join("extra.txt").exists());
        assert!(dst.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_move_removes_source_after_success() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.txt", "a").await;

        let backend = LocalBackend::new();
        let ctx = ctx();
        backend
            .move_to(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await
            .unwrap();

        assert!(!src.path().join("a.txt").exists());
        assert!(dst.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.txt", "a").await;
        write(dst.path(), "stale.txt", "s").await;

        let backend = LocalBackend::new();
        let mut ctx = ctx();
        ctx.options.dry_run = true;
        backend
            .sync(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await
            .unwrap();

        // Comparisons happened, mutations did not
        assert!(!dst.path().join("a.txt").exists());
        assert!(dst.path().join("stale.txt").exists());
        let snap = ctx.stats.snapshot();
        assert_eq!(snap.transfers, 1); // counted as would-transfer
        assert_eq!(snap.deletes, 0);
    }

    #[tokio::test]
    async fn test_check_reports_differences() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "same.txt", "x").await;
        write(dst.path(), "same.txt", "x").await;
        write(src.path(), "diff.txt", "src version").await;
        write(dst.path(), "diff.txt", "dst version").await;
        write(src.path(), "missing.txt", "m").await;

        let backend = LocalBackend::new();
        let ctx = ctx();
        backend
            .check(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await
            .unwrap();

        let snap = ctx.stats.snapshot();
        assert_eq!(snap.errors, 2);
        assert_eq!(snap.total_checks, 3);
        // Nothing was mutated
        assert_eq!(
            tokio::fs::read_to_string(dst.path().join("diff.txt"))
                .await
                .unwrap(),
            "dst version"
        );
    }

    #[tokio::test]
    async fn test_max_delete_cap_aborts() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(dst.path(), "one.txt", "1").await;
        write(dst.path(), "two.txt", "2").await;

        let backend = LocalBackend::new();
        let mut ctx = ctx();
        ctx.options.max_delete = 1;
        let result = backend
            .sync(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await;
        assert!(result.is_err());
        assert!(dst.path().join("one.txt").exists());
    }

    #[tokio::test]
    async fn test_backup_suffix_renames_instead_of_delete() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(dst.path(), "old.txt", "old").await;

        let backend = LocalBackend::new();
        let mut ctx = ctx();
        ctx.options.backup_suffix = Some(".bak".into());
        ctx.options.suffix_keep_extension = true;
        backend
            .sync(
                &ctx,
                endpoint(&backend, dst.path()).await,
                endpoint(&backend, src.path()).await,
            )
            .await
            .unwrap();

        assert!(!dst.path().join("old.txt").exists());
        assert!(dst.path().join("old.bak.txt").exists());
        assert_eq!(ctx.stats.snapshot().renames, 1);
    }

    #[tokio::test]
    async fn test_bisync_propagates_both_directions() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        write(one.path(), "only1.txt", "1").await;
        write(two.path(), "only2.txt", "2").await;

        let backend = LocalBackend::new();
        let ctx = ctx();
        let opts = BisyncOptions {
            resync: false,
            conflict_resolve: ConflictResolve::Newer,
            conflict_loser: ConflictLoser::Delete,
            conflict_suffix: None,
            max_lock: None,
        };
        backend
            .bisync(
                &ctx,
                endpoint(&backend, one.path()).await,
                endpoint(&backend, two.path()).await,
                &opts,
            )
            .await
            .unwrap();

        assert!(one.path().join("only2.txt").exists());
        assert!(two.path().join("only1.txt").exists());
        // The lock is released
        assert!(!one.path().join(BISYNC_LOCK).exists());
    }

    #[tokio::test]
    async fn test_bisync_conflict_larger_wins_with_rename() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        write(one.path(), "doc.txt", "long contents win").await;
        write(two.path(), "doc.txt", "short").await;

        let backend = LocalBackend::new();
        let ctx = ctx();
        let opts = BisyncOptions {
            resync: false,
            conflict_resolve: ConflictResolve::Larger,
            conflict_loser: ConflictLoser::Pathname,
            conflict_suffix: Some(".loser".into()),
            max_lock: None,
        };
        backend
            .bisync(
                &ctx,
                endpoint(&backend, one.path()).await,
                endpoint(&backend, two.path()).await,
                &opts,
            )
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read_to_string(two.path().join("doc.txt"))
                .await
                .unwrap(),
            "long contents win"
        );
        assert!(two.path().join("doc.txt.loser").exists());
    }

    #[tokio::test]
    async fn test_bisync_lock_refuses_second_peer() {
        let one = TempDir::new().unwrap();
        write(one.path(), BISYNC_LOCK, "held").await;

        let result = BisyncLock::acquire(one.path(), Some(Duration::from_secs(600))).await;
        assert!(matches!(
            result,
            Err(CoreError::Filesystem { transient: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_change_notify_reports_relative_paths() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let fs = endpoint(&backend, dir.path()).await;

        let (seen_tx, mut seen_rx) = mpsc::channel::<String>(16);
        let callback: ChangeCallback = Arc::new(move |path: &str, _entry| {
            let _ = seen_tx.try_send(path.to_string());
        });

        let cancel = CancellationToken::new();
        let (poll_tx, poll_rx) = mpsc::channel(1);
        poll_tx.try_send(Duration::from_secs(60)).unwrap();
        fs.change_notify(cancel.clone(), callback, poll_rx);

        // Give the watcher a moment to install, then trigger a change
        tokio::time::sleep(Duration::from_millis(200)).await;
        write(dir.path(), "observed.txt", "data").await;

        let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("watcher produced no event")
            .unwrap();
        assert!(seen.contains("observed.txt"));
        cancel.cancel();
    }

    #[test]
    fn test_backup_name() {
        assert_eq!(backup_name("a.txt", ".bak", false), "a.txt.bak");
        assert_eq!(backup_name("a.txt", ".bak", true), "a.bak.txt");
        assert_eq!(backup_name("noext", ".bak", true), "noext.bak");
    }
}
