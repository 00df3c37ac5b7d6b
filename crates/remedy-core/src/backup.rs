use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use tokio::process::Command;
use tracing::{info, warn};

use crate::db::Db;
use crate::types::{Snapshot, SnapshotManifest, SnapshotSubject};

/// Creates and restores point-in-time snapshots ahead of destructive
/// operations. A snapshot either lands complete — payload plus manifest
/// plus database row — or not at all: any failure removes the partial
/// directory and surfaces as an error, which blocks the caller's mutating
/// operation.
pub struct BackupManager {
    backup_dir: String,
    database: String,
    retention_days: i64,
    compression: bool,
    db: Arc<Db>,
}

impl BackupManager {
    pub fn new(
        backup_dir: impl Into<String>,
        database: impl Into<String>,
        retention_days: i64,
        compression: bool,
        db: Arc<Db>,
    ) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            database: database.into(),
            retention_days: retention_days.max(1),
            compression,
            db,
        }
    }

    fn new_snapshot_dir(&self, id: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        Path::new(&self.backup_dir).join(format!("{stamp}_{}", &id[..8.min(id.len())]))
    }

    /// Full dump of the managed database.
    pub async fn snapshot_database(&self) -> Result<Snapshot> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.new_snapshot_dir(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;

        let result = self.dump_database(&id, &dir).await;
        if result.is_err() {
            // Never leave a half-written snapshot behind as restorable.
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }
        result
    }

    async fn dump_database(&self, id: &str, dir: &Path) -> Result<Snapshot> {
        let dump_path = dir.join("database.sql");
        let output = Command::new("pg_dump")
            .args(["-Fp", "-f"])
            .arg(&dump_path)
            .arg(&self.database)
            .output()
            .await
            .context("spawn pg_dump")?;
        if !output.status.success() {
            bail!(
                "pg_dump of {} failed: {}",
                self.database,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        if self.compression {
            let src = dump_path.clone();
            let dst = dir.join("database.sql.gz");
            tokio::task::spawn_blocking(move || gzip_file(&src, &dst))
                .await
                .context("join gzip task")??;
            tokio::fs::remove_file(&dump_path).await.ok();
        }

        self.finish(
            id,
            dir,
            SnapshotSubject::Database,
            Some(self.database.clone()),
            Vec::new(),
            None,
        )
        .await
    }

    /// Archive the files under `root` (a module directory about to be
    /// mutated by a fix).
    pub async fn snapshot_files(&self, root: &str) -> Result<Snapshot> {
        if !Path::new(root).is_dir() {
            bail!("fix-target root {root} does not exist");
        }
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.new_snapshot_dir(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;

        let archive = dir.join("files.tar.gz");
        let root_buf = PathBuf::from(root);
        let pack = tokio::task::spawn_blocking(move || pack_dir(&root_buf, &archive))
            .await
            .context("join archive task");

        let files = match pack {
            Ok(Ok(files)) => files,
            Ok(Err(e)) | Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e.context(format!("archive fix target {root}")));
            }
        };

        let result = self
            .finish(
                &id,
                &dir,
                SnapshotSubject::FixTarget,
                None,
                files,
                Some(root.to_string()),
            )
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }
        result
    }

    async fn finish(
        &self,
        id: &str,
        dir: &Path,
        subject: SnapshotSubject,
        database: Option<String>,
        files: Vec<String>,
        root: Option<String>,
    ) -> Result<Snapshot> {
        let created_at = Utc::now();
        let manifest = SnapshotManifest {
            id: id.to_string(),
            subject,
            database,
            files,
            root,
            compressed: self.compression,
            created_at,
        };
        let json = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        tokio::fs::write(dir.join("manifest.json"), json)
            .await
            .context("write manifest")?;

        let snapshot = Snapshot {
            id: id.to_string(),
            subject,
            location: dir.to_string_lossy().to_string(),
            created_at,
            retained_until: created_at + Duration::days(self.retention_days),
        };
        self.db.insert_snapshot(&snapshot).context("record snapshot")?;
        info!(
            snapshot_id = %snapshot.id,
            subject = subject.as_str(),
            location = %snapshot.location,
            "snapshot created"
        );
        Ok(snapshot)
    }

    fn read_manifest(&self, snapshot: &Snapshot) -> Result<SnapshotManifest> {
        let path = Path::new(&snapshot.location).join("manifest.json");
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("snapshot {} has no readable manifest", snapshot.id))?;
        serde_json::from_str(&data)
            .with_context(|| format!("snapshot {} manifest is invalid", snapshot.id))
    }

    /// Restore a snapshot. Idempotent: applying the same snapshot twice
    /// converges to the same subject state.
    pub async fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let manifest = self.read_manifest(snapshot)?;
        match manifest.subject {
            SnapshotSubject::Database => self.restore_database(snapshot, &manifest).await,
            SnapshotSubject::FixTarget => self.restore_files(snapshot, &manifest).await,
        }
    }

    async fn restore_database(
        &self,
        snapshot: &Snapshot,
        manifest: &SnapshotManifest,
    ) -> Result<()> {
        let dir = Path::new(&snapshot.location);
        let database = manifest.database.clone().unwrap_or_else(|| self.database.clone());

        let dump_path = if manifest.compressed {
            let src = dir.join("database.sql.gz");
            let dst = dir.join("database.sql");
            if !dst.exists() {
                let (src, dst) = (src.clone(), dst.clone());
                tokio::task::spawn_blocking(move || gunzip_file(&src, &dst))
                    .await
                    .context("join gunzip task")??;
            }
            dst
        } else {
            dir.join("database.sql")
        };
        if !dump_path.exists() {
            bail!("snapshot {} dump file not found", snapshot.id);
        }

        run_checked(Command::new("dropdb").args(["--if-exists", database.as_str()])).await?;
        run_checked(Command::new("createdb").arg(&database)).await?;
        run_checked(
            Command::new("psql")
                .args(["-q", "-d", database.as_str(), "-f"])
                .arg(&dump_path),
        )
        .await?;

        info!(snapshot_id = %snapshot.id, database, "database restored");
        Ok(())
    }

    async fn restore_files(&self, snapshot: &Snapshot, manifest: &SnapshotManifest) -> Result<()> {
        let Some(root) = manifest.root.clone() else {
            bail!("snapshot {} manifest has no target root", snapshot.id);
        };
        let archive = Path::new(&snapshot.location).join("files.tar.gz");
        if !archive.exists() {
            bail!("snapshot {} archive not found", snapshot.id);
        }

        tokio::task::spawn_blocking(move || unpack_archive(&archive, Path::new(&root)))
            .await
            .context("join unpack task")??;

        info!(snapshot_id = %snapshot.id, "fix target restored");
        Ok(())
    }

    /// Delete snapshots past their retention horizon. Snapshots flagged
    /// in-use by an in-flight operation are left alone, so the sweep never
    /// races an active restore.
    pub async fn sweep(&self) -> Result<usize> {
        let expired = self.db.list_expired_snapshots()?;
        let mut removed = 0usize;
        for snapshot in expired {
            if let Err(e) = tokio::fs::remove_dir_all(&snapshot.location).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(snapshot_id = %snapshot.id, "sweep could not remove {}: {e}", snapshot.location);
                    continue;
                }
            }
            self.db.delete_snapshot(&snapshot.id)?;
            removed += 1;
            info!(snapshot_id = %snapshot.id, "expired snapshot removed");
        }
        Ok(removed)
    }
}

async fn run_checked(cmd: &mut Command) -> Result<()> {
    let output = cmd.output().await.context("spawn restore command")?;
    if !output.status.success() {
        bail!(
            "restore command failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

// ── Blocking archive helpers ─────────────────────────────────────────────

fn gzip_file(src: &Path, dst: &Path) -> Result<()> {
    let mut input = std::fs::File::open(src).with_context(|| format!("open {}", src.display()))?;
    let output = std::fs::File::create(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());
    std::io::copy(&mut input, &mut encoder).context("gzip copy")?;
    encoder.finish().context("gzip finish")?;
    Ok(())
}

fn gunzip_file(src: &Path, dst: &Path) -> Result<()> {
    let input = std::fs::File::open(src).with_context(|| format!("open {}", src.display()))?;
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut output =
        std::fs::File::create(dst).with_context(|| format!("create {}", dst.display()))?;
    std::io::copy(&mut decoder, &mut output).context("gunzip copy")?;
    Ok(())
}

/// Tar-gzip every file under `root`, returning the archived paths relative
/// to it.
fn pack_dir(root: &Path, archive: &Path) -> Result<Vec<String>> {
    let file =
        std::fs::File::create(archive).with_context(|| format!("create {}", archive.display()))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .context("archive entry outside root")?
                    .to_path_buf();
                builder
                    .append_path_with_name(&path, &rel)
                    .with_context(|| format!("archive {}", path.display()))?;
                files.push(rel.to_string_lossy().to_string());
            }
        }
    }
    builder.into_inner().context("finish tar")?.finish().context("finish gzip")?;
    files.sort();
    Ok(files)
}

/// Replace the contents of `root` with the archive. Clearing first makes
/// restore idempotent and removes files the failed fix created.
fn unpack_archive(archive: &Path, root: &Path) -> Result<()> {
    if root.exists() {
        std::fs::remove_dir_all(root).with_context(|| format!("clear {}", root.display()))?;
    }
    std::fs::create_dir_all(root).with_context(|| format!("recreate {}", root.display()))?;
    let file =
        std::fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(root).with_context(|| format!("unpack into {}", root.display()))?;
    Ok(())
}
