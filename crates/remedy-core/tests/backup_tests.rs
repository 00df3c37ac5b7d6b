use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};

use remedy_core::{
    backup::BackupManager,
    db::Db,
    types::{Snapshot, SnapshotManifest, SnapshotSubject},
};

fn open_db() -> Arc<Db> {
    let mut db = Db::open(":memory:").unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn manager(backup_dir: &Path, db: Arc<Db>) -> BackupManager {
    BackupManager::new(
        backup_dir.to_string_lossy(),
        "remedy_test_no_such_db",
        7,
        true,
        db,
    )
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn file_snapshot_records_manifest_and_payload() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("sale_custom");
    write_file(&root.join("models/sale.py"), "class Sale: pass\n");
    write_file(&root.join("__manifest__.py"), "{}\n");

    let db = open_db();
    let mgr = manager(&dir.path().join("backups"), Arc::clone(&db));

    let snapshot = mgr.snapshot_files(root.to_str().unwrap()).await.unwrap();
    assert_eq!(snapshot.subject, SnapshotSubject::FixTarget);

    let manifest_path = Path::new(&snapshot.location).join("manifest.json");
    let manifest: SnapshotManifest =
        serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
    assert_eq!(manifest.id, snapshot.id);
    assert_eq!(manifest.root.as_deref(), root.to_str());
    assert_eq!(manifest.files, vec!["__manifest__.py", "models/sale.py"]);

    assert!(Path::new(&snapshot.location).join("files.tar.gz").exists());
    assert_eq!(db.list_snapshots().unwrap().len(), 1);
}

#[tokio::test]
async fn restore_is_idempotent_and_removes_strays() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("stock_x");
    let model = root.join("models/move.py");
    write_file(&model, "original\n");

    let db = open_db();
    let mgr = manager(&dir.path().join("backups"), Arc::clone(&db));
    let snapshot = mgr.snapshot_files(root.to_str().unwrap()).await.unwrap();

    // A bad fix mangles the file and leaves a stray behind.
    write_file(&model, "broken by fix\n");
    write_file(&root.join("models/stray.py"), "should vanish\n");

    mgr.restore(&snapshot).await.unwrap();
    assert_eq!(std::fs::read_to_string(&model).unwrap(), "original\n");
    assert!(!root.join("models/stray.py").exists());

    // Applying the same snapshot again converges to the same state.
    mgr.restore(&snapshot).await.unwrap();
    assert_eq!(std::fs::read_to_string(&model).unwrap(), "original\n");
    assert!(!root.join("models/stray.py").exists());
}

#[tokio::test]
async fn failed_file_snapshot_leaves_no_partial_behind() {
    let dir = tempfile::tempdir().unwrap();
    let backups = dir.path().join("backups");
    std::fs::create_dir_all(&backups).unwrap();

    let db = open_db();
    let mgr = manager(&backups, Arc::clone(&db));

    let missing = dir.path().join("does-not-exist");
    assert!(mgr.snapshot_files(missing.to_str().unwrap()).await.is_err());

    let leftovers: Vec<_> = std::fs::read_dir(&backups).unwrap().collect();
    assert!(leftovers.is_empty());
    assert!(db.list_snapshots().unwrap().is_empty());
}

#[tokio::test]
async fn failed_database_snapshot_leaves_no_partial_behind() {
    let dir = tempfile::tempdir().unwrap();
    let backups = dir.path().join("backups");
    std::fs::create_dir_all(&backups).unwrap();

    let db = open_db();
    let mgr = manager(&backups, Arc::clone(&db));

    // Either pg_dump is absent or the database does not exist; both must
    // surface as an error with nothing recorded as restorable.
    assert!(mgr.snapshot_database().await.is_err());

    let leftovers: Vec<_> = std::fs::read_dir(&backups).unwrap().collect();
    assert!(leftovers.is_empty());
    assert!(db.list_snapshots().unwrap().is_empty());
}

#[tokio::test]
async fn restore_refuses_snapshot_without_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("backups/2025-03-01_00-00-00_deadbeef");
    std::fs::create_dir_all(&location).unwrap();

    let db = open_db();
    let mgr = manager(&dir.path().join("backups"), db);

    let snapshot = Snapshot {
        id: "deadbeef".into(),
        subject: SnapshotSubject::FixTarget,
        location: location.to_string_lossy().to_string(),
        created_at: Utc::now(),
        retained_until: Utc::now() + Duration::days(7),
    };
    assert!(mgr.restore(&snapshot).await.is_err());
}

#[tokio::test]
async fn sweep_removes_expired_snapshots_only() {
    let dir = tempfile::tempdir().unwrap();
    let backups = dir.path().join("backups");
    let root = dir.path().join("mod_a");
    write_file(&root.join("a.py"), "x\n");

    let db = open_db();
    let mgr = manager(&backups, Arc::clone(&db));

    // Live snapshot through the normal path.
    let live = mgr.snapshot_files(root.to_str().unwrap()).await.unwrap();

    // Expired snapshot: a real directory whose retention lapsed.
    let expired_dir = backups.join("2025-01-01_00-00-00_feedface");
    std::fs::create_dir_all(&expired_dir).unwrap();
    let expired = Snapshot {
        id: "feedface".into(),
        subject: SnapshotSubject::FixTarget,
        location: expired_dir.to_string_lossy().to_string(),
        created_at: Utc::now() - Duration::days(30),
        retained_until: Utc::now() - Duration::days(23),
    };
    db.insert_snapshot(&expired).unwrap();

    let removed = mgr.sweep().await.unwrap();
    assert_eq!(removed, 1);
    assert!(!expired_dir.exists());
    assert!(Path::new(&live.location).exists());
    assert_eq!(db.list_snapshots().unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_skips_snapshots_held_by_inflight_operations() {
    let dir = tempfile::tempdir().unwrap();
    let backups = dir.path().join("backups");
    std::fs::create_dir_all(&backups).unwrap();

    let db = open_db();
    let mgr = manager(&backups, Arc::clone(&db));

    let held_dir = backups.join("2025-01-01_00-00-00_cafebabe");
    std::fs::create_dir_all(&held_dir).unwrap();
    let held = Snapshot {
        id: "cafebabe".into(),
        subject: SnapshotSubject::FixTarget,
        location: held_dir.to_string_lossy().to_string(),
        created_at: Utc::now() - Duration::days(30),
        retained_until: Utc::now() - Duration::days(23),
    };
    db.insert_snapshot(&held).unwrap();
    db.set_snapshot_in_use("cafebabe", true).unwrap();

    assert_eq!(mgr.sweep().await.unwrap(), 0);
    assert!(held_dir.exists());

    // Released, the next sweep takes it.
    db.set_snapshot_in_use("cafebabe", false).unwrap();
    assert_eq!(mgr.sweep().await.unwrap(), 1);
    assert!(!held_dir.exists());
}
