use std::io::Write;
use std::sync::Arc;

use remedy_core::{db::Db, tailer::Tailer};

fn open_db() -> Arc<Db> {
    let mut db = Db::open(":memory:").unwrap();
    db.migrate().unwrap();
    Arc::new(db)
}

fn append(path: &std::path::Path, content: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

#[tokio::test]
async fn reads_appended_lines_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    append(&path, "first\nsecond\n");

    let db = open_db();
    let mut tailer = Tailer::new(path.to_string_lossy(), Arc::clone(&db), 10);

    let batch = tailer.poll_once().await.unwrap().unwrap();
    assert_eq!(batch.lines, vec!["first", "second"]);
    assert!(!batch.reset);

    // Nothing new: no batch.
    assert!(tailer.poll_once().await.unwrap().is_none());

    append(&path, "third\n");
    let batch = tailer.poll_once().await.unwrap().unwrap();
    assert_eq!(batch.lines, vec!["third"]);
}

#[tokio::test]
async fn partial_lines_are_never_split() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    append(&path, "par");

    let db = open_db();
    let mut tailer = Tailer::new(path.to_string_lossy(), Arc::clone(&db), 10);

    // No complete line yet.
    assert!(tailer.poll_once().await.unwrap().is_none());
    assert_eq!(tailer.offset(), 0);

    append(&path, "tial\nnext\n");
    let batch = tailer.poll_once().await.unwrap().unwrap();
    assert_eq!(batch.lines, vec!["partial", "next"]);
}

#[tokio::test]
async fn offset_survives_restart_without_skip_or_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    let path_str = path.to_string_lossy().to_string();
    append(&path, "one\ntwo\n");

    let db = open_db();
    let mut tailer = Tailer::new(&path_str, Arc::clone(&db), 10);
    let batch = tailer.poll_once().await.unwrap().unwrap();
    assert_eq!(batch.lines.len(), 2);
    let offset = tailer.offset();
    drop(tailer);

    // A new tailer over the same store resumes exactly where the old one
    // stopped.
    let mut tailer = Tailer::new(&path_str, Arc::clone(&db), 10);
    assert_eq!(tailer.offset(), offset);

    append(&path, "three\n");
    let batch = tailer.poll_once().await.unwrap().unwrap();
    assert_eq!(batch.lines, vec!["three"]);
}

#[tokio::test]
async fn truncation_resets_offset_and_emits_marker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    let path_str = path.to_string_lossy().to_string();

    // 100 lines of 10 bytes puts the recorded offset at 1000.
    let mut content = String::new();
    for i in 0..100 {
        content.push_str(&format!("line{i:04}!\n"));
    }
    append(&path, &content);

    let db = open_db();
    let mut tailer = Tailer::new(&path_str, Arc::clone(&db), 10);
    tailer.poll_once().await.unwrap().unwrap();
    assert_eq!(tailer.offset(), 1000);
    drop(tailer);

    // The file is rotated down to 400 bytes while no tailer is running.
    let mut short = String::new();
    for i in 0..40 {
        short.push_str(&format!("new {i:04}!\n"));
    }
    std::fs::write(&path, &short).unwrap();

    // Restart: offset 1000 against a 400-byte file must not seek past the
    // end or error — it resumes from zero with a reset marker.
    let mut tailer = Tailer::new(&path_str, Arc::clone(&db), 10);
    assert_eq!(tailer.offset(), 1000);

    let batch = tailer.poll_once().await.unwrap().unwrap();
    assert!(batch.reset);
    assert_eq!(batch.lines.len(), 40);
    assert_eq!(batch.lines[0], "new 0000!");
    assert_eq!(tailer.offset(), 400);
    assert_eq!(db.get_tail_offset(&path_str), 400);
}

#[tokio::test]
async fn truncation_to_empty_still_signals_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    let path_str = path.to_string_lossy().to_string();
    append(&path, "a\nb\n");

    let db = open_db();
    let mut tailer = Tailer::new(&path_str, Arc::clone(&db), 10);
    tailer.poll_once().await.unwrap().unwrap();

    std::fs::write(&path, "").unwrap();
    let batch = tailer.poll_once().await.unwrap().unwrap();
    assert!(batch.reset);
    assert!(batch.lines.is_empty());
    assert_eq!(tailer.offset(), 0);
}

#[tokio::test]
async fn missing_source_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.log");
    let db = open_db();
    let mut tailer = Tailer::new(path.to_string_lossy(), db, 10);
    assert!(tailer.poll_once().await.unwrap().is_none());
}
