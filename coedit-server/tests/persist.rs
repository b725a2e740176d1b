//! Tests for document persistence and patch application laws.

use std::path::PathBuf;

use anyhow::Result;
use coedit_server::document::{DEFAULT_CONTENT, DocumentStore, PatchOutcome};
use common::*;
use diffy::create_patch;

pub mod common;

fn temp_doc() -> PathBuf {
    std::env::temp_dir()
        .join(format!("coedit_test_{:x}", rand::random::<u64>()))
        .join("doc.txt")
}

fn patch(original: &str, modified: &str) -> String {
    create_patch(original, modified).to_string()
}

const CAP: usize = 1024;

#[tokio::test]
async fn test_load_creates_default() -> Result<()> {
    logging();
    let path = temp_doc();
    let store = DocumentStore::new(path.clone(), CAP);
    store.load().await?;

    assert_eq!(store.snapshot().await, DEFAULT_CONTENT);
    assert_eq!(tokio::fs::read_to_string(&path).await?, DEFAULT_CONTENT);
    Ok(())
}

#[tokio::test]
async fn test_load_existing() -> Result<()> {
    logging();
    let path = temp_doc();
    tokio::fs::create_dir_all(path.parent().unwrap()).await?;
    tokio::fs::write(&path, "<p>already here</p>").await?;

    let store = DocumentStore::new(path, CAP);
    store.load().await?;
    assert_eq!(store.snapshot().await, "<p>already here</p>");
    Ok(())
}

#[tokio::test]
async fn test_load_oversize_file_replaced_with_banner() -> Result<()> {
    logging();
    let path = temp_doc();
    tokio::fs::create_dir_all(path.parent().unwrap()).await?;
    tokio::fs::write(&path, "x".repeat(CAP + 1)).await?;

    let store = DocumentStore::new(path.clone(), CAP);
    store.load().await?;

    let content = store.snapshot().await;
    assert!(content.contains("size limit"), "{content}");
    assert_eq!(tokio::fs::read_to_string(&path).await?, content);
    Ok(())
}

#[tokio::test]
async fn test_diff_apply_is_exact() -> Result<()> {
    logging();
    let store = DocumentStore::new(temp_doc(), CAP);
    store.load().await?;

    let next = "<p>héllo 🎉 world</p>";
    let outcome = store.apply_patch(&patch(DEFAULT_CONTENT, next)).await;
    assert_eq!(outcome, PatchOutcome::Applied(next.len()));
    assert_eq!(store.snapshot().await, next);
    Ok(())
}

#[tokio::test]
async fn test_empty_diff_is_noop() -> Result<()> {
    logging();
    let store = DocumentStore::new(temp_doc(), CAP);
    store.load().await?;

    let outcome = store
        .apply_patch(&patch(DEFAULT_CONTENT, DEFAULT_CONTENT))
        .await;
    assert_eq!(outcome, PatchOutcome::NoChange);
    assert!(store.dirty_snapshot().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_failed_patch_leaves_content() -> Result<()> {
    logging();
    let store = DocumentStore::new(temp_doc(), CAP);
    store.load().await?;

    let bogus = patch("<p>some other document</p>", "<p>edited</p>");
    match store.apply_patch(&bogus).await {
        PatchOutcome::Failed(reason) => assert!(reason.contains("patch apply failed"), "{reason}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(store.snapshot().await, DEFAULT_CONTENT);
    assert!(store.dirty_snapshot().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_size_cap_boundary() -> Result<()> {
    logging();
    let store = DocumentStore::new(temp_doc(), CAP);
    store.load().await?;

    // Exactly at the cap is accepted.
    let at_cap = "x".repeat(CAP);
    assert_eq!(
        store.apply_patch(&patch(DEFAULT_CONTENT, &at_cap)).await,
        PatchOutcome::Applied(CAP)
    );

    // One byte over is rejected and the document is untouched.
    let over = "x".repeat(CAP + 1);
    match store.apply_patch(&patch(&at_cap, &over)).await {
        PatchOutcome::Rejected(reason) => assert!(reason.contains("size limit"), "{reason}"),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(store.snapshot().await, at_cap);
    Ok(())
}

#[tokio::test]
async fn test_save_load_round_trip() -> Result<()> {
    logging();
    let path = temp_doc();
    let store = std::sync::Arc::new(DocumentStore::new(path.clone(), CAP));
    store.load().await?;

    let next = "<p>saved 🎉</p>";
    store.apply_patch(&patch(DEFAULT_CONTENT, next)).await;

    let saver = std::sync::Arc::clone(&store);
    tokio::task::spawn_blocking(move || saver.save_sync()).await??;

    // No temp file is left behind by the rename.
    let tmp = format!("{}.tmp", path.display());
    assert!(!std::path::Path::new(&tmp).exists());

    let reloaded = DocumentStore::new(path, CAP);
    reloaded.load().await?;
    assert_eq!(reloaded.snapshot().await, next);
    Ok(())
}

#[tokio::test]
async fn test_dirty_snapshot_read_and_clear() -> Result<()> {
    logging();
    let store = DocumentStore::new(temp_doc(), CAP);
    store.load().await?;
    assert!(store.dirty_snapshot().await.is_none());

    let next = "<p>edited</p>";
    store.apply_patch(&patch(DEFAULT_CONTENT, next)).await;
    assert_eq!(store.dirty_snapshot().await.as_deref(), Some(next));
    assert!(store.dirty_snapshot().await.is_none());

    store.mark_dirty().await;
    assert_eq!(store.dirty_snapshot().await.as_deref(), Some(next));
    Ok(())
}

#[tokio::test]
async fn test_save_async_writes_snapshot() -> Result<()> {
    logging();
    let path = temp_doc();
    let store = DocumentStore::new(path.clone(), CAP);
    store.load().await?;

    let next = "<p>async save</p>";
    store.apply_patch(&patch(DEFAULT_CONTENT, next)).await;
    let snapshot = store.dirty_snapshot().await.unwrap();
    store.save_async(snapshot).await?;

    assert_eq!(tokio::fs::read_to_string(&path).await?, next);
    Ok(())
}

#[tokio::test]
async fn test_save_async_refuses_oversize_payload() -> Result<()> {
    logging();
    let path = temp_doc();
    let store = DocumentStore::new(path.clone(), CAP);
    store.load().await?;

    let result = store.save_async("x".repeat(CAP + 1)).await;
    assert!(result.is_err());
    assert_eq!(
        tokio::fs::read_to_string(&path).await?,
        DEFAULT_CONTENT,
        "live file must be untouched"
    );
    Ok(())
}
