//! Persistence integration tests.
//!
//! Verifies:
//! - Checkpoints land on interval boundaries and match a full replay
//! - A corrupt checkpoint falls back to replaying from key 0
//! - The RocksDB store survives a reopen with the log intact

use std::sync::Arc;

use quire_collab::storage::{checkpoint_path, RocksConfig, RocksLogStore};
use quire_collab::{
    open_document, Checkpoint, DocumentHandle, EngineConfig, LogStore, MemoryLogStore, Meta,
    SyncState,
};
use quire_core::Step;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Appends `count` single-character entries at the end of the first block.
async fn type_entries<S: LogStore>(handle: &mut DocumentHandle<S>, count: usize) {
    for i in 0..count {
        let end = handle.document().size() - 1;
        let ch = char::from(b'a' + (i % 26) as u8).to_string();
        handle
            .submit_local_edit(vec![Step::insert_text(end, &ch)], Meta::new())
            .await
            .unwrap();
    }
}

async fn stored_checkpoint<S: LogStore>(store: &S, doc: &str) -> Option<Checkpoint> {
    let bytes = store.read(&checkpoint_path(doc)).await.unwrap()?;
    Some(Checkpoint::decode(&bytes).unwrap())
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_checkpoint_equivalent_to_full_replay() {
    let store = Arc::new(MemoryLogStore::new());
    let config = EngineConfig::for_testing();
    let mut writer = open_document(Arc::clone(&store), "doc", "writer", config.clone())
        .await
        .unwrap();

    type_entries(&mut writer, 99).await;
    writer.settle().await;
    assert!(stored_checkpoint(&*store, "doc").await.is_none());

    for target in [100u64, 200] {
        let have = writer.latest_key() as usize;
        type_entries(&mut writer, target as usize - have).await;
        writer.settle().await;

        let checkpoint = stored_checkpoint(&*store, "doc").await.unwrap();
        assert_eq!(checkpoint.key, target);
        assert_eq!(&checkpoint.snapshot, writer.document());

        // starts from the checkpoint
        let from_checkpoint = open_document(Arc::clone(&store), "doc", "late", config.clone())
            .await
            .unwrap();
        assert_eq!(from_checkpoint.latest_key(), target);
        assert_eq!(from_checkpoint.document(), writer.document());

        // and the same log without it, replayed from key 0
        let copy = Arc::new(MemoryLogStore::new());
        for key in 1..=target {
            let path = quire_collab::storage::change_path("doc", key);
            let bytes = store.read(&path).await.unwrap().unwrap();
            copy.conditional_write(&path, move |_| Some(bytes)).await.unwrap();
        }
        let replayed = open_document(copy, "doc", "fresh", config.clone())
            .await
            .unwrap();
        assert_eq!(replayed.document(), from_checkpoint.document());
    }
}

#[tokio::test]
async fn test_checkpoint_matches_remote_view() {
    let store = Arc::new(MemoryLogStore::new());
    let mut config = EngineConfig::for_testing();
    config.checkpoint_interval = 10;
    let mut a = open_document(Arc::clone(&store), "doc", "a", config.clone())
        .await
        .unwrap();
    let mut b = open_document(Arc::clone(&store), "doc", "b", config)
        .await
        .unwrap();

    type_entries(&mut a, 10).await;
    a.settle().await;
    b.poll().await.unwrap();
    b.settle().await;

    let checkpoint = stored_checkpoint(&*store, "doc").await.unwrap();
    assert_eq!(checkpoint.key, 10);
    assert_eq!(&checkpoint.snapshot, b.document());
}

#[tokio::test]
async fn test_corrupt_checkpoint_falls_back_to_replay() {
    let store = Arc::new(MemoryLogStore::new());
    let config = EngineConfig::for_testing();
    let mut writer = open_document(Arc::clone(&store), "doc", "w", config.clone())
        .await
        .unwrap();
    type_entries(&mut writer, 5).await;
    store.write(&checkpoint_path("doc"), vec![0xde, 0xad]).await.unwrap();

    let reader = open_document(Arc::clone(&store), "doc", "r", config)
        .await
        .unwrap();
    assert_eq!(reader.state(), SyncState::Live);
    assert_eq!(reader.document().text_content(), "abcde");
    assert_eq!(reader.latest_key(), 5);
}

// ─── RocksDB ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rocks_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::for_testing();
    config.checkpoint_interval = 4;

    let expected = {
        let store = Arc::new(RocksLogStore::open(RocksConfig::for_testing(dir.path())).unwrap());
        let mut handle = open_document(store, "notes", "writer", config.clone())
            .await
            .unwrap();
        type_entries(&mut handle, 6).await;
        handle.settle().await;
        handle.document().clone()
    };

    let store = Arc::new(RocksLogStore::open(RocksConfig::for_testing(dir.path())).unwrap());
    let checkpoint = stored_checkpoint(&*store, "notes").await.unwrap();
    assert_eq!(checkpoint.key, 4);

    let mut handle = open_document(Arc::clone(&store), "notes", "reader", config)
        .await
        .unwrap();
    assert_eq!(handle.document(), &expected);
    assert_eq!(handle.latest_key(), 6);

    handle
        .submit_local_edit(vec![Step::insert_text(1, ">")], Meta::new())
        .await
        .unwrap();
    assert_eq!(handle.latest_key(), 7);
    assert_eq!(handle.document().text_content(), ">abcdef");
}
