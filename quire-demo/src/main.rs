//! Quire demo — two editors sharing one change log.
//!
//! Runs against an in-memory store by default. Pass a directory to use a
//! RocksDB store instead; running twice against the same directory replays
//! the earlier session.

use std::sync::Arc;

use log::info;
use quire_collab::{
    new_client_id, open_document, DocumentHandle, EngineConfig, LogStore, MemoryLogStore, Meta,
    RemoteChange, RocksConfig, RocksLogStore, SelectionIntent, SyncError,
};
use quire_core::{BlockKind, Mark, Step};

const DOC_ID: &str = "welcome";

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match std::env::args().nth(1) {
        Some(path) => {
            let store = RocksLogStore::open(RocksConfig {
                path: path.into(),
                ..RocksConfig::default()
            })?;
            run(Arc::new(store)).await
        }
        None => run(Arc::new(MemoryLogStore::new())).await,
    }
}

fn end_of_first_block<S: LogStore>(handle: &DocumentHandle<S>) -> usize {
    let doc = handle.document();
    1 + doc.blocks()[0].content_size()
}

async fn run<S: LogStore>(store: Arc<S>) -> Result<(), SyncError> {
    let config = EngineConfig::default();
    let mut alice =
        open_document(Arc::clone(&store), DOC_ID, &new_client_id(), config.clone()).await?;
    let mut bob = open_document(Arc::clone(&store), DOC_ID, &new_client_id(), config).await?;
    let mut bob_changes = bob.on_remote_change();
    info!("opened {DOC_ID} at key {}", alice.latest_key());

    // Both type at the same spot before seeing each other.
    let at = end_of_first_block(&alice);
    alice
        .submit_local_edit(vec![Step::insert_text(at, "Hello")], Meta::new())
        .await?;
    bob.submit_local_edit(vec![Step::insert_text(at, ", world")], Meta::new())
        .await?;
    alice.poll().await?;
    bob.poll().await?;
    info!("alice sees {:?}", alice.document().text_content());
    info!("bob sees   {:?}", bob.document().text_content());

    if let Some(changes) = bob_changes.as_mut() {
        while let Ok(change) = changes.try_recv() {
            if let RemoteChange::Applied { key, client_id, steps } = change {
                info!("bob applied entry {key} from {client_id} ({steps} steps)");
            }
        }
    }

    // Alice selects the first word; bob renders it.
    alice.set_local_selection(1, 6, SelectionIntent::Pointer).await?;
    bob.poll().await?;
    for selection in bob.active_selections() {
        let [r, g, b, _] = selection.color.to_array();
        info!(
            "bob shows {}'s selection {}..{} in rgb({:.0}, {:.0}, {:.0})",
            selection.client_id,
            selection.anchor,
            selection.head,
            r * 255.0,
            g * 255.0,
            b * 255.0
        );
    }

    // Alice drafts a heading on a fork while bob keeps typing on the parent.
    let fork = alice.fork_new().await?;
    let config = EngineConfig::default();
    let mut draft =
        open_document(Arc::clone(&store), &fork.fork_id, alice.client_id(), config).await?;
    draft
        .submit_local_edit(
            vec![
                Step::SetBlockType { pos: 0, kind: BlockKind::Heading { level: 1 } },
                Step::AddMark { from: 1, to: 6, mark: Mark::Strong },
            ],
            Meta::new(),
        )
        .await?;
    draft.commit("make it a heading").await?;

    bob.poll().await?;
    let end = end_of_first_block(&bob);
    bob.submit_local_edit(vec![Step::insert_text(end, "!")], Meta::new())
        .await?;

    let outcome = alice.rebase(&fork.fork_id).await?;
    info!(
        "rebased {} onto {DOC_ID} at key {:?} ({} steps, {} dropped)",
        fork.fork_id,
        outcome.key,
        outcome.steps,
        outcome.dropped
    );
    bob.poll().await?;
    info!("final document: {:?}", bob.document().text_content());
    info!("first block is now {}", bob.document().blocks()[0].kind);

    alice.settle().await;
    bob.settle().await;
    Ok(())
}
