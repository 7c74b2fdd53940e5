//! Forks, commits and rebasing a fork back onto its parent.
//!
//! ```text
//! parent  ──E0──┬──E2 (parent entries after the fork)──► head
//!               │
//!        forked_at_key
//!               │
//! fork          └──E1 (fork entries)──►
//!
//! rebase(fork):  E1' = rebase(E1 over E2), validated against head,
//!                appended to the parent as one entry (meta rebased = true)
//! ```
//!
//! A fork starts as a checkpoint of the parent at `forked_at_key`, so its
//! own log continues at `forked_at_key + 1`. The parent document at that
//! key is also kept under the fork's `fork_doc` slot; E1 and E2 are the
//! steps that actually applied when each log is replayed from it.
//! Commits slice a document's log into named windows; `rebase_commit`
//! moves a single window.
//!
//! A client claims a merge under the fork before appending anything, so a
//! fork or commit raced by two clients lands on the parent once.

use std::sync::Arc;

use quire_core::{rebase_steps, rebase_steps_after, Document, Step};

use crate::changelog::{AppendOutcome, ChangeLogClient, LogRecord};
use crate::checkpoint::write_checkpoint;
use crate::codec::{
    decode, decode_snapshot, encode, encode_snapshot, now_millis, Checkpoint, CommitRecord,
    CurrentCommit, ForkMarker, ForkRecord, Meta, MetaValue, META_COMMIT, META_FORK, META_REBASED,
};
use crate::engine::{absorb_record, SyncEngine};
use crate::error::SyncError;
use crate::storage::{
    commit_claim_path, commit_path, commits_prefix, current_commit_path, fork_data_path,
    fork_doc_path, fork_marker_path, forks_prefix, merge_claim_path, LogStore,
};

/// What a rebase appended to the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseOutcome {
    /// Key of the appended entry; `None` when nothing was left to append.
    pub key: Option<u64>,
    pub steps: usize,
    /// Fork steps whose target was deleted on the parent.
    pub dropped: usize,
}

/// Replays `records` onto `doc` and collects the steps that applied from
/// entries in `(after, until]`. Corrupt steps and unreadable entries
/// contribute nothing.
fn applied_between(
    mut doc: Document,
    records: &[LogRecord],
    after: u64,
    until: u64,
    doc_id: &str,
) -> Vec<Step> {
    let mut steps = Vec::new();
    for record in records.iter().take_while(|r| r.key() <= until) {
        let (next, absorbed) = absorb_record(&doc, record);
        doc = next;
        if absorbed.key <= after {
            continue;
        }
        if !absorbed.corrupt.is_empty() {
            log::warn!(
                "{doc_id}: entry {} contributes {} of its steps, the rest are corrupt",
                absorbed.key,
                absorbed.applied.len()
            );
        }
        steps.extend(absorbed.applied);
    }
    steps
}

/// Rebases `steps` over `over` after undoing `undo`, then checks that the
/// result applies to `head` as a whole.
fn rebase_checked(
    undo: &[Step],
    steps: &[Step],
    over: &[Step],
    head: &Document,
) -> Result<(Vec<Step>, usize), SyncError> {
    let rebased = if undo.is_empty() {
        rebase_steps(steps, over)
    } else {
        rebase_steps_after(undo, steps, over)
    };
    for index in &rebased.dropped {
        log::warn!("fork step {index} dropped: its target no longer exists on the parent");
    }
    let mut doc = head.clone();
    for (index, step) in rebased.steps.iter().enumerate() {
        doc = step
            .apply(&doc)
            .map_err(|source| SyncError::RebaseFailed { index, source })?;
    }
    Ok((rebased.steps, rebased.dropped.len()))
}

pub(crate) async fn load_commits<S: LogStore>(
    store: &S,
    doc_id: &str,
) -> Result<Vec<CommitRecord>, SyncError> {
    let mut commits = Vec::new();
    for (key, bytes) in store.read_children(&commits_prefix(doc_id), None).await? {
        match CommitRecord::decode(&bytes) {
            Ok(commit) => commits.push(commit),
            Err(e) => log::warn!("{doc_id}: skipping unreadable commit {key}: {e}"),
        }
    }
    Ok(commits)
}

/// Fork and commit operations on one open document.
pub struct ForkManager<'a, S: LogStore> {
    engine: &'a mut SyncEngine<S>,
}

impl<S: LogStore> SyncEngine<S> {
    pub fn forks(&mut self) -> ForkManager<'_, S> {
        ForkManager { engine: self }
    }
}

impl<S: LogStore> ForkManager<'_, S> {
    async fn read_fork(&self, fork_id: &str) -> Result<ForkRecord, SyncError> {
        let store = self.engine.store();
        let Some(bytes) = store.read(&fork_data_path(fork_id)).await? else {
            return Err(SyncError::ForkNotFound(fork_id.to_string()));
        };
        let record: ForkRecord = decode(&bytes)?;
        if record.parent_id != self.engine.doc_id() {
            return Err(SyncError::ForkNotFound(fork_id.to_string()));
        }
        Ok(record)
    }

    /// The parent document `fork_id` was taken from.
    async fn fork_point(&self, fork_id: &str) -> Result<Document, SyncError> {
        let store = self.engine.store();
        let Some(bytes) = store.read(&fork_doc_path(fork_id)).await? else {
            return Err(SyncError::ForkNotFound(fork_id.to_string()));
        };
        Ok(decode_snapshot(&bytes)?)
    }

    /// Creates `new_id` as a copy of this document at its current key.
    pub async fn fork(&mut self, new_id: &str) -> Result<ForkRecord, SyncError> {
        self.engine.ensure_live()?;
        self.engine.flush_all().await?;

        let parent_id = self.engine.doc_id().to_string();
        let forked_at_key = self.engine.latest_key();
        let record = ForkRecord {
            fork_id: new_id.to_string(),
            parent_id: parent_id.clone(),
            forked_at_key,
            merged: false,
            created_at: now_millis(),
            merged_at: None,
        };

        let store = Arc::clone(self.engine.store());
        let bytes = encode(&record)?;
        let claimed = store
            .conditional_write(&fork_data_path(new_id), move |current| {
                current.is_none().then_some(bytes)
            })
            .await?;
        if !claimed.committed {
            return Err(SyncError::ForkExists(new_id.to_string()));
        }

        let snapshot = self.engine.confirmed_document();
        store
            .write(&fork_doc_path(new_id), encode_snapshot(snapshot)?)
            .await?;
        let checkpoint = Checkpoint {
            key: forked_at_key,
            snapshot: snapshot.clone(),
            timestamp: record.created_at,
        };
        write_checkpoint(&*store, new_id, &checkpoint).await?;
        let marker = ForkMarker {
            fork_id: new_id.to_string(),
            forked_at_key,
            created_at: record.created_at,
        };
        store
            .write(&fork_marker_path(&parent_id, new_id), encode(&marker)?)
            .await?;

        log::info!("{parent_id}: forked {new_id} at key {forked_at_key}");
        Ok(record)
    }

    /// Forks of this document, oldest first.
    pub async fn list_forks(&self) -> Result<Vec<ForkRecord>, SyncError> {
        let store = self.engine.store();
        let markers = store
            .read_children(&forks_prefix(self.engine.doc_id()), None)
            .await?;
        let mut forks = Vec::with_capacity(markers.len());
        for (fork_id, bytes) in markers {
            if let Err(e) = decode::<ForkMarker>(&bytes) {
                log::warn!("{}: unreadable fork marker {fork_id}: {e}", self.engine.doc_id());
                continue;
            }
            match self.read_fork(&fork_id).await {
                Ok(record) => forks.push(record),
                Err(e) => log::warn!("{}: fork {fork_id} unavailable: {e}", self.engine.doc_id()),
            }
        }
        forks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.fork_id.cmp(&b.fork_id)));
        Ok(forks)
    }

    /// Where this document's history starts: the fork point for a fork,
    /// the empty document at key 0 otherwise.
    async fn base(&self) -> Result<(u64, Document), SyncError> {
        let doc_id = self.engine.doc_id();
        let Some(bytes) = self.engine.store().read(&fork_data_path(doc_id)).await? else {
            return Ok((0, Document::empty()));
        };
        let forked_at_key = decode::<ForkRecord>(&bytes)?.forked_at_key;
        Ok((forked_at_key, self.fork_point(doc_id).await?))
    }

    /// Applied steps of this document's entries in `(after, until]`.
    async fn steps_between(&self, after: u64, until: u64) -> Result<Vec<Step>, SyncError> {
        if after >= until {
            return Ok(Vec::new());
        }
        let (base_key, base) = self.base().await?;
        let records = self.engine.log_client().load_entries(base_key + 1).await?;
        Ok(applied_between(base, &records, after, until, self.engine.doc_id()))
    }

    /// Bundles every entry since the previous commit into a new commit.
    pub async fn commit(&mut self, description: &str) -> Result<CommitRecord, SyncError> {
        self.engine.ensure_live()?;
        self.engine.flush_all().await?;

        let doc_id = self.engine.doc_id().to_string();
        let store = Arc::clone(self.engine.store());
        let mut window = match store.read(&current_commit_path(&doc_id)).await? {
            Some(bytes) => decode::<CurrentCommit>(&bytes)?,
            None => CurrentCommit {
                commit_id: 1,
                started_after_key: self.base().await?.0,
            },
        };
        let latest = self.engine.latest_key();
        let max_attempts = self.engine.config().max_append_attempts.max(1);

        for _ in 0..max_attempts {
            let commit = CommitRecord {
                commit_id: window.commit_id,
                description: description.to_string(),
                steps: self.steps_between(window.started_after_key, latest).await?,
                client_id: self.engine.client_id().to_string(),
                key_range: (window.started_after_key + 1, latest),
                merged: false,
                created_at: now_millis(),
            };
            let bytes = commit.encode()?;
            let outcome = store
                .conditional_write(&commit_path(&doc_id, commit.commit_id), move |current| {
                    current.is_none().then_some(bytes)
                })
                .await?;

            if outcome.committed {
                let next = CurrentCommit {
                    commit_id: commit.commit_id + 1,
                    started_after_key: latest.max(window.started_after_key),
                };
                store.write(&current_commit_path(&doc_id), encode(&next)?).await?;
                log::info!(
                    "{doc_id}: commit {} \"{}\" covers keys {}..={}",
                    commit.commit_id,
                    commit.description,
                    commit.key_range.0,
                    commit.key_range.1
                );
                return Ok(commit);
            }

            let Some(winner) = outcome.value else {
                break;
            };
            let winner = CommitRecord::decode(&winner)?;
            log::debug!("{doc_id}: commit id {} taken, retrying", winner.commit_id);
            window = CurrentCommit {
                commit_id: winner.commit_id + 1,
                started_after_key: winner.key_range.1.max(window.started_after_key),
            };
        }
        Err(SyncError::AppendConflict {
            key: window.commit_id,
            attempts: max_attempts,
        })
    }

    /// Commits of this document, by id.
    pub async fn list_commits(&self) -> Result<Vec<CommitRecord>, SyncError> {
        load_commits(&**self.engine.store(), self.engine.doc_id()).await
    }

    /// Applied steps of this document's entries since `fork` was taken,
    /// replayed from `fork_point`.
    async fn parent_steps(
        &self,
        fork: &ForkRecord,
        fork_point: Document,
    ) -> Result<Vec<Step>, SyncError> {
        let records = self
            .engine
            .log_client()
            .load_entries(fork.forked_at_key + 1)
            .await?;
        Ok(applied_between(
            fork_point,
            &records,
            fork.forked_at_key,
            self.engine.latest_key(),
            self.engine.doc_id(),
        ))
    }

    /// Fork steps after the fork point and parent steps since then.
    async fn diverged(&self, fork: &ForkRecord) -> Result<(Vec<Step>, Vec<Step>), SyncError> {
        let fork_point = self.fork_point(&fork.fork_id).await?;
        let fork_log = ChangeLogClient::new(
            Arc::clone(self.engine.store()),
            fork.fork_id.clone(),
            self.engine.client_id(),
            self.engine.config(),
        );
        let fork_steps = applied_between(
            fork_point.clone(),
            &fork_log.load_entries(fork.forked_at_key + 1).await?,
            fork.forked_at_key,
            u64::MAX,
            &fork.fork_id,
        );
        let parent_steps = self.parent_steps(fork, fork_point).await?;
        Ok((fork_steps, parent_steps))
    }

    /// Takes `path` for this client. Fails with `AlreadyMerged` naming
    /// `what` when another client holds it.
    async fn claim(&self, path: &str, what: String) -> Result<(), SyncError> {
        let owner = encode(&self.engine.client_id().to_string())?;
        let outcome = self
            .engine
            .store()
            .conditional_write(path, move |current| current.is_none().then_some(owner))
            .await?;
        if !outcome.committed {
            log::debug!("{}: {what} is already being merged", self.engine.doc_id());
            return Err(SyncError::AlreadyMerged(what));
        }
        Ok(())
    }

    async fn release(&self, path: &str) {
        if let Err(e) = self.engine.store().remove(path).await {
            log::warn!("{}: could not release merge claim {path}: {e}", self.engine.doc_id());
        }
    }

    /// Appends `undo`-relative `steps` rebased over `parent_steps` as one
    /// entry. Lost races extend `parent_steps` and recompute the rebase.
    async fn append_rebased(
        &mut self,
        undo: &[Step],
        steps: &[Step],
        mut parent_steps: Vec<Step>,
        meta: Meta,
    ) -> Result<RebaseOutcome, SyncError> {
        let (rebased, mut dropped) =
            rebase_checked(undo, steps, &parent_steps, self.engine.confirmed_document())?;

        let (result, over) = self
            .engine
            .append_tracked(rebased, meta, |shadow, applied, _| {
                parent_steps.extend_from_slice(applied);
                let (rebased, now_dropped) = rebase_checked(undo, steps, &parent_steps, shadow)?;
                dropped = now_dropped;
                Ok(rebased)
            })
            .await;

        match result? {
            AppendOutcome::Committed { entry, .. } => {
                let key = entry.key;
                let count = entry.steps.len();
                self.engine.apply_committed(entry, &[], &over);
                self.engine.remember_own(key);
                Ok(RebaseOutcome {
                    key: Some(key),
                    steps: count,
                    dropped,
                })
            }
            AppendOutcome::Emptied { .. } => Ok(RebaseOutcome {
                key: None,
                steps: 0,
                dropped,
            }),
        }
    }

    /// Replays every change made on `fork_id` onto this document.
    pub async fn rebase(&mut self, fork_id: &str) -> Result<RebaseOutcome, SyncError> {
        self.engine.ensure_live()?;
        let mut fork = self.read_fork(fork_id).await?;
        if fork.merged {
            return Err(SyncError::AlreadyMerged(fork_id.to_string()));
        }
        let claim = merge_claim_path(fork_id);
        self.claim(&claim, fork_id.to_string()).await?;
        let outcome = match self.merge_fork(&fork).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release(&claim).await;
                return Err(e);
            }
        };

        fork.merged = true;
        fork.merged_at = Some(now_millis());
        self.engine
            .store()
            .write(&fork_data_path(fork_id), encode(&fork)?)
            .await?;
        log::info!(
            "{}: rebased fork {fork_id} ({} steps, {} dropped)",
            self.engine.doc_id(),
            outcome.steps,
            outcome.dropped
        );
        Ok(outcome)
    }

    async fn merge_fork(&mut self, fork: &ForkRecord) -> Result<RebaseOutcome, SyncError> {
        self.engine.flush_all().await?;
        let (fork_steps, parent_steps) = self.diverged(fork).await?;
        let mut meta = Meta::new();
        meta.insert(META_REBASED.into(), MetaValue::Bool(true));
        meta.insert(META_FORK.into(), MetaValue::Text(fork.fork_id.clone()));
        self.append_rebased(&[], &fork_steps, parent_steps, meta).await
    }

    /// Replays the changes of a single commit of `fork_id` onto this
    /// document. Earlier commits of the fork are taken back out first, so
    /// the commit lands as if it had been made directly at the fork point.
    pub async fn rebase_commit(
        &mut self,
        fork_id: &str,
        commit_id: u64,
    ) -> Result<RebaseOutcome, SyncError> {
        self.engine.ensure_live()?;
        let fork = self.read_fork(fork_id).await?;
        let whole_claimed = self
            .engine
            .store()
            .read(&merge_claim_path(fork_id))
            .await?
            .is_some();
        if fork.merged || whole_claimed {
            return Err(SyncError::AlreadyMerged(fork_id.to_string()));
        }
        let commits = load_commits(&**self.engine.store(), fork_id).await?;
        let Some(mut target) = commits.iter().find(|c| c.commit_id == commit_id).cloned() else {
            return Err(SyncError::CommitNotFound {
                doc_id: fork_id.to_string(),
                commit_id,
            });
        };
        let what = format!("{fork_id} commit {commit_id}");
        if target.merged {
            return Err(SyncError::AlreadyMerged(what));
        }
        let claim = commit_claim_path(fork_id, commit_id);
        self.claim(&claim, what).await?;
        let outcome = match self.merge_commit(&fork, &commits, &target).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release(&claim).await;
                return Err(e);
            }
        };

        target.merged = true;
        self.engine
            .store()
            .write(&commit_path(fork_id, commit_id), target.encode()?)
            .await?;
        log::info!(
            "{}: rebased commit {commit_id} of {fork_id} ({} steps)",
            self.engine.doc_id(),
            outcome.steps
        );
        Ok(outcome)
    }

    async fn merge_commit(
        &mut self,
        fork: &ForkRecord,
        commits: &[CommitRecord],
        target: &CommitRecord,
    ) -> Result<RebaseOutcome, SyncError> {
        self.engine.flush_all().await?;
        let undo: Vec<Step> = commits
            .iter()
            .filter(|c| c.commit_id < target.commit_id)
            .flat_map(|c| c.steps.iter().cloned())
            .collect();
        let fork_point = self.fork_point(&fork.fork_id).await?;
        let parent_steps = self.parent_steps(fork, fork_point).await?;

        let mut meta = Meta::new();
        meta.insert(META_REBASED.into(), MetaValue::Bool(true));
        meta.insert(META_FORK.into(), MetaValue::Text(fork.fork_id.clone()));
        meta.insert(META_COMMIT.into(), MetaValue::Int(target.commit_id as i64));
        self.append_rebased(&undo, &target.steps, parent_steps, meta)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChangeEntry;
    use crate::config::EngineConfig;
    use crate::storage::{change_path, MemoryLogStore};
    use quire_core::{apply_all, BlockKind, Mark, Slice, TextRun};

    async fn open(
        store: &Arc<MemoryLogStore>,
        doc: &str,
        client: &str,
    ) -> SyncEngine<MemoryLogStore> {
        let config = EngineConfig::for_testing();
        let mut engine = SyncEngine::new(Arc::clone(store), doc, client, config);
        engine.open().await.unwrap();
        engine
    }

    async fn code_block(engine: &mut SyncEngine<MemoryLogStore>, text: &str) {
        let steps = vec![
            Step::SetBlockType {
                pos: 0,
                kind: BlockKind::CodeBlock,
            },
            Step::insert_text(1, text),
        ];
        engine.submit_local_edit(steps, Meta::new()).await.unwrap();
    }

    /// Writes an entry at `key` that inserts bold text at 1, which a code
    /// block rejects.
    async fn write_bold_entry(store: &MemoryLogStore, doc: &str, key: u64) {
        let entry = ChangeEntry {
            key,
            steps: vec![Step::Replace {
                from: 1,
                to: 1,
                slice: Slice::Inline(vec![TextRun::marked("XYZ", [Mark::Strong])]),
            }],
            client_id: "c".into(),
            meta: Meta::new(),
            timestamp: 0,
        };
        let bytes = entry.encode().unwrap();
        store
            .conditional_write(&change_path(doc, key), move |_| Some(bytes))
            .await
            .unwrap();
    }

    async fn type_text(engine: &mut SyncEngine<MemoryLogStore>, pos: usize, text: &str) {
        engine
            .submit_local_edit(vec![Step::insert_text(pos, text)], Meta::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fork_copies_current_state() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        type_text(&mut parent, 1, "base").await;

        let record = parent.forks().fork("draft").await.unwrap();
        assert_eq!(record.forked_at_key, 1);
        assert_eq!(record.parent_id, "main");

        let fork = open(&store, "draft", "a").await;
        assert_eq!(fork.document().text_content(), "base");
        assert_eq!(fork.latest_key(), 1);

        type_text(&mut parent, 5, " moved on").await;
        let stored = store.read(&fork_doc_path("draft")).await.unwrap().unwrap();
        assert_eq!(decode_snapshot(&stored).unwrap(), Document::from_paragraphs(&["base"]));

        assert!(matches!(
            parent.forks().fork("draft").await,
            Err(SyncError::ForkExists(_))
        ));
        let forks = parent.forks().list_forks().await.unwrap();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].fork_id, "draft");
    }

    #[tokio::test]
    async fn test_rebase_fork_onto_parent() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        type_text(&mut parent, 1, "middle").await;
        parent.forks().fork("draft").await.unwrap();

        let mut fork = open(&store, "draft", "b").await;
        type_text(&mut fork, 7, " end").await;
        type_text(&mut parent, 1, "start ").await;

        let outcome = parent.forks().rebase("draft").await.unwrap();
        assert_eq!(outcome.key, Some(3));
        assert_eq!(parent.document().text_content(), "start middle end");

        let entries = parent.log_client().load_entries(3).await.unwrap();
        assert!(entries[0].entry().unwrap().is_rebased());

        assert!(matches!(
            parent.forks().rebase("draft").await,
            Err(SyncError::AlreadyMerged(_))
        ));
        assert!(parent.forks().list_forks().await.unwrap()[0].merged);
    }

    #[tokio::test]
    async fn test_rebase_unknown_fork() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        assert!(matches!(
            parent.forks().rebase("nope").await,
            Err(SyncError::ForkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_validation_writes_nothing() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        type_text(&mut parent, 1, "abc").await;
        parent.forks().fork("draft").await.unwrap();

        // bold on the fork, code block on the parent
        let mut fork = open(&store, "draft", "b").await;
        fork.submit_local_edit(
            vec![Step::AddMark {
                from: 1,
                to: 3,
                mark: quire_core::Mark::Strong,
            }],
            Meta::new(),
        )
        .await
        .unwrap();
        parent
            .submit_local_edit(
                vec![Step::SetBlockType {
                    pos: 0,
                    kind: quire_core::BlockKind::CodeBlock,
                }],
                Meta::new(),
            )
            .await
            .unwrap();

        let before = parent.latest_key();
        let err = parent.forks().rebase("draft").await.unwrap_err();
        assert!(matches!(err, SyncError::RebaseFailed { index: 0, .. }));
        assert_eq!(parent.latest_key(), before);
        assert!(!parent.forks().list_forks().await.unwrap()[0].merged);
        // a later attempt may try again
        assert!(store.read(&merge_claim_path("draft")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commits_partition_the_log() {
        let store = Arc::new(MemoryLogStore::new());
        let mut doc = open(&store, "main", "a").await;
        type_text(&mut doc, 1, "one").await;
        let first = doc.forks().commit("first").await.unwrap();
        assert_eq!(first.commit_id, 1);
        assert_eq!(first.key_range, (1, 1));

        type_text(&mut doc, 4, " two").await;
        type_text(&mut doc, 8, " three").await;
        let second = doc.forks().commit("second").await.unwrap();
        assert_eq!(second.commit_id, 2);
        assert_eq!(second.key_range, (2, 3));
        assert_eq!(second.steps.len(), 2);

        let empty = doc.forks().commit("nothing").await.unwrap();
        assert!(empty.key_range.0 > empty.key_range.1);
        assert!(empty.steps.is_empty());

        let ids: Vec<u64> = doc
            .forks()
            .list_commits()
            .await
            .unwrap()
            .iter()
            .map(|c| c.commit_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_commit_takes_next_id() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "main", "a").await;
        let mut b = open(&store, "main", "b").await;
        type_text(&mut a, 1, "x").await;
        b.poll().await.unwrap();

        a.forks().commit("from a").await.unwrap();
        // b still has the stale window but must not reuse id 1
        store.remove(&current_commit_path("main")).await.unwrap();
        let commit = b.forks().commit("from b").await.unwrap();
        assert_eq!(commit.commit_id, 2);
        assert!(commit.steps.is_empty());
    }

    #[tokio::test]
    async fn test_rebase_single_commit() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        type_text(&mut parent, 1, "hello").await;
        parent.forks().fork("draft").await.unwrap();

        let mut fork = open(&store, "draft", "b").await;
        type_text(&mut fork, 1, "AA").await;
        fork.forks().commit("prefix").await.unwrap();
        type_text(&mut fork, 8, "ZZ").await;
        let second = fork.forks().commit("suffix").await.unwrap();
        assert_eq!(second.commit_id, 2);

        type_text(&mut parent, 6, "!").await;
        let outcome = parent.forks().rebase_commit("draft", 2).await.unwrap();
        assert_eq!(outcome.steps, 1);
        assert_eq!(parent.document().text_content(), "hello!ZZ");

        assert!(matches!(
            parent.forks().rebase_commit("draft", 2).await,
            Err(SyncError::AlreadyMerged(_))
        ));
        assert!(matches!(
            parent.forks().rebase_commit("draft", 9).await,
            Err(SyncError::CommitNotFound { commit_id: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_rebase_skips_corrupt_parent_steps() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        code_block(&mut parent, "abcdef").await;
        parent.forks().fork("draft").await.unwrap();

        let mut fork = open(&store, "draft", "b").await;
        type_text(&mut fork, 2, "!").await;
        write_bold_entry(&store, "main", 2).await;
        parent.poll().await.unwrap();
        assert_eq!(parent.latest_key(), 2);
        assert_eq!(parent.corruption_report().len(), 1);

        let outcome = parent.forks().rebase("draft").await.unwrap();
        assert_eq!(outcome.key, Some(3));
        assert_eq!(parent.document().text_content(), "a!bcdef");
    }

    #[tokio::test]
    async fn test_rebase_commit_skips_corrupt_parent_steps() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        code_block(&mut parent, "abcdef").await;
        parent.forks().fork("draft").await.unwrap();

        let mut fork = open(&store, "draft", "b").await;
        type_text(&mut fork, 2, "!").await;
        fork.forks().commit("bang").await.unwrap();
        write_bold_entry(&store, "main", 2).await;
        parent.poll().await.unwrap();

        parent.forks().rebase_commit("draft", 1).await.unwrap();
        assert_eq!(parent.document().text_content(), "a!bcdef");
    }

    #[tokio::test]
    async fn test_commit_holds_only_applied_steps() {
        let store = Arc::new(MemoryLogStore::new());
        let mut doc = open(&store, "main", "a").await;
        code_block(&mut doc, "abc").await;
        write_bold_entry(&store, "main", 2).await;
        doc.poll().await.unwrap();
        type_text(&mut doc, 4, "d").await;

        let commit = doc.forks().commit("all").await.unwrap();
        assert_eq!(commit.key_range, (1, 3));
        let replayed = apply_all(&Document::empty(), &commit.steps).unwrap();
        assert_eq!(&replayed, doc.document());
        assert_eq!(replayed.text_content(), "abcd");
    }

    #[tokio::test]
    async fn test_rebase_claimed_fork_appends_once() {
        let store = Arc::new(MemoryLogStore::new());
        let mut a = open(&store, "main", "a").await;
        type_text(&mut a, 1, "abc").await;
        a.forks().fork("draft").await.unwrap();
        let mut fork = open(&store, "draft", "f").await;
        type_text(&mut fork, 4, "!").await;
        let mut c = open(&store, "main", "c").await;

        // c read the fork as unmerged while a still holds the claim
        store
            .conditional_write(&merge_claim_path("draft"), |_| Some(b"a".to_vec()))
            .await
            .unwrap();
        assert!(matches!(
            c.forks().rebase("draft").await,
            Err(SyncError::AlreadyMerged(_))
        ));
        assert!(matches!(
            c.forks().rebase_commit("draft", 1).await,
            Err(SyncError::AlreadyMerged(_))
        ));
        assert_eq!(c.latest_key(), 1);
        store.remove(&merge_claim_path("draft")).await.unwrap();

        let (mut from_a, mut from_c) = (a.forks(), c.forks());
        let (first, second) = tokio::join!(from_a.rebase("draft"), from_c.rebase("draft"));
        let merged = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(merged, 1);
        assert!(matches!(
            first.and(second),
            Err(SyncError::AlreadyMerged(_))
        ));

        a.poll().await.unwrap();
        c.poll().await.unwrap();
        assert_eq!(a.latest_key(), 2);
        assert_eq!(a.document().text_content(), "abc!");
        assert_eq!(a.document(), c.document());
    }

    #[tokio::test]
    async fn test_rebase_commit_claimed_once() {
        let store = Arc::new(MemoryLogStore::new());
        let mut parent = open(&store, "main", "a").await;
        type_text(&mut parent, 1, "abc").await;
        parent.forks().fork("draft").await.unwrap();
        let mut fork = open(&store, "draft", "f").await;
        type_text(&mut fork, 4, "!").await;
        fork.forks().commit("bang").await.unwrap();

        store
            .conditional_write(&commit_claim_path("draft", 1), |_| Some(b"c".to_vec()))
            .await
            .unwrap();
        assert!(matches!(
            parent.forks().rebase_commit("draft", 1).await,
            Err(SyncError::AlreadyMerged(_))
        ));
        assert_eq!(parent.latest_key(), 1);
        assert_eq!(parent.document().text_content(), "abc");
    }
}
