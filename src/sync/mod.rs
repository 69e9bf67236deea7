pub mod relink;
pub mod report;

use crate::document::{DocumentPatch, compose_task_lines, imported_description};
use crate::fingerprint::{content_hash, fingerprint, plain_title};
use crate::index::SyncIndex;
use crate::models::{ExternalItem, ItemDraft, ItemPatch, TaskRecord};
use crate::store::{ExternalStore, StoreError, StoreResult, legacy_marker_fingerprint};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use report::{SyncAction, SyncReport};

pub const DEFAULT_TITLE_MATCH_LIMIT: usize = 25;

/// Which side wins when a mapped task and its item disagree on the title.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TitlePolicy {
    #[default]
    Push,
    Pull,
}

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub title_policy: TitlePolicy,
    pub import_unmapped: bool,
    pub include_completed: bool,
    pub reindex: bool,
    pub migrate_legacy: bool,
    /// Opportunistic title matching is skipped above this many unresolved titles.
    pub title_match_limit: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            title_policy: TitlePolicy::Push,
            import_unmapped: false,
            include_completed: false,
            reindex: false,
            migrate_legacy: true,
            title_match_limit: DEFAULT_TITLE_MATCH_LIMIT,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub report: SyncReport,
    pub actions: Vec<SyncAction>,
    /// Edits to apply to the source document.
    pub patches: Vec<DocumentPatch>,
    /// Legacy markers imported into the index.
    pub migrated: usize,
    /// Index keys moved by pulled titles, as `(previous, current)`. They only
    /// hold once the patches reach the document.
    pub rekeys: Vec<(String, String)>,
}

impl SyncOutcome {
    /// Whether the run wrote (or would write) to the store or the document.
    pub fn has_changes(&self) -> bool {
        !self.patches.is_empty() || self.actions.iter().any(SyncAction::touches_store)
    }

    pub fn absorb(&mut self, other: SyncOutcome) {
        self.report.merge(&other.report);
        self.actions.extend(other.actions);
        self.patches.extend(other.patches);
        self.migrated += other.migrated;
        self.rekeys.extend(other.rekeys);
    }
}

/// A store call failed part way through. Work done before the failure is kept
/// in `partial` so the caller can still persist it.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct Interrupted {
    pub source: StoreError,
    pub partial: SyncOutcome,
}

/// Reconciles the tasks of one document with one list of the store.
pub fn reconcile(
    list: &str,
    tasks: &[TaskRecord],
    index: &mut SyncIndex,
    store: &mut dyn ExternalStore,
    options: &SyncOptions,
) -> Result<SyncOutcome, Interrupted> {
    let mut run = Reconciler::new(list, index, store, options, unique_tasks(list, tasks));
    match run.run() {
        Ok(()) => {
            debug!(list, summary = %run.outcome.report.summary(), "reconciled");
            Ok(run.outcome)
        }
        Err(source) => Err(Interrupted {
            source,
            partial: run.outcome,
        }),
    }
}

/// Imports legacy notes markers of `list` into the index, alone, so the caller
/// can persist the result before reconciling.
pub fn migrate_legacy(
    list: &str,
    index: &mut SyncIndex,
    store: &mut dyn ExternalStore,
    options: &SyncOptions,
) -> Result<SyncOutcome, Interrupted> {
    let mut run = Reconciler::new(list, index, store, options, Vec::new());
    match run.migrate_legacy() {
        Ok(()) => Ok(run.outcome),
        Err(source) => Err(Interrupted {
            source,
            partial: run.outcome,
        }),
    }
}

/// Identical tasks share a fingerprint and cannot be told apart; only the first is synced.
fn unique_tasks(list: &str, tasks: &[TaskRecord]) -> Vec<TaskRecord> {
    let mut seen = HashSet::new();
    tasks
        .iter()
        .filter(|task| {
            let first = seen.insert(task.fingerprint.as_str());
            if !first {
                warn!(list, line = task.source_line, title = %task.title, "duplicate task skipped");
            }
            first
        })
        .cloned()
        .collect()
}

fn single_line(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct Reconciler<'a> {
    list: &'a str,
    index: &'a mut SyncIndex,
    store: &'a mut dyn ExternalStore,
    options: &'a SyncOptions,
    tasks: Vec<TaskRecord>,
    /// External ids owned by a live task in this run.
    claimed: HashSet<String>,
    outcome: SyncOutcome,
    phase: &'static str,
    placeholders: usize,
}

impl<'a> Reconciler<'a> {
    fn new(
        list: &'a str,
        index: &'a mut SyncIndex,
        store: &'a mut dyn ExternalStore,
        options: &'a SyncOptions,
        tasks: Vec<TaskRecord>,
    ) -> Self {
        Self {
            list,
            index,
            store,
            options,
            tasks,
            claimed: HashSet::new(),
            outcome: SyncOutcome::default(),
            phase: "start",
            placeholders: 0,
        }
    }

    fn run(&mut self) -> StoreResult<()> {
        if self.options.migrate_legacy {
            self.migrate_legacy()?;
        }
        if self.options.reindex {
            self.reindex()?;
        }
        let pending = self.resolve_tasks()?;
        let pending = self.resolve_orphans(pending)?;
        self.create_pending(&pending)?;
        if self.options.import_unmapped {
            self.import_unmapped()?;
        }
        Ok(())
    }

    fn record(&mut self, action: SyncAction) {
        info!(
            list = self.list,
            phase = self.phase,
            dry_run = self.options.dry_run,
            "{}",
            action.describe()
        );
        self.outcome.report.record(&action);
        self.outcome.actions.push(action);
    }

    fn migrate_legacy(&mut self) -> StoreResult<()> {
        self.phase = "migrate";
        for item in self.store.fetch_legacy_marked(self.list)? {
            let Some(fingerprint) = legacy_marker_fingerprint(&item.notes) else {
                continue;
            };
            if self.index.get(self.list, &fingerprint).is_some()
                || self.index.find_by_external_id(self.list, &item.id).is_some()
            {
                continue;
            }
            self.index.set(self.list, &fingerprint, &item.id, None);
            self.outcome.migrated += 1;
            self.record(SyncAction::Migrated {
                fingerprint,
                id: item.id,
            });
        }
        Ok(())
    }

    fn reindex(&mut self) -> StoreResult<()> {
        self.phase = "reindex";
        let headers = self
            .store
            .fetch_all_headers(self.list, self.options.include_completed)?;
        let mut by_title: HashMap<String, VecDeque<String>> = HashMap::new();
        for header in headers {
            if self.index.find_by_external_id(self.list, &header.id).is_none() {
                by_title.entry(header.title).or_default().push_back(header.id);
            }
        }

        for position in 0..self.tasks.len() {
            let task = &self.tasks[position];
            if self.index.get(self.list, &task.fingerprint).is_some() {
                continue;
            }
            let Some(id) = by_title.get_mut(&task.title).and_then(VecDeque::pop_front) else {
                continue;
            };
            let (fingerprint, title) = (task.fingerprint.clone(), task.title.clone());
            self.index.set(self.list, &fingerprint, &id, None);
            self.record(SyncAction::Reindexed { title, id });
        }
        Ok(())
    }

    /// Resolves every task to its item and reconciles the pair. Returns the
    /// positions of tasks left without a counterpart, in document order.
    fn resolve_tasks(&mut self) -> StoreResult<Vec<usize>> {
        self.phase = "resolve";
        let mapped: Vec<Option<String>> = self
            .tasks
            .iter()
            .map(|task| {
                self.index
                    .get(self.list, &task.fingerprint)
                    .map(|entry| entry.external_id.clone())
            })
            .collect();
        let ids = distinct(mapped.iter().flatten());
        let items = self.fetch_items(&ids)?;

        let mut resolved: Vec<(usize, ExternalItem)> = Vec::new();
        let mut unresolved = Vec::new();
        for (position, id) in mapped.into_iter().enumerate() {
            let Some(id) = id else {
                unresolved.push(position);
                continue;
            };
            let fingerprint = self.tasks[position].fingerprint.clone();
            if self.claimed.contains(&id) {
                self.index.delete(self.list, &fingerprint);
                self.record(SyncAction::Superseded { fingerprint, id });
                unresolved.push(position);
            } else if let Some(item) = items.get(&id) {
                self.claimed.insert(id);
                resolved.push((position, item.clone()));
            } else {
                self.index.delete(self.list, &fingerprint);
                self.record(SyncAction::StaleDropped { fingerprint, id });
                unresolved.push(position);
            }
        }

        let (adopted, mut unresolved) = self.match_titles(unresolved)?;
        resolved.extend(adopted);
        resolved.sort_by_key(|(position, _)| *position);
        unresolved.sort_unstable();

        for (position, item) in resolved {
            self.reconcile_pair(position, &item, self.options.title_policy)?;
        }
        Ok(unresolved)
    }

    /// Adopts same-titled unclaimed items for unresolved tasks when few enough
    /// titles are outstanding to make the query cheap.
    fn match_titles(
        &mut self,
        unresolved: Vec<usize>,
    ) -> StoreResult<(Vec<(usize, ExternalItem)>, Vec<usize>)> {
        if unresolved.is_empty() {
            return Ok((Vec::new(), unresolved));
        }
        let titles = distinct(unresolved.iter().map(|&position| &self.tasks[position].title));
        if titles.len() > self.options.title_match_limit {
            debug!(
                list = self.list,
                titles = titles.len(),
                limit = self.options.title_match_limit,
                "too many unresolved titles; skipping title match"
            );
            return Ok((Vec::new(), unresolved));
        }

        let headers =
            self.store
                .fetch_by_exact_titles(self.list, &titles, self.options.include_completed)?;
        let mut by_title: HashMap<String, VecDeque<String>> = HashMap::new();
        for header in headers {
            if !self.claimed.contains(&header.id) {
                by_title.entry(header.title).or_default().push_back(header.id);
            }
        }

        let mut adopted = Vec::new();
        let mut still_unresolved = Vec::new();
        for position in unresolved {
            let task = &self.tasks[position];
            let Some(id) = by_title.get_mut(&task.title).and_then(VecDeque::pop_front) else {
                still_unresolved.push(position);
                continue;
            };
            let (fingerprint, title) = (task.fingerprint.clone(), task.title.clone());
            self.index.set(self.list, &fingerprint, &id, None);
            self.claimed.insert(id.clone());
            self.record(SyncAction::Adopted {
                title,
                id: id.clone(),
            });
            adopted.push((position, id));
        }

        let ids: Vec<String> = adopted.iter().map(|(_, id)| id.clone()).collect();
        let mut items = self.fetch_items(&ids)?;
        let mut resolved = Vec::new();
        for (position, id) in adopted {
            match items.remove(&id) {
                Some(item) => resolved.push((position, item)),
                None => {
                    // Gone between the two queries.
                    self.index.delete(self.list, &self.tasks[position].fingerprint);
                    self.claimed.remove(&id);
                    still_unresolved.push(position);
                }
            }
        }
        Ok((resolved, still_unresolved))
    }

    /// Converges one task with its item. `titles` decides which side wins a
    /// title disagreement.
    fn reconcile_pair(
        &mut self,
        position: usize,
        item: &ExternalItem,
        titles: TitlePolicy,
    ) -> StoreResult<()> {
        let task = self.tasks[position].clone();
        let mut key = task.fingerprint.clone();
        let mut patch = ItemPatch::default();
        let mut pushed = Vec::new();

        if task.completed && !item.completed {
            patch.completed = Some(true);
            pushed.push(SyncAction::CompletedExternal {
                title: task.title.clone(),
                id: item.id.clone(),
            });
        } else if item.completed && !task.completed {
            self.outcome.patches.push(DocumentPatch::SetChecked {
                line: task.source_line,
                checked: true,
            });
            self.tasks[position].completed = true;
            self.record(SyncAction::CompletedDocument {
                title: task.title.clone(),
                line: task.source_line,
            });
        }

        let pulled = single_line(&item.title);
        let pull = titles == TitlePolicy::Pull && !pulled.is_empty();
        if pull && pulled != task.raw_title && plain_title(&pulled) != task.title {
            let renamed = fingerprint(self.list, &pulled, task.notes.as_deref());
            self.outcome.patches.push(DocumentPatch::ReplaceTitle {
                line: task.source_line,
                title: pulled.clone(),
            });
            self.index.rekey(self.list, &key, &renamed);
            self.outcome.rekeys.push((key.clone(), renamed.clone()));
            let current = &mut self.tasks[position];
            current.fingerprint = renamed.clone();
            current.title = plain_title(&pulled);
            current.raw_title = pulled.clone();
            key = renamed;
            self.record(SyncAction::TitlePulled {
                from: task.title.clone(),
                to: pulled,
                line: task.source_line,
            });
        } else if !pull && item.title != task.title {
            patch.title = Some(task.title.clone());
            pushed.push(SyncAction::TitlePushed {
                from: item.title.clone(),
                to: task.title.clone(),
                id: item.id.clone(),
            });
        }

        let description = task.notes_text();
        let hash = content_hash(description);
        let cached = self
            .index
            .get(self.list, &key)
            .and_then(|entry| entry.last_content_hash.as_deref());
        let refresh_hash = cached != Some(hash.as_str());
        if refresh_hash && item.notes != description {
            patch.notes = Some(description.to_string());
            pushed.push(SyncAction::NotesPushed {
                title: task.title.clone(),
                id: item.id.clone(),
            });
        }

        if !patch.is_empty() {
            self.update_item(&item.id, &patch)?;
        }
        for action in pushed {
            self.record(action);
        }
        if refresh_hash {
            self.index.set_content_hash(self.list, &key, hash);
        }
        Ok(())
    }

    /// Settles index entries whose task left the document. Returns the
    /// pending positions that were not absorbed by a rename.
    fn resolve_orphans(&mut self, mut pending: Vec<usize>) -> StoreResult<Vec<usize>> {
        self.phase = "orphans";
        let live: HashSet<&str> = self
            .tasks
            .iter()
            .map(|task| task.fingerprint.as_str())
            .collect();
        let orphans: Vec<(String, String)> = self
            .index
            .entries(self.list)
            .into_iter()
            .filter(|(fingerprint, _)| !live.contains(fingerprint.as_str()))
            .map(|(fingerprint, entry)| (fingerprint, entry.external_id))
            .collect();
        if orphans.is_empty() {
            return Ok(pending);
        }

        let ids = distinct(orphans.iter().map(|(_, id)| id));
        let items = self.fetch_items(&ids)?;
        for (fingerprint, id) in orphans {
            if self.claimed.contains(&id) {
                self.index.delete(self.list, &fingerprint);
                self.record(SyncAction::Superseded { fingerprint, id });
                continue;
            }
            let Some(item) = items.get(&id) else {
                self.index.delete(self.list, &fingerprint);
                self.record(SyncAction::StaleDropped { fingerprint, id });
                continue;
            };

            let candidates = pending
                .iter()
                .map(|&position| self.tasks[position].title.as_str());
            if let Some(slot) = relink::best_match(&item.title, candidates) {
                let position = pending.remove(slot);
                let task_fingerprint = self.tasks[position].fingerprint.clone();
                self.index.rekey(self.list, &fingerprint, &task_fingerprint);
                self.claimed.insert(id.clone());
                self.record(SyncAction::Relinked {
                    from: item.title.clone(),
                    to: self.tasks[position].title.clone(),
                    id,
                });
                // The document holds the newer title, whatever the policy.
                self.reconcile_pair(position, item, TitlePolicy::Push)?;
                continue;
            }

            self.delete_item(&id)?;
            self.index.delete(self.list, &fingerprint);
            self.record(SyncAction::Deleted {
                title: item.title.clone(),
                id,
            });
        }
        Ok(pending)
    }

    fn create_pending(&mut self, pending: &[usize]) -> StoreResult<()> {
        self.phase = "create";
        for &position in pending {
            let task = self.tasks[position].clone();
            let draft = ItemDraft {
                title: task.title.clone(),
                notes: task.notes_text().to_string(),
                completed: task.completed,
            };
            let id = self.create_item(&draft)?;
            self.index.set(
                self.list,
                &task.fingerprint,
                &id,
                Some(content_hash(task.notes_text())),
            );
            self.claimed.insert(id.clone());
            self.record(SyncAction::Created {
                title: task.title,
                id,
            });
        }
        Ok(())
    }

    fn import_unmapped(&mut self) -> StoreResult<()> {
        self.phase = "import";
        let items = self
            .store
            .fetch_all_items(self.list, self.options.include_completed)?;
        let mut lines = Vec::new();
        let mut retitles = Vec::new();
        for item in items {
            if self.claimed.contains(&item.id)
                || self.index.find_by_external_id(self.list, &item.id).is_some()
            {
                continue;
            }
            let title = single_line(&item.title);
            let plain = plain_title(&title);
            if plain.is_empty() {
                continue;
            }
            let description = imported_description(&item.notes);
            let fingerprint = fingerprint(self.list, &title, description.as_deref());
            if self.index.get(self.list, &fingerprint).is_some() {
                warn!(list = self.list, id = %item.id, title = %title, "item duplicates a mapped task; not imported");
                continue;
            }
            lines.extend(compose_task_lines(
                &title,
                item.completed,
                description.as_deref(),
            ));
            self.index.set(
                self.list,
                &fingerprint,
                &item.id,
                Some(content_hash(description.as_deref().unwrap_or(""))),
            );
            self.claimed.insert(item.id.clone());
            self.record(SyncAction::Imported {
                title,
                id: item.id.clone(),
            });
            // The line reads back as its plain text; the item has to match it.
            if plain != item.title {
                retitles.push((item.id, item.title, plain));
            }
        }
        if !lines.is_empty() {
            self.outcome.patches.push(DocumentPatch::Append { lines });
        }

        for (id, from, to) in retitles {
            let patch = ItemPatch {
                title: Some(to.clone()),
                ..ItemPatch::default()
            };
            self.update_item(&id, &patch)?;
            self.record(SyncAction::TitlePushed { from, to, id });
        }
        Ok(())
    }

    fn fetch_items(&mut self, ids: &[String]) -> StoreResult<HashMap<String, ExternalItem>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self
            .store
            .fetch_by_ids(self.list, ids)?
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect())
    }

    fn create_item(&mut self, draft: &ItemDraft) -> StoreResult<String> {
        if self.options.dry_run {
            self.placeholders += 1;
            return Ok(format!("dry-run:{}", self.placeholders));
        }
        self.store.create(self.list, draft)
    }

    fn update_item(&mut self, id: &str, patch: &ItemPatch) -> StoreResult<()> {
        if self.options.dry_run {
            return Ok(());
        }
        self.store.update(self.list, id, patch)
    }

    fn delete_item(&mut self, id: &str) -> StoreResult<()> {
        if self.options.dry_run {
            return Ok(());
        }
        self.store.delete(self.list, id)
    }
}

fn distinct<'s>(values: impl Iterator<Item = &'s String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .filter(|value| seen.insert(value.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{apply_patches, extract_tasks};
    use crate::models::ExternalHeader;
    use crate::store::local::LocalStore;
    use std::time::Duration;

    const LIST: &str = "Inbox";

    fn sync(
        doc: &str,
        index: &mut SyncIndex,
        store: &mut dyn ExternalStore,
        options: &SyncOptions,
    ) -> (SyncOutcome, String) {
        let tasks = extract_tasks(LIST, doc);
        let outcome = reconcile(LIST, &tasks, index, store, options).expect("reconcile");
        let patched = apply_patches(doc, &outcome.patches);
        (outcome, patched)
    }

    fn map_existing(
        store: &mut LocalStore,
        index: &mut SyncIndex,
        title: &str,
        completed: bool,
    ) -> String {
        let id = store.insert_external(LIST, title, "", completed);
        index.set(
            LIST,
            &fingerprint(LIST, title, None),
            &id,
            Some(content_hash("")),
        );
        id
    }

    #[test]
    fn new_task_creates_one_item_and_index_entry() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();

        let (outcome, patched) = sync(
            "- [ ] Buy milk\n",
            &mut index,
            &mut store,
            &SyncOptions::default(),
        );

        let items = store.items(LIST);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Buy milk");
        assert!(!items[0].completed);
        let entry = index
            .get(LIST, &fingerprint(LIST, "Buy milk", None))
            .expect("index entry");
        assert_eq!(entry.external_id, items[0].id);
        assert_eq!(outcome.report.created, 1);
        assert_eq!(patched, "- [ ] Buy milk\n");
    }

    #[test]
    fn document_completion_is_pushed() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let id = map_existing(&mut store, &mut index, "Pay rent", false);

        let doc = "- [x] Pay rent\n";
        let (outcome, patched) = sync(doc, &mut index, &mut store, &SyncOptions::default());

        assert!(store.items(LIST)[0].completed);
        assert_eq!(patched, doc);
        assert_eq!(
            outcome.actions,
            vec![SyncAction::CompletedExternal {
                title: "Pay rent".to_string(),
                id,
            }]
        );
    }

    #[test]
    fn external_completion_checks_the_document() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        map_existing(&mut store, &mut index, "Call dentist", true);

        let (outcome, patched) = sync(
            "# Errands\n- [ ] Call dentist\n- [ ] Buy stamps\n",
            &mut index,
            &mut store,
            &SyncOptions::default(),
        );

        assert_eq!(patched, "# Errands\n- [x] Call dentist\n- [ ] Buy stamps\n");
        assert_eq!(outcome.report.completed_document, 1);
        assert!(store.items(LIST).iter().any(|item| item.title == "Call dentist" && item.completed));
    }

    #[test]
    fn completion_is_never_reverted() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let id = map_existing(&mut store, &mut index, "Water plants", true);

        // Unchecking in the document does not reopen the item; the box is checked again.
        let (_, patched) = sync(
            "- [ ] Water plants\n",
            &mut index,
            &mut store,
            &SyncOptions::default(),
        );
        assert_eq!(patched, "- [x] Water plants\n");
        assert!(store.item_mut(LIST, &id).expect("item").completed);
    }

    #[test]
    fn prefix_rename_relinks_instead_of_recreating() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions::default();
        sync("- [ ] Draft\n", &mut index, &mut store, &options);
        let id = store.items(LIST)[0].id.clone();

        let (outcome, _) = sync("- [ ] Draft v2\n", &mut index, &mut store, &options);

        let items = store.items(LIST);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].title, "Draft v2");
        assert_eq!(outcome.report.relinked, 1);
        assert_eq!(outcome.report.created, 0);
        assert_eq!(outcome.report.deleted, 0);
        assert!(index.get(LIST, &fingerprint(LIST, "Draft", None)).is_none());
        assert_eq!(
            index
                .get(LIST, &fingerprint(LIST, "Draft v2", None))
                .map(|entry| entry.external_id.as_str()),
            Some(id.as_str())
        );
    }

    #[test]
    fn ambiguous_rename_falls_back_to_delete_and_create() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions::default();
        sync("- [ ] Draft\n", &mut index, &mut store, &options);

        let (outcome, _) = sync(
            "- [ ] Draft v2\n- [ ] Draft v3\n",
            &mut index,
            &mut store,
            &options,
        );

        assert_eq!(outcome.report.relinked, 0);
        assert_eq!(outcome.report.deleted, 1);
        assert_eq!(outcome.report.created, 2);
        assert_eq!(store.items(LIST).len(), 2);
    }

    #[test]
    fn unrelated_rename_deletes_and_creates_once() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions::default();
        sync("- [ ] Buy milk\n", &mut index, &mut store, &options);

        let (outcome, _) = sync("- [ ] Get oat drink\n", &mut index, &mut store, &options);

        assert_eq!(outcome.report.deleted, 1);
        assert_eq!(outcome.report.created, 1);
        let items = store.items(LIST);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Get oat drink");
    }

    #[test]
    fn dry_run_plans_without_touching_the_store() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let removed = map_existing(&mut store, &mut index, "Old chore", false);
        map_existing(&mut store, &mut index, "Laundry", true);
        let before = store.items(LIST).to_vec();

        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let (outcome, _) = sync(
            "- [ ] Laundry\n- [ ] Fix bike\n",
            &mut index,
            &mut store,
            &options,
        );

        assert_eq!(store.items(LIST), before.as_slice());
        assert!(outcome.has_changes());
        assert!(outcome.actions.contains(&SyncAction::Deleted {
            title: "Old chore".to_string(),
            id: removed,
        }));
        assert!(outcome.actions.contains(&SyncAction::Created {
            title: "Fix bike".to_string(),
            id: "dry-run:1".to_string(),
        }));
        assert_eq!(
            outcome.patches,
            vec![DocumentPatch::SetChecked {
                line: 1,
                checked: true
            }]
        );
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions {
            import_unmapped: true,
            ..SyncOptions::default()
        };
        store.insert_external(LIST, "Renew passport", "photo booth\n\n- bring old one", false);
        let doc = "# Week\n\
                   - [ ] Buy milk\n  2 liters\n\
                   - [x] Pay rent\n\
                   * [ ] **Call** [dentist](https://example.com)\n\
                   1. [ ] Book flights\n";

        let (first, patched) = sync(doc, &mut index, &mut store, &options);
        assert_eq!(first.report.created, 4);
        assert_eq!(first.report.imported, 1);

        let (second, again) = sync(&patched, &mut index, &mut store, &options);
        assert!(!second.has_changes(), "unexpected actions: {:?}", second.actions);
        assert_eq!(again, patched);
        assert_eq!(store.items(LIST).len(), 5);
    }

    #[test]
    fn unmapped_items_are_never_deleted() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        store.insert_external(LIST, "Added on phone", "", false);

        let (outcome, _) = sync(
            "- [ ] Something else\n",
            &mut index,
            &mut store,
            &SyncOptions {
                title_match_limit: 0,
                ..SyncOptions::default()
            },
        );

        assert_eq!(outcome.report.deleted, 0);
        assert!(store.items(LIST).iter().any(|item| item.title == "Added on phone"));
    }

    #[test]
    fn description_edit_keeps_the_same_item() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions::default();
        sync("- [ ] Buy milk\n  2 liters\n", &mut index, &mut store, &options);
        let id = store.items(LIST)[0].id.clone();

        let (outcome, _) = sync("- [ ] Buy milk\n  3 liters\n", &mut index, &mut store, &options);

        let items = store.items(LIST);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].notes, "3 liters");
        assert_eq!(outcome.report.deleted, 0);
        assert_eq!(outcome.report.created, 0);
        assert_eq!(index.len(LIST), 1);

        let (third, _) = sync("- [ ] Buy milk\n  3 liters\n", &mut index, &mut store, &options);
        assert!(!third.has_changes());
    }

    #[test]
    fn externally_deleted_item_is_recreated_once() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions::default();
        sync("- [ ] Buy milk\n", &mut index, &mut store, &options);
        let id = store.items(LIST)[0].id.clone();
        store.remove_external(LIST, &id);

        let (outcome, _) = sync("- [ ] Buy milk\n", &mut index, &mut store, &options);

        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(outcome.report.created, 1);
        assert_eq!(store.items(LIST).len(), 1);
    }

    #[test]
    fn legacy_markers_are_migrated_into_the_index() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let legacy = fingerprint(LIST, "Water plants", None);
        let id = store.insert_external(
            LIST,
            "Water plants",
            &format!("[todolist-md:{legacy}]"),
            false,
        );

        let (outcome, _) = sync(
            "- [ ] Water plants\n",
            &mut index,
            &mut store,
            &SyncOptions {
                title_match_limit: 0,
                ..SyncOptions::default()
            },
        );

        assert_eq!(outcome.migrated, 1);
        assert_eq!(outcome.report.created, 0);
        assert_eq!(
            index.get(LIST, &legacy).map(|entry| entry.external_id.as_str()),
            Some(id.as_str())
        );
        // The marker is replaced by the task's (empty) description.
        assert_eq!(store.items(LIST)[0].notes, "");
    }

    #[test]
    fn standalone_migration_only_touches_the_index() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let legacy = fingerprint(LIST, "Stretch", None);
        store.insert_external(LIST, "Stretch", &format!("[todolist-md:{legacy}]"), false);
        store.insert_external(LIST, "Unmarked", "", false);

        let outcome = migrate_legacy(LIST, &mut index, &mut store, &SyncOptions::default())
            .expect("migrate");

        assert_eq!(outcome.migrated, 1);
        assert!(!outcome.has_changes());
        assert_eq!(index.len(LIST), 1);
        assert_eq!(store.items(LIST).len(), 2);
    }

    #[test]
    fn reindex_maps_by_exact_title() {
        let mut store = LocalStore::in_memory();
        let id = store.insert_external(LIST, "Walk dog", "", false);
        let doc = "- [ ] Walk dog\n";
        let no_title_match = SyncOptions {
            title_match_limit: 0,
            ..SyncOptions::default()
        };

        let mut index = SyncIndex::default();
        let (outcome, _) = sync(
            doc,
            &mut index,
            &mut store,
            &SyncOptions {
                reindex: true,
                ..no_title_match.clone()
            },
        );
        assert_eq!(outcome.report.created, 0);
        assert_eq!(
            index
                .get(LIST, &fingerprint(LIST, "Walk dog", None))
                .map(|entry| entry.external_id.as_str()),
            Some(id.as_str())
        );

        let mut fresh = SyncIndex::default();
        let (outcome, _) = sync(doc, &mut fresh, &mut store, &no_title_match);
        assert_eq!(outcome.report.created, 1);
    }

    #[test]
    fn title_match_adopts_one_item_per_task() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        store.insert_external(LIST, "Stretch", "", false);

        let (outcome, _) = sync(
            "- [ ] Stretch\n\n## Evening\n- [ ] Stretch\n  before bed\n",
            &mut index,
            &mut store,
            &SyncOptions::default(),
        );

        assert_eq!(outcome.report.created, 1);
        assert_eq!(store.items(LIST).len(), 2);
        assert_eq!(index.len(LIST), 2);
    }

    #[test]
    fn import_appends_unmapped_items() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        store.insert_external(LIST, "Pick up parcel", "locker 12\n", false);
        store.insert_external(LIST, "Already done", "", true);

        let (outcome, patched) = sync(
            "- [ ] Existing",
            &mut index,
            &mut store,
            &SyncOptions {
                import_unmapped: true,
                ..SyncOptions::default()
            },
        );

        assert_eq!(outcome.report.imported, 1);
        assert_eq!(patched, "- [ ] Existing\n- [ ] Pick up parcel\n  locker 12\n");
        let imported = extract_tasks(LIST, &patched);
        assert!(index.get(LIST, &imported[1].fingerprint).is_some());
    }

    #[test]
    fn pull_policy_rewrites_the_document_title() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let id = map_existing(&mut store, &mut index, "Old name", false);
        store.item_mut(LIST, &id).expect("item").title = "New name".to_string();
        let options = SyncOptions {
            title_policy: TitlePolicy::Pull,
            ..SyncOptions::default()
        };

        let (_, patched) = sync("- [ ] Old name\n", &mut index, &mut store, &options);

        assert_eq!(patched, "- [ ] New name\n");
        assert!(index.get(LIST, &fingerprint(LIST, "Old name", None)).is_none());
        assert!(index.get(LIST, &fingerprint(LIST, "New name", None)).is_some());
        let (again, _) = sync(&patched, &mut index, &mut store, &options);
        assert!(!again.has_changes());
    }

    #[test]
    fn relink_keeps_the_document_title_under_pull_policy() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions {
            title_policy: TitlePolicy::Pull,
            ..SyncOptions::default()
        };
        sync("- [ ] Draft\n", &mut index, &mut store, &options);
        let id = store.items(LIST)[0].id.clone();

        let (outcome, patched) = sync("- [ ] Draft v2\n", &mut index, &mut store, &options);

        assert_eq!(patched, "- [ ] Draft v2\n");
        assert_eq!(outcome.report.relinked, 1);
        assert!(
            !outcome
                .actions
                .iter()
                .any(|action| matches!(action, SyncAction::TitlePulled { .. }))
        );
        let items = store.items(LIST);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].title, "Draft v2");
        assert!(index.get(LIST, &fingerprint(LIST, "Draft v2", None)).is_some());

        let (again, _) = sync(&patched, &mut index, &mut store, &options);
        assert!(!again.has_changes(), "unexpected actions: {:?}", again.actions);
    }

    #[test]
    fn imported_formatted_titles_stay_settled() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        store.insert_external(LIST, "Email `bob`", "", false);
        store.insert_external(LIST, "Buy  milk", "", false);
        let options = SyncOptions {
            import_unmapped: true,
            ..SyncOptions::default()
        };

        let (first, patched) = sync("# Inbox\n", &mut index, &mut store, &options);

        assert_eq!(first.report.imported, 2);
        assert!(patched.contains("- [ ] Email `bob`\n"));
        assert!(patched.contains("- [ ] Buy milk\n"));
        let mut titles: Vec<&str> = store
            .items(LIST)
            .iter()
            .map(|item| item.title.as_str())
            .collect();
        titles.sort_unstable();
        assert_eq!(titles, vec!["Buy milk", "Email bob"]);

        let (second, again) = sync(&patched, &mut index, &mut store, &options);
        assert!(!second.has_changes(), "unexpected actions: {:?}", second.actions);
        assert_eq!(again, patched);
    }

    #[test]
    fn removed_task_with_vanished_item_only_drops_the_entry() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let options = SyncOptions::default();
        sync("- [ ] Buy milk\n", &mut index, &mut store, &options);
        let id = store.items(LIST)[0].id.clone();
        store.remove_external(LIST, &id);

        let (outcome, _) = sync("# Nothing left\n", &mut index, &mut store, &options);

        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(outcome.report.deleted, 0);
        assert_eq!(outcome.report.created, 0);
        assert_eq!(
            outcome.actions,
            vec![SyncAction::StaleDropped {
                fingerprint: fingerprint(LIST, "Buy milk", None),
                id,
            }]
        );
        assert_eq!(index.len(LIST), 0);
        assert!(store.items(LIST).is_empty());
    }

    #[test]
    fn pulled_title_records_the_rekey() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let id = map_existing(&mut store, &mut index, "Old name", false);
        store.item_mut(LIST, &id).expect("item").title = "New name".to_string();
        let options = SyncOptions {
            title_policy: TitlePolicy::Pull,
            ..SyncOptions::default()
        };

        let (outcome, _) = sync("- [ ] Old name\n", &mut index, &mut store, &options);

        assert_eq!(
            outcome.rekeys,
            vec![(
                fingerprint(LIST, "Old name", None),
                fingerprint(LIST, "New name", None)
            )]
        );
    }

    #[test]
    fn push_policy_restores_the_store_title() {
        let mut store = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        let id = map_existing(&mut store, &mut index, "Old name", false);
        store.item_mut(LIST, &id).expect("item").title = "New name".to_string();

        let (outcome, patched) = sync(
            "- [ ] Old name\n",
            &mut index,
            &mut store,
            &SyncOptions::default(),
        );

        assert_eq!(patched, "- [ ] Old name\n");
        assert_eq!(store.items(LIST)[0].title, "Old name");
        assert_eq!(outcome.report.updated, 1);
    }

    /// Delegates to a local store but times out on every create.
    struct FailingCreates(LocalStore);

    impl ExternalStore for FailingCreates {
        fn fetch_by_ids(&mut self, list: &str, ids: &[String]) -> StoreResult<Vec<ExternalItem>> {
            self.0.fetch_by_ids(list, ids)
        }

        fn fetch_by_exact_titles(
            &mut self,
            list: &str,
            titles: &[String],
            include_completed: bool,
        ) -> StoreResult<Vec<ExternalHeader>> {
            self.0.fetch_by_exact_titles(list, titles, include_completed)
        }

        fn fetch_legacy_marked(&mut self, list: &str) -> StoreResult<Vec<ExternalItem>> {
            self.0.fetch_legacy_marked(list)
        }

        fn fetch_all_headers(
            &mut self,
            list: &str,
            include_completed: bool,
        ) -> StoreResult<Vec<ExternalHeader>> {
            self.0.fetch_all_headers(list, include_completed)
        }

        fn fetch_all_items(
            &mut self,
            list: &str,
            include_completed: bool,
        ) -> StoreResult<Vec<ExternalItem>> {
            self.0.fetch_all_items(list, include_completed)
        }

        fn create(&mut self, _list: &str, _draft: &ItemDraft) -> StoreResult<String> {
            Err(StoreError::Timeout {
                op: "create".to_string(),
                after: Duration::from_secs(40),
            })
        }

        fn update(&mut self, list: &str, id: &str, patch: &ItemPatch) -> StoreResult<()> {
            self.0.update(list, id, patch)
        }

        fn delete(&mut self, list: &str, id: &str) -> StoreResult<()> {
            self.0.delete(list, id)
        }
    }

    #[test]
    fn store_failure_keeps_earlier_progress() {
        let mut inner = LocalStore::in_memory();
        let mut index = SyncIndex::default();
        map_existing(&mut inner, &mut index, "Call dentist", true);
        let mut store = FailingCreates(inner);

        let tasks = extract_tasks(LIST, "- [ ] Call dentist\n- [ ] New thing\n");
        let err = reconcile(LIST, &tasks, &mut index, &mut store, &SyncOptions::default())
            .expect_err("create fails");

        assert!(err.source.is_timeout());
        assert_eq!(
            err.partial.patches,
            vec![DocumentPatch::SetChecked {
                line: 1,
                checked: true
            }]
        );
        assert_eq!(index.len(LIST), 1);
    }
}
