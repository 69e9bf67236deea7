use super::{ExternalStore, StoreError, StoreResult, has_legacy_marker};
use crate::models::{ExternalHeader, ExternalItem, ItemDraft, ItemPatch};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
struct LocalState {
    #[serde(default)]
    lists: BTreeMap<String, Vec<ExternalItem>>,
}

/// Reminder lists kept in a JSON file. Without a path the store lives only in memory.
#[derive(Debug, Default)]
pub struct LocalStore {
    path: Option<PathBuf>,
    state: LocalState,
}

impl LocalStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                StoreError::Decode(format!("{}: {e}", path.display()))
            })?
        } else {
            LocalState::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state,
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn items(&self, list: &str) -> &[ExternalItem] {
        self.state
            .lists
            .get(list)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Inserts an item directly, the way an edit made in the reminders app would.
    pub fn insert_external(&mut self, list: &str, title: &str, notes: &str, completed: bool) -> String {
        let id = generate_id();
        self.state
            .lists
            .entry(list.to_string())
            .or_default()
            .push(ExternalItem {
                id: id.clone(),
                title: title.to_string(),
                completed,
                notes: notes.to_string(),
            });
        id
    }

    pub fn item_mut(&mut self, list: &str, id: &str) -> Option<&mut ExternalItem> {
        self.state
            .lists
            .get_mut(list)?
            .iter_mut()
            .find(|item| item.id == id)
    }

    pub fn remove_external(&mut self, list: &str, id: &str) -> bool {
        let Some(items) = self.state.lists.get_mut(list) else {
            return false;
        };
        let before = items.len();
        items.retain(|item| item.id != id);
        items.len() != before
    }

    fn persist(&self) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.state)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    fn visible(&self, list: &str, include_completed: bool) -> impl Iterator<Item = &ExternalItem> {
        self.items(list)
            .iter()
            .filter(move |item| include_completed || !item.completed)
    }
}

impl ExternalStore for LocalStore {
    fn fetch_by_ids(&mut self, list: &str, ids: &[String]) -> StoreResult<Vec<ExternalItem>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .items(list)
            .iter()
            .filter(|item| wanted.contains(item.id.as_str()))
            .cloned()
            .collect())
    }

    fn fetch_by_exact_titles(
        &mut self,
        list: &str,
        titles: &[String],
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>> {
        let wanted: HashSet<&str> = titles.iter().map(String::as_str).collect();
        Ok(self
            .visible(list, include_completed)
            .filter(|item| wanted.contains(item.title.as_str()))
            .map(ExternalItem::header)
            .collect())
    }

    fn fetch_legacy_marked(&mut self, list: &str) -> StoreResult<Vec<ExternalItem>> {
        Ok(self
            .items(list)
            .iter()
            .filter(|item| has_legacy_marker(&item.notes))
            .cloned()
            .collect())
    }

    fn fetch_all_headers(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>> {
        Ok(self
            .visible(list, include_completed)
            .map(ExternalItem::header)
            .collect())
    }

    fn fetch_all_items(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalItem>> {
        Ok(self.visible(list, include_completed).cloned().collect())
    }

    fn create(&mut self, list: &str, draft: &ItemDraft) -> StoreResult<String> {
        let id = self.insert_external(list, &draft.title, &draft.notes, draft.completed);
        self.persist()?;
        Ok(id)
    }

    fn update(&mut self, list: &str, id: &str, patch: &ItemPatch) -> StoreResult<()> {
        let Some(item) = self.item_mut(list, id) else {
            return Err(StoreError::Request(format!("no item {id} in list {list}")));
        };
        if let Some(title) = &patch.title {
            item.title = title.clone();
        }
        if let Some(notes) = &patch.notes {
            item.notes = notes.clone();
        }
        if let Some(completed) = patch.completed {
            item.completed = completed;
        }
        self.persist()
    }

    fn delete(&mut self, list: &str, id: &str) -> StoreResult<()> {
        self.remove_external(list, id);
        self.persist()
    }
}

fn generate_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("local-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_update_delete_persist_to_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("store.json");

        let mut store = LocalStore::open(&path).expect("open store");
        let id = store
            .create(
                "Work",
                &ItemDraft {
                    title: "Write report".to_string(),
                    notes: String::new(),
                    completed: false,
                },
            )
            .expect("create");
        store
            .update(
                "Work",
                &id,
                &ItemPatch {
                    completed: Some(true),
                    ..ItemPatch::default()
                },
            )
            .expect("update");

        let mut reopened = LocalStore::open(&path).expect("reopen store");
        let items = reopened.fetch_by_ids("Work", &[id.clone()]).expect("fetch");
        assert_eq!(items.len(), 1);
        assert!(items[0].completed);

        reopened.delete("Work", &id).expect("delete");
        assert!(LocalStore::open(&path).expect("reopen").items("Work").is_empty());
    }

    #[test]
    fn title_and_header_queries_respect_completion_filter() {
        let mut store = LocalStore::in_memory();
        store.insert_external("L", "Open", "", false);
        store.insert_external("L", "Done", "", true);
        store.insert_external("Other", "Open", "", false);

        let open = store
            .fetch_by_exact_titles("L", &["Open".to_string(), "Done".to_string()], false)
            .expect("titles");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].title, "Open");

        assert_eq!(store.fetch_all_headers("L", true).expect("headers").len(), 2);
        assert_eq!(store.fetch_all_items("L", false).expect("items").len(), 1);
    }

    #[test]
    fn update_of_missing_item_fails() {
        let mut store = LocalStore::in_memory();
        let result = store.update("L", "nope", &ItemPatch::default());
        assert!(matches!(result, Err(StoreError::Request(_))));
    }
}
