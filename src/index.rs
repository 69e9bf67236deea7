use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

pub const INDEX_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub external_id: String,
    pub last_content_hash: Option<String>,
}

/// On-disk entry. Older files stored the bare external id.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Full {
        uuid: String,
        #[serde(rename = "lastBodyHash", default, skip_serializing_if = "Option::is_none")]
        last_body_hash: Option<String>,
    },
    Bare(String),
}

impl From<StoredEntry> for IndexEntry {
    fn from(stored: StoredEntry) -> Self {
        match stored {
            StoredEntry::Full {
                uuid,
                last_body_hash,
            } => IndexEntry {
                external_id: uuid,
                last_content_hash: last_body_hash,
            },
            StoredEntry::Bare(uuid) => IndexEntry {
                external_id: uuid,
                last_content_hash: None,
            },
        }
    }
}

impl From<&IndexEntry> for StoredEntry {
    fn from(entry: &IndexEntry) -> Self {
        StoredEntry::Full {
            uuid: entry.external_id.clone(),
            last_body_hash: entry.last_content_hash.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredIndex {
    version: u32,
    #[serde(default)]
    lists: BTreeMap<String, BTreeMap<String, StoredEntry>>,
}

/// Per-list fingerprint → external id table, persisted between runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncIndex {
    lists: BTreeMap<String, BTreeMap<String, IndexEntry>>,
}

impl SyncIndex {
    /// Reads the index at `path`. A missing or unreadable file yields an empty index.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read sync index; starting empty");
                return Self::default();
            }
        };
        match Self::from_json(&content) {
            Some(index) => index,
            None => {
                warn!(path = %path.display(), "sync index is corrupt; starting empty");
                Self::default()
            }
        }
    }

    fn from_json(content: &str) -> Option<Self> {
        let stored: StoredIndex = serde_json::from_str(content).ok()?;
        if stored.version != INDEX_VERSION {
            return None;
        }
        let lists = stored
            .lists
            .into_iter()
            .map(|(list, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|(fingerprint, entry)| (fingerprint, IndexEntry::from(entry)))
                    .collect();
                (list, entries)
            })
            .collect();
        Some(Self { lists })
    }

    pub fn to_json(&self) -> String {
        let stored = StoredIndex {
            version: INDEX_VERSION,
            lists: self
                .lists
                .iter()
                .map(|(list, entries)| {
                    let entries = entries
                        .iter()
                        .map(|(fingerprint, entry)| (fingerprint.clone(), StoredEntry::from(entry)))
                        .collect();
                    (list.clone(), entries)
                })
                .collect(),
        };
        serde_json::to_string_pretty(&stored).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, self.to_json())?;
        fs::rename(&tmp, path)
    }

    pub fn get(&self, list: &str, fingerprint: &str) -> Option<&IndexEntry> {
        self.lists.get(list)?.get(fingerprint)
    }

    pub fn set(
        &mut self,
        list: &str,
        fingerprint: &str,
        external_id: &str,
        content_hash: Option<String>,
    ) {
        self.lists.entry(list.to_string()).or_default().insert(
            fingerprint.to_string(),
            IndexEntry {
                external_id: external_id.to_string(),
                last_content_hash: content_hash,
            },
        );
    }

    pub fn set_content_hash(&mut self, list: &str, fingerprint: &str, content_hash: String) {
        if let Some(entry) = self
            .lists
            .get_mut(list)
            .and_then(|entries| entries.get_mut(fingerprint))
        {
            entry.last_content_hash = Some(content_hash);
        }
    }

    pub fn delete(&mut self, list: &str, fingerprint: &str) -> Option<IndexEntry> {
        let entries = self.lists.get_mut(list)?;
        let removed = entries.remove(fingerprint);
        if entries.is_empty() {
            self.lists.remove(list);
        }
        removed
    }

    /// Moves an entry to a new fingerprint, replacing whatever was there.
    pub fn rekey(&mut self, list: &str, old_fingerprint: &str, new_fingerprint: &str) -> bool {
        if old_fingerprint == new_fingerprint {
            return self.get(list, old_fingerprint).is_some();
        }
        let Some(entry) = self.delete(list, old_fingerprint) else {
            return false;
        };
        self.lists
            .entry(list.to_string())
            .or_default()
            .insert(new_fingerprint.to_string(), entry);
        true
    }

    /// Entries of one list in fingerprint order.
    pub fn entries(&self, list: &str) -> Vec<(String, IndexEntry)> {
        self.lists
            .get(list)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(fingerprint, entry)| (fingerprint.clone(), entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_by_external_id(&self, list: &str, external_id: &str) -> Option<&str> {
        self.lists.get(list)?.iter().find_map(|(fingerprint, entry)| {
            (entry.external_id == external_id).then_some(fingerprint.as_str())
        })
    }

    pub fn list_names(&self) -> Vec<String> {
        self.lists.keys().cloned().collect()
    }

    pub fn len(&self, list: &str) -> usize {
        self.lists.get(list).map(BTreeMap::len).unwrap_or(0)
    }
}
