use serde::{Deserialize, Serialize};

/// One checklist entry extracted from a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    pub fingerprint: String,
    /// Plain title, markdown formatting stripped.
    pub title: String,
    /// Title exactly as written after the checkbox.
    pub raw_title: String,
    pub completed: bool,
    pub notes: Option<String>,
    /// 1-based line of the checkbox in the source document.
    pub source_line: usize,
}

impl TaskRecord {
    pub fn notes_text(&self) -> &str {
        self.notes.as_deref().unwrap_or("")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub id: String,
    pub title: String,
    pub completed: bool,
    #[serde(default)]
    pub notes: String,
}

impl ExternalItem {
    pub fn header(&self) -> ExternalHeader {
        ExternalHeader {
            id: self.id.clone(),
            title: self.title.clone(),
            completed: self.completed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalHeader {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ItemDraft {
    pub title: String,
    pub notes: String,
    pub completed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.notes.is_none() && self.completed.is_none()
    }
}
