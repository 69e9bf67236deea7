use serde::Serialize;

/// One decision taken (or, in a dry run, planned) while reconciling a list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncAction {
    Migrated { fingerprint: String, id: String },
    Reindexed { title: String, id: String },
    Adopted { title: String, id: String },
    StaleDropped { fingerprint: String, id: String },
    Superseded { fingerprint: String, id: String },
    CompletedExternal { title: String, id: String },
    CompletedDocument { title: String, line: usize },
    TitlePushed { from: String, to: String, id: String },
    TitlePulled { from: String, to: String, line: usize },
    NotesPushed { title: String, id: String },
    Relinked { from: String, to: String, id: String },
    Deleted { title: String, id: String },
    Created { title: String, id: String },
    Imported { title: String, id: String },
}

impl SyncAction {
    /// Whether this action writes to the external store.
    pub fn touches_store(&self) -> bool {
        matches!(
            self,
            SyncAction::CompletedExternal { .. }
                | SyncAction::TitlePushed { .. }
                | SyncAction::NotesPushed { .. }
                | SyncAction::Deleted { .. }
                | SyncAction::Created { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            SyncAction::Migrated { fingerprint, id } => {
                format!("migrate legacy marker {} -> {id}", short(fingerprint))
            }
            SyncAction::Reindexed { title, id } => format!("reindex \"{title}\" -> {id}"),
            SyncAction::Adopted { title, id } => format!("adopt \"{title}\" -> {id}"),
            SyncAction::StaleDropped { fingerprint, id } => {
                format!("drop stale entry {} ({id} is gone)", short(fingerprint))
            }
            SyncAction::Superseded { fingerprint, id } => {
                format!("drop entry {} ({id} is mapped by a live task)", short(fingerprint))
            }
            SyncAction::CompletedExternal { title, id } => {
                format!("complete \"{title}\" in store ({id})")
            }
            SyncAction::CompletedDocument { title, line } => {
                format!("check \"{title}\" in document (line {line})")
            }
            SyncAction::TitlePushed { from, to, id } => {
                format!("rename \"{from}\" -> \"{to}\" in store ({id})")
            }
            SyncAction::TitlePulled { from, to, line } => {
                format!("rename \"{from}\" -> \"{to}\" in document (line {line})")
            }
            SyncAction::NotesPushed { title, id } => format!("update notes of \"{title}\" ({id})"),
            SyncAction::Relinked { from, to, id } => {
                format!("relink \"{from}\" -> \"{to}\" ({id})")
            }
            SyncAction::Deleted { title, id } => format!("delete \"{title}\" ({id})"),
            SyncAction::Created { title, id } => format!("create \"{title}\" ({id})"),
            SyncAction::Imported { title, id } => format!("import \"{title}\" ({id})"),
        }
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub completed_external: usize,
    pub completed_document: usize,
    pub relinked: usize,
    pub deleted: usize,
    pub imported: usize,
    pub migrated: usize,
    pub dropped: usize,
}

impl SyncReport {
    pub fn record(&mut self, action: &SyncAction) {
        match action {
            SyncAction::Migrated { .. } => self.migrated += 1,
            SyncAction::StaleDropped { .. } | SyncAction::Superseded { .. } => self.dropped += 1,
            SyncAction::CompletedExternal { .. } => self.completed_external += 1,
            SyncAction::CompletedDocument { .. } => self.completed_document += 1,
            SyncAction::Relinked { .. } => self.relinked += 1,
            SyncAction::Deleted { .. } => self.deleted += 1,
            SyncAction::Created { .. } => self.created += 1,
            SyncAction::Imported { .. } => self.imported += 1,
            SyncAction::TitlePushed { .. }
            | SyncAction::TitlePulled { .. }
            | SyncAction::NotesPushed { .. } => self.updated += 1,
            SyncAction::Reindexed { .. } | SyncAction::Adopted { .. } => {}
        }
    }

    pub fn merge(&mut self, other: &SyncReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.completed_external += other.completed_external;
        self.completed_document += other.completed_document;
        self.relinked += other.relinked;
        self.deleted += other.deleted;
        self.imported += other.imported;
        self.migrated += other.migrated;
        self.dropped += other.dropped;
    }

    pub fn summary(&self) -> String {
        format!(
            "+{} ~{} done {}/{} relinked {} -{} <-{} | migrated {} dropped {}",
            self.created,
            self.updated,
            self.completed_external,
            self.completed_document,
            self.relinked,
            self.deleted,
            self.imported,
            self.migrated,
            self.dropped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_counts_by_kind() {
        let mut report = SyncReport::default();
        for action in [
            SyncAction::Created {
                title: "A".to_string(),
                id: "1".to_string(),
            },
            SyncAction::NotesPushed {
                title: "A".to_string(),
                id: "1".to_string(),
            },
            SyncAction::Adopted {
                title: "B".to_string(),
                id: "2".to_string(),
            },
        ] {
            report.record(&action);
        }
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.summary(), "+1 ~1 done 0/0 relinked 0 -0 <-0 | migrated 0 dropped 0");
    }

    #[test]
    fn actions_serialize_with_tag() {
        let action = SyncAction::CompletedDocument {
            title: "Call dentist".to_string(),
            line: 3,
        };
        let json = serde_json::to_value(&action).expect("serialize");
        assert_eq!(json["action"], "completed_document");
        assert_eq!(json["line"], 3);
    }
}
