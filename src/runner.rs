use crate::config::{Config, TargetConfig};
use crate::document::{DocumentFile, FsDocument, apply_patches, extract_tasks};
use crate::index::SyncIndex;
use crate::store::{ExternalStore, StoreError};
use crate::sync::{self, Interrupted, SyncAction, SyncOptions, SyncOutcome, SyncReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("list {list}: {source}")]
    Store { list: String, source: StoreError },
    #[error("document {}: {source}", .path.display())]
    Document { path: PathBuf, source: io::Error },
    #[error("index {}: {source}", .path.display())]
    Index { path: PathBuf, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One document paired with the list it mirrors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub file: PathBuf,
    pub list: String,
    pub import_unmapped: Option<bool>,
    pub include_completed: Option<bool>,
}

impl Target {
    pub fn new(file: impl Into<PathBuf>, list: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            list: list.into(),
            import_unmapped: None,
            include_completed: None,
        }
    }

    fn options(&self, base: &SyncOptions) -> SyncOptions {
        let mut options = base.clone();
        if let Some(import_unmapped) = self.import_unmapped {
            options.import_unmapped = import_unmapped;
        }
        if let Some(include_completed) = self.include_completed {
            options.include_completed = include_completed;
        }
        options
    }
}

impl From<&TargetConfig> for Target {
    fn from(config: &TargetConfig) -> Self {
        Self {
            file: config.file.clone(),
            list: config.list.clone(),
            import_unmapped: config.import_unmapped,
            include_completed: config.include_completed,
        }
    }
}

pub enum TargetSource {
    File { file: PathBuf, list: String },
    /// Every markdown file of a directory, each synced to the list named after its stem.
    Dir(PathBuf),
    Configured { list: Option<String> },
}

pub fn resolve_targets(source: &TargetSource, config: &Config) -> Result<Vec<Target>, SyncError> {
    match source {
        TargetSource::File { file, list } => Ok(vec![Target::new(file.clone(), list.clone())]),
        TargetSource::Dir(dir) => {
            let mut files = Vec::new();
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                let is_markdown = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
                if is_markdown && path.is_file() {
                    files.push(path);
                }
            }
            files.sort();
            Ok(files
                .into_iter()
                .filter_map(|path| {
                    let list = path.file_stem()?.to_str()?.to_string();
                    Some(Target::new(path, list))
                })
                .collect())
        }
        TargetSource::Configured { list } => Ok(config
            .targets
            .iter()
            .filter(|target| list.as_ref().is_none_or(|list| &target.list == list))
            .map(Target::from)
            .collect()),
    }
}

#[derive(Clone, Debug)]
pub struct RunSettings {
    pub options: SyncOptions,
    pub index_path: PathBuf,
    /// Where documents are copied before being overwritten; `None` disables backups.
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct TargetReport {
    pub file: PathBuf,
    pub list: String,
    pub report: SyncReport,
    pub actions: Vec<SyncAction>,
    pub document_updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetReport {
    fn new(target: &Target) -> Self {
        Self {
            file: target.file.clone(),
            list: target.list.clone(),
            report: SyncReport::default(),
            actions: Vec::new(),
            document_updated: false,
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub targets: Vec<TargetReport>,
    pub totals: SyncReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_error: Option<String>,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.targets
            .iter()
            .filter(|target| target.error.is_some())
            .count()
            + usize::from(self.index_error.is_some())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        for target in &self.targets {
            out.push_str(&format!(
                "{} <- {}{}: {}\n",
                target.list,
                target.file.display(),
                mode,
                target.report.summary()
            ));
            for action in &target.actions {
                out.push_str(&format!("  {}\n", action.describe()));
            }
            if let Some(err) = &target.error {
                out.push_str(&format!("  error: {err}\n"));
            }
        }
        if let Some(err) = &self.index_error {
            out.push_str(&format!("index error: {err}\n"));
        }
        out.push_str(&format!("total: {}\n", self.totals.summary()));
        out
    }
}

/// Synchronizes every target in turn. A failing target is reported and never
/// stops the others; the index is saved once at the end unless dry running.
pub fn run(targets: &[Target], store: &mut dyn ExternalStore, settings: &RunSettings) -> RunReport {
    let started_at = Utc::now();
    let mut index = SyncIndex::load(&settings.index_path);
    let mut reports = Vec::with_capacity(targets.len());
    let mut totals = SyncReport::default();

    for target in targets {
        let report = sync_target(target, &mut index, store, settings);
        totals.merge(&report.report);
        reports.push(report);
    }

    let mut index_error = None;
    if !settings.options.dry_run
        && let Err(err) = save_index(&index, &settings.index_path)
    {
        error!(error = %err, "failed to save index");
        index_error = Some(err.to_string());
    }

    RunReport {
        started_at,
        dry_run: settings.options.dry_run,
        targets: reports,
        totals,
        index_error,
    }
}

fn save_index(index: &SyncIndex, path: &Path) -> Result<(), SyncError> {
    index.save(path).map_err(|source| SyncError::Index {
        path: path.to_path_buf(),
        source,
    })
}

fn sync_target(
    target: &Target,
    index: &mut SyncIndex,
    store: &mut dyn ExternalStore,
    settings: &RunSettings,
) -> TargetReport {
    let mut report = TargetReport::new(target);
    let file = target.file.display().to_string();
    let document = FsDocument::new(&target.file);
    let content = match document.read() {
        Ok(content) => content,
        Err(source) => {
            let err = SyncError::Document {
                path: target.file.clone(),
                source,
            };
            warn!(list = %target.list, file = %file, error = %err, "skipping target");
            report.error = Some(err.to_string());
            return report;
        }
    };

    let options = target.options(&settings.options);
    let (outcome, mut failure) = reconcile_target(target, &content, index, store, settings, options);
    if failure.is_none() && !outcome.has_changes() {
        debug!(list = %target.list, file = %file, "already in sync");
    }

    if !settings.options.dry_run && !outcome.patches.is_empty() {
        let updated = apply_patches(&content, &outcome.patches);
        if updated != content {
            match write_document(&document, &content, &updated, settings.backup_dir.as_deref()) {
                Ok(()) => {
                    info!(list = %target.list, file = %file, patches = outcome.patches.len(), "document updated");
                    report.document_updated = true;
                }
                Err(source) => {
                    forget_imports(index, &target.list, &outcome.actions);
                    undo_pulled_titles(index, &target.list, &outcome.rekeys);
                    failure.get_or_insert(SyncError::Document {
                        path: target.file.clone(),
                        source,
                    });
                }
            }
        }
    }

    if let Some(err) = &failure {
        error!(list = %target.list, file = %file, error = %err, "sync failed");
        report.error = Some(err.to_string());
    }
    report.report = outcome.report;
    report.actions = outcome.actions;
    report
}

/// Runs legacy migration (persisting the index straight away when it found
/// anything) and then the reconciler. Partial work survives a store failure.
fn reconcile_target(
    target: &Target,
    content: &str,
    index: &mut SyncIndex,
    store: &mut dyn ExternalStore,
    settings: &RunSettings,
    mut options: SyncOptions,
) -> (SyncOutcome, Option<SyncError>) {
    let list = target.list.as_str();
    let mut outcome = SyncOutcome::default();
    let store_failure = |source| SyncError::Store {
        list: list.to_string(),
        source,
    };

    if options.migrate_legacy {
        match sync::migrate_legacy(list, index, store, &options) {
            Ok(migrated) => {
                if migrated.migrated > 0 && !options.dry_run {
                    info!(list, count = migrated.migrated, "migrated legacy markers");
                    if let Err(err) = save_index(index, &settings.index_path) {
                        warn!(list, error = %err, "failed to save index after migration");
                    }
                }
                outcome.absorb(migrated);
            }
            Err(Interrupted { source, partial }) => {
                outcome.absorb(partial);
                return (outcome, Some(store_failure(source)));
            }
        }
        options.migrate_legacy = false;
    }

    let tasks = extract_tasks(list, content);
    match sync::reconcile(list, &tasks, index, store, &options) {
        Ok(reconciled) => {
            outcome.absorb(reconciled);
            (outcome, None)
        }
        Err(Interrupted { source, partial }) => {
            outcome.absorb(partial);
            (outcome, Some(store_failure(source)))
        }
    }
}

fn write_document(
    document: &dyn DocumentFile,
    original: &str,
    updated: &str,
    backup_dir: Option<&Path>,
) -> io::Result<()> {
    if let Some(dir) = backup_dir {
        fs::create_dir_all(dir)?;
        let stem = document
            .path()
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("document");
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        fs::write(dir.join(format!("{stem}-{stamp}.md")), original)?;
    }
    document.write(updated)
}

/// Imported items whose lines never reached the document must not stay mapped,
/// or the next run would treat them as removed tasks.
fn forget_imports(index: &mut SyncIndex, list: &str, actions: &[SyncAction]) {
    for action in actions {
        if let SyncAction::Imported { id, .. } = action
            && let Some(fingerprint) = index.find_by_external_id(list, id).map(str::to_string)
        {
            index.delete(list, &fingerprint);
        }
    }
}

/// Pulled titles that never reached the document leave the index keyed by a
/// title the document does not have; move those entries back.
fn undo_pulled_titles(index: &mut SyncIndex, list: &str, rekeys: &[(String, String)]) {
    for (previous, current) in rekeys.iter().rev() {
        if !index.rekey(list, current, previous) {
            warn!(list, fingerprint = %current, "pulled entry vanished before it could be restored");
        }
    }
}
