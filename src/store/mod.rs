pub mod google;
pub mod local;
pub mod reminders;

use crate::models::{ExternalHeader, ExternalItem, ItemDraft, ItemPatch};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Notes prefix written by older releases to tie an item back to its task.
pub const LEGACY_MARKER_PREFIX: &str = "[todolist-md:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} timed out after {}s", .after.as_secs())]
    Timeout { op: String, after: Duration },
    #[error("request failed: {0}")]
    Request(String),
    #[error("authorization required: {0}")]
    Auth(String),
    #[error("script failed: {0}")]
    Script(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("list not found: {0}")]
    ListNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The reminder collection a document is synchronized against.
///
/// Every call is a blocking round trip. Implementations only report items of
/// the named list and never assume enumerating a list is cheap for callers.
pub trait ExternalStore {
    fn fetch_by_ids(&mut self, list: &str, ids: &[String]) -> StoreResult<Vec<ExternalItem>>;

    fn fetch_by_exact_titles(
        &mut self,
        list: &str,
        titles: &[String],
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>>;

    /// Items whose notes still carry a legacy back-reference marker.
    fn fetch_legacy_marked(&mut self, list: &str) -> StoreResult<Vec<ExternalItem>>;

    fn fetch_all_headers(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalHeader>>;

    fn fetch_all_items(
        &mut self,
        list: &str,
        include_completed: bool,
    ) -> StoreResult<Vec<ExternalItem>>;

    fn create(&mut self, list: &str, draft: &ItemDraft) -> StoreResult<String>;

    fn update(&mut self, list: &str, id: &str, patch: &ItemPatch) -> StoreResult<()>;

    fn delete(&mut self, list: &str, id: &str) -> StoreResult<()>;
}

/// Runs `call` with `timeout`; a timeout is retried once with twice the budget.
pub fn retry_on_timeout<T>(
    op: &str,
    timeout: Duration,
    mut call: impl FnMut(Duration) -> StoreResult<T>,
) -> StoreResult<T> {
    match call(timeout) {
        Err(err) if err.is_timeout() => {
            let enlarged = timeout * 2;
            warn!(op, timeout_secs = enlarged.as_secs(), "store call timed out; retrying once");
            call(enlarged)
        }
        other => other,
    }
}

/// Fingerprint referenced by a legacy marker inside `notes`, if any.
pub fn legacy_marker_fingerprint(notes: &str) -> Option<String> {
    let start = notes.find(LEGACY_MARKER_PREFIX)? + LEGACY_MARKER_PREFIX.len();
    let rest = &notes[start..];
    let end = rest.find(']')?;
    let fingerprint = rest[..end].trim();
    if fingerprint.is_empty() || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(fingerprint.to_ascii_lowercase())
}

pub(crate) fn has_legacy_marker(notes: &str) -> bool {
    legacy_marker_fingerprint(notes).is_some()
}
