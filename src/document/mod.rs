pub mod extract;
pub mod patch;

use regex::{Captures, Regex};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use extract::extract_tasks;
pub use patch::{DocumentPatch, apply_patches, compose_task_lines, imported_description};

/// Read/write access to the text of one document.
pub trait DocumentFile {
    fn read(&self) -> io::Result<String>;
    fn write(&self, content: &str) -> io::Result<()>;
    fn path(&self) -> &Path;
}

pub struct FsDocument {
    path: PathBuf,
}

impl FsDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DocumentFile for FsDocument {
    fn read(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }

    fn write(&self, content: &str) -> io::Result<()> {
        let tmp = self.path.with_extension("md.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn checkbox_regex() -> &'static Regex {
    static CHECKBOX: OnceLock<Regex> = OnceLock::new();
    CHECKBOX.get_or_init(|| {
        Regex::new(
            r"^(?P<prefix>(?:[ \t]*>)*[ \t]*(?:[-*+]|\d{1,9}[.)])[ \t]+)\[(?P<mark>[ xX])\](?P<gap>[ \t]*)(?P<title>.*?)(?P<tail>[ \t]*\r?)$",
        )
        .expect("valid checkbox pattern")
    })
}

fn list_item_regex() -> &'static Regex {
    static LIST_ITEM: OnceLock<Regex> = OnceLock::new();
    LIST_ITEM.get_or_init(|| {
        Regex::new(r"^(?:[-*+]|\d{1,9}[.)])(?:[ \t]|$)").expect("valid list item pattern")
    })
}

pub(crate) fn checkbox_captures(line: &str) -> Option<Captures<'_>> {
    checkbox_regex().captures(line)
}

pub(crate) fn is_list_item(trimmed: &str) -> bool {
    list_item_regex().is_match(trimmed)
}

/// Width of leading whitespace, tabs counted as four columns.
pub(crate) fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}
