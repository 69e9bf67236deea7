use super::{checkbox_captures, indent_width, is_list_item};
use crate::fingerprint::{fingerprint, plain_title};
use crate::models::TaskRecord;
use pulldown_cmark::{Event, Options, Parser};

/// Collects the checklist items of a markdown document in document order.
pub fn extract_tasks(list: &str, content: &str) -> Vec<TaskRecord> {
    let lines: Vec<&str> = content.lines().collect();
    let line_starts = line_starts(content);

    let parser = Parser::new_ext(content, Options::ENABLE_TASKLISTS);
    let mut tasks = Vec::new();
    let mut last_line = None;

    for (event, range) in parser.into_offset_iter() {
        let Event::TaskListMarker(checked) = event else {
            continue;
        };
        let line_idx = line_index(&line_starts, range.start);
        // One task per source line even if the parser reports nested markers.
        if last_line == Some(line_idx) {
            continue;
        }
        last_line = Some(line_idx);

        let Some(line) = lines.get(line_idx) else {
            continue;
        };
        let Some(caps) = checkbox_captures(line) else {
            continue;
        };
        let raw_title = caps["title"].trim().to_string();
        let title = plain_title(&raw_title);
        if title.is_empty() {
            continue;
        }

        let notes = description_below(&lines, line_idx);
        tasks.push(TaskRecord {
            fingerprint: fingerprint(list, &raw_title, notes.as_deref()),
            title,
            raw_title,
            completed: checked,
            notes,
            source_line: line_idx + 1,
        });
    }

    tasks
}

/// Non-list lines indented under the task, up to the first blank or shallower line.
fn description_below(lines: &[&str], task_idx: usize) -> Option<String> {
    let task_indent = indent_width(lines[task_idx]);
    let mut collected = Vec::new();
    for line in lines.iter().skip(task_idx + 1) {
        let trimmed = line.trim();
        if trimmed.is_empty() || indent_width(line) <= task_indent || is_list_item(trimmed) {
            break;
        }
        collected.push(trimmed);
    }
    if collected.is_empty() {
        None
    } else {
        Some(collected.join("\n"))
    }
}

fn line_starts(content: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (idx, byte) in content.bytes().enumerate() {
        if byte == b'\n' {
            starts.push(idx + 1);
        }
    }
    starts
}

fn line_index(starts: &[usize], offset: usize) -> usize {
    match starts.binary_search(&offset) {
        Ok(idx) => idx,
        Err(idx) => idx.saturating_sub(1),
    }
}
