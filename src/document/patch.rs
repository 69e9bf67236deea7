use super::{checkbox_captures, is_list_item};
use serde::Serialize;

/// A minimal edit against the source text of a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentPatch {
    SetChecked { line: usize, checked: bool },
    ReplaceTitle { line: usize, title: String },
    Append { lines: Vec<String> },
}

/// Applies `patches` to `content`. Line patches address 1-based lines of the
/// original text and only touch lines that still carry a checkbox; appends
/// land at the end in order. Every other byte is preserved.
pub fn apply_patches(content: &str, patches: &[DocumentPatch]) -> String {
    let mut lines: Vec<String> = content.split_inclusive('\n').map(str::to_string).collect();

    for patch in patches {
        match patch {
            DocumentPatch::SetChecked { line, checked } => {
                if let Some(slot) = line_slot(&mut lines, *line)
                    && let Some(updated) = set_checked_line(slot, *checked)
                {
                    *slot = updated;
                }
            }
            DocumentPatch::ReplaceTitle { line, title } => {
                if let Some(slot) = line_slot(&mut lines, *line)
                    && let Some(updated) = replace_title_line(slot, title)
                {
                    *slot = updated;
                }
            }
            DocumentPatch::Append { .. } => {}
        }
    }

    let mut output = lines.concat();
    for patch in patches {
        if let DocumentPatch::Append { lines } = patch {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            for line in lines {
                output.push_str(line);
                output.push('\n');
            }
        }
    }
    output
}

/// Renders an imported item as a checkbox line plus indented description lines.
pub fn compose_task_lines(title: &str, completed: bool, description: Option<&str>) -> Vec<String> {
    let checkbox = if completed { "- [x] " } else { "- [ ] " };
    let mut lines = vec![format!("{checkbox}{}", title.trim())];
    if let Some(description) = description {
        lines.extend(description.lines().map(|line| format!("  {line}")));
    }
    lines
}

/// Notes of an external item as the description extraction will read back:
/// trimmed, blank lines dropped, and list-looking lines escaped so they stay
/// part of the description.
pub fn imported_description(notes: &str) -> Option<String> {
    let lines: Vec<String> = notes
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if is_list_item(line) {
                format!("\\{line}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn line_slot(lines: &mut [String], line: usize) -> Option<&mut String> {
    if line == 0 {
        return None;
    }
    lines.get_mut(line - 1)
}

fn split_terminator(raw: &str) -> (&str, &str) {
    match raw.strip_suffix('\n') {
        Some(body) => (body, "\n"),
        None => (raw, ""),
    }
}

fn set_checked_line(raw: &str, checked: bool) -> Option<String> {
    let (body, terminator) = split_terminator(raw);
    let caps = checkbox_captures(body)?;
    let mark = caps.name("mark")?;
    let is_checked = mark.as_str() != " ";
    if is_checked == checked {
        return None;
    }
    let glyph = if checked { "x" } else { " " };
    Some(format!(
        "{}{}{}{}",
        &body[..mark.start()],
        glyph,
        &body[mark.end()..],
        terminator
    ))
}

fn replace_title_line(raw: &str, title: &str) -> Option<String> {
    let (body, terminator) = split_terminator(raw);
    let caps = checkbox_captures(body)?;
    let current = caps.name("title")?;
    let gap = caps.name("gap").map(|m| m.as_str()).unwrap_or("");
    let gap = if gap.is_empty() { " " } else { gap };
    let gap_start = caps.name("gap").map(|m| m.start()).unwrap_or(current.start());
    Some(format!(
        "{}{}{}{}{}",
        &body[..gap_start],
        gap,
        title.trim(),
        &body[current.end()..],
        terminator
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_checked_flips_only_the_target_line() {
        let content = "# List\r\n- [ ] One\n- [ ] Two\n";
        let patched = apply_patches(
            content,
            &[DocumentPatch::SetChecked {
                line: 3,
                checked: true,
            }],
        );
        assert_eq!(patched, "# List\r\n- [ ] One\n- [x] Two\n");
    }

    #[test]
    fn set_checked_skips_non_task_lines_and_out_of_range() {
        let content = "plain line\n- [x] Done";
        let patched = apply_patches(
            content,
            &[
                DocumentPatch::SetChecked {
                    line: 1,
                    checked: true,
                },
                DocumentPatch::SetChecked {
                    line: 9,
                    checked: true,
                },
                DocumentPatch::SetChecked {
                    line: 2,
                    checked: true,
                },
            ],
        );
        assert_eq!(patched, content);
    }

    #[test]
    fn replace_title_keeps_indent_and_marker() {
        let content = "  * [X] Old title\n";
        let patched = apply_patches(
            content,
            &[DocumentPatch::ReplaceTitle {
                line: 1,
                title: "New title".to_string(),
            }],
        );
        assert_eq!(patched, "  * [X] New title\n");
    }

    #[test]
    fn append_adds_separator_newline_once() {
        let patched = apply_patches(
            "- [ ] One",
            &[DocumentPatch::Append {
                lines: compose_task_lines("Imported", true, Some("first\nsecond")),
            }],
        );
        assert_eq!(patched, "- [ ] One\n- [x] Imported\n  first\n  second\n");
    }

    #[test]
    fn imported_description_matches_extraction() {
        let description = imported_description("  call first \n\n- bring forms\n").expect("notes");
        assert_eq!(description, "call first\n\\- bring forms");
        assert_eq!(imported_description(" \n\n"), None);

        let mut content = String::new();
        for line in compose_task_lines("Dentist", false, Some(&description)) {
            content.push_str(&line);
            content.push('\n');
        }
        let tasks = crate::document::extract_tasks("L", &content);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].notes.as_deref(), Some(description.as_str()));
    }
}
