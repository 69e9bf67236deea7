use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

struct Formatting {
    image: Regex,
    link: Regex,
    reference_link: Regex,
    autolink: Regex,
    code: Regex,
    strong: Regex,
    emphasis_star: Regex,
    emphasis_underscore: Regex,
}

fn formatting() -> &'static Formatting {
    static FORMATTING: OnceLock<Formatting> = OnceLock::new();
    FORMATTING.get_or_init(|| Formatting {
        image: Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("valid image pattern"),
        link: Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid link pattern"),
        reference_link: Regex::new(r"\[([^\]]+)\]\[[^\]]*\]").expect("valid reference pattern"),
        autolink: Regex::new(r"<((?:https?|mailto):[^>\s]+)>").expect("valid autolink pattern"),
        code: Regex::new(r"`+([^`]*)`+").expect("valid code pattern"),
        strong: Regex::new(r"\*\*|__|~~").expect("valid strong pattern"),
        emphasis_star: Regex::new(r"\*([^*\s][^*]*)\*").expect("valid emphasis pattern"),
        emphasis_underscore: Regex::new(r"(^|[^\w])_([^_\s][^_]*)_([^\w]|$)")
            .expect("valid emphasis pattern"),
    })
}

/// Strips inline markdown formatting, keeping the visible text.
pub fn plain_title(raw: &str) -> String {
    let f = formatting();
    let text = f.code.replace_all(raw, "$1");
    let text = f.image.replace_all(&text, "$1");
    let text = f.link.replace_all(&text, "$1");
    let text = f.reference_link.replace_all(&text, "$1");
    let text = f.autolink.replace_all(&text, "$1");
    let text = f.strong.replace_all(&text, "");
    let text = f.emphasis_star.replace_all(&text, "$1");
    let text = f.emphasis_underscore.replace_all(&text, "$1$2$3");
    collapse_whitespace(&text)
}

/// Position-independent identity of a task within a list.
pub fn fingerprint(list: &str, raw_title: &str, description: Option<&str>) -> String {
    let payload = format!(
        "{}\n{}\n{}",
        list,
        plain_title(raw_title),
        description.unwrap_or("")
    );
    sha256_hex(&payload)
}

pub fn content_hash(text: &str) -> String {
    sha256_hex(text)
}

/// Lowercased, punctuation-free form used when comparing titles across a rename.
pub fn normalize_title(title: &str) -> String {
    let mapped: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&mapped)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
