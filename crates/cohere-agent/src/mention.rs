//! `@path` mention resolution.
//!
//! Before a prompt enters the turn loop, each `@name` token naming a real
//! workspace file or directory is expanded into a fenced context block
//! prepended to the prompt. Duplicate mentions resolve once.

use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

fn mention_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([\w./-]+)").ok()).as_ref()
}

/// Expand `@name` mentions against the workspace. Unresolvable mentions are
/// left for the model to interpret.
pub fn resolve_mentions(prompt: &str, workspace: &Path) -> String {
    let Some(re) = mention_regex() else {
        return prompt.to_string();
    };

    let mut seen = Vec::new();
    let mut blocks = Vec::new();
    for caps in re.captures_iter(prompt) {
        let name = caps[1].trim_end_matches(['.', '/']);
        if name.is_empty() || seen.iter().any(|s| s == name) {
            continue;
        }
        seen.push(name.to_string());

        let path = workspace.join(name);
        if path.is_file() {
            if let Ok(content) = fs::read_to_string(&path) {
                blocks.push(format!("Contents of `{name}`:\n```\n{content}\n```"));
            }
        } else if path.is_dir() {
            if let Some(listing) = directory_listing(&path) {
                blocks.push(format!("Contents of directory `{name}`:\n```\n{listing}\n```"));
            }
        }
    }

    if blocks.is_empty() {
        return prompt.to_string();
    }
    format!("{}\n\n{prompt}", blocks.join("\n\n"))
}

fn directory_listing(path: &Path) -> Option<String> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in fs::read_dir(path).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => dirs.push(format!("[DIR] {name}")),
            Ok(_) => files.push(format!("[FILE] {name}")),
            Err(_) => {}
        }
    }
    dirs.sort();
    files.sort();
    dirs.extend(files);
    Some(dirs.join("\n"))
}
