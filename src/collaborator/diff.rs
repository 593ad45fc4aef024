use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Source extensions worth simulating.
const RELEVANT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "java", "cpp", "c", "h", "cs", "php", "rb", "go", "rs",
    "swift", "kt", "scala", "html", "css", "scss", "sass", "less", "vue", "svelte",
];

const RELEVANT_FILE_NAMES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    "requirements.txt",
    "setup.py",
    "pyproject.toml",
];

const EXCLUDED_FRAGMENTS: &[&str] = &[
    ".git/",
    "node_modules/",
    "__pycache__/",
    ".pytest_cache/",
];

const EXCLUDED_FILE_NAMES: &[&str] = &[
    ".gitignore",
    ".gitmodules",
    "package-lock.json",
    "yarn.lock",
    "Pipfile.lock",
    ".DS_Store",
    "Thumbs.db",
];

const EXCLUDED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "svg", "ico", "pdf", "doc", "docx", "zip", "tar", "gz",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    TypeChanged,
    Unknown,
}

impl ChangeKind {
    /// Map a `git diff --name-status` code (`M`, `A`, `R100`, ...) to a kind.
    pub fn from_status(code: &str) -> Self {
        match code.chars().next() {
            Some('A') => ChangeKind::Added,
            Some('M') => ChangeKind::Modified,
            Some('D') => ChangeKind::Deleted,
            Some('R') => ChangeKind::Renamed,
            Some('C') => ChangeKind::Copied,
            Some('T') => ChangeKind::TypeChanged,
            _ => ChangeKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Unified hunk text for this file, without the `diff --git` header
    pub hunks: String,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            hunks: String::new(),
        }
    }

    pub fn with_hunks(mut self, hunks: impl Into<String>) -> Self {
        self.hunks = hunks.into();
        self
    }

    pub fn is_relevant(&self) -> bool {
        is_relevant_path(&self.path)
    }

    /// Count of (added, removed) lines in the hunks.
    pub fn line_counts(&self) -> (usize, usize) {
        let mut added = 0;
        let mut removed = 0;
        for line in self.hunks.lines() {
            if line.starts_with("+++") || line.starts_with("---") {
                continue;
            }
            if line.starts_with('+') {
                added += 1;
            } else if line.starts_with('-') {
                removed += 1;
            }
        }
        (added, removed)
    }
}

/// Changes between the PR head and its base branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub base_ref: String,
    pub head_ref: String,
    pub files: Vec<FileChange>,
}

impl Diff {
    pub fn new(base_ref: impl Into<String>, head_ref: impl Into<String>, files: Vec<FileChange>) -> Self {
        Self {
            base_ref: base_ref.into(),
            head_ref: head_ref.into(),
            files,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn relevant_files(&self) -> impl Iterator<Item = &FileChange> {
        self.files.iter().filter(|f| f.is_relevant())
    }

    pub fn stats(&self) -> DiffStats {
        let (lines_added, lines_removed) = self
            .files
            .iter()
            .map(FileChange::line_counts)
            .fold((0, 0), |(a, r), (fa, fr)| (a + fa, r + fr));
        DiffStats {
            files_changed: self.files.len(),
            relevant_files: self.relevant_files().count(),
            lines_added,
            lines_removed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub relevant_files: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Whether a changed path is source code a simulation could exercise.
pub fn is_relevant_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if EXCLUDED_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        return false;
    }

    let file = Path::new(path);
    let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if EXCLUDED_FILE_NAMES.contains(&name) || name == ".env" || name.starts_with(".env.") {
        return false;
    }

    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some(ext) if EXCLUDED_EXTENSIONS.contains(&ext) => false,
        Some(ext) if RELEVANT_EXTENSIONS.contains(&ext) => true,
        _ => RELEVANT_FILE_NAMES.contains(&name),
    }
}

/// Parse `git diff --name-status` output. Renames and copies report the
/// destination path.
pub fn parse_name_status(output: &str) -> Vec<FileChange> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let code = parts.next()?.trim();
            let path = parts.last()?.trim();
            if code.is_empty() || path.is_empty() {
                return None;
            }
            Some(FileChange::new(path, ChangeKind::from_status(code)))
        })
        .collect()
}

/// Split a full unified diff into per-file hunk text keyed by destination path.
pub fn split_unified(diff: &str) -> HashMap<String, String> {
    let mut sections = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in diff.lines() {
        if let Some(header) = line.strip_prefix("diff --git ") {
            if let Some((path, body)) = current.take() {
                sections.insert(path, body);
            }
            let path = header
                .rsplit_once(" b/")
                .map(|(_, b)| b.to_string())
                .unwrap_or_else(|| header.to_string());
            current = Some((path, String::new()));
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some((path, body)) = current {
        sections.insert(path, body);
    }
    sections
}

/// Combine name-status and unified diff output into a [`Diff`].
pub fn assemble(base_ref: &str, head_ref: &str, name_status: &str, unified: &str) -> Diff {
    let mut hunks = split_unified(unified);
    let files = parse_name_status(name_status)
        .into_iter()
        .map(|change| {
            let text = hunks.remove(&change.path).unwrap_or_default();
            change.with_hunks(text)
        })
        .collect();
    Diff::new(base_ref, head_ref, files)
}
