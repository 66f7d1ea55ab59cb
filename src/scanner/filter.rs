//! Include/exclude policy for discovered paths.

use std::path::{Component, Path, PathBuf};

/// Decides whether a path takes part in a scan.
///
/// A path is excluded when it is not under any include root, when it is
/// under an exclude root, or when a wildcard matches it. Absolute wildcards
/// match as prefixes of the path; relative ones are matched against the file
/// name and every path segment.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<PathBuf>,
    exclude: Vec<PathBuf>,
    absolute_wildcards: Vec<String>,
    relative_wildcards: Vec<String>,
}

impl PathFilter {
    pub fn new(include: &[PathBuf], exclude: &[PathBuf], wildcards: &str) -> Self {
        let mut absolute_wildcards = Vec::new();
        let mut relative_wildcards = Vec::new();

        for pattern in wildcards.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if Path::new(pattern).is_absolute() {
                absolute_wildcards.push(normalize(Path::new(pattern)).to_string_lossy().into_owned());
            } else {
                relative_wildcards.push(pattern.to_string());
            }
        }

        Self {
            include: include.iter().map(|p| normalize(p)).collect(),
            exclude: exclude.iter().map(|p| normalize(p)).collect(),
            absolute_wildcards,
            relative_wildcards,
        }
    }

    pub fn include_roots(&self) -> &[PathBuf] {
        &self.include
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let path = normalize(path);

        if !self.include.iter().any(|root| path.starts_with(root)) {
            return true;
        }

        if self.exclude.iter().any(|root| path.starts_with(root)) {
            return true;
        }

        let text = path.to_string_lossy();
        for pattern in &self.absolute_wildcards {
            if text.starts_with(pattern.as_str()) {
                return true;
            }
            if has_glob_chars(pattern) && path.ancestors().any(|a| fnmatch(pattern, &a.to_string_lossy())) {
                return true;
            }
        }

        if !self.relative_wildcards.is_empty() {
            let segments: Vec<String> = path
                .components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();

            for pattern in &self.relative_wildcards {
                if segments.iter().any(|segment| fnmatch(pattern, segment)) {
                    return true;
                }
            }
        }

        false
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the
/// filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Shell-style match: `*` any run, `?` one char, `[seq]` / `[!seq]` sets
/// with ranges. Case-sensitive; `*` also matches `/`.
pub fn fnmatch(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ni));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ni += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_set(&p, pi, n[ni]) {
                        if matched {
                            pi = next;
                            ni += 1;
                            continue;
                        }
                    } else if n[ni] == '[' {
                        // Unterminated set is a literal '['.
                        pi += 1;
                        ni += 1;
                        continue;
                    }
                }
                c if c == n[ni] => {
                    pi += 1;
                    ni += 1;
                    continue;
                }
                _ => {}
            }
        }

        match star {
            Some((star_pi, star_ni)) => {
                pi = star_pi + 1;
                ni = star_ni + 1;
                star = Some((star_pi, star_ni + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Match `c` against the set starting at `p[start] == '['`. Returns whether
/// it matched and the index after the closing `]`, or `None` when the set is
/// unterminated.
fn match_set(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '!';
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < p.len() {
        if p[i] == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;

        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            if p[i] <= c && c <= p[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if p[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}
