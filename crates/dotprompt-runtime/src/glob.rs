//! Filesystem glob expansion for `.clear`.
//!
//! Per path component: `*` matches any run of characters, `?` one character,
//! `[abc]`/`[a-z]`/`[!a]` character classes. `**` as a whole component
//! matches zero or more directories. `{a,b}` alternatives are expanded
//! before matching. Hidden entries only match components that start with `.`.

use std::cell::Cell;
use std::path::{Component, Path, PathBuf};

/// Bound on matcher recursion, counted as total calls.
const MAX_MATCH_CALLS: usize = 100_000;

pub fn contains_glob(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[') || s.contains('{')
}

/// Expand `pattern` against the filesystem, relative paths rooted at
/// `base_dir`. Results are sorted and deduplicated; only existing paths are
/// returned.
pub fn expand(pattern: &str, base_dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for alternative in expand_braces(pattern) {
        let path = Path::new(&alternative);
        let (root, components) = split_root(path, base_dir);
        walk(&root, &components, &mut found);
    }
    found.sort();
    found.dedup();
    found
}

fn split_root(path: &Path, base_dir: &Path) -> (PathBuf, Vec<String>) {
    let mut root = if path.is_absolute() {
        PathBuf::new()
    } else {
        base_dir.to_path_buf()
    };
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => root.push(component.as_os_str()),
            Component::CurDir => {}
            other => components.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    (root, components)
}

fn walk(dir: &Path, components: &[String], found: &mut Vec<PathBuf>) {
    let Some((head, rest)) = components.split_first() else {
        if dir.exists() {
            found.push(dir.to_path_buf());
        }
        return;
    };

    if head == "**" {
        walk(dir, rest, found);
        for entry in subdirectories(dir) {
            walk(&entry, components, found);
        }
        return;
    }

    if !contains_glob(head) {
        walk(&dir.join(head), rest, found);
        return;
    }

    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        if name.starts_with('.') && !head.starts_with('.') {
            continue;
        }
        if glob_match(head, &name) {
            walk(&dir.join(&name), rest, found);
        }
    }
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}

/// Match one name against one component pattern (no braces, no `/`).
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();
    let calls = Cell::new(0usize);
    match_at(&pattern, 0, &input, 0, &calls)
}

fn match_at(pattern: &[char], pi: usize, input: &[char], ii: usize, calls: &Cell<usize>) -> bool {
    calls.set(calls.get() + 1);
    if calls.get() > MAX_MATCH_CALLS {
        return false;
    }
    if pi >= pattern.len() {
        return ii >= input.len();
    }

    match pattern[pi] {
        '*' => {
            let mut next = pi;
            while next < pattern.len() && pattern[next] == '*' {
                next += 1;
            }
            if next >= pattern.len() {
                return true;
            }
            (ii..=input.len()).any(|start| match_at(pattern, next, input, start, calls))
        }
        '?' => ii < input.len() && match_at(pattern, pi + 1, input, ii + 1, calls),
        '[' => {
            let Some(&c) = input.get(ii) else {
                return false;
            };
            match match_class(pattern, pi, c) {
                Some((true, next)) => match_at(pattern, next, input, ii + 1, calls),
                Some((false, _)) => false,
                None => c == '[' && match_at(pattern, pi + 1, input, ii + 1, calls),
            }
        }
        expected => {
            input.get(ii) == Some(&expected) && match_at(pattern, pi + 1, input, ii + 1, calls)
        }
    }
}

/// Evaluate a `[...]` class starting at `pattern[start]`. Returns whether `c`
/// matched and the index after the class, or `None` if the class is unclosed.
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negated = matches!(pattern.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        if pattern[i] == ']' && !first {
            return Some((matched != negated, i + 1));
        }
        first = false;
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            if pattern[i] <= c && c <= pattern[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if pattern[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

/// Expand the first top-level `{a,b}` group, recursively.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut depth = 0usize;
    let mut start = None;
    let mut end = None;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let (Some(start), Some(end)) = (start, end) else {
        return vec![pattern.to_string()];
    };

    let prefix: String = chars[..start].iter().collect();
    let suffix: String = chars[end + 1..].iter().collect();
    let mut alternatives = Vec::new();
    let mut current = String::new();
    let mut nested = 0usize;
    for &c in &chars[start + 1..end] {
        match c {
            '{' => {
                nested += 1;
                current.push(c);
            }
            '}' => {
                nested = nested.saturating_sub(1);
                current.push(c);
            }
            ',' if nested == 0 => alternatives.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    alternatives.push(current);

    alternatives
        .into_iter()
        .flat_map(|alt| expand_braces(&format!("{}{}{}", prefix, alt, suffix)))
        .collect()
}
