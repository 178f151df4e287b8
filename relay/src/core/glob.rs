//! Glob matching and conservative glob-vs-glob overlap detection.
//!
//! Reservations compare patterns against patterns, not against files on disk,
//! so overlap is decided syntactically. When in doubt the answer is "overlaps":
//! a false conflict costs a retry, a missed one costs a corrupted file.

use regex::Regex;

/// Translate a glob into an anchored regex.
///
/// `**` crosses directory separators, `*` and `?` do not.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = normalize(pattern);
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// Regex match that treats an untranslatable pattern as matching (fail closed).
fn glob_matches(pattern: &str, candidate: &str) -> bool {
    match glob_to_regex(pattern) {
        Ok(re) => re.is_match(candidate),
        Err(_) => true,
    }
}

/// True if `path` is matched by `pattern`, or lives under it when `pattern` is a directory.
pub fn matches_path(pattern: &str, path: &str) -> bool {
    let pattern_norm = normalize(pattern);
    let path = normalize(path);
    if !has_wildcard(&pattern_norm) && is_within(&path, &pattern_norm) {
        return true;
    }
    glob_matches(&pattern_norm, &path)
}

/// True if some path could be matched by both patterns.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == "." || b == "." || a == "**" || b == "**" {
        return true;
    }
    if a == b || is_within(&a, &b) || is_within(&b, &a) {
        return true;
    }
    if glob_matches(&a, &b) || glob_matches(&b, &a) {
        return true;
    }
    let (wild_a, wild_b) = (has_wildcard(&a), has_wildcard(&b));
    if wild_a && wild_b {
        let (prefix_a, prefix_b) = (literal_prefix(&a), literal_prefix(&b));
        return prefix_a.starts_with(prefix_b) || prefix_b.starts_with(prefix_a);
    }
    if wild_a {
        return literal_dir_covers(&a, &b);
    }
    if wild_b {
        return literal_dir_covers(&b, &a);
    }
    false
}

/// True if any pattern in `left` overlaps any pattern in `right`.
pub fn any_overlap<A: AsRef<str>, B: AsRef<str>>(left: &[A], right: &[B]) -> bool {
    left.iter().any(|a| {
        right
            .iter()
            .any(|b| patterns_overlap(a.as_ref(), b.as_ref()))
    })
}

fn normalize(pattern: &str) -> String {
    let trimmed = pattern.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    let trimmed = trimmed.trim_end_matches('/');
    trimmed.to_string()
}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

fn is_within(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path[dir.len()..].starts_with('/')
}

fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

/// A literal directory `dir` overlaps a glob whose literal prefix lies inside it.
fn literal_dir_covers(glob: &str, dir: &str) -> bool {
    let prefix = literal_prefix(glob);
    prefix.starts_with(&format!("{dir}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_does_not_cross_directories() {
        assert!(matches_path("src/*.js", "src/a.js"));
        assert!(!matches_path("src/*.js", "src/nested/a.js"));
        assert!(matches_path("src/**/*.js", "src/nested/a.js"));
        assert!(matches_path("src/**/*.js", "src/a.js"));
        assert!(matches_path("src/?.js", "src/a.js"));
    }

    #[test]
    fn directory_pattern_covers_children() {
        assert!(matches_path("src/", "src/a.js"));
        assert!(!matches_path("src", "srcx/a.js"));
    }

    #[test]
    fn identical_literals_overlap() {
        assert!(patterns_overlap("src/a.js", "./src/a.js"));
        assert!(!patterns_overlap("src/a.js", "src/b.js"));
    }

    #[test]
    fn glob_overlaps_literal_it_matches() {
        assert!(patterns_overlap("src/**/*.ts", "src/ui/button.ts"));
        assert!(patterns_overlap("src/ui/button.ts", "src/**/*.ts"));
        assert!(!patterns_overlap("src/**/*.ts", "docs/readme.md"));
    }

    #[test]
    fn globs_with_shared_prefix_overlap() {
        assert!(patterns_overlap("src/**/*.ts", "src/ui/*.ts"));
        assert!(!patterns_overlap("src/*.ts", "docs/*.md"));
    }

    #[test]
    fn directory_overlaps_glob_inside_it() {
        assert!(patterns_overlap("src", "src/ui/*.ts"));
        assert!(patterns_overlap("src/ui/*.ts", "src"));
        assert!(!patterns_overlap("docs", "src/ui/*.ts"));
    }

    #[test]
    fn any_overlap_checks_all_pairs() {
        let held = ["src/a.js"];
        let wanted = ["src/a.js", "src/b.js"];
        assert!(any_overlap(&wanted, &held));
        assert!(!any_overlap(&["lib/x.rs"], &held));
    }
}
