//! Exclusion matching (§4.3). Decides whether an absolute or root-relative path
//! is ignored, honoring literal, root-anchored, substring and glob patterns, plus
//! the remote→local path-remapping table used by the composer collaborator.

use regex::Regex;

use crate::index::{INDEX_BACKUP_FILE, INDEX_FILE};

#[derive(Clone)]
enum Pattern {
    /// `*`-glob pattern, compiled to a case-insensitive, dotall regex.
    Glob(Regex),
    /// Root-anchored: matches via prefix containment against an absolute path.
    Root(String),
    /// Plain substring pattern.
    Substring(String),
}

#[derive(Clone)]
pub struct Exclusion {
    patterns: Vec<Pattern>,
    roots: Vec<String>,
}

impl Exclusion {
    /// Build an `Exclusion` for `roots` from the configured `ignored` patterns and
    /// the remote→local `mapping`. Three built-ins are always appended: the
    /// index filename, the backup filename, and `/.ftp-` (sibling config files).
    pub fn new(roots: &[String], ignored: &[String], mapping: &[(String, String)]) -> Exclusion {
        let mut ignored = ignored.to_vec();
        ignored.push(INDEX_FILE.to_string());
        ignored.push(INDEX_BACKUP_FILE.to_string());
        ignored.push("/.ftp-".to_string());

        let mut formatted: Vec<String> = Vec::new();
        for pattern in &ignored {
            if let Some((_, local)) = mapping.iter().find(|(remote, _)| remote == pattern) {
                for root in roots {
                    if !local.starts_with(root.as_str()) {
                        formatted.push(format!("{root}{pattern}"));
                    }
                }
            } else if let Some(stripped) = pattern.strip_prefix('/') {
                for root in roots {
                    formatted.push(format!("{root}/{stripped}"));
                }
            } else {
                formatted.push(pattern.clone());
            }
        }

        let drive_prefix = Regex::new(r"^[a-zA-Z]+:/").unwrap();
        let patterns = formatted
            .into_iter()
            .map(|pattern| {
                if pattern.contains('*') {
                    let escaped = regex::escape(&pattern).replace(r"\*", ".*");
                    Pattern::Glob(
                        Regex::new(&format!("(?is){escaped}"))
                            .unwrap_or_else(|_| Regex::new(&regex::escape(&pattern)).unwrap()),
                    )
                } else if pattern.starts_with('/') || drive_prefix.is_match(&pattern) {
                    Pattern::Root(pattern)
                } else {
                    Pattern::Substring(pattern)
                }
            })
            .collect();

        Exclusion {
            patterns,
            roots: roots.to_vec(),
        }
    }

    /// Returns the matching pattern (as a string) if `path` (absolute) is
    /// ignored. Match order within one pass: regex, then root/prefix, then
    /// substring; first match wins.
    pub fn is_ignored_absolute(&self, path: &str) -> Option<String> {
        for pattern in &self.patterns {
            match pattern {
                Pattern::Glob(re) => {
                    if re.is_match(path) {
                        return Some(re.as_str().to_string());
                    }
                }
                Pattern::Root(prefix) => {
                    if path.starts_with(prefix.as_str()) {
                        return Some(prefix.clone());
                    }
                }
                Pattern::Substring(needle) => {
                    if path.contains(needle.as_str()) {
                        return Some(needle.clone());
                    }
                }
            }
        }
        None
    }

    /// Tests the concatenation of each root with `relative_path`. Used only by
    /// the planner, to avoid proposing deletion of index-internal files.
    pub fn is_ignored_relative(&self, relative_path: &str) -> bool {
        self.roots
            .iter()
            .any(|root| self.is_ignored_absolute(&format!("{root}{relative_path}")).is_some())
    }

    /// True when `pattern` is an exact literal match of `directory` (used by the
    /// scanner to decide whether a directory is recorded but not descended, vs.
    /// suppressed entirely).
    pub fn is_exact_literal_match(&self, directory: &str) -> bool {
        self.patterns.iter().any(|pattern| match pattern {
            Pattern::Root(p) | Pattern::Substring(p) => p == directory,
            Pattern::Glob(_) => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_anchored_pattern_matches_prefix() {
        let exclusion = Exclusion::new(&["/srv/www".to_string()], &["/cache".to_string()], &[]);
        assert!(exclusion.is_ignored_absolute("/srv/www/cache/file.txt").is_some());
        assert!(exclusion.is_ignored_absolute("/srv/www/not-cache/file.txt").is_none());
    }

    #[test]
    fn substring_pattern_matches_anywhere() {
        let exclusion = Exclusion::new(&["/srv/www".to_string()], &["node_modules".to_string()], &[]);
        assert!(exclusion
            .is_ignored_absolute("/srv/www/vendor/pkg/node_modules/x.js")
            .is_some());
    }

    #[test]
    fn glob_pattern_matches_case_insensitively() {
        let exclusion = Exclusion::new(&["/srv/www".to_string()], &["*.LOG".to_string()], &[]);
        assert!(exclusion.is_ignored_absolute("/srv/www/app.log").is_some());
        assert!(exclusion.is_ignored_absolute("/srv/www/app.txt").is_none());
    }

    #[test]
    fn builtins_are_always_excluded() {
        let exclusion = Exclusion::new(&["/srv/www".to_string()], &[], &[]);
        assert!(exclusion
            .is_ignored_absolute("/srv/www/.deployment-index")
            .is_some());
        assert!(exclusion
            .is_ignored_absolute("/srv/www/.deployment-index.backup")
            .is_some());
        assert!(exclusion.is_ignored_absolute("/srv/www/.ftp-prod.json").is_some());
    }

    #[test]
    fn is_ignored_absolute_false_implies_relative_false() {
        let roots = vec!["/srv/www".to_string()];
        let exclusion = Exclusion::new(&roots, &["/cache".to_string()], &[]);

        let p = "/not-ignored/file.txt";
        assert!(exclusion.is_ignored_absolute(&format!("{}{}", roots[0], p)).is_none());
        assert!(!exclusion.is_ignored_relative(p));
    }

    #[test]
    fn mapping_reanchors_pattern_to_roots_not_already_under_local() {
        let roots = vec!["/srv/www".to_string()];
        let mapping = vec![("/vendor".to_string(), "/elsewhere/vendor".to_string())];
        let exclusion = Exclusion::new(&roots, &["/vendor".to_string()], &mapping);
        assert!(exclusion.is_ignored_absolute("/srv/www/vendor/pkg").is_some());
    }

    #[test]
    fn exact_literal_directory_match_is_detected() {
        let exclusion = Exclusion::new(&["/srv/www".to_string()], &["/srv/www/logs".to_string()], &[]);
        assert!(exclusion.is_exact_literal_match("/srv/www/logs"));
        assert!(!exclusion.is_exact_literal_match("/srv/www/logs/today"));
    }
}
