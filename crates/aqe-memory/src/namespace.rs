//! Key-path rules for shared memory.
//!
//! Keys look like `<namespace>/<agent>/<resource>`. The namespace segment is a
//! fixed literal taken from configuration; anything outside it is rejected
//! before a backend is touched.

use aqe_config::MemoryConfig;
use aqe_core::{AqeError, Result};

/// The reserved namespace every memory key must live under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
    max_key_len: usize,
}

impl Namespace {
    pub fn new(root: impl Into<String>, max_key_len: usize) -> Result<Self> {
        let root = root.into();
        if root.is_empty() {
            return Err(AqeError::validation("memory.namespace", "must not be empty"));
        }
        if let Some(c) = root.chars().find(|c| *c == '/' || *c == '*' || bad_char(*c)) {
            return Err(AqeError::validation(
                "memory.namespace",
                format!("'{root}' contains invalid character {c:?}"),
            ));
        }
        if max_key_len <= root.len() + 1 {
            return Err(AqeError::validation(
                "memory.max_key_len",
                format!("{max_key_len} leaves no room for keys under '{root}/'"),
            ));
        }
        Ok(Self { root, max_key_len })
    }

    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        Self::new(config.namespace.clone(), config.max_key_len)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn max_key_len(&self) -> usize {
        self.max_key_len
    }

    /// Build and validate `<namespace>/<part>/<part>...`.
    pub fn key(&self, parts: &[&str]) -> Result<String> {
        let key = std::iter::once(self.root.as_str())
            .chain(parts.iter().copied())
            .collect::<Vec<_>>()
            .join("/");
        self.validate_key(&key)?;
        Ok(key)
    }

    /// A concrete key: namespaced, non-empty segments, no wildcards.
    pub fn validate_key(&self, key: &str) -> Result<()> {
        self.check_path(key, "key", false)
    }

    /// A search pattern: same shape as a key, `*` allowed.
    pub fn validate_pattern(&self, pattern: &str) -> Result<()> {
        self.check_path(pattern, "pattern", true)
    }

    /// A listing prefix: the bare namespace or anything that starts with `<namespace>/`.
    pub fn validate_prefix(&self, prefix: &str) -> Result<()> {
        if prefix != self.root && !prefix.starts_with(&format!("{}/", self.root)) {
            return Err(AqeError::validation(
                "prefix",
                format!("'{prefix}' is outside namespace '{}'", self.root),
            ));
        }
        if let Some(c) = prefix.chars().find(|c| *c == '*' || bad_char(*c)) {
            return Err(AqeError::validation(
                "prefix",
                format!("'{prefix}' contains invalid character {c:?}"),
            ));
        }
        Ok(())
    }

    fn check_path(&self, path: &str, field: &str, allow_wildcard: bool) -> Result<()> {
        if path.len() > self.max_key_len {
            return Err(AqeError::validation(
                field,
                format!("length {} exceeds limit {}", path.len(), self.max_key_len),
            ));
        }
        let Some(rest) = path
            .strip_prefix(self.root.as_str())
            .and_then(|r| r.strip_prefix('/'))
        else {
            return Err(AqeError::validation(
                field,
                format!("'{path}' must start with '{}/'", self.root),
            ));
        };
        if rest.split('/').any(str::is_empty) {
            return Err(AqeError::validation(
                field,
                format!("'{path}' has an empty path segment"),
            ));
        }
        if let Some(c) = path
            .chars()
            .find(|c| bad_char(*c) || (!allow_wildcard && *c == '*'))
        {
            return Err(AqeError::validation(
                field,
                format!("'{path}' contains invalid character {c:?}"),
            ));
        }
        Ok(())
    }
}

fn bad_char(c: char) -> bool {
    c.is_whitespace() || c.is_control()
}

/// Glob match where `*` matches any run of characters, `/` included.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while ki < k.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            resume = ki;
            pi += 1;
        } else if pi < p.len() && p[pi] == k[ki] {
            pi += 1;
            ki += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ki = resume;
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Translate a `*`-only pattern into SQLite `GLOB` syntax.
pub(crate) fn to_sql_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            other => out.push(other),
        }
    }
    out
}

/// Escape every GLOB metacharacter so the text matches literally.
pub(crate) fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("aqe", 64).unwrap()
    }

    #[test]
    fn test_accepts_namespaced_keys() {
        assert!(ns().validate_key("aqe/gen/plan").is_ok());
        assert!(ns().validate_key("aqe/x").is_ok());
        assert_eq!(ns().key(&["cov", "result"]).unwrap(), "aqe/cov/result");
    }

    #[test]
    fn test_rejects_malformed_keys() {
        let ns = ns();
        for bad in [
            "gen/plan",
            "aqe",
            "aqe/",
            "aqe//plan",
            "aqe/gen/",
            "aqex/gen",
            "aqe/gen plan",
            "aqe/gen/*",
            "",
        ] {
            assert!(ns.validate_key(bad).unwrap_err().is_validation(), "{bad}");
        }
        let long = format!("aqe/{}", "k".repeat(80));
        assert!(ns.validate_key(&long).is_err());
    }

    #[test]
    fn test_patterns_allow_wildcards() {
        let ns = ns();
        assert!(ns.validate_pattern("aqe/*").is_ok());
        assert!(ns.validate_pattern("aqe/*/result").is_ok());
        assert!(ns.validate_pattern("*").is_err());
        assert!(ns.validate_pattern("other/*").is_err());
    }

    #[test]
    fn test_prefix_rules() {
        let ns = ns();
        assert!(ns.validate_prefix("aqe").is_ok());
        assert!(ns.validate_prefix("aqe/").is_ok());
        assert!(ns.validate_prefix("aqe/gen").is_ok());
        assert!(ns.validate_prefix("aq").is_err());
        assert!(ns.validate_prefix("aqe/*").is_err());
    }

    #[test]
    fn test_namespace_root_rules() {
        assert!(Namespace::new("", 64).is_err());
        assert!(Namespace::new("a/b", 64).is_err());
        assert!(Namespace::new("aqe", 4).is_err());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("aqe/*", "aqe/gen/plan"));
        assert!(glob_match("aqe/*/plan", "aqe/gen/plan"));
        assert!(glob_match("aqe/*/plan", "aqe/a/b/plan"));
        assert!(glob_match("aqe/gen/plan", "aqe/gen/plan"));
        assert!(glob_match("aqe/*an", "aqe/gen/plan"));
        assert!(!glob_match("aqe/*/plan", "aqe/gen/plans"));
        assert!(!glob_match("aqe/cov/*", "aqe/gen/plan"));
        assert!(glob_match("aqe/**", "aqe/x"));
    }

    #[test]
    fn test_sql_glob_escaping() {
        assert_eq!(to_sql_glob("aqe/*/r?[1]"), "aqe/*/r[?][[]1]");
        assert_eq!(escape_glob("aqe/a*b"), "aqe/a[*]b");
    }
}
