//! Path prefix matching

/// Case-insensitive, segment-aware prefix matcher
///
/// A prefix matches when the path starts with it (ASCII case-insensitive) and the
/// match ends on a segment boundary: either the path ends there or a `/` follows.
/// The root prefix `/` matches every path.
#[derive(Debug, Clone, Copy)]
pub struct PrefixMatcher<'a> {
    prefix: &'a str,
}

impl<'a> PrefixMatcher<'a> {
    /// Create a matcher for a normalized prefix
    pub fn new(prefix: &'a str) -> Self {
        Self { prefix }
    }

    /// Whether this is the catch-all root prefix
    pub fn is_root(&self) -> bool {
        self.prefix == "/"
    }

    /// Check if a path matches this prefix
    pub fn matches(&self, path: &str) -> bool {
        if self.is_root() {
            return path.starts_with('/');
        }

        let n = self.prefix.len();
        if path.len() < n || !path.as_bytes()[..n].eq_ignore_ascii_case(self.prefix.as_bytes()) {
            return false;
        }

        path.len() == n || path.as_bytes()[n] == b'/'
    }

    /// Remaining path after the prefix, always starting with `/` (or empty)
    ///
    /// Returns `None` when the path does not match.
    pub fn strip<'p>(&self, path: &'p str) -> Option<&'p str> {
        if !self.matches(path) {
            return None;
        }
        if self.is_root() {
            return Some(path);
        }
        Some(&path[self.prefix.len()..])
    }
}
