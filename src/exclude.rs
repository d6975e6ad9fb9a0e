//! Exclusion-pattern matching (§6). Three token shapes are recognized:
//! a trailing `/` matches any path component; a leading `*.` matches a file
//! suffix; anything else is a plain substring match.

pub struct ExcludeSet {
    dir_components: Vec<String>,
    suffixes: Vec<String>,
    substrings: Vec<String>,
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Self {
        let mut dir_components = Vec::new();
        let mut suffixes = Vec::new();
        let mut substrings = Vec::new();
        for p in patterns {
            if let Some(stripped) = p.strip_suffix('/') {
                dir_components.push(stripped.to_string());
            } else if let Some(suffix) = p.strip_prefix("*.") {
                suffixes.push(format!(".{suffix}"));
            } else {
                substrings.push(p.clone());
            }
        }
        Self { dir_components, suffixes, substrings }
    }

    /// `rel_path` must already be forward-slash normalized.
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        if self.dir_components.iter().any(|d| rel_path.split('/').any(|c| c == d)) {
            return true;
        }
        if self.suffixes.iter().any(|s| rel_path.ends_with(s.as_str())) {
            return true;
        }
        self.substrings.iter().any(|s| rel_path.contains(s.as_str()))
    }
}
