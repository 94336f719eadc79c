//! Glob key patterns
//!
//! `*` matches any run of characters, `?` matches exactly one, everything
//! else is literal. Patterns match the whole key.

use regex::Regex;

use crate::error::{Error, Result};

/// Compiled glob pattern
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compile a glob
    pub fn new(glob: &str) -> Result<Self> {
        let mut source = String::with_capacity(glob.len() + 12);
        // wildcards match any character, newlines included
        source.push_str("(?s)^");
        for c in glob.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                c => source.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source)
            .map_err(|e| Error::Internal(format!("invalid key pattern {:?}: {}", glob, e)))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// Whether `key` matches
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Original glob text
    pub fn as_str(&self) -> &str {
        &self.glob
    }
}
