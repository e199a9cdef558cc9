//! Glob-style key patterns, matching the subset Redis `SCAN MATCH` accepts
//! that the dependency index and bulk eviction rely on: `*` and `?`.

use regex::Regex;

use crate::error::{CacheError, CacheResult};

/// Compiled key pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    regex: Regex,
}

impl KeyPattern {
    /// Compile a glob into an anchored regex.
    pub fn new(glob: &str) -> CacheResult<Self> {
        let mut expr = String::with_capacity(glob.len() + 8);
        expr.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| CacheError::Pattern(e.to_string()))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}
