//! Path filtering via three wildcard blacklists (directory, filename,
//! full-path). A path is collectible iff none of the configured patterns
//! match it (§4.1). Built on `globset`, exactly as the teacher's
//! `graph/filter.rs` does for CLI include/exclude globs.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("invalid glob pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

pub struct Blacklist {
    dir_patterns: GlobSet,
    filepath_patterns: GlobSet,
    filename_patterns: GlobSet,
}

impl Blacklist {
    pub fn new(dir_blacklist: &[String], filepath_blacklist: &[String], filename_blacklist: &[String]) -> Result<Self, BlacklistError> {
        Ok(Blacklist {
            dir_patterns: build_set(dir_blacklist)?,
            filepath_patterns: build_set(filepath_blacklist)?,
            filename_patterns: build_set(filename_blacklist)?,
        })
    }

    pub fn empty() -> Self {
        Blacklist {
            dir_patterns: GlobSet::empty(),
            filepath_patterns: GlobSet::empty(),
            filename_patterns: GlobSet::empty(),
        }
    }

    pub fn is_dir_blacklisted(&self, dir: &Path) -> bool {
        self.dir_patterns.is_match(dir)
    }

    pub fn is_path_collectible(&self, full_path: &Path, filename: &str) -> bool {
        if self.filepath_patterns.is_match(full_path) {
            return false;
        }
        if self.filename_patterns.is_match(filename) {
            return false;
        }
        if let Some(parent) = full_path.parent() {
            if self.dir_patterns.is_match(parent) {
                return false;
            }
        }
        true
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, BlacklistError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| BlacklistError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| BlacklistError::InvalidPattern {
        pattern: patterns.join(","),
        source,
    })
}
