use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use serde_derive::Deserialize;
use validator::Validate;

use crate::core::GenericResult;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TimestampKind {
    Creation,
    LastAccess,
    #[default]
    LastWrite,
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CleanupGroup {
    #[validate(length(min = 1))]
    pub name: String,
    pub age_days: u32,
    #[validate(length(min = 1))]
    pub specs: Vec<String>,
    #[serde(default)]
    pub timestamp: TimestampKind,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub include_read_only: bool,
    #[serde(default)]
    pub apply_deletion_limit: bool,
    #[serde(default)]
    pub recurse: bool,
    #[serde(default)]
    pub recursion_scope: Option<String>,
}

impl CleanupGroup {
    pub fn age(&self) -> Duration {
        Duration::from_secs(u64::from(self.age_days) * 24 * 60 * 60)
    }

    /// Minimum number of files the backup cadence is expected to produce over the retention
    /// window.
    pub fn retain_minimum(&self, main_loop_minutes: u32) -> i64 {
        let main_loop_minutes = i64::from(main_loop_minutes.max(1));
        let runs_per_day = (24 * 60 + main_loop_minutes - 1) / main_loop_minutes;
        runs_per_day * (i64::from(self.age_days) + 1)
    }

    pub fn scope_folder(&self) -> Option<&str> {
        self.recursion_scope.as_deref().map(str::trim).filter(|scope| !scope.is_empty())
    }
}

/// A `directory/pattern` file specification.
pub struct FileSpec {
    pub directory: PathBuf,
    pub pattern: String,
    matcher: GlobMatcher,
}

impl FileSpec {
    pub fn parse(spec: &str) -> GenericResult<FileSpec> {
        let path = expanduser::expanduser(spec.trim())?;
        if !path.is_absolute() {
            return Err!("Invalid file specification {:?}: the path must be absolute", spec);
        }

        let pattern = path.file_name().and_then(|name| name.to_str()).ok_or_else(|| format!(
            "Invalid file specification {:?}: it has no file name pattern", spec))?;
        let directory = path.parent().map(Path::to_path_buf).ok_or_else(|| format!(
            "Invalid file specification {:?}: it has no directory", spec))?;

        // Traditional "everything" pattern which also matches names without extension
        let glob = if pattern == "*.*" {
            "*"
        } else {
            pattern
        };

        let matcher = GlobBuilder::new(glob).literal_separator(true).backslash_escape(true)
            .build().map_err(|e| format!("Invalid file pattern ({:?}): {}", pattern, e))?
            .compile_matcher();

        Ok(FileSpec {pattern: pattern.to_owned(), directory, matcher})
    }

    pub fn matches(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }
}
