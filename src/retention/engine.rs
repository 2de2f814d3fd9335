use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};
use std::time::{Duration, SystemTime};

use easy_logging::GlobalContext;
use log::{debug, info};

use crate::control::StopToken;
use crate::report::{Outcome, Reporter};

use super::entry::{self, FileEntry};
use super::group::{CleanupGroup, FileSpec};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetentionDecision {
    Delete,
    TooYoung,
    HiddenExcluded,
    ReadOnlyExcluded,
    LimitExhausted,
}

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub deleted: usize,
    pub errors: usize,
    pub stopped: bool,
}

impl RetentionReport {
    pub fn outcome(&self) -> Outcome {
        if self.stopped {
            Outcome::Stopped
        } else if self.errors != 0 {
            Outcome::Failed
        } else {
            Outcome::Good
        }
    }

    fn merge(&mut self, other: RetentionReport) {
        self.deleted += other.deleted;
        self.errors += other.errors;
        self.stopped |= other.stopped;
    }
}

pub struct RetentionEngine {
    main_loop_minutes: u32,
    deletion_delay: Duration,
    reporter: Reporter,
}

impl RetentionEngine {
    pub fn new(main_loop_minutes: u32, deletion_delay: Duration, reporter: Reporter) -> RetentionEngine {
        RetentionEngine {main_loop_minutes, deletion_delay, reporter}
    }

    pub fn run_all(&self, groups: &[CleanupGroup], now: SystemTime, stop: &StopToken) -> RetentionReport {
        let mut report = RetentionReport::default();

        for group in groups {
            if stop.is_stopped() {
                report.stopped = true;
                break;
            }

            let _context = GlobalContext::new(&group.name);
            report.merge(self.run(group, now, stop));
        }

        report
    }

    pub fn run(&self, group: &CleanupGroup, now: SystemTime, stop: &StopToken) -> RetentionReport {
        let mut report = RetentionReport::default();
        let cutoff = now.checked_sub(group.age()).unwrap_or(SystemTime::UNIX_EPOCH);

        for spec in &group.specs {
            if stop.is_stopped() {
                report.stopped = true;
                break;
            }

            let file_spec = match FileSpec::parse(spec) {
                Ok(file_spec) => file_spec,
                Err(err) => {
                    self.reporter.item_error(&format!("Skipping {:?} cleanup rule: {}", spec, err));
                    report.errors += 1;
                    continue;
                },
            };

            if !file_spec.directory.is_dir() {
                debug!("Skipping {:?}: {:?} doesn't exist.", spec, file_spec.directory);
                continue;
            }

            debug!("Cleaning up {:?} in {:?}...", file_spec.pattern, file_spec.directory);
            let directory = file_spec.directory.clone();
            report.merge(self.process_directory(group, &file_spec, &directory, cutoff, stop));
        }

        if report.deleted != 0 {
            info!("{} files have been deleted.", report.deleted);
        }

        report
    }

    fn process_directory(
        &self, group: &CleanupGroup, spec: &FileSpec, directory: &Path, cutoff: SystemTime, stop: &StopToken,
    ) -> RetentionReport {
        let mut report = RetentionReport::default();

        let (mut entries, errors) = match entry::list_matching(directory, spec) {
            Ok(result) => result,
            Err(err) => {
                self.reporter.item_error(&format!("Unable to list {:?}: {}", directory, err));
                report.errors += 1;
                return report;
            },
        };

        for error in errors {
            self.reporter.item_error(&error);
            report.errors += 1;
        }

        // Oldest first, so the deletion limit always protects the newest files
        entries.sort_by_key(|entry| entry.timestamp(group.timestamp));
        let deletion_limit = entries.len() as i64 - group.retain_minimum(self.main_loop_minutes);

        for (index, entry) in entries.iter().enumerate() {
            if stop.is_stopped() {
                report.stopped = true;
                return report;
            }

            let decision = judge(group, entry, index, deletion_limit, cutoff);
            if decision == RetentionDecision::LimitExhausted {
                debug!("Keeping the rest of {:?}: the deletion limit ({}) is exhausted.",
                       directory, deletion_limit.max(0));
                break;
            } else if decision != RetentionDecision::Delete {
                continue;
            }

            match self.delete(group, entry) {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    self.reporter.item_error(&err);
                    report.errors += 1;
                },
            }

            if !stop.sleep(self.deletion_delay) {
                report.stopped = true;
                return report;
            }
        }

        if group.recurse {
            report.merge(self.process_subdirectories(group, spec, directory, cutoff, stop));
        }

        report
    }

    fn process_subdirectories(
        &self, group: &CleanupGroup, spec: &FileSpec, directory: &Path, cutoff: SystemTime, stop: &StopToken,
    ) -> RetentionReport {
        let mut report = RetentionReport::default();

        let subdirectories = match entry::list_subdirectories(directory) {
            Ok(subdirectories) => subdirectories,
            Err(err) => {
                self.reporter.item_error(&format!("Unable to list subdirectories of {:?}: {}", directory, err));
                report.errors += 1;
                return report;
            },
        };

        for subdirectory in subdirectories {
            if stop.is_stopped() {
                report.stopped = true;
                break;
            }

            report.merge(self.process_directory(group, spec, &subdirectory, cutoff, stop));
            if report.stopped {
                break;
            }

            if !is_prunable(&subdirectory, group.scope_folder()) {
                continue;
            }

            match entry::is_empty_directory(&subdirectory) {
                Ok(true) => {},
                Ok(false) => continue,
                Err(err) => {
                    self.reporter.item_error(&format!("Unable to list {:?}: {}", subdirectory, err));
                    report.errors += 1;
                    continue;
                },
            }

            match fs::remove_dir(&subdirectory) {
                Ok(()) => {
                    self.reporter.line(&format!("Deleted empty folder {}", subdirectory.display()));
                    report.deleted += 1;
                },
                Err(err) => {
                    self.reporter.item_error(&format!("Failed to delete {:?}: {}", subdirectory, err));
                    report.errors += 1;
                },
            }
        }

        report
    }

    fn delete(&self, group: &CleanupGroup, entry: &FileEntry) -> Result<(), String> {
        let path = &entry.path;

        if entry.read_only {
            clear_read_only(path).map_err(|e| format!(
                "Failed to delete {:?}: unable to clear read-only attribute: {}", path, e))?;
        }

        let result = if entry.is_dir {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| format!("Failed to delete {:?}: {}", path, e))?;

        self.reporter.line(&entry.describe(group.timestamp));
        Ok(())
    }
}

/// Decides the fate of the entry at `index` of the oldest-first sorted list.
pub fn judge(
    group: &CleanupGroup, entry: &FileEntry, index: usize, deletion_limit: i64, cutoff: SystemTime,
) -> RetentionDecision {
    if group.apply_deletion_limit && index as i64 >= deletion_limit {
        RetentionDecision::LimitExhausted
    } else if entry.timestamp(group.timestamp) >= cutoff {
        RetentionDecision::TooYoung
    } else if entry.hidden && !group.include_hidden {
        RetentionDecision::HiddenExcluded
    } else if entry.read_only && !group.include_read_only {
        RetentionDecision::ReadOnlyExcluded
    } else {
        RetentionDecision::Delete
    }
}

/// Subdirectories are pruned either anywhere (no scope) or inside the scope folder, but never
/// the scope folder itself.
pub fn is_prunable(path: &Path, scope_folder: Option<&str>) -> bool {
    let Some(scope) = scope_folder else {
        return true;
    };

    let inside_scope = path.components().any(|component| {
        matches!(component, Component::Normal(name) if name == scope)
    });

    inside_scope && path.file_name().is_none_or(|name| name != scope)
}

fn clear_read_only(path: &Path) -> std::io::Result<()> {
    let mut permissions = fs::symlink_metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o200);
    fs::set_permissions(path, permissions)?;

    if fs::symlink_metadata(path)?.permissions().readonly() {
        return Err(std::io::Error::other("the entry is still protected"));
    }

    Ok(())
}
