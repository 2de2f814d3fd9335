use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::TimeDelta;
use easy_logging::GlobalContext;
use log::{debug, error, info};
use nix::fcntl::Flock;

use crate::backuping::{BackupOrchestrator, BackupSummary, HookMetadata};
use crate::config::Config;
use crate::control::StopToken;
use crate::core::{EmptyResult, GenericResult};
use crate::metrics;
use crate::report::{FileJournal, Journal, LogJournal, Notifier, Outcome, Reporter};
use crate::retention::{RetentionEngine, RetentionReport};
use crate::util::sys::acquire_lock;

use super::state::{Cycle, Timing};

/// Exclusive lock on the configuration file. Cleanup runs under the lock, but it's released for
/// the backup phase which may take hours.
pub struct ConfigLock {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl ConfigLock {
    pub fn acquire(path: &Path) -> GenericResult<ConfigLock> {
        let lock = acquire_lock(path)?;
        Ok(ConfigLock {path: path.to_owned(), lock: Some(lock)})
    }

    pub fn release(&mut self) {
        if self.lock.take().is_some() {
            debug!("Released {:?} lock.", self.path);
        }
    }

    pub fn reacquire(&mut self) -> EmptyResult {
        if self.lock.is_none() {
            self.lock.replace(acquire_lock(&self.path)?);
            debug!("Reacquired {:?} lock.", self.path);
        }
        Ok(())
    }
}

/// Part of the cycle to execute.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Scope {
    #[default]
    All,
    Cleanup(Option<String>),
    Backup(Option<String>),
}

impl Scope {
    fn cleanup(&self) -> bool {
        matches!(self, Scope::All | Scope::Cleanup(_))
    }

    fn backup(&self) -> bool {
        matches!(self, Scope::All | Scope::Backup(_))
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub retention: RetentionReport,
    pub backup: Option<BackupSummary>,
}

impl CycleReport {
    pub fn outcome(&self) -> Outcome {
        let outcome = self.retention.outcome();
        match self.backup.as_ref() {
            Some(backup) => outcome.combine(backup.outcome()),
            None => outcome,
        }
    }

    pub fn failure_message(&self) -> Option<String> {
        let mut messages = Vec::new();

        if self.retention.errors != 0 {
            messages.push(format!("Failed to delete {} files", self.retention.errors));
        }

        if let Some(message) = self.backup.as_ref().and_then(BackupSummary::failure_message) {
            messages.push(message);
        }

        if messages.is_empty() {
            None
        } else {
            Some(messages.join(". "))
        }
    }
}

/// Production cycle: reads the configuration file anew on each run, cleans up and then backs up.
pub struct ConfiguredCycle {
    config_path: String,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ConfiguredCycle {
    pub fn new(config_path: &str, notifier: Option<Arc<dyn Notifier>>) -> ConfiguredCycle {
        ConfiguredCycle {config_path: config_path.to_owned(), notifier}
    }

    pub fn execute(&self, scope: &Scope, stop: &StopToken) -> GenericResult<CycleReport> {
        let config = Config::load(&self.config_path)?;
        let mut lock = ConfigLock::acquire(Path::new(&config.path))?;
        let reporter = self.reporter(&config)?;

        let mut report = CycleReport::default();

        if scope.cleanup() {
            report.retention = self.cleanup(&config, scope, &reporter, stop)?;
        }

        if scope.backup() {
            if let Some(backup) = config.backup.as_ref() {
                if stop.is_stopped() {
                    info!("Skipping backup: the cycle is being stopped.");
                    report.backup.replace(BackupSummary {sets: Vec::new(), stopped: true});
                } else {
                    let metadata = HookMetadata::new(&config.path, config.log_path.as_deref());
                    let orchestrator = BackupOrchestrator::new(backup, reporter.clone(), metadata);

                    lock.release();
                    let summary = match scope {
                        Scope::Backup(Some(name)) => config.get_backup_set(name).and_then(|set| {
                            orchestrator.run_sets(&[set], stop)
                        }),
                        _ => orchestrator.run_all(stop),
                    };
                    if let Err(err) = lock.reacquire() {
                        error!("{}.", err);
                    }

                    report.backup.replace(summary?);
                }
            } else if let Scope::Backup(_) = scope {
                return Err!("Backup is not configured in the configuration file");
            }
        }

        match report.failure_message() {
            Some(message) => reporter.error(&message),
            None => match report.outcome() {
                Outcome::Good => info!("The cycle has completed successfully."),
                _ => info!("The cycle has been interrupted."),
            },
        }

        if let Some(metrics_path) = config.metrics_path.as_ref() {
            metrics::collect(&report);
            if let Err(err) = metrics::save(metrics_path) {
                error!("Failed to save metrics to {:?}: {}.", metrics_path, err);
            }
        }

        Ok(report)
    }

    fn cleanup(&self, config: &Config, scope: &Scope, reporter: &Reporter, stop: &StopToken) -> GenericResult<RetentionReport> {
        let engine = RetentionEngine::new(
            config.schedule.main_loop_minutes, config.retention.deletion_delay, reporter.clone());

        // The same point in time for all groups, so they are judged consistently
        let now = SystemTime::now();

        Ok(match scope {
            Scope::Cleanup(Some(name)) => {
                let group = config.get_group(name)?;
                let _context = GlobalContext::new(&group.name);
                engine.run(group, now, stop)
            },
            _ => engine.run_all(&config.retention.groups, now, stop),
        })
    }

    fn reporter(&self, config: &Config) -> GenericResult<Reporter> {
        let journal: Arc<dyn Journal> = match config.log_path.as_ref() {
            Some(path) => Arc::new(FileJournal::open(Path::new(path))?),
            None => Arc::new(LogJournal),
        };
        Ok(Reporter::new(journal, self.notifier.clone(), config.error_popups))
    }
}

impl Cycle for ConfiguredCycle {
    fn timing(&mut self) -> GenericResult<Timing> {
        let config = Config::load(&self.config_path)?;
        Ok(Timing {
            start_time: config.schedule.start_time,
            interval: TimeDelta::minutes(config.schedule.main_loop_minutes.into()),
        })
    }

    fn run(&mut self, stop: &StopToken) -> Outcome {
        match self.execute(&Scope::All, stop) {
            Ok(report) => report.outcome(),
            Err(err) => {
                Reporter::new(Arc::new(LogJournal), self.notifier.clone(), true).error(&format!(
                    "The cycle has failed: {}", err));
                Outcome::Failed
            },
        }
    }
}
