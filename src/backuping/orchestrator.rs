use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use cow_utils::CowUtils;
use easy_logging::GlobalContext;
use itertools::Itertools;
use log::{debug, info};

use crate::control::StopToken;
use crate::core::{EmptyResult, GenericResult};
use crate::devices::{self, DeviceBitField};
use crate::process::{Completion, Invocation, ProcessSupervisor};
use crate::report::{Outcome, Reporter};

use super::config::{BackupConfig, BackupSet};
use super::hook::{self, HookStatus};
use super::naming;

/// Information about the running software passed to the done-hook.
#[derive(Clone, Debug)]
pub struct HookMetadata {
    pub software_name: String,
    pub software_location: String,
    pub config_path: String,
    pub log_path: String,
}

impl HookMetadata {
    pub fn new(config_path: &str, log_path: Option<&str>) -> HookMetadata {
        let software_location = std::env::current_exe()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();

        HookMetadata {
            software_name: env!("CARGO_PKG_NAME").to_owned(),
            software_location,
            config_path: config_path.to_owned(),
            log_path: log_path.unwrap_or_default().to_owned(),
        }
    }

    fn config_name(&self) -> String {
        Path::new(&self.config_path).file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct BackupReport {
    pub name: String,
    pub outcome: Outcome,
    pub output_path: Option<PathBuf>,
    pub command_line: Option<String>,
    pub compressor_exit_code: Option<i32>,
    pub copy_failures: u32,
    pub missing_devices: Vec<char>,
    pub error: Option<String>,
}

impl BackupReport {
    pub fn new(name: &str) -> BackupReport {
        BackupReport {
            name: name.to_owned(),
            outcome: Outcome::Failed,
            output_path: None,
            command_line: None,
            compressor_exit_code: None,
            copy_failures: 0,
            missing_devices: Vec::new(),
            error: None,
        }
    }

    fn fail(mut self, error: String) -> BackupReport {
        self.outcome = Outcome::Failed;
        self.error.replace(error);
        self
    }

    fn stop(mut self) -> BackupReport {
        self.outcome = Outcome::Stopped;
        self
    }

    pub fn is_good(&self) -> bool {
        self.outcome == Outcome::Good
    }
}

#[derive(Debug, Default)]
pub struct BackupSummary {
    pub sets: Vec<BackupReport>,
    pub stopped: bool,
}

impl BackupSummary {
    pub fn outcome(&self) -> Outcome {
        if self.stopped || self.sets.iter().any(|set| set.outcome == Outcome::Stopped) {
            Outcome::Stopped
        } else if self.sets.iter().all(BackupReport::is_good) {
            Outcome::Good
        } else {
            Outcome::Failed
        }
    }

    pub fn copy_failures(&self) -> u32 {
        self.sets.iter().map(|set| set.copy_failures).sum()
    }

    pub fn missing_devices(&self) -> Vec<char> {
        self.sets.iter().flat_map(|set| set.missing_devices.iter().copied()).sorted().dedup().collect()
    }

    /// Aggregated failure description, if the backup has failed.
    pub fn failure_message(&self) -> Option<String> {
        if self.outcome() != Outcome::Failed {
            return None;
        }

        let failed = self.sets.iter().filter(|set| !set.is_good()).map(|set| set.name.as_str()).join(", ");
        let mut message = format!("Backup has failed for: {}", failed);

        let copy_failures = self.copy_failures();
        if copy_failures != 0 {
            message += &format!(". Copy failures: {}", copy_failures);
        }

        let missing_devices = self.missing_devices();
        if !missing_devices.is_empty() {
            message += &format!(". Missing devices: {}", devices::format_letters(&missing_devices));
        }

        Some(message)
    }
}

pub struct BackupOrchestrator<'a> {
    config: &'a BackupConfig,
    supervisor: ProcessSupervisor,
    reporter: Reporter,
    metadata: HookMetadata,
    work_path: PathBuf,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(config: &'a BackupConfig, reporter: Reporter, metadata: HookMetadata) -> BackupOrchestrator<'a> {
        let supervisor = ProcessSupervisor::new(config.process.clone(), reporter.journal());
        BackupOrchestrator {config, supervisor, reporter, metadata, work_path: config.work_path()}
    }

    pub fn run_all(&self, stop: &StopToken) -> GenericResult<BackupSummary> {
        let sets: Vec<&BackupSet> = self.config.sets.iter().collect();
        self.run_sets(&sets, stop)
    }

    pub fn run_sets(&self, sets: &[&BackupSet], stop: &StopToken) -> GenericResult<BackupSummary> {
        let selected = self.config.selected_devices()?;
        self.check_devices(&selected);

        let mut summary = BackupSummary::default();

        for &set in sets {
            if stop.is_stopped() {
                summary.stopped = true;
                break;
            }

            let _context = GlobalContext::new(&set.name);
            let report = self.run(set, &selected, stop);

            if let Some(error) = report.error.as_ref() {
                self.reporter.item_error(error);
            }
            summary.sets.push(report);
        }

        Ok(summary)
    }

    fn check_devices(&self, selected: &DeviceBitField) {
        let current = devices::scan(selected.range(), &self.config.device_list(), &self.config.marker_name);
        debug!("Devices: current={}, selected={}.", current, selected);

        let missing = DeviceBitField::diff(selected, &current);
        if !missing.is_empty() {
            self.reporter.info(&format!(
                "The following backup devices are not attached: {}", devices::format_letters(&missing)));
        }
    }

    pub fn run(&self, set: &BackupSet, selected: &DeviceBitField, stop: &StopToken) -> BackupReport {
        let report = BackupReport::new(&set.name);
        if stop.is_stopped() {
            return report.stop();
        }

        let archive_path = set.archive_path(self.config);
        if let Err(err) = fs::create_dir_all(&archive_path) {
            return report.fail(format!("Unable to create {:?}: {}", archive_path, err));
        }

        let manifest_path = self.work_path.join(format!("{}-{}.list", self.metadata.software_name, set.name));
        if let Err(err) = write_manifest(&manifest_path, &set.source_patterns(self.config)) {
            return report.fail(format!("Unable to write file list to {:?}: {}", manifest_path, err));
        }

        let report = self.compress_and_replicate(set, selected, &archive_path, &manifest_path, stop, report);

        if let Err(err) = fs::remove_file(&manifest_path) {
            debug!("Failed to delete {:?}: {}.", manifest_path, err);
        }

        report
    }

    fn compress_and_replicate(
        &self, set: &BackupSet, selected: &DeviceBitField, archive_path: &Path, manifest_path: &Path,
        stop: &StopToken, mut report: BackupReport,
    ) -> BackupReport {
        let output_path = naming::output_path(
            archive_path, &set.output_name, &self.config.date_format, &self.config.extension,
            self.config.append, &Local::now());
        report.output_path.replace(output_path.clone());

        let invocation = Invocation::new(&self.config.compressor.program, substitute_arguments(
            &self.config.compressor.args, manifest_path, &output_path, archive_path));

        let command_line = invocation.command_line();
        info!("Compressing into {:?}...", output_path);
        self.reporter.line(&format!("Command: {}", command_line));
        report.command_line.replace(command_line);

        match self.supervisor.run(&invocation, stop) {
            Ok(Completion::Exited(code)) => {
                report.compressor_exit_code.replace(code);
                if code != 0 {
                    return report.fail(format!("Compressor has failed with {} exit code", code));
                }
            },
            Ok(Completion::Stopped) => return report.stop(),
            Ok(Completion::Unstoppable) => {
                let mut report = report.stop();
                report.error.replace(format!(
                    "{} process could not be stopped", invocation.name()));
                return report;
            },
            Err(err) => return report.fail(format!("Unable to run the compressor: {}", err)),
        }

        let Some(hook) = self.config.done_hook.as_ref() else {
            report.outcome = Outcome::Good;
            return report;
        };

        let status_path = self.work_path.join(format!("{}-{}.status", self.metadata.software_name, set.name));
        if let Err(err) = remove_if_exists(&status_path) {
            return report.fail(format!("Unable to delete {:?}: {}", status_path, err));
        }

        let mut args = hook.args.clone();
        args.extend(self.hook_arguments(set, &output_path, archive_path));

        let invocation = Invocation::new(&hook.program, args)
            .env(hook::STATUS_FILE_ENV, &status_path.to_string_lossy());

        info!("Running done-hook...");
        let exit_code = match self.supervisor.run(&invocation, stop) {
            Ok(Completion::Exited(code)) => code,
            Ok(Completion::Stopped) => return report.stop(),
            Ok(Completion::Unstoppable) => {
                let mut report = report.stop();
                report.error.replace(format!("{} process could not be stopped", invocation.name()));
                return report;
            },
            Err(err) => return report.fail(format!("Unable to run the done-hook: {}", err)),
        };

        let status = match hook::read_status_file(&status_path) {
            Ok(Some(status)) => status,
            Ok(None) => i64::from(exit_code),
            Err(err) => {
                self.reporter.item_error(&err.to_string());
                -1
            },
        };
        let _ = remove_if_exists(&status_path);

        let status = HookStatus::decode_or_fail(status, selected);
        debug!("Done-hook status: devices={}, copy failures={}.", status.devices, status.copy_failures);

        report.copy_failures = status.copy_failures;
        report.missing_devices = DeviceBitField::diff(selected, &status.devices);

        if !report.missing_devices.is_empty() {
            self.reporter.warning(&format!(
                "The backup hasn't been copied to the following devices: {}",
                devices::format_letters(&report.missing_devices)));
        }

        if status.copy_failures != 0 {
            return report.fail(format!("Failed to copy the backup {} times", status.copy_failures));
        }

        report.outcome = Outcome::Good;
        report
    }

    fn hook_arguments(&self, set: &BackupSet, output_path: &Path, archive_path: &Path) -> Vec<String> {
        let output_name = output_path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        vec![
            output_path.to_string_lossy().into_owned(),
            output_name,
            set.output_name.clone(),
            archive_path.to_string_lossy().into_owned(),
            self.metadata.software_name.clone(),
            self.metadata.software_location.clone(),
            self.metadata.config_path.clone(),
            self.metadata.config_name(),
            self.metadata.log_path.clone(),
        ]
    }
}

fn write_manifest(path: &Path, patterns: &[PathBuf]) -> EmptyResult {
    let mut file = fs::File::create(path)?;
    for pattern in patterns {
        writeln!(file, "{}", pattern.display())?;
    }
    Ok(file.sync_all()?)
}

fn substitute_arguments(template: &[String], manifest_path: &Path, output_path: &Path, archive_path: &Path) -> Vec<String> {
    let manifest_path = manifest_path.to_string_lossy();
    let output_path = output_path.to_string_lossy();
    let archive_path = archive_path.to_string_lossy();

    template.iter().map(|arg| {
        let arg = arg.cow_replace("{manifest}", &manifest_path);
        let arg = arg.cow_replace("{output}", &output_path);
        let arg = arg.cow_replace("{output_dir}", &archive_path);
        arg.into_owned()
    }).collect()
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}
