use std::io::{BufWriter, Write};
use std::fs::{self, File};

use lazy_static::lazy_static;
use prometheus::{self, Encoder, Gauge, GaugeVec, TextEncoder};

use crate::backuping::BackupReport;
use crate::core::{EmptyResult, GenericError};
use crate::report::Outcome;
use crate::scheduler::CycleReport;

lazy_static! {
    static ref DELETED_FILES: Gauge = register(
        "deleted_files", "Number of files deleted by the last cleanup.");
    static ref RETENTION_ERRORS: Gauge = register(
        "retention_errors", "Number of files the last cleanup has failed to delete.");
    static ref MISSING_DEVICES: Gauge = register(
        "missing_devices", "Number of devices the last backup hasn't been copied to.");
    static ref CYCLE_STATUS: Gauge = register(
        "cycle_status", "Status of the last cycle: 0 - good, 1 - failed, 2 - stopped.");
    static ref LAST_SUCCESS_TIME: Gauge = register(
        "last_success_time", "Time of the last successful cycle.");

    static ref BACKUP_STATUS: GaugeVec = register_vec(
        "backup_status", "Status of the last backup: 0 - good, 1 - failed, 2 - stopped.");
    static ref COPY_FAILURES: GaugeVec = register_vec(
        "copy_failures", "Number of failed archive copies in the last backup.");
}

pub fn collect(report: &CycleReport) {
    let outcome = report.outcome();

    DELETED_FILES.set(report.retention.deleted as f64);
    RETENTION_ERRORS.set(report.retention.errors as f64);
    CYCLE_STATUS.set(status(outcome));

    if outcome == Outcome::Good {
        LAST_SUCCESS_TIME.set(chrono::Utc::now().timestamp() as f64);
    }

    if let Some(backup) = report.backup.as_ref() {
        MISSING_DEVICES.set(backup.missing_devices().len() as f64);

        for set in &backup.sets {
            collect_backup(set);
        }
    }
}

fn collect_backup(set: &BackupReport) {
    BACKUP_STATUS.with_label_values(&[&set.name]).set(status(set.outcome));
    COPY_FAILURES.with_label_values(&[&set.name]).set(set.copy_failures as f64);
}

pub fn save(path: &str) -> EmptyResult {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();

    let temp_path = format!("{}.tmp", path);
    let mut file = BufWriter::new(File::create(&temp_path)?);

    encoder.encode(&metrics, &mut file)
        .map_err(Into::into)
        .and_then(|_| {
            Ok(file.flush()?)
        })
        .or_else(|err: GenericError| {
            fs::remove_file(&temp_path)?;
            Err(err)
        })?;

    Ok(fs::rename(&temp_path, path)?)
}

fn status(outcome: Outcome) -> f64 {
    match outcome {
        Outcome::Good => 0.0,
        Outcome::Failed => 1.0,
        Outcome::Stopped => 2.0,
    }
}

fn register(name: &str, help: &str) -> Gauge {
    prometheus::register_gauge!(format!("rotabak_{}", name), help).unwrap()
}

fn register_vec(name: &str, help: &str) -> GaugeVec {
    prometheus::register_gauge_vec!(format!("rotabak_{}", name), help, &["name"]).unwrap()
}

#[cfg(test)]
mod tests {
    use crate::backuping::BackupSummary;
    use crate::retention::RetentionReport;

    use super::*;

    #[test]
    fn saving() {
        let temp_dir = assert_fs::TempDir::new().unwrap();
        let path = temp_dir.join("rotabak.prom");
        let path = path.to_str().unwrap();

        let mut set = BackupReport::new("documents");
        set.outcome = Outcome::Failed;
        set.copy_failures = 2;

        collect(&CycleReport {
            retention: RetentionReport {deleted: 3, errors: 0, stopped: false},
            backup: Some(BackupSummary {sets: vec![set], stopped: false}),
        });
        save(path).unwrap();

        let metrics = fs::read_to_string(path).unwrap();
        assert!(metrics.contains("rotabak_deleted_files 3"));
        assert!(metrics.contains("rotabak_copy_failures{name=\"documents\"} 2"));
        assert!(metrics.contains("rotabak_cycle_status 1"));
        assert!(!fs::exists(format!("{}.tmp", path)).unwrap());
    }
}
