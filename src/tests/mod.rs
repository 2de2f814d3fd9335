use std::fs;
use std::path::PathBuf;
use std::sync::Once;
use std::thread;
use std::time::{Duration, SystemTime};

use assert_fs::fixture::TempDir;
use filetime::FileTime;
use indoc::formatdoc;

use crate::backuping::HookStatus;
use crate::control::StopToken;
use crate::core::{EmptyResult, GenericResult};
use crate::devices::{DeviceBitField, LetterRange};
use crate::report::Outcome;
use crate::scheduler::{ConfiguredCycle, CycleReport, Scope};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = easy_logging::init(module_path!().split("::").next().unwrap(), log::Level::Info);
    });
}

struct Environment {
    _temp_dir: TempDir,
    root: PathBuf,
    config_path: PathBuf,
}

impl Environment {
    fn new(compressor_script: &str, hook_script: &str) -> GenericResult<Environment> {
        init_logging();

        let temp_dir = TempDir::new()?;
        let root = temp_dir.canonicalize()?;

        for dir in ["logs", "documents", "archive", "usb0", "work"] {
            fs::create_dir(root.join(dir))?;
        }
        fs::write(root.join("usb0/BACKUP.MARK"), "")?;
        fs::write(root.join("documents/report.txt"), "report")?;

        let old_log = root.join("logs/old.log");
        fs::write(&old_log, "old")?;
        filetime::set_file_mtime(&old_log, days_ago(10))?;
        fs::write(root.join("logs/new.log"), "new")?;

        let config_path = root.join("rotabak.yaml");
        fs::write(&config_path, formatdoc!(r#"
            schedule:
              start_time: "02:30"
              main_loop_minutes: 1440
            log_path: {root}/rotabak.log
            retention:
              deletion_delay: 0ms
              groups:
                - name: logs
                  age_days: 1
                  specs: ["{root}/logs/*.log"]
            backup:
              archive_path: {root}/archive
              work_path: {root}/work
              compressor:
                program: /bin/sh
                args: ["-c", '{compressor_script}', "compressor", "{{manifest}}", "{{output}}"]
              done_hook:
                program: /bin/sh
                args: ["-c", '{hook_script}', "done-hook"]
              selected_devices: E
              devices:
                - {{letter: E, path: {root}/usb0}}
              process:
                poll_interval: 10ms
                kill_retry_wait: 100ms
              sets:
                - name: documents
                  sources: [{root}/documents]
                  output_name: docs
        "#, root=root.display()))?;

        Ok(Environment {_temp_dir: temp_dir, root, config_path})
    }

    fn execute(&self, scope: Scope, stop: &StopToken) -> GenericResult<CycleReport> {
        ConfiguredCycle::new(self.config_path.to_str().unwrap(), None).execute(&scope, stop)
    }

    fn archives(&self) -> GenericResult<Vec<PathBuf>> {
        let mut archives = Vec::new();
        for entry in fs::read_dir(self.root.join("archive"))? {
            archives.push(entry?.path());
        }
        archives.sort();
        Ok(archives)
    }
}

fn days_ago(days: u64) -> FileTime {
    FileTime::from_system_time(SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60))
}

fn copied_to_selected_devices() -> i64 {
    let range = LetterRange::new('C').unwrap();
    let devices = DeviceBitField::from_letters(range, "E").unwrap();
    HookStatus {devices, copy_failures: 0}.encode()
}

const COMPRESSOR: &str = r#"cat "$1" > "$2""#;

#[test]
fn full_cycle() -> EmptyResult {
    let hook = format!(
        r#"echo "$2 $3 $5" > "$(dirname "$1")/../hook.args"; echo {} > "$ROTABAK_STATUS_FILE""#,
        copied_to_selected_devices());
    let env = Environment::new(COMPRESSOR, &hook)?;

    let report = env.execute(Scope::All, &StopToken::new())?;
    assert_eq!(report.outcome(), Outcome::Good, "{:?}", report);
    assert_eq!(report.retention.deleted, 1);

    assert!(!env.root.join("logs/old.log").exists());
    assert!(env.root.join("logs/new.log").exists());

    let archives = env.archives()?;
    assert_eq!(archives.len(), 1);

    let manifest = fs::read_to_string(&archives[0])?;
    assert_eq!(manifest.trim(), env.root.join("documents/*").to_str().unwrap());
    assert_eq!(fs::read_dir(env.root.join("work"))?.count(), 0);

    let archive_name = archives[0].file_name().unwrap().to_str().unwrap();
    assert!(archive_name.starts_with("docs-") && archive_name.ends_with(".7z"));

    let hook_args = fs::read_to_string(env.root.join("hook.args"))?;
    assert_eq!(hook_args.trim(), format!("{} docs rotabak", archive_name));

    let set = &report.backup.as_ref().unwrap().sets[0];
    assert_eq!(set.compressor_exit_code, Some(0));
    assert!(set.missing_devices.is_empty());

    let journal = fs::read_to_string(env.root.join("rotabak.log"))?;
    assert!(journal.contains("old.log"));
    assert!(journal.contains("Command: /bin/sh -c"));

    // The second run never overwrites the existing archive
    let report = env.execute(Scope::Backup(None), &StopToken::new())?;
    assert_eq!(report.outcome(), Outcome::Good);
    assert_eq!(report.retention.deleted, 0);
    assert_eq!(env.archives()?.len(), 2);

    Ok(())
}

#[test]
fn copy_failures() -> EmptyResult {
    let env = Environment::new(COMPRESSOR, "exit 205")?;

    let report = env.execute(Scope::Backup(Some(s!("documents"))), &StopToken::new())?;
    assert_eq!(report.outcome(), Outcome::Failed);

    let set = &report.backup.as_ref().unwrap().sets[0];
    assert_eq!(set.outcome, Outcome::Failed);
    assert_eq!(set.copy_failures, 5);
    assert_eq!(set.missing_devices, vec!['E']);

    let message = report.failure_message().unwrap();
    assert!(message.contains("Copy failures: 5"), "{}", message);
    assert!(message.contains("Missing devices: E:"), "{}", message);

    // Cleanup hasn't been requested
    assert!(env.root.join("logs/old.log").exists());

    Ok(())
}

#[test]
fn compressor_failure() -> EmptyResult {
    let env = Environment::new("exit 2", r#"touch "$(dirname "$1")/../hook.ran""#)?;

    let report = env.execute(Scope::Backup(None), &StopToken::new())?;
    let set = &report.backup.as_ref().unwrap().sets[0];

    assert_eq!(set.outcome, Outcome::Failed);
    assert_eq!(set.compressor_exit_code, Some(2));
    assert!(!env.root.join("hook.ran").exists());

    Ok(())
}

#[test]
fn cancellation() -> EmptyResult {
    let env = Environment::new("sleep 30", r#"touch "$(dirname "$1")/../hook.ran""#)?;

    let stop = StopToken::new();
    let stopper = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            stop.stop();
        })
    };

    let report = env.execute(Scope::Backup(None), &stop)?;
    stopper.join().unwrap();

    assert_eq!(report.outcome(), Outcome::Stopped);
    assert_eq!(report.backup.as_ref().unwrap().sets[0].outcome, Outcome::Stopped);
    assert!(report.failure_message().is_none());
    assert!(!env.root.join("hook.ran").exists());

    Ok(())
}

#[test]
fn backup_skipped_on_stop() -> EmptyResult {
    let env = Environment::new(COMPRESSOR, r#"touch "$(dirname "$1")/../hook.ran""#)?;

    let stop = StopToken::new();
    stop.stop();

    let report = env.execute(Scope::Backup(None), &stop)?;
    assert_eq!(report.outcome(), Outcome::Stopped);

    let backup = report.backup.as_ref().unwrap();
    assert!(backup.stopped && backup.sets.is_empty());
    assert!(report.failure_message().is_none());

    assert!(env.archives()?.is_empty());
    assert!(!env.root.join("hook.ran").exists());

    Ok(())
}

#[test]
fn unknown_set() -> EmptyResult {
    let env = Environment::new(COMPRESSOR, "exit 0")?;
    assert!(env.execute(Scope::Backup(Some(s!("missing"))), &StopToken::new()).is_err());
    assert!(env.execute(Scope::Cleanup(Some(s!("missing"))), &StopToken::new()).is_err());
    assert!(env.archives()?.is_empty());
    Ok(())
}

#[test]
fn config_is_unlocked_during_backup() -> EmptyResult {
    let env = Environment::new(
        r#"cat "$1" > "$2"; touch "$(dirname "$2")/../compressed""#,
        r#"while [ ! -e "$(dirname "$1")/../checked" ]; do sleep 0.05; done; exit 100"#)?;

    let config_path = env.config_path.clone();
    let root = env.root.clone();
    let checker = thread::spawn(move || -> bool {
        while !root.join("compressed").exists() {
            thread::sleep(Duration::from_millis(10));
        }
        let unlocked = crate::util::sys::acquire_lock(&config_path).is_ok();
        fs::write(root.join("checked"), "").unwrap();
        unlocked
    });

    let report = env.execute(Scope::All, &StopToken::new())?;
    assert!(checker.join().unwrap());
    assert_ne!(report.outcome(), Outcome::Stopped);

    Ok(())
}
