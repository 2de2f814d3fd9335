use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde::de::{self, Deserializer, Visitor};
use serde_derive::Deserialize;
use validator::Validate;

use crate::core::GenericResult;
use crate::devices::{Device, DeviceBitField, LetterRange};
use crate::retention::CleanupGroup;

use crate::backuping::{BackupConfig, BackupSet};

#[derive(Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(skip)]
    pub path: String,

    #[validate(nested)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub error_popups: bool,
    pub log_path: Option<String>,
    pub metrics_path: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub retention: RetentionConfig,

    #[validate(nested)]
    pub backup: Option<BackupConfig>,
}

#[derive(Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    #[serde(deserialize_with = "deserialize_time")]
    pub start_time: NaiveTime,
    #[validate(range(min = 1))]
    pub main_loop_minutes: u32,
    #[serde(default = "default_tick", deserialize_with = "deserialize_duration")]
    pub tick: Duration,
}

#[derive(Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default = "default_deletion_delay", deserialize_with = "deserialize_duration")]
    pub deletion_delay: Duration,
    #[serde(default)]
    #[validate(nested)]
    pub groups: Vec<CleanupGroup>,
}

impl Default for RetentionConfig {
    fn default() -> RetentionConfig {
        RetentionConfig {
            deletion_delay: default_deletion_delay(),
            groups: Vec::new(),
        }
    }
}

fn default_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_deletion_delay() -> Duration {
    Duration::from_millis(10)
}

impl Config {
    pub fn load(path: &str) -> GenericResult<Config> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Config::parse(path, &data)
    }

    pub fn parse(path: &str, data: &[u8]) -> GenericResult<Config> {
        let mut config: Config = serde_yaml::from_slice(data)?;
        config.path = path.to_owned();
        config.validate()?;

        if config.schedule.tick.is_zero() {
            return Err!("Invalid scheduler tick: it must be positive");
        }

        let mut group_names = HashSet::new();
        for group in &config.retention.groups {
            if !group_names.insert(&group.name) {
                return Err!("Duplicated cleanup group name: {:?}", group.name);
            }
        }

        if let Some(log_path) = config.log_path.clone() {
            config.log_path.replace(validate_local_path(&log_path)?);
        }

        if let Some(metrics_path) = config.metrics_path.clone() {
            config.metrics_path.replace(validate_local_path(&metrics_path)?);
        }

        if let Some(backup) = config.backup.as_mut() {
            validate_backup_config(backup)?;
        }

        Ok(config)
    }

    pub fn get_group(&self, name: &str) -> GenericResult<&CleanupGroup> {
        for group in &self.retention.groups {
            if group.name == name {
                return Ok(group);
            }
        }

        Err!("{:?} cleanup group is not specified in the configuration file", name)
    }

    pub fn get_backup_set(&self, name: &str) -> GenericResult<&BackupSet> {
        let backup = self.backup.as_ref().ok_or(
            "Backup is not configured in the configuration file")?;

        for set in &backup.sets {
            if set.name == name {
                return Ok(set);
            }
        }

        Err!("{:?} backup set is not specified in the configuration file", name)
    }
}

fn validate_backup_config(backup: &mut BackupConfig) -> GenericResult<()> {
    backup.archive_path = validate_local_path(&backup.archive_path)?;

    if let Some(work_path) = backup.work_path.clone() {
        backup.work_path.replace(validate_local_path(&work_path)?);
    }

    if backup.sets.is_empty() {
        return Err!("At least one backup set must be configured");
    }

    let mut set_names = HashSet::new();
    for set in backup.sets.iter_mut() {
        if !set_names.insert(set.name.clone()) {
            return Err!("Duplicated backup set name: {:?}", set.name);
        }

        if let Some(archive_path) = set.archive_path.clone() {
            set.archive_path.replace(validate_local_path(&archive_path)?);
        }

        for source in set.sources.iter_mut() {
            *source = validate_local_path(source)?;
        }
    }

    crate::backuping::validate_date_format(&backup.date_format)?;

    let range = backup.letter_range()?;
    backup.selected_devices()?;

    let mut letters = HashSet::new();
    for device in backup.devices.iter_mut() {
        if !DeviceBitField::empty(range).set(device.letter) {
            return Err!("Invalid device letter {:?}: it's out of {}-based range", device.letter, range.first());
        }

        if !letters.insert(device.letter.to_ascii_uppercase()) {
            return Err!("Duplicated device letter: {:?}", device.letter);
        }

        device.path = validate_local_path(&device.path)?;
    }

    Ok(())
}

impl BackupConfig {
    pub fn letter_range(&self) -> GenericResult<LetterRange> {
        LetterRange::new(self.first_letter)
    }

    pub fn selected_devices(&self) -> GenericResult<DeviceBitField> {
        DeviceBitField::from_letters(self.letter_range()?, &self.selected_devices)
    }

    /// Directory for manifest and status files.
    pub fn work_path(&self) -> PathBuf {
        self.work_path.as_ref().map(PathBuf::from).unwrap_or_else(std::env::temp_dir)
    }

    pub fn device_list(&self) -> Vec<Device> {
        self.devices.iter().map(|device| Device {
            letter: device.letter.to_ascii_uppercase(),
            path: PathBuf::from(&device.path),
        }).collect()
    }
}

fn validate_path(path: &str) -> GenericResult<String> {
    let mut normalized_path = PathBuf::new();
    let mut path_components = Path::new(path).components();

    if path_components.next() != Some(Component::RootDir) {
        return Err!("Paths must be absolute: {:?}", path);
    }
    normalized_path.push(Component::RootDir.as_os_str());

    for component in path_components {
        if let Component::Normal(component) = component {
            normalized_path.push(component);
        } else {
            return Err!("Invalid path: {}", path);
        }
    }

    Ok(normalized_path.to_str().ok_or_else(|| format!("Invalid path: {:?}", path))?.to_owned())
}

fn validate_local_path(path: &str) -> GenericResult<String> {
    validate_path(&shellexpand::tilde(path))
}

fn deserialize_time<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where D: Deserializer<'de>
{
    let time: String = Deserialize::deserialize(deserializer)?;
    NaiveTime::parse_from_str(&time, "%H:%M").map_err(|_| de::Error::custom(format!(
        "Invalid time of day: {:?}. Expected HH:MM", time)))
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where D: Deserializer<'de>
{
    deserializer.deserialize_string(DurationVisitor)
}

struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("time duration in $number{ms|s|m|h|d} format")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> where E: de::Error {
        parse_duration(v).map_err(E::custom)
    }
}

fn parse_duration(string: &str) -> GenericResult<Duration> {
    lazy_static! {
        static ref DURATION_RE: Regex = Regex::new(
            r"^(?P<number>0|[1-9]\d*)(?P<unit>ms|s|m|h|d)$").unwrap();
    }

    let captures = DURATION_RE.captures(string).ok_or(format!(
        "Invalid time duration specification: {:?}", string))?;

    let number: u64 = captures.name("number").unwrap().as_str().parse().map_err(|_| format!(
        "Invalid time duration specification: {:?}", string))?;

    Ok(match captures.name("unit").unwrap().as_str() {
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 60 * 60),
        "d" => Duration::from_secs(number * 60 * 60 * 24),
        _ => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    const CONFIG: &str = indoc!(r#"
        schedule:
          start_time: "02:30"
          main_loop_minutes: 1440
        error_popups: true
        log_path: /var/log/rotabak.log
        retention:
          deletion_delay: 0ms
          groups:
            - name: temp
              age_days: 90
              specs: ["/tmp/scratch/*.*"]
            - name: archives
              age_days: 10
              specs: ["/var/backups/*.7z"]
              timestamp: creation
              apply_deletion_limit: true
              recurse: true
              recursion_scope: Archive
        backup:
          archive_path: /var/backups
          compressor: {program: 7z, args: ["a", "{output}", "@{manifest}"]}
          done_hook: {program: /usr/local/bin/replicate.sh}
          selected_devices: "E, F"
          devices:
            - {letter: e, path: /media/usb0}
            - {letter: F, path: /media/usb1}
          process:
            poll_interval: 50ms
          sets:
            - name: documents
              sources: [/home/user/Documents]
              output_name: docs
    "#);

    #[test]
    fn parsing() {
        let config = Config::parse("/etc/rotabak.yaml", CONFIG.as_bytes()).unwrap();

        assert_eq!(config.schedule.start_time, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        assert_eq!(config.schedule.tick, Duration::from_secs(1));
        assert!(config.error_popups);
        assert_eq!(config.retention.deletion_delay, Duration::ZERO);

        let group = config.get_group("archives").unwrap();
        assert!(group.apply_deletion_limit && group.recurse);
        assert_eq!(group.scope_folder(), Some("Archive"));
        assert!(!config.get_group("temp").unwrap().recurse);
        assert!(config.get_group("missing").is_err());

        let backup = config.backup.as_ref().unwrap();
        assert_eq!(backup.date_format, "-%Y-%m-%d");
        assert_eq!(backup.extension, ".7z");
        assert_eq!(backup.marker_name, "BACKUP.MARK");
        assert_eq!(backup.process.poll_interval, Duration::from_millis(50));
        assert_eq!(backup.process.kill_retries, 5);
        assert_eq!(backup.selected_devices().unwrap().letters(), vec!['E', 'F']);
        assert_eq!(backup.device_list()[0].letter, 'E');

        let set = config.get_backup_set("documents").unwrap();
        assert_eq!(set.archive_path(backup), Path::new("/var/backups"));
    }

    #[rstest(from, to,
        case("main_loop_minutes: 1440", "main_loop_minutes: 0"),
        case("\"02:30\"", "\"25:30\""),
        case("output_name: docs", "output_name: \"\""),
        case("name: archives", "name: temp"),
        case("selected_devices: \"E, F\"", "selected_devices: \"A\""),
        case("letter: F", "letter: E"),
        case("archive_path: /var/backups", "archive_path: var/backups"),
        case("deletion_delay: 0ms", "deletion_delay: 1w"),
        case("error_popups: true", "error_popup: true"),
        case("archive_path: /var/backups", "archive_path: /var/backups\n  date_format: \"-%Q\""),
    )]
    fn invalid(from: &str, to: &str) {
        assert!(CONFIG.contains(from));
        let data = CONFIG.replacen(from, to, 1);
        assert!(Config::parse("/etc/rotabak.yaml", data.as_bytes()).is_err(), "{}", to);
    }

    #[test]
    fn zero_tick() {
        let data = CONFIG.replace("main_loop_minutes: 1440", "main_loop_minutes: 1440\n  tick: 0ms");
        let error = Config::parse("/etc/rotabak.yaml", data.as_bytes()).err().unwrap();
        assert_eq!(error.to_string(), "Invalid scheduler tick: it must be positive");

        let data = CONFIG.replace("main_loop_minutes: 1440", "main_loop_minutes: 1440\n  tick: 250ms");
        let config = Config::parse("/etc/rotabak.yaml", data.as_bytes()).unwrap();
        assert_eq!(config.schedule.tick, Duration::from_millis(250));
    }

    #[test]
    fn work_path() {
        let config = Config::parse("/etc/rotabak.yaml", CONFIG.as_bytes()).unwrap();
        assert_eq!(config.backup.as_ref().unwrap().work_path(), std::env::temp_dir());

        let data = CONFIG.replace(
            "  archive_path: /var/backups\n", "  archive_path: /var/backups\n  work_path: ~/../tmp/rotabak\n");
        assert!(Config::parse("/etc/rotabak.yaml", data.as_bytes()).is_err());

        let data = CONFIG.replace(
            "  archive_path: /var/backups\n", "  archive_path: /var/backups\n  work_path: /var/tmp/rotabak/\n");
        let config = Config::parse("/etc/rotabak.yaml", data.as_bytes()).unwrap();
        assert_eq!(config.backup.as_ref().unwrap().work_path(), Path::new("/var/tmp/rotabak"));
    }

    #[test]
    fn backup_without_sets() {
        let data = CONFIG.split("  sets:").next().unwrap().to_owned() + "  sets: []\n";
        let error = Config::parse("/etc/rotabak.yaml", data.as_bytes()).err().unwrap();
        assert_eq!(error.to_string(), "At least one backup set must be configured");
    }

    #[rstest(spec, expected,
        case("0ms", Some(Duration::ZERO)),
        case("250ms", Some(Duration::from_millis(250))),
        case("3s", Some(Duration::from_secs(3))),
        case("2m", Some(Duration::from_secs(120))),
        case("1h", Some(Duration::from_secs(3600))),
        case("1d", Some(Duration::from_secs(86400))),
        case("01s", None),
        case("s", None),
        case("5 s", None),
    )]
    fn duration(spec: &str, expected: Option<Duration>) {
        assert_eq!(parse_duration(spec).ok(), expected);
    }
}
