use std::path::{Path, PathBuf};

use serde_derive::Deserialize;
use validator::Validate;

use crate::process::{CommandConfig, ProcessSettings};

#[derive(Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[validate(length(min = 1))]
    pub archive_path: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub append: bool,
    #[serde(default = "default_glob")]
    #[validate(length(min = 1))]
    pub default_glob: String,

    pub compressor: CommandConfig,
    pub done_hook: Option<CommandConfig>,

    #[serde(default = "default_marker_name")]
    #[validate(length(min = 1))]
    pub marker_name: String,
    #[serde(default = "default_first_letter")]
    pub first_letter: char,
    #[serde(default)]
    pub selected_devices: String,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub process: ProcessSettings,
    pub work_path: Option<String>,

    #[validate(nested)]
    pub sets: Vec<BackupSet>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub letter: char,
    pub path: String,
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BackupSet {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub sources: Vec<String>,
    pub glob: Option<String>,
    #[validate(length(min = 1))]
    pub output_name: String,
    pub archive_path: Option<String>,
}

impl BackupSet {
    pub fn archive_path(&self, config: &BackupConfig) -> PathBuf {
        PathBuf::from(self.archive_path.as_ref().unwrap_or(&config.archive_path))
    }

    pub fn glob<'a>(&'a self, config: &'a BackupConfig) -> &'a str {
        self.glob.as_deref().filter(|glob| !glob.is_empty()).unwrap_or(&config.default_glob)
    }

    /// Compressor input: every source folder combined with the effective glob.
    pub fn source_patterns(&self, config: &BackupConfig) -> Vec<PathBuf> {
        let glob = self.glob(config);
        self.sources.iter().map(|source| Path::new(source).join(glob)).collect()
    }
}

fn default_date_format() -> String {
    "-%Y-%m-%d".to_owned()
}

fn default_extension() -> String {
    ".7z".to_owned()
}

fn default_glob() -> String {
    "*".to_owned()
}

fn default_marker_name() -> String {
    "BACKUP.MARK".to_owned()
}

fn default_first_letter() -> char {
    'C'
}
