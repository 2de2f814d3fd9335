mod config;
mod hook;
mod naming;
mod orchestrator;

pub use self::config::{BackupConfig, BackupSet};
pub use self::hook::HookStatus;
pub use self::naming::validate_date_format;
pub use self::orchestrator::{BackupOrchestrator, BackupReport, BackupSummary, HookMetadata};
