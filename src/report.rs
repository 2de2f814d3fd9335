use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Local;
use log::{error, info, warn};

use crate::core::GenericResult;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    Good,
    Failed,
    Stopped,
}

impl Outcome {
    pub fn combine(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Stopped, _) | (_, Outcome::Stopped) => Outcome::Stopped,
            (Outcome::Failed, _) | (_, Outcome::Failed) => Outcome::Failed,
            _ => Outcome::Good,
        }
    }
}

/// Append-only sink for deletion records and child process output.
pub trait Journal: Send + Sync {
    fn log_line(&self, text: &str);
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NoticeKind {
    Error,
    Warning,
    Info,
}

/// Optional user-facing notification sink (pop-ups, tray balloons and the like).
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NoticeKind, text: &str, caption: &str);
}

pub struct LogJournal;

impl Journal for LogJournal {
    fn log_line(&self, text: &str) {
        info!("{}", text);
    }
}

pub struct FileJournal {
    file: Mutex<File>,
}

impl FileJournal {
    pub fn open(path: &Path) -> GenericResult<FileJournal> {
        let file = OpenOptions::new().create(true).append(true).open(path).map_err(|e| format!(
            "Unable to open {:?}: {}", path, e))?;
        Ok(FileJournal {file: Mutex::new(file)})
    }
}

impl Journal for FileJournal {
    fn log_line(&self, text: &str) {
        info!("{}", text);

        let line = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), text);
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(err) = file.write_all(line.as_bytes()) {
            error!("Failed to write to the journal: {}.", err);
        }
    }
}

#[derive(Clone)]
pub struct Reporter {
    journal: Arc<dyn Journal>,
    notifier: Option<Arc<dyn Notifier>>,
    error_popups: bool,
}

impl Reporter {
    pub fn new(journal: Arc<dyn Journal>, notifier: Option<Arc<dyn Notifier>>, error_popups: bool) -> Reporter {
        Reporter {journal, notifier, error_popups}
    }

    pub fn journal(&self) -> Arc<dyn Journal> {
        self.journal.clone()
    }

    pub fn line(&self, text: &str) {
        self.journal.log_line(text);
    }

    /// Per-item error: always logged, shown to the user only if error pop-ups are enabled.
    pub fn item_error(&self, text: &str) {
        error!("{}.", text);
        if self.error_popups {
            self.notify(NoticeKind::Error, text);
        }
    }

    /// Run-level error, shown once at the end of a cycle.
    pub fn error(&self, text: &str) {
        error!("{}.", text);
        self.notify(NoticeKind::Error, text);
    }

    pub fn warning(&self, text: &str) {
        warn!("{}.", text);
        self.notify(NoticeKind::Warning, text);
    }

    pub fn info(&self, text: &str) {
        info!("{}.", text);
        self.notify(NoticeKind::Info, text);
    }

    fn notify(&self, kind: NoticeKind, text: &str) {
        if let Some(notifier) = self.notifier.as_ref() {
            notifier.notify(kind, text, env!("CARGO_PKG_NAME"));
        }
    }
}
