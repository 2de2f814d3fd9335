use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::core::GenericResult;
use crate::util::format_file_size;

use super::group::{FileSpec, TimestampKind};

#[derive(Clone, Debug)]
pub struct FileEntry {
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub hidden: bool,
    pub read_only: bool,
}

impl FileEntry {
    pub fn new(path: PathBuf, metadata: &Metadata) -> io::Result<FileEntry> {
        let modified = metadata.modified()?;
        let hidden = path.file_name().is_some_and(|name| name.to_string_lossy().starts_with('.'));

        Ok(FileEntry {
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            created: metadata.created().unwrap_or(modified),
            accessed: metadata.accessed().unwrap_or(modified),
            modified,
            hidden,
            read_only: metadata.permissions().readonly(),
            path,
        })
    }

    pub fn timestamp(&self, kind: TimestampKind) -> SystemTime {
        match kind {
            TimestampKind::Creation => self.created,
            TimestampKind::LastAccess => self.accessed,
            TimestampKind::LastWrite => self.modified,
        }
    }

    /// Journal record: time, size (or a directory marker) and path.
    pub fn describe(&self, kind: TimestampKind) -> String {
        let time: DateTime<Local> = self.timestamp(kind).into();
        let size = if self.is_dir {
            "<DIR>".to_owned()
        } else {
            format_file_size(self.size)
        };
        format!("{} {:>10} {}", time.format("%Y-%m-%d %H:%M:%S"), size, self.path.display())
    }
}

/// Lists entries of the specified directory (not recursively) which match the file
/// specification. Entries which can't be inspected are returned as errors.
pub fn list_matching(directory: &Path, spec: &FileSpec) -> GenericResult<(Vec<FileEntry>, Vec<String>)> {
    let mut entries = Vec::new();
    let mut errors = Vec::new();

    for entry in fs::read_dir(directory)? {
        let entry = entry?;

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            errors.push(format!("Skipping {:?}: invalid file name", entry.path()));
            continue;
        };

        if !spec.matches(name) {
            continue;
        }

        let path = entry.path();
        match fs::symlink_metadata(&path).and_then(|metadata| FileEntry::new(path.clone(), &metadata)) {
            Ok(file) => entries.push(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {},
            Err(err) => errors.push(format!("Unable to get metadata of {:?}: {}", path, err)),
        }
    }

    Ok((entries, errors))
}

pub fn list_subdirectories(directory: &Path) -> GenericResult<Vec<PathBuf>> {
    let mut subdirectories = Vec::new();

    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            subdirectories.push(entry.path());
        }
    }

    subdirectories.sort();
    Ok(subdirectories)
}

pub fn is_empty_directory(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use maplit::hashset;

    use super::*;

    #[test]
    fn listing() {
        let temp_dir = assert_fs::TempDir::new().unwrap();
        for name in ["a.log", "b.log", ".hidden.log", "c.txt"] {
            fs::write(temp_dir.join(name), "data").unwrap();
        }
        fs::create_dir(temp_dir.join("dir.log")).unwrap();
        fs::create_dir(temp_dir.join("other")).unwrap();

        let spec = FileSpec::parse(temp_dir.join("*.log").to_str().unwrap()).unwrap();
        let (entries, errors) = list_matching(&temp_dir, &spec).unwrap();
        assert!(errors.is_empty());

        let names: std::collections::HashSet<String> = entries.iter()
            .map(|entry| entry.path.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, hashset!{s!("a.log"), s!("b.log"), s!(".hidden.log"), s!("dir.log")});

        for entry in &entries {
            let name = entry.path.file_name().unwrap().to_str().unwrap();
            assert_eq!(entry.hidden, name.starts_with('.'));
            assert_eq!(entry.is_dir, name == "dir.log");
            assert!(!entry.read_only);
        }

        let subdirectories = list_subdirectories(&temp_dir).unwrap();
        assert_eq!(subdirectories, vec![temp_dir.join("dir.log"), temp_dir.join("other")]);
        assert!(is_empty_directory(&temp_dir.join("other")).unwrap());
        assert!(!is_empty_directory(&temp_dir).unwrap());
    }
}
