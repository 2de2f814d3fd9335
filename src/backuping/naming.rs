use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};

use crate::core::EmptyResult;

pub fn validate_date_format(format: &str) -> EmptyResult {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err!("Invalid date format: {:?}", format);
    }
    Ok(())
}

/// Returns `{base}{date}{extension}` path inside the directory. Unless appending to an existing
/// archive, a colliding name gets `.{n}` inserted before the extension.
pub fn output_path<Tz: TimeZone>(
    directory: &Path, base: &str, date_format: &str, extension: &str, append: bool, time: &DateTime<Tz>,
) -> PathBuf
    where Tz::Offset: std::fmt::Display
{
    let stem = format!("{}{}", base, time.format(date_format));

    let path = directory.join(format!("{}{}", stem, extension));
    if append || !path.exists() {
        return path;
    }

    let mut number = 2;
    loop {
        let path = directory.join(format!("{}.{}{}", stem, number, extension));
        if !path.exists() {
            return path;
        }
        number += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Local, TimeZone};

    use super::*;

    #[test]
    fn unique_names() {
        let temp_dir = assert_fs::TempDir::new().unwrap();
        let time = Local.with_ymd_and_hms(2024, 3, 9, 2, 30, 0).unwrap();

        let path = |append| output_path(&temp_dir, "docs", "-%Y-%m-%d", ".7z", append, &time);

        let first = path(false);
        assert_eq!(first, temp_dir.join("docs-2024-03-09.7z"));
        fs::write(&first, "").unwrap();

        let second = path(false);
        assert_eq!(second, temp_dir.join("docs-2024-03-09.2.7z"));
        fs::write(&second, "").unwrap();

        assert_eq!(path(false), temp_dir.join("docs-2024-03-09.3.7z"));
        assert_eq!(path(true), first);
    }

    #[test]
    fn date_format_validation() {
        assert!(validate_date_format("-%Y-%m-%d_%H%M").is_ok());
        assert!(validate_date_format("-%Q").is_err());
    }
}
