use std::fs;
use std::io;
use std::path::Path;

use log::warn;

use crate::core::GenericResult;
use crate::devices::{DeviceBitField, LetterRange};

pub const MAX_COPY_FAILURES: u32 = 99;

/// Environment variable with a path of a file the done-hook may write its status to. Unix exit
/// codes are too narrow for the device bit field.
pub const STATUS_FILE_ENV: &str = "ROTABAK_STATUS_FILE";

/// Result of the done-hook: devices the archive has been replicated to and copy failures count.
/// It's transmitted as `100 * device_bit_field + copy_failures`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HookStatus {
    pub devices: DeviceBitField,
    pub copy_failures: u32,
}

impl HookStatus {
    pub fn encode(&self) -> i64 {
        100 * i64::from(self.devices.encode()) + i64::from(self.copy_failures.min(MAX_COPY_FAILURES))
    }

    pub fn split(status: i64) -> GenericResult<(u32, u32)> {
        if status < 0 {
            return Err!("Invalid done-hook status: {}", status);
        }

        let devices = status / 100;
        let copy_failures = status - 100 * devices;

        let devices = u32::try_from(devices).map_err(|_| format!(
            "Invalid done-hook status: {}", status))?;

        Ok((devices, copy_failures as u32))
    }

    pub fn decode(status: i64, range: LetterRange) -> GenericResult<HookStatus> {
        let (devices, copy_failures) = HookStatus::split(status)?;
        let devices = DeviceBitField::decode(range, devices).map_err(|e| format!(
            "Invalid done-hook status ({}): {}", status, e))?;
        Ok(HookStatus {devices, copy_failures})
    }

    /// Malformed status means that nothing is known to be copied.
    pub fn decode_or_fail(status: i64, selected: &DeviceBitField) -> HookStatus {
        match HookStatus::decode(status, selected.range()) {
            Ok(status) => status,
            Err(err) => {
                warn!("{}.", err);
                HookStatus {
                    devices: DeviceBitField::empty(selected.range()),
                    copy_failures: (selected.letters().len() as u32).max(1),
                }
            },
        }
    }
}

/// Reads the status the hook has written to the status file, if any.
pub fn read_status_file(path: &Path) -> GenericResult<Option<i64>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err!("Unable to read {:?}: {}", path, err),
    };

    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    Ok(Some(data.parse().map_err(|_| format!("Invalid done-hook status in {:?}: {:?}", path, data))?))
}
