use std::ffi::OsStr;

use nix::unistd::{self, Pid};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Kernel truncates process names to this length.
pub const MAX_PROCESS_NAME_LEN: usize = 15;

/// Finds live processes with the specified name inside the process group.
pub fn find_processes(name: &str, group: Pid) -> Vec<Pid> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

    system.processes().values()
        .filter(|process| process.status() != ProcessStatus::Zombie && same_name(process.name(), name))
        .map(|process| Pid::from_raw(process.pid().as_u32() as i32))
        // Processes may exit at any moment, so lookup errors mean "not found"
        .filter(|&pid| unistd::getpgid(Some(pid)) == Ok(group))
        .collect()
}

fn same_name(process_name: &OsStr, name: &str) -> bool {
    let process_name = process_name.to_string_lossy();
    process_name.chars().take(MAX_PROCESS_NAME_LEN).eq(name.chars().take(MAX_PROCESS_NAME_LEN))
}
