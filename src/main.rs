#[macro_use] mod core;

mod backuping;
mod cli;
mod config;
mod control;
mod devices;
mod metrics;
mod process;
mod report;
mod retention;
mod scheduler;
mod util;

#[cfg(test)] mod tests;

use std::io::{self, Write};

use log::{error, info};

use crate::backuping::HookStatus;
use crate::cli::{Action, GlobalOptions, Parser};
use crate::config::Config;
use crate::control::{RestartReceiver, StopToken, Watcher};
use crate::core::GenericResult;
use crate::report::Outcome;
use crate::scheduler::{ConfiguredCycle, Scheduler, Scope};

fn main() {
    let mut parser = Parser::new();

    let global = parser.parse_global().unwrap_or_else(|e| {
        let _ = writeln!(io::stderr(), "Command line arguments parsing error: {}.", e);
        std::process::exit(1);
    });

    if let Err(e) = easy_logging::init(module_path!().split("::").next().unwrap(), global.log_level) {
        let _ = writeln!(io::stderr(), "Failed to initialize the logging: {}.", e);
        std::process::exit(1);
    }

    let ok = match parser.parse().and_then(|action| run(&global, action)) {
        Ok(ok) => ok,
        Err(e) => {
            error!("{}.", e);
            false
        }
    };

    std::process::exit(if ok {0} else {1});
}

fn run(global: &GlobalOptions, action: Action) -> GenericResult<bool> {
    let config = Config::load(&global.config_path).map_err(|e| format!(
        "Error while reading {:?} configuration file: {}", global.config_path, e))?;

    let scope = match action {
        Action::Run => return run_scheduler(&config),
        Action::Devices => return show_devices(&config),
        Action::Cleanup {group} => Scope::Cleanup(group),
        Action::Backup {set} => Scope::Backup(set),
    };

    let (stop, _restart) = watch(&config)?;
    let report = ConfiguredCycle::new(&config.path, None).execute(&scope, &stop)?;

    Ok(report.outcome() == Outcome::Good)
}

fn run_scheduler(config: &Config) -> GenericResult<bool> {
    let (stop, restart) = watch(config)?;

    info!("Starting the scheduler...");
    let cycle = ConfiguredCycle::new(&config.path, None);
    let outcome = Scheduler::new(cycle, stop, restart, config.schedule.tick).run();

    Ok(outcome.is_none_or(|outcome| outcome != Outcome::Failed))
}

fn watch(config: &Config) -> GenericResult<(StopToken, RestartReceiver)> {
    control::install_signal_handlers()?;

    let stop = StopToken::new();
    let (restart_tx, restart_rx) = control::restart_channel();
    Watcher::new(&config.path, stop.clone(), restart_tx, config.schedule.tick).spawn()?;

    Ok((stop, restart_rx))
}

fn show_devices(config: &Config) -> GenericResult<bool> {
    let backup = config.backup.as_ref().ok_or(
        "Backup is not configured in the configuration file")?;

    let selected = backup.selected_devices()?;
    let current = devices::scan(selected.range(), &backup.device_list(), &backup.marker_name);

    for device in backup.device_list() {
        println!("{}: {} ({}{})", device.letter, device.path.display(),
                 if current.contains(device.letter) {"attached"} else {"not attached"},
                 if selected.contains(device.letter) {", selected"} else {""});
    }
    println!("Bit field: {} ({})", current, current.encode());
    println!("Done-hook status for a complete copy: {}", HookStatus {devices: selected, copy_failures: 0}.encode());

    if current.is_empty() {
        println!("No backup devices are attached.");
    }

    let missing = devices::DeviceBitField::diff(&selected, &current);
    if !missing.is_empty() {
        println!("Missing: {}", devices::format_letters(&missing));
    }

    Ok(missing.is_empty())
}
