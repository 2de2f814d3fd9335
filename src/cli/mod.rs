mod parser;

pub use parser::{Parser, GlobalOptions};

pub enum Action {
    Run,
    Cleanup {group: Option<String>},
    Backup {set: Option<String>},
    Devices,
}
