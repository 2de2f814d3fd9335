mod cycle;
mod state;

pub use self::cycle::{ConfiguredCycle, CycleReport, Scope};
pub use self::state::Scheduler;
