mod supervisor;
mod sys;

use std::fmt;

use itertools::Itertools;
use serde_derive::Deserialize;

pub use self::supervisor::{Completion, ProcessSupervisor, ProcessSettings};

/// A fully specified external command.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: &str, args: Vec<String>) -> Invocation {
        Invocation {program: program.to_owned(), args, env: Vec::new()}
    }

    pub fn env(mut self, name: &str, value: &str) -> Invocation {
        self.env.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Process name as the OS reports it.
    pub fn name(&self) -> String {
        let name = self.program.rsplit('/').next().unwrap_or(&self.program);
        name.chars().take(sys::MAX_PROCESS_NAME_LEN).collect()
    }

    /// Shell-compatible command line which can be copied to rerun the command by hand.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program).chain(self.args.iter()).map(|arg| quote(arg)).join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Program with an argument template.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn quote(arg: &str) -> String {
    let safe = !arg.is_empty() && arg.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | '=' | ':' | ',' | '@' | '+' | '%')
    });

    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
