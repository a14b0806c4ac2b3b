//! Operator command registry
//!
//! Built once on first use and never modified afterwards. Commands do not
//! touch sessions directly: dispatching a line produces a
//! [`ScheduledAction`] for the tick driver's deferred queue.
//!
//! Privilege levels count downwards: level 0 is the console, and a caller may
//! run any command whose level is at or above its own.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::deferred::{DeferredAction, ScheduledAction};

pub const CONSOLE_LEVEL: u8 = 0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("You do not have permission to perform this command")]
    PermissionDenied,
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Bad argument: {0}")]
    BadArgument(String),
}

type Handler = fn(&[String]) -> Result<ScheduledAction, AdminError>;

pub struct AdminCommand {
    pub name: &'static str,
    pub level: u8,
    /// Arguments required after the command name
    pub args: usize,
    pub usage: &'static str,
    handler: Handler,
}

pub struct CommandRegistry {
    commands: HashMap<&'static str, AdminCommand>,
}

static REGISTRY: OnceLock<CommandRegistry> = OnceLock::new();

/// Process-wide registry of built-in commands
pub fn registry() -> &'static CommandRegistry {
    REGISTRY.get_or_init(CommandRegistry::builtin)
}

impl CommandRegistry {
    pub fn builtin() -> Self {
        let commands = [
            AdminCommand {
                name: "kick",
                level: 1,
                args: 2,
                usage: "kick <slot> <reason>",
                handler: kick,
            },
            AdminCommand {
                name: "tell",
                level: 2,
                args: 2,
                usage: "tell <slot> <text>",
                handler: tell,
            },
            AdminCommand {
                name: "delay",
                level: 1,
                args: 3,
                usage: "delay <seconds> <slot> <command>",
                handler: delay,
            },
            AdminCommand {
                name: "restart",
                level: 0,
                args: 0,
                usage: "restart",
                handler: restart,
            },
        ];

        Self {
            commands: commands.into_iter().map(|c| (c.name, c)).collect(),
        }
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<&AdminCommand> {
        self.commands.get(name.to_ascii_lowercase().as_str())
    }

    /// Commands available at `level`, sorted by name
    pub fn visible(&self, level: u8) -> Vec<&AdminCommand> {
        let mut list: Vec<&AdminCommand> = self
            .commands
            .values()
            .filter(|c| c.level >= level)
            .collect();
        list.sort_by_key(|c| c.name);
        list
    }

    /// Parses and authorises one operator line
    pub fn dispatch(&self, line: &str, level: u8) -> Result<ScheduledAction, AdminError> {
        let tokens = tokenize(line);
        let (name, args) = tokens.split_first().ok_or(AdminError::Empty)?;

        let command = self
            .get(name)
            .ok_or_else(|| AdminError::Unknown(name.clone()))?;
        if command.level < level {
            return Err(AdminError::PermissionDenied);
        }
        if args.len() != command.args {
            return Err(AdminError::Usage(command.usage));
        }

        (command.handler)(args)
    }
}

/// Splits on whitespace, keeping double-quoted runs together
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_token = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    tokens
}

fn parse_slot(arg: &str) -> Result<usize, AdminError> {
    arg.parse()
        .map_err(|_| AdminError::BadArgument(format!("'{}' is not a slot number", arg)))
}

fn kick(args: &[String]) -> Result<ScheduledAction, AdminError> {
    Ok(ScheduledAction::now(DeferredAction::Drop {
        slot: parse_slot(&args[0])?,
        reason: args[1].clone(),
    }))
}

fn tell(args: &[String]) -> Result<ScheduledAction, AdminError> {
    Ok(ScheduledAction::now(DeferredAction::ServerCommand {
        slot: parse_slot(&args[0])?,
        text: format!("print \"{}\n\"", args[1]),
    }))
}

fn delay(args: &[String]) -> Result<ScheduledAction, AdminError> {
    let delay_msec = args[0]
        .parse::<u64>()
        .ok()
        .and_then(|seconds| seconds.checked_mul(1000))
        .ok_or_else(|| AdminError::BadArgument(format!("'{}' is not a number of seconds", args[0])))?;

    Ok(ScheduledAction {
        delay_msec,
        action: DeferredAction::ClientCommand {
            slot: parse_slot(&args[1])?,
            text: args[2].clone(),
        },
    })
}

fn restart(_args: &[String]) -> Result<ScheduledAction, AdminError> {
    Ok(ScheduledAction::now(DeferredAction::ResetWorld))
}
