use clap::Parser;
use clap_derive::{Args, Subcommand};

use crate::{datapoint::WireFormat, event::PutType};

use super::error::DispatchError;

/// One parsed command line
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `set <name> <type> <timestamp> <len> {<data>}`, decoded as text
    Set(String),
    /// `eval <script>`
    Eval(String),
    Cli(CliCommands),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, DispatchError> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));

        match verb {
            "set" => Ok(Self::Set(rest.trim().to_string())),
            "eval" => Ok(Self::Eval(rest.trim().to_string())),
            _ => Ok(Self::Cli(Cli::parse(line)?.command)),
        }
    }
}

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(
    name = "dserv",
    no_binary_name = true,
    disable_help_flag = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommands,
}

impl Cli {
    pub fn parse(cmd_str: &str) -> Result<Self, DispatchError> {
        let words = shlex::split(cmd_str)
            .ok_or_else(|| DispatchError::Parse("unbalanced quotes".to_string()))?;
        Ok(Self::try_parse_from(words)?)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Current value of a datapoint
    Get(NameArg),
    /// Re-publish a datapoint with the current time
    Touch(NameArg),
    /// Remove a datapoint
    Clear(NameArg),
    /// 1 if the datapoint exists, else 0
    Exists(NameArg),
    /// Publish a copy of a datapoint under another name
    Copy { from: String, to: String },
    /// Payload length of a datapoint
    #[command(name = "getsize")]
    GetSize(NameArg),
    /// All datapoint names
    Keys,
    /// Directory of opaque group datapoints
    #[command(name = "dgdir")]
    DgDir,

    /// Subscribe this connection to a name pattern
    #[command(name = "addmatch")]
    AddMatch {
        pattern: String,
        #[arg(default_value_t = 1, allow_negative_numbers = true)]
        stride: i64,
    },
    #[command(name = "removematch")]
    RemoveMatch { pattern: String },
    #[command(name = "removeallmatches")]
    RemoveAllMatches,
    /// This connection's subscriptions
    Matches,
    /// Encoding used for this connection's pushes
    Format {
        #[arg(value_enum)]
        format: WireFormat,
    },

    /// Publish an event
    #[command(name = "evtput")]
    EvtPut(EvtPutArgs),
    /// Bind a name to an event type
    #[command(name = "evtnameset")]
    EvtNameSet {
        e_type: u8,
        name: String,
        put_type: PutType,
    },

    /// One-shot timer: `[id] ms`
    #[command(name = "timer.tick")]
    TimerTick(TickArgs),
    /// Repeating timer: `[id] start interval [repeat]`
    #[command(name = "timer.tickInterval")]
    TimerTickInterval(TickIntervalArgs),
    #[command(name = "timer.expired")]
    TimerExpired { id: Option<usize> },
    #[command(name = "timer.reset")]
    TimerReset { id: Option<usize> },
    #[command(name = "timer.status")]
    TimerStatus,
    #[command(name = "timer.setPrefix")]
    TimerSetPrefix { prefix: String },
    /// Script run on the engine whenever the timer expires
    #[command(name = "timer.setScript")]
    TimerSetScript {
        id: usize,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        script: Vec<String>,
    },
    #[command(name = "timer.removeScript")]
    TimerRemoveScript { id: usize },

    /// Script run on the engine whenever a matching datapoint is set
    #[command(name = "dpoint.setScript")]
    DpointSetScript {
        pattern: String,
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        every: i64,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        script: Vec<String>,
    },
    #[command(name = "dpoint.removeScript")]
    DpointRemoveScript { pattern: String },
    #[command(name = "dpoint.removeAllScripts")]
    DpointRemoveAllScripts,

    /// Current timestamp in microseconds
    Now,
    Version,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct NameArg {
    pub name: String,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct EvtPutArgs {
    pub e_type: u8,
    pub subtype: u8,
    /// 0 stamps with the current time
    pub timestamp: u64,
    pub put_type: Option<PutType>,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub params: Vec<String>,
}

/// `[id] ms`
#[derive(Args, Debug, Clone, PartialEq)]
pub struct TickArgs {
    #[arg(required = true, num_args = 1..=2, allow_negative_numbers = true)]
    pub values: Vec<i64>,
}

/// `start interval`, `id start interval` or `id start interval repeat`
#[derive(Args, Debug, Clone, PartialEq)]
pub struct TickIntervalArgs {
    #[arg(required = true, num_args = 2..=4, allow_negative_numbers = true)]
    pub values: Vec<i64>,
}
