//! Operator commands typed on the registry and node consoles.

use std::str::FromStr;

use overlay_core::wire::DEFAULT_MANIFEST_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{command} needs a {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },

    #[error("{command}: {value:?} is not a valid {what}")]
    InvalidArgument {
        command: &'static str,
        what: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCommand {
    ListMessagingNodes,
    SetupOverlay { manifest_size: u32 },
    ListRoutingTables,
    Start { packets: u32 },
    PrintTrafficSummary,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    PrintCountersAndDiagnostics,
    Help,
    Quit,
}

fn number(command: &'static str, what: &'static str, value: &str) -> Result<u32, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidArgument {
        command,
        what,
        value: value.to_string(),
    })
}

impl FromStr for RegistryCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["list-messaging-nodes"] => Ok(Self::ListMessagingNodes),
            ["setup-overlay"] => Ok(Self::SetupOverlay {
                manifest_size: DEFAULT_MANIFEST_SIZE,
            }),
            ["setup-overlay", size] => Ok(Self::SetupOverlay {
                manifest_size: number("setup-overlay", "manifest size", size)?,
            }),
            ["list-routing-tables"] => Ok(Self::ListRoutingTables),
            ["start"] => Err(CommandError::MissingArgument {
                command: "start",
                what: "packet count",
            }),
            ["start", packets] => Ok(Self::Start {
                packets: number("start", "packet count", packets)?,
            }),
            ["print-traffic-summary"] => Ok(Self::PrintTrafficSummary),
            ["help"] => Ok(Self::Help),
            ["quit"] | ["exit"] => Ok(Self::Quit),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }
}

impl RegistryCommand {
    pub const USAGE: &'static str = "\
commands:
  list-messaging-nodes      registered nodes and their link state
  setup-overlay [k]         build the overlay with k links per node (default 3)
  list-routing-tables       routing tables from the last setup
  start <packets>           start a task round
  print-traffic-summary     traffic report of the last round
  quit";
}

impl FromStr for NodeCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["print-counters-and-diagnostics"] => Ok(Self::PrintCountersAndDiagnostics),
            ["help"] => Ok(Self::Help),
            ["quit"] | ["exit"] => Ok(Self::Quit),
            _ => Err(CommandError::Unknown(line.trim().to_string())),
        }
    }
}

impl NodeCommand {
    pub const USAGE: &'static str = "\
commands:
  print-counters-and-diagnostics
  quit";
}
