//! Interpreter wire protocol.
//!
//! Text commands, one per frame: a command word followed by space-separated
//! arguments. The vocabulary is fixed by the external interpreter:
//!
//! ```text
//! -> setLogStat <ruleId> <stateCode>     verbosity hint, fire-and-forget
//! -> reqFieldInfo <fieldName>            field inspection request
//! <- printLog <ruleId> <token>...        one rule execution trace
//! <> ping <ts> / pong <ts>               keep-alive
//! ```
//!
//! Malformed frames are rejected per-message; the link logs and discards
//! them without touching the connection.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("`{command}` is missing its `{argument}` argument")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("`{command}` has a non-numeric `{argument}`: `{value}`")]
    InvalidNumber {
        command: &'static str,
        argument: &'static str,
        value: String,
    },
}

/// One decoded frame, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set a rule's logging verbosity on the interpreter side.
    SetLogStat { rule_id: u32, state_code: u8 },
    /// Ask the interpreter to describe a field.
    ReqFieldInfo { field: String },
    /// Execution trace for one fired rule.
    PrintLog { rule_id: u32, tokens: Vec<String> },
    /// Keep-alive probe.
    Ping { ts: u64 },
    /// Keep-alive answer.
    Pong { ts: u64 },
}

impl Command {
    /// Encode into one wire frame.
    pub fn encode(&self) -> String {
        match self {
            Self::SetLogStat {
                rule_id,
                state_code,
            } => format!("setLogStat {rule_id} {state_code}"),
            Self::ReqFieldInfo { field } => format!("reqFieldInfo {field}"),
            Self::PrintLog { rule_id, tokens } => {
                let mut line = format!("printLog {rule_id}");
                for token in tokens {
                    line.push(' ');
                    line.push_str(token);
                }
                line
            }
            Self::Ping { ts } => format!("ping {ts}"),
            Self::Pong { ts } => format!("pong {ts}"),
        }
    }

    /// Decode one wire frame.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let mut words = frame.split_whitespace();
        let command = words.next().ok_or(ProtocolError::Empty)?;

        match command {
            "printLog" => {
                let rule_id = parse_number(&mut words, "printLog", "ruleId")?;
                Ok(Self::PrintLog {
                    rule_id,
                    tokens: words.map(str::to_string).collect(),
                })
            }
            "setLogStat" => {
                let rule_id = parse_number(&mut words, "setLogStat", "ruleId")?;
                let state_code = parse_number(&mut words, "setLogStat", "newState")?;
                Ok(Self::SetLogStat {
                    rule_id,
                    state_code,
                })
            }
            "reqFieldInfo" => {
                let field = words.next().ok_or(ProtocolError::MissingArgument {
                    command: "reqFieldInfo",
                    argument: "fieldName",
                })?;
                Ok(Self::ReqFieldInfo {
                    field: field.to_string(),
                })
            }
            "ping" => Ok(Self::Ping {
                ts: parse_number(&mut words, "ping", "ts")?,
            }),
            "pong" => Ok(Self::Pong {
                ts: parse_number(&mut words, "pong", "ts")?,
            }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn parse_number<'a, T: std::str::FromStr>(
    words: &mut impl Iterator<Item = &'a str>,
    command: &'static str,
    argument: &'static str,
) -> Result<T, ProtocolError> {
    let word = words.next().ok_or(ProtocolError::MissingArgument { command, argument })?;
    word.parse().map_err(|_| ProtocolError::InvalidNumber {
        command,
        argument,
        value: word.to_string(),
    })
}
