use std::time::Duration;

use crate::types::ReplyShape;

/// A typed command argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Float(f64),
    /// Quoted string data, e.g. a file or measurement name
    Str(String),
    Bool(bool),
    /// Bare enumerated token, e.g. `SINGle` or `REAL`
    Token(String),
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Int(value.into())
    }
}

impl From<u32> for Arg {
    fn from(value: u32) -> Self {
        Arg::Int(value.into())
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Float(value)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

/// Whether a command produces an immediate reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Action,
    Query(ReplyShape),
}

/// An outgoing SCPI instruction. Built through [`CommandBuilder`], immutable afterwards.
///
/// # Examples
/// ```
/// use vna_link::{Command, ReplyShape, ValueType};
///
/// let sweep = Command::action("SENS1:SWE:MODE").token("SINGle").long_running().build();
/// let points = Command::query("SENS1:SWE:POIN?", ReplyShape::Scalar(ValueType::Integer)).build();
/// assert!(sweep.is_long_running());
/// assert!(points.is_query());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    mnemonic: String,
    args: Vec<Arg>,
    kind: CommandKind,
    long_running: bool,
    timeout: Option<Duration>,
}

impl Command {
    /// Start building a command that expects no reply
    pub fn action(mnemonic: impl Into<String>) -> CommandBuilder {
        CommandBuilder::new(mnemonic.into(), CommandKind::Action)
    }

    /// Start building a query whose reply has the given shape
    pub fn query(mnemonic: impl Into<String>, shape: ReplyShape) -> CommandBuilder {
        CommandBuilder::new(mnemonic.into(), CommandKind::Query(shape))
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn is_query(&self) -> bool {
        matches!(self.kind, CommandKind::Query(_))
    }

    pub fn reply_shape(&self) -> Option<ReplyShape> {
        match self.kind {
            CommandKind::Query(shape) => Some(shape),
            CommandKind::Action => None,
        }
    }

    /// Whether an `*OPC?` barrier follows the command
    pub fn is_long_running(&self) -> bool {
        self.long_running && !self.is_query()
    }

    /// Deadline override for the reply or completion barrier
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: Command,
}

impl CommandBuilder {
    fn new(mnemonic: String, kind: CommandKind) -> Self {
        Self {
            command: Command {
                mnemonic,
                args: Vec::new(),
                kind,
                long_running: false,
                timeout: None,
            },
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.command.args.push(arg.into());
        self
    }

    pub fn int(self, value: i64) -> Self {
        self.arg(Arg::Int(value))
    }

    pub fn float(self, value: f64) -> Self {
        self.arg(Arg::Float(value))
    }

    pub fn string(self, value: impl Into<String>) -> Self {
        self.arg(Arg::Str(value.into()))
    }

    pub fn boolean(self, value: bool) -> Self {
        self.arg(Arg::Bool(value))
    }

    pub fn token(self, value: impl Into<String>) -> Self {
        self.arg(Arg::Token(value.into()))
    }

    /// Follow the command with a completion barrier (calibration, sweeps, presets)
    pub fn long_running(mut self) -> Self {
        self.command.long_running = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Command {
        self.command
    }
}

impl From<CommandBuilder> for Command {
    fn from(builder: CommandBuilder) -> Self {
        builder.build()
    }
}
