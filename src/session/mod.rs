use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, trace, warn};

use crate::error::VnaError;
use crate::logger::{OperationKind, TranscriptEntry, TranscriptLogger};
use crate::mirror::{invalidates_selection, StateMirror};
use crate::scpi::block::{self, BlockTarget};
use crate::scpi::codec::{self, ScpiCodec};
use crate::scpi::{Command, CommandKind};
use crate::transport::{
    ConnectionConfig, Deadline, Link, ReadFailure, TcpTransport, Transport, DEFAULT_SCPI_PORT,
};
use crate::types::{classify_code, ErrorEntry, Reply, ReplyShape, ValueType, Warnings, NO_ERROR_CODE};

pub mod calibration;
pub mod common;
pub mod selection;
pub mod trace;
pub mod transfer;

/// Session behaviour settings.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vna_link::SessionConfig;
///
/// let config = SessionConfig {
///     timeout: Duration::from_secs(30),
///     max_error_polls: 16,
///     ..SessionConfig::default()
/// };
/// assert_eq!(config.line_delimiter, "\n");
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each reply, barrier or error poll
    pub timeout: Duration,
    /// Terminator appended to every message and expected after every reply
    pub line_delimiter: String,
    /// Upper bound on `SYST:ERR?` polls per error check
    pub max_error_polls: usize,
    /// Send `*CLS` when the session opens so stale errors are not attributed
    /// to the first command
    pub clear_status_on_connect: bool,
    /// Instrument-defined codes reported as warnings instead of faults
    pub warning_codes: Vec<i32>,
    /// Largest block length, and longest reply line, accepted from the
    /// instrument
    pub max_block_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            line_delimiter: "\n".to_string(),
            max_error_polls: 64,
            clear_status_on_connect: true,
            warning_codes: Vec::new(),
            max_block_size: 1 << 30,
        }
    }
}

/// Where a session is in its dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sent,
    AwaitingCompletion,
    ErrorCheck,
    /// Terminal: the stream can no longer be trusted, reconnect
    Faulted,
}

/// Builder for TCP sessions.
///
/// ```no_run
/// use std::time::Duration;
/// use vna_link::Session;
///
/// let mut session = Session::builder()
///     .address("192.168.1.50")
///     .timeout(Duration::from_secs(20))
///     .max_error_polls(32)
///     .connect()?;
/// let id = session.identify()?;
/// println!("{} {}", id.manufacturer, id.model);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct SessionBuilder {
    address: Option<String>,
    port: Option<u16>,
    connection: ConnectionConfig,
    session: SessionConfig,
    transcript: Option<PathBuf>,
}

impl SessionBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    /// Defaults to the raw SCPI socket port 5025
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connect_timeout = timeout;
        self
    }

    /// Per-operation reply deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.session.timeout = timeout;
        self
    }

    pub fn line_delimiter(mut self, delimiter: &str) -> Self {
        self.session.line_delimiter = delimiter.to_string();
        self
    }

    pub fn max_error_polls(mut self, polls: usize) -> Self {
        self.session.max_error_polls = polls;
        self
    }

    /// Record every dispatched operation to a JSONL file
    pub fn transcript(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript = Some(path.into());
        self
    }

    pub fn connect(self) -> Result<Session<TcpTransport>, VnaError> {
        let address = self
            .address
            .ok_or_else(|| VnaError::InvalidAddress("Address must be specified".to_string()))?;
        let port = self.port.unwrap_or(DEFAULT_SCPI_PORT);

        let transport = TcpTransport::connect(&address, port, &self.connection)?;
        let mut session = Session::open(transport, self.session, self.transcript)?;
        info!("Connected to instrument at {address}:{port}");
        session.initialize()?;
        Ok(session)
    }
}

/// One connection to an instrument, with exactly one command in flight at a time.
///
/// Every command goes through the same cycle: it is sent, long-running
/// actions wait on an `*OPC?` barrier, query replies are read, and then the
/// instrument error queue is drained so any fault is attributed to the
/// command that caused it. Timeouts, truncated blocks and desynchronized
/// replies leave the session [`SessionState::Faulted`]; it must be
/// reconnected before further use.
pub struct Session<T: Transport = TcpTransport> {
    link: Link<T>,
    codec: ScpiCodec,
    config: SessionConfig,
    state: SessionState,
    sequence: u64,
    mirror: StateMirror,
    transcript: Option<TranscriptLogger>,
}

impl Session<TcpTransport> {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Connect over TCP with default settings
    pub fn connect(address: &str, port: u16) -> Result<Self, VnaError> {
        Self::builder().address(address).port(port).connect()
    }
}

impl<T: Transport> Session<T> {
    /// Open a session over an already connected transport
    pub fn with_transport(transport: T, config: SessionConfig) -> Result<Self, VnaError> {
        let mut session = Self::open(transport, config, None)?;
        session.initialize()?;
        Ok(session)
    }

    fn open(transport: T, config: SessionConfig, transcript: Option<PathBuf>) -> Result<Self, VnaError> {
        if config.line_delimiter.is_empty() {
            return Err(VnaError::InvalidCommand("line delimiter must not be empty".to_string()));
        }
        if config.max_error_polls == 0 {
            return Err(VnaError::InvalidCommand("max_error_polls must be at least 1".to_string()));
        }
        let delimiter = config.line_delimiter.as_bytes().to_vec();
        Ok(Self {
            link: Link::new(transport, delimiter.clone(), config.max_block_size),
            codec: ScpiCodec::new(delimiter),
            config,
            state: SessionState::Idle,
            sequence: 0,
            mirror: StateMirror::new(),
            transcript: transcript.map(|path| TranscriptLogger::new(path, 32, false)),
        })
    }

    fn initialize(&mut self) -> Result<(), VnaError> {
        self.mirror.invalidate();
        if self.config.clear_status_on_connect {
            self.execute(&Command::action(codec::CLEAR_STATUS).build())?;
        }
        Ok(())
    }

    /// Start recording a JSONL transcript of every operation
    pub fn enable_transcript(&mut self, path: impl Into<PathBuf>) {
        self.transcript = Some(TranscriptLogger::new(path.into(), 32, false));
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn codec(&self) -> &ScpiCodec {
        &self.codec
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        self.state == SessionState::Faulted
    }

    /// True while a command is between send and the end of its error check
    pub fn is_operation_pending(&self) -> bool {
        !matches!(self.state, SessionState::Idle | SessionState::Faulted)
    }

    /// Number of operations dispatched so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn mirror(&self) -> &StateMirror {
        &self.mirror
    }

    pub fn transport(&self) -> &T {
        self.link.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.link.transport_mut()
    }

    /// Run an action. Returns the non-fatal queue entries it produced, or
    /// `InstrumentFault` if the instrument reported a fatal one.
    pub fn execute(&mut self, command: &Command) -> Result<Warnings, VnaError> {
        if command.is_query() {
            return Err(VnaError::InvalidCommand(format!(
                "'{}' is a query, use query()",
                command.mnemonic()
            )));
        }
        self.run(command.mnemonic(), OperationKind::Action, |s| {
            s.dispatch(command).map(|(_, warnings)| warnings)
        })
    }

    /// Run a query and return its decoded reply. Warnings are logged.
    pub fn query(&mut self, command: &Command) -> Result<Reply, VnaError> {
        let (reply, warnings) = self.query_with_warnings(command)?;
        for w in &warnings {
            warn!("'{}' raised warning {},\"{}\"", command.mnemonic(), w.code, w.message);
        }
        Ok(reply)
    }

    pub fn query_with_warnings(&mut self, command: &Command) -> Result<(Reply, Warnings), VnaError> {
        if !command.is_query() {
            return Err(VnaError::InvalidCommand(format!(
                "'{}' is not a query, use execute()",
                command.mnemonic()
            )));
        }
        self.run(command.mnemonic(), OperationKind::Query, |s| {
            let (reply, warnings) = s.dispatch(command)?;
            let reply = reply.ok_or_else(|| VnaError::ProtocolDesync("query produced no reply".into()))?;
            Ok((reply, warnings))
        })
    }

    /// Send a group of actions back to back, then one barrier (if any member
    /// is long-running) and one error check covering the whole group.
    pub fn execute_group(&mut self, commands: &[Command]) -> Result<Warnings, VnaError> {
        if let Some(query) = commands.iter().find(|c| c.is_query()) {
            return Err(VnaError::InvalidCommand(format!(
                "'{}' is a query and cannot be part of a command group",
                query.mnemonic()
            )));
        }
        let label = commands
            .iter()
            .map(Command::mnemonic)
            .collect::<Vec<_>>()
            .join("; ");
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        // Encode everything first so a bad argument sends nothing
        let encoded = commands
            .iter()
            .map(|c| self.codec.encode(c))
            .collect::<Result<Vec<_>, _>>()?;

        self.run(&label, OperationKind::Group, |s| {
            s.state = SessionState::Sent;
            for (command, bytes) in commands.iter().zip(&encoded) {
                s.send_message(command.mnemonic(), bytes)?;
            }
            let barrier_timeout = commands
                .iter()
                .filter(|c| c.is_long_running())
                .map(|c| c.timeout().unwrap_or(s.config.timeout))
                .max();
            if let Some(timeout) = barrier_timeout {
                s.await_completion(timeout)?;
            }
            s.drain_errors(&label)
        })
    }

    /// Shorthand for an action given as a raw command string
    pub fn write(&mut self, command: &str) -> Result<Warnings, VnaError> {
        self.execute(&Command::action(command).build())
    }

    /// Shorthand for a query whose reply line is returned unparsed
    pub fn query_raw(&mut self, command: &str) -> Result<String, VnaError> {
        let reply = self.query(&Command::query(command, ReplyShape::Raw).build())?;
        Ok(reply.as_str()?.to_string())
    }

    /// Close the connection, flushing the transcript
    pub fn disconnect(mut self) -> Result<(), VnaError> {
        info!("Disconnecting after {} operations", self.sequence);
        if let Some(mut transcript) = self.transcript.take() {
            transcript.flush()?;
            transcript.finalize_as_json()?;
        }
        self.mirror.invalidate();
        self.link.close().map_err(|source| VnaError::Io {
            source,
            context: "Closing transport".to_string(),
        })
    }

    /// Wrap one client operation: refuse on a faulted session, number it,
    /// apply the failure policy and record it in the transcript.
    fn run<R>(
        &mut self,
        label: &str,
        kind: OperationKind,
        op: impl FnOnce(&mut Self) -> Result<R, VnaError>,
    ) -> Result<R, VnaError>
    where
        R: Recordable,
    {
        if self.state == SessionState::Faulted {
            return Err(VnaError::SessionFaulted);
        }
        self.sequence += 1;
        let sequence = self.sequence;
        let started = Instant::now();
        debug!("=== #{sequence} {kind:?} START: {label} ===");

        let result = op(self).map_err(|e| self.fail(e));
        match &result {
            Ok(_) => {
                self.state = SessionState::Idle;
                debug!("=== #{sequence} SUCCESS: {label} ({:?}) ===", started.elapsed());
            }
            Err(e) => debug!("=== #{sequence} FAILED: {label}: {e} ==="),
        }

        self.record(TranscriptEntry {
            sequence,
            timestamp: Utc::now(),
            command: label.to_string(),
            kind,
            elapsed_ms: started.elapsed().as_secs_f64() * 1e3,
            outcome: match &result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
            warnings: result.as_ref().map(R::warnings).unwrap_or_default(),
        });
        result
    }

    fn record(&mut self, entry: TranscriptEntry) {
        if let Some(transcript) = self.transcript.as_mut() {
            if let Err(e) = transcript.add(entry) {
                warn!("Disabling transcript after repeated failures: {e}");
                self.transcript = None;
            }
        }
    }

    /// Apply the failure policy to an error and hand it back
    pub(crate) fn fail(&mut self, error: VnaError) -> VnaError {
        if error.is_fatal() {
            warn!("Session faulted: {error}");
            self.state = SessionState::Faulted;
            self.mirror.invalidate();
        } else {
            if matches!(error, VnaError::InstrumentFault { .. }) {
                self.mirror.invalidate();
            }
            self.state = SessionState::Idle;
        }
        error
    }

    /// Sent -> (AwaitingCompletion | reply) -> ErrorCheck for one command
    fn dispatch(&mut self, command: &Command) -> Result<(Option<Reply>, Warnings), VnaError> {
        let bytes = self.codec.encode(command)?;
        self.state = SessionState::Sent;
        self.send_message(command.mnemonic(), &bytes)?;

        let timeout = command.timeout().unwrap_or(self.config.timeout);
        let reply = match command.kind() {
            CommandKind::Query(shape) => {
                match self.read_reply(shape, &Deadline::after(timeout), BlockTarget::Buffer) {
                    Ok(reply) => Some(reply),
                    Err(e @ VnaError::MalformedReply { .. }) => {
                        // The stream is still in sync; settle the queue so its
                        // entries stay with this query
                        self.drain_errors(command.mnemonic())?;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            CommandKind::Action if command.is_long_running() => {
                self.await_completion(timeout)?;
                None
            }
            CommandKind::Action => None,
        };

        let warnings = self.drain_errors(command.mnemonic())?;
        Ok((reply, warnings))
    }

    /// Write one fully encoded message
    pub(crate) fn send_message(&mut self, mnemonic: &str, bytes: &[u8]) -> Result<(), VnaError> {
        if invalidates_selection(mnemonic) {
            self.mirror.invalidate();
        }
        trace!("TX {:?}", String::from_utf8_lossy(&bytes[..bytes.len().min(128)]));
        self.link.send(bytes).map(|_| ()).map_err(|short| VnaError::Io {
            source: short.source,
            context: format!("Sending '{mnemonic}' ({} of {} bytes written)", short.sent, bytes.len()),
        })
    }

    /// Read a reply of the given shape; blocks are read by length, everything
    /// else up to the line delimiter
    pub(crate) fn read_reply(
        &mut self,
        shape: ReplyShape,
        deadline: &Deadline,
        target: BlockTarget,
    ) -> Result<Reply, VnaError> {
        if shape == ReplyShape::Block {
            let payload = block::read_block(&mut self.link, deadline, self.config.max_block_size, target)?;
            return Ok(Reply::Block(payload));
        }
        let line = self.read_line(deadline)?;
        if line.first() == Some(&block::BLOCK_SENTINEL) {
            return Err(VnaError::ProtocolDesync(format!(
                "block reply where {shape:?} was expected"
            )));
        }
        self.codec.decode(&line, shape)
    }

    fn read_line(&mut self, deadline: &Deadline) -> Result<Vec<u8>, VnaError> {
        let line = self.link.read_line(deadline).map_err(|failure| match failure {
            ReadFailure::TimedOut => VnaError::Timeout(deadline.budget()),
            ReadFailure::Closed => VnaError::ProtocolDesync("connection closed while awaiting reply".into()),
            ReadFailure::Overflow(limit) => {
                VnaError::ProtocolDesync(format!("no delimiter within {limit} reply bytes"))
            }
            ReadFailure::Io(source) => VnaError::Io {
                source,
                context: "Reading reply".to_string(),
            },
        })?;
        trace!("RX {:?}", String::from_utf8_lossy(&line[..line.len().min(128)]));
        Ok(line)
    }

    /// Completion barrier: `*OPC?` must answer `1` within `timeout`
    fn await_completion(&mut self, timeout: Duration) -> Result<(), VnaError> {
        self.state = SessionState::AwaitingCompletion;
        debug!("Awaiting operation complete (up to {timeout:?})");
        let bytes = self.codec.encode(&Command::query(codec::OPC_QUERY, ReplyShape::Raw).build())?;
        self.send_message(codec::OPC_QUERY, &bytes)?;

        let line = self.read_line(&Deadline::after(timeout))?;
        let reply = self
            .codec
            .decode(&line, ReplyShape::Scalar(ValueType::Integer))
            .and_then(|r| r.as_i64());
        match reply {
            Ok(1) => Ok(()),
            _ => Err(VnaError::ProtocolDesync(format!(
                "unexpected *OPC? reply {:?}",
                String::from_utf8_lossy(&line)
            ))),
        }
    }

    /// ErrorCheck: drain `SYST:ERR?` until the empty-queue sentinel, at most
    /// `max_error_polls` times
    pub(crate) fn drain_errors(&mut self, attributed_to: &str) -> Result<Warnings, VnaError> {
        self.state = SessionState::ErrorCheck;
        let query = self.codec.encode(&Command::query(codec::ERROR_QUERY, ReplyShape::Raw).build())?;

        let mut warnings = Vec::new();
        let mut faults = Vec::new();
        let mut emptied = false;

        for poll in 1..=self.config.max_error_polls {
            self.send_message(codec::ERROR_QUERY, &query)?;
            let line = self.read_line(&Deadline::after(self.config.timeout))?;
            let text = String::from_utf8_lossy(&line);
            // Without a parseable entry the queue state is unknown
            let (code, message) = codec::parse_error_reply(&text)
                .map_err(|e| VnaError::ProtocolDesync(format!("unreadable error queue entry: {e}")))?;

            if code == NO_ERROR_CODE {
                trace!("Error queue empty after {poll} polls");
                emptied = true;
                break;
            }

            let entry = ErrorEntry::new(code, message, classify_code(code, &self.config.warning_codes));
            if entry.is_fatal() {
                warn!("'{attributed_to}' raised {},\"{}\"", entry.code, entry.message);
                faults.push(entry);
            } else {
                debug!("'{attributed_to}' raised warning {},\"{}\"", entry.code, entry.message);
                warnings.push(entry);
            }
        }

        if !emptied {
            return Err(VnaError::ProtocolDesync(format!(
                "error queue not empty after {} polls",
                self.config.max_error_polls
            )));
        }
        if !faults.is_empty() {
            return Err(VnaError::InstrumentFault {
                command: attributed_to.to_string(),
                faults,
            });
        }
        Ok(warnings)
    }
}

/// Results that carry instrument warnings into the transcript
trait Recordable {
    fn warnings(&self) -> Warnings {
        Vec::new()
    }
}

impl Recordable for Warnings {
    fn warnings(&self) -> Warnings {
        self.clone()
    }
}

impl Recordable for (Reply, Warnings) {
    fn warnings(&self) -> Warnings {
        self.1.clone()
    }
}

impl Recordable for Vec<u8> {}

impl Recordable for () {}
