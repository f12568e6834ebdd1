//! In-memory instrument speaking enough SCPI to drive a [`Session`] without
//! hardware.
//!
//! Replies are produced synchronously when a message is sent, so an empty
//! output queue means nothing will ever arrive: `receive` then waits out the
//! requested timeout and reports `TimedOut`, like a silent socket would.
//!
//! The handle is cheap to clone; every clone shares the same state, so tests
//! keep one clone for scripting and inspection and give another to the
//! session.
//!
//! [`Session`]: crate::Session

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use parking_lot::Mutex;

use crate::scpi::block;
use crate::scpi::codec::{CLEAR_STATUS, ERROR_QUERY, FILE_TRANSFER, FILE_TRANSFER_QUERY, OPC_QUERY};
use crate::transport::Transport;

const DEFAULT_IDN: &str = "Simulated,VNA-4P,SIM000001,1.0.0";

#[derive(Debug)]
struct SimState {
    delimiter: Vec<u8>,
    block_terminator: Option<Vec<u8>>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    errors: VecDeque<(i32, String)>,
    replies: HashMap<String, String>,
    block_replies: HashMap<String, Vec<u8>>,
    faults: HashMap<String, (i32, String)>,
    files: HashMap<String, Vec<u8>>,
    history: Vec<String>,
    idn: String,
    silent: bool,
    stuck_error: Option<(i32, String)>,
    truncate_next_block: Option<usize>,
    max_frame_size: Option<usize>,
    error_polls: usize,
    closed: bool,
}

/// One message taken off the input stream, with its inline block if any
struct Message {
    text: String,
    block: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    pub fn new() -> Self {
        Self::with_delimiter("\n")
    }

    pub fn with_delimiter(delimiter: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                delimiter: delimiter.as_bytes().to_vec(),
                block_terminator: None,
                inbox: Vec::new(),
                outbox: VecDeque::new(),
                errors: VecDeque::new(),
                replies: HashMap::new(),
                block_replies: HashMap::new(),
                faults: HashMap::new(),
                files: HashMap::new(),
                history: Vec::new(),
                idn: DEFAULT_IDN.to_string(),
                silent: false,
                stuck_error: None,
                truncate_next_block: None,
                max_frame_size: None,
                error_polls: 0,
                closed: false,
            })),
        }
    }

    /// End block replies with `terminator` instead of the line delimiter
    pub fn set_block_terminator(&self, terminator: &str) {
        self.state.lock().block_terminator = Some(terminator.as_bytes().to_vec());
    }

    /// Queue an entry as if an earlier command had raised it
    pub fn push_error(&self, code: i32, message: &str) {
        self.state.lock().errors.push_back((code, message.to_string()));
    }

    /// Text reply for a query header
    pub fn set_reply(&self, header: &str, reply: &str) {
        self.state.lock().replies.insert(normalize(header), reply.to_string());
    }

    /// Definite-length block reply for a query header
    pub fn set_block_reply(&self, header: &str, payload: Vec<u8>) {
        self.state.lock().block_replies.insert(normalize(header), payload);
    }

    /// Every message with this header raises `code` instead of executing
    pub fn fail_on(&self, header: &str, code: i32, message: &str) {
        self.state
            .lock()
            .faults
            .insert(normalize(header), (code, message.to_string()));
    }

    /// Stop answering anything
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Make `SYST:ERR?` report this entry forever
    pub fn set_stuck_error(&self, code: i32, message: &str) {
        self.state.lock().stuck_error = Some((code, message.to_string()));
    }

    /// Send only the first `bytes` of the next block payload, then go quiet
    pub fn truncate_next_block(&self, bytes: usize) {
        self.state.lock().truncate_next_block = Some(bytes);
    }

    /// Largest frame accepted by `send` and produced by `receive`
    pub fn set_max_frame_size(&self, size: usize) {
        self.state.lock().max_frame_size = Some(size);
    }

    pub fn set_idn(&self, idn: &str) {
        self.state.lock().idn = idn.to_string();
    }

    pub fn put_file(&self, name: &str, content: Vec<u8>) {
        self.state.lock().files.insert(name.to_string(), content);
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(name).cloned()
    }

    /// Received messages in order. Inline blocks appear as their header
    /// followed by `<N bytes>`.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    /// Number of `SYST:ERR?` polls answered so far
    pub fn error_polls(&self) -> usize {
        self.state.lock().error_polls
    }

    pub fn pending_errors(&self) -> usize {
        self.state.lock().errors.len()
    }

    /// Drop the connection from the instrument side
    pub fn hang_up(&self) {
        self.state.lock().closed = true;
    }
}

impl Transport for SimulatedInstrument {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "instrument hung up"));
        }
        if let Some(limit) = state.max_frame_size {
            if data.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("frame of {} bytes exceeds {limit}", data.len()),
                ));
            }
        }
        state.inbox.extend_from_slice(data);
        while let Some(message) = state.next_message() {
            state.handle(message);
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.outbox.is_empty() {
            if state.closed {
                return Ok(0);
            }
            drop(state);
            std::thread::sleep(timeout);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
        }
        let n = buf
            .len()
            .min(state.outbox.len())
            .min(state.max_frame_size.unwrap_or(usize::MAX));
        for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn max_frame_size(&self) -> Option<usize> {
        self.state.lock().max_frame_size
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

impl SimState {
    /// Split the next complete message off the inbox. A `#` outside quotes
    /// starts an inline block, which is consumed by length.
    fn next_message(&mut self) -> Option<Message> {
        let mut in_quote = false;
        let mut i = 0;
        while i < self.inbox.len() {
            match self.inbox[i] {
                b'"' => in_quote = !in_quote,
                block::BLOCK_SENTINEL if !in_quote => return self.take_block_message(i),
                _ if !in_quote && self.inbox[i..].starts_with(&self.delimiter) => {
                    let text = String::from_utf8_lossy(&self.inbox[..i]).into_owned();
                    self.inbox.drain(..i + self.delimiter.len());
                    return Some(Message { text, block: None });
                }
                _ => {}
            }
            i += 1;
        }
        None
    }

    fn take_block_message(&mut self, start: usize) -> Option<Message> {
        let digits = (*self.inbox.get(start + 1)?).checked_sub(b'0')? as usize;
        if self.inbox.len() < start + 2 + digits {
            return None;
        }
        let header = block::parse_header(&self.inbox[start..]).ok()?;
        let payload_start = start + header.header_len;
        let payload_end = payload_start + header.payload_len;
        if self.inbox.len() < payload_end + self.delimiter.len() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.inbox[..start]).into_owned();
        let payload = self.inbox[payload_start..payload_end].to_vec();
        self.inbox.drain(..payload_end + self.delimiter.len());
        Some(Message {
            text,
            block: Some(payload),
        })
    }

    fn handle(&mut self, message: Message) {
        let Message { text, block } = message;
        let entry = match &block {
            Some(payload) => format!("{text}{}<{} bytes>", block::header_for(payload.len()), payload.len()),
            None => text.clone(),
        };
        trace!("SIM RX {entry:?}");
        self.history.push(entry);

        if self.silent {
            return;
        }
        let header = normalize(text.split_whitespace().next().unwrap_or_default());

        if let Some((code, msg)) = self.faults.get(&header).cloned() {
            self.errors.push_back((code, msg));
            return;
        }

        match header.as_str() {
            CLEAR_STATUS => self.errors.clear(),
            OPC_QUERY => self.reply("1"),
            "*IDN?" => {
                let idn = self.idn.clone();
                self.reply(&idn);
            }
            ERROR_QUERY => {
                self.error_polls += 1;
                let (code, msg) = self
                    .stuck_error
                    .clone()
                    .or_else(|| self.errors.pop_front())
                    .unwrap_or((0, "No error".to_string()));
                self.reply(&format!("{code:+},\"{msg}\""));
            }
            FILE_TRANSFER_QUERY => match quoted_arg(&text).and_then(|name| self.files.get(&name).cloned()) {
                Some(content) => self.reply_block(&content),
                None => {
                    self.errors.push_back((-256, "File name not found".to_string()));
                    self.reply_block(&[]);
                }
            },
            FILE_TRANSFER => match (quoted_arg(&text), block) {
                (Some(name), Some(payload)) => {
                    self.files.insert(name, payload);
                }
                _ => self.errors.push_back((-109, "Missing parameter".to_string())),
            },
            _ => {
                if let Some(payload) = self.block_replies.get(&header).cloned() {
                    self.reply_block(&payload);
                } else if let Some(reply) = self.replies.get(&header).cloned() {
                    self.reply(&reply);
                } else if header.ends_with('?') {
                    self.errors.push_back((-113, "Undefined header".to_string()));
                }
            }
        }
    }

    fn reply(&mut self, text: &str) {
        self.outbox.extend(text.as_bytes());
        self.outbox.extend(self.delimiter.iter());
    }

    fn reply_block(&mut self, payload: &[u8]) {
        self.outbox.extend(block::header_for(payload.len()).as_bytes());
        match self.truncate_next_block.take() {
            Some(keep) => self.outbox.extend(&payload[..keep.min(payload.len())]),
            None => {
                self.outbox.extend(payload);
                let terminator = self.block_terminator.as_ref().unwrap_or(&self.delimiter);
                self.outbox.extend(terminator.iter());
            }
        }
    }
}

fn normalize(header: &str) -> String {
    header.trim().trim_start_matches(':').to_ascii_uppercase()
}

/// First double-quoted argument of a message
fn quoted_arg(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let len = text[start..].find('"')?;
    Some(text[start..start + len].to_string())
}
