pub mod config;
pub mod error;
pub mod logger;
pub mod mirror;
pub mod scpi;
pub mod session;
pub mod simulator;
pub mod transport;
pub mod types;

pub use config::{load_config, load_config_or_default, AppConfig};
pub use error::VnaError;
pub use logger::{Logger, OperationKind, TranscriptEntry, TranscriptLogger};
pub use mirror::StateMirror;
pub use scpi::{Arg, Command, CommandBuilder, CommandKind, ScpiCodec};
pub use session::{Session, SessionBuilder, SessionConfig, SessionState};
pub use simulator::SimulatedInstrument;
pub use transport::{ConnectionConfig, TcpTransport, Transport, DEFAULT_SCPI_PORT};
pub use types::{
    Capabilities, ErrorEntry, InstrumentId, Reply, ReplyShape, ScpiValue, Severity, TraceData,
    ValueType, Warnings,
};
