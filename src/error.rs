use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::ErrorEntry;

#[derive(Error, Debug)]
pub enum VnaError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("No reply from instrument within {0:?}")]
    Timeout(Duration),
    #[error("Malformed reply {reply:?}: {reason}")]
    MalformedReply { reply: String, reason: String },
    #[error("Instrument fault after '{command}': {}", describe_faults(.faults))]
    InstrumentFault {
        command: String,
        faults: Vec<ErrorEntry>,
    },
    #[error("Block transfer incomplete: expected {expected} bytes, moved {actual}")]
    TransferIncomplete { expected: usize, actual: usize },
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Session is faulted, reconnect before issuing further commands")]
    SessionFaulted,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Local file error ({path:?}): {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn describe_faults(faults: &[ErrorEntry]) -> String {
    faults
        .iter()
        .map(|f| format!("{},\"{}\"", f.code, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl VnaError {
    /// Whether this condition leaves the session unusable until reconnect.
    pub fn is_fatal(&self) -> bool {
        match self {
            VnaError::MalformedReply { .. }
            | VnaError::InstrumentFault { .. }
            | VnaError::InvalidCommand(_)
            | VnaError::InvalidAddress(_)
            | VnaError::LocalFile { .. } => false,
            VnaError::Io { .. }
            | VnaError::Timeout(_)
            | VnaError::TransferIncomplete { .. }
            | VnaError::ProtocolDesync(_)
            | VnaError::SessionFaulted => true,
        }
    }

    /// Code of the primary instrument fault, if this is one.
    pub fn fault_code(&self) -> Option<i32> {
        match self {
            VnaError::InstrumentFault { faults, .. } => faults.first().map(|f| f.code),
            _ => None,
        }
    }

    pub(crate) fn malformed(reply: impl Into<String>, reason: impl Into<String>) -> Self {
        VnaError::MalformedReply {
            reply: reply.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    #[test]
    fn test_fatal_classification() {
        assert!(VnaError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(VnaError::ProtocolDesync("x".into()).is_fatal());
        assert!(VnaError::TransferIncomplete {
            expected: 10,
            actual: 3
        }
        .is_fatal());
        assert!(!VnaError::malformed("abc", "not a number").is_fatal());
        assert!(!VnaError::InvalidCommand("x".into()).is_fatal());
    }

    #[test]
    fn test_fault_display_and_code() {
        let err = VnaError::InstrumentFault {
            command: "SENS1:FREQ:STAR".to_string(),
            faults: vec![ErrorEntry::new(-222, "Data out of range", Severity::Fatal)],
        };
        assert_eq!(err.fault_code(), Some(-222));
        assert_eq!(
            err.to_string(),
            "Instrument fault after 'SENS1:FREQ:STAR': -222,\"Data out of range\""
        );
    }
}
