use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::{Session, SessionState};
use crate::error::VnaError;
use crate::logger::OperationKind;
use crate::scpi::block::{self, BlockTarget, BlockTransferDescriptor, Direction};
use crate::scpi::codec::{FILE_TRANSFER, FILE_TRANSFER_QUERY};
use crate::scpi::Command;
use crate::transport::{Deadline, Transport};
use crate::types::{ReplyShape, Warnings};

impl<T: Transport> Session<T> {
    /// Write `bytes` to `name` on the instrument's file system (`MMEM:TRAN`).
    ///
    /// The payload travels as a single definite-length block, so it may hold
    /// any byte values. The error queue is checked once the block is sent.
    ///
    /// # Errors
    /// - `InvalidCommand` if `name` contains the line delimiter (nothing is sent)
    /// - `TransferIncomplete` if the transport fails before the whole payload
    ///   is written; the session is then faulted
    /// - `InstrumentFault` if the instrument rejects the file
    pub fn upload_file(&mut self, bytes: &[u8], name: &str) -> Result<Warnings, VnaError> {
        let prefix = self
            .codec
            .encode_unterminated(&Command::action(FILE_TRANSFER).string(name).build())?;
        if bytes.len() > block::MAX_DECLARABLE_LEN {
            return Err(VnaError::InvalidCommand(format!(
                "{} bytes do not fit a definite-length block",
                bytes.len()
            )));
        }

        let descriptor = BlockTransferDescriptor::new(
            Direction::Upload,
            bytes.len(),
            BlockTarget::InstrumentFile(name.to_string()),
        );
        let label = format!("{prefix},{}", block::header_for(bytes.len()));
        info!("Uploading {} bytes to {name:?}", bytes.len());

        self.run(&label, OperationKind::Upload, |s| {
            s.state = SessionState::Sent;
            let head = label.as_bytes();

            let incomplete = |actual| VnaError::TransferIncomplete {
                expected: descriptor.declared_len,
                actual,
            };
            s.link.send(head).map_err(|short| {
                warn!("Upload header failed: {}", short.source);
                incomplete(0)
            })?;
            let sent = s.link.send(bytes).map_err(|short| {
                warn!("Upload stopped after {} bytes: {}", short.sent, short.source);
                incomplete(short.sent)
            })?;
            descriptor.verify(sent)?;

            let delimiter = s.link.delimiter().to_vec();
            s.link.send(&delimiter).map_err(|short| VnaError::Io {
                source: short.source,
                context: "Terminating upload".to_string(),
            })?;

            s.drain_errors(&label)
        })
    }

    /// Read file `name` from the instrument (`MMEM:TRAN?`).
    ///
    /// Exactly the declared number of bytes is returned. A transfer that stops
    /// short yields `TransferIncomplete` with the counts only; partial data is
    /// discarded.
    pub fn download_file(&mut self, name: &str) -> Result<Vec<u8>, VnaError> {
        let command = Command::query(FILE_TRANSFER_QUERY, ReplyShape::Block)
            .string(name)
            .build();
        let bytes = self.codec.encode(&command)?;
        let label = format!("{FILE_TRANSFER_QUERY} {name:?}");

        self.run(&label, OperationKind::Download, |s| {
            s.state = SessionState::Sent;
            s.send_message(FILE_TRANSFER_QUERY, &bytes)?;
            let deadline = Deadline::after(s.config.timeout);
            let reply = s.read_reply(
                ReplyShape::Block,
                &deadline,
                BlockTarget::InstrumentFile(name.to_string()),
            )?;
            for w in s.drain_errors(&label)? {
                warn!("Download of {name:?} raised warning {},\"{}\"", w.code, w.message);
            }
            let payload = reply.into_block()?;
            info!("Downloaded {} bytes from {name:?}", payload.len());
            Ok(payload)
        })
    }

    /// Download `name` into a local file.
    ///
    /// Data goes to a `.partial` sibling first and is renamed into place only
    /// once complete, so a failed transfer never leaves a truncated file at
    /// `path`.
    pub fn download_file_to(&mut self, name: &str, path: impl AsRef<Path>) -> Result<usize, VnaError> {
        let path = path.as_ref();
        let payload = self.download_file(name)?;

        let descriptor = BlockTransferDescriptor::new(
            Direction::Download,
            payload.len(),
            BlockTarget::LocalFile(path.to_path_buf()),
        );
        let partial = partial_path(path);
        let local_err = |source| VnaError::LocalFile {
            path: path.to_path_buf(),
            source,
        };
        let on_disk = fs::write(&partial, &payload).and_then(|()| fs::metadata(&partial));
        let verified = match on_disk {
            Ok(meta) => descriptor.verify(meta.len() as usize),
            Err(source) => Err(local_err(source)),
        };
        let placed = verified.and_then(|()| fs::rename(&partial, path).map_err(local_err));
        if let Err(e) = placed {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        debug!("Wrote {} bytes to {}", payload.len(), path.display());
        Ok(payload.len())
    }

    /// Upload the contents of a local file to `name` on the instrument
    pub fn upload_file_from(&mut self, path: impl AsRef<Path>, name: &str) -> Result<Warnings, VnaError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| VnaError::LocalFile {
            path: path.to_path_buf(),
            source,
        })?;
        self.upload_file(&bytes, name)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedInstrument;
    use crate::SessionConfig;
    use std::time::Duration;

    fn session(sim: &SimulatedInstrument) -> Session<SimulatedInstrument> {
        let config = SessionConfig {
            timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        Session::with_transport(sim.clone(), config).unwrap()
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/tmp/cal.csa")),
            PathBuf::from("/tmp/cal.csa.partial")
        );
    }

    #[test]
    fn test_upload_message_framing() {
        let sim = SimulatedInstrument::new();
        let mut s = session(&sim);
        s.upload_file(b"a\nb", "C:/state.sta").unwrap();
        assert_eq!(sim.file("C:/state.sta").unwrap(), b"a\nb");
        assert!(sim
            .history()
            .iter()
            .any(|line| line == "MMEM:TRAN \"C:/state.sta\",#13<3 bytes>"));
    }

    #[test]
    fn test_download_missing_file_is_a_fault() {
        let sim = SimulatedInstrument::new();
        let mut s = session(&sim);
        let err = s.download_file("nope.csa").unwrap_err();
        assert_eq!(err.fault_code(), Some(-256));
        assert!(!s.is_faulted());
    }

    #[test]
    fn test_download_to_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new();
        let touchstone = b"# Hz S RI R 50\n1e9 0 0 1 0\n".to_vec();
        sim.put_file("trace.s2p", touchstone.clone());
        let mut s = session(&sim);

        let target = dir.path().join("trace.s2p");
        let written = s.download_file_to("trace.s2p", &target).unwrap();
        assert_eq!(written, touchstone.len());
        assert_eq!(fs::read(&target).unwrap(), touchstone);
        assert!(!partial_path(&target).exists());
    }

    #[test]
    fn test_truncated_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new();
        sim.put_file("big.csa", vec![7u8; 5000]);
        let mut s = session(&sim);
        sim.truncate_next_block(1200);

        let target = dir.path().join("big.csa");
        let err = s.download_file_to("big.csa", &target).unwrap_err();
        assert!(matches!(
            err,
            VnaError::TransferIncomplete {
                expected: 5000,
                actual: 1200
            }
        ));
        assert!(s.is_faulted());
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[test]
    fn test_failed_placement_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new();
        sim.put_file("state.sta", b"state".to_vec());
        let mut s = session(&sim);

        // A directory already sits where the file should go
        let target = dir.path().join("state.sta");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"x").unwrap();

        let err = s.download_file_to("state.sta", &target).unwrap_err();
        assert!(matches!(err, VnaError::LocalFile { .. }));
        assert!(!partial_path(&target).exists());
        assert!(target.join("keep").exists());
        assert!(!s.is_faulted());
    }
}
