use log::debug;

use super::Session;
use crate::error::VnaError;
use crate::scpi::block::{decode_real64, Endian};
use crate::scpi::Command;
use crate::transport::Transport;
use crate::types::{ReplyShape, TraceData};

impl<T: Transport> Session<T> {
    /// Read the formatted data and stimulus values of one measurement.
    ///
    /// Selects the measurement, switches the data format to little-endian
    /// `REAL,64` and reads `CALC<ch>:DATA? FDATA` and `CALC<ch>:X?` as binary
    /// blocks.
    ///
    /// # Errors
    /// Returns `MalformedReply` if the two arrays differ in length or a
    /// payload is not a whole number of doubles.
    pub fn fetch_trace(&mut self, ch: u32, name: &str) -> Result<TraceData, VnaError> {
        self.select_measurement(ch, name)?;
        self.execute_group(&[
            Command::action("FORM:BORD").token("SWAP").build(),
            Command::action("FORM").token("REAL").int(64).build(),
        ])?;

        let y = self.real64_block(Command::query(format!("CALC{ch}:DATA?"), ReplyShape::Block).token("FDATA"))?;
        let x = self.real64_block(Command::query(format!("CALC{ch}:X?"), ReplyShape::Block))?;

        if x.len() != y.len() {
            return Err(VnaError::malformed(
                format!("<{} stimulus, {} data points>", x.len(), y.len()),
                "stimulus and data lengths differ",
            ));
        }
        debug!("Fetched {} points of {name:?} on channel {ch}", y.len());
        Ok(TraceData { x, y })
    }

    fn real64_block(&mut self, command: impl Into<Command>) -> Result<Vec<f64>, VnaError> {
        let payload = self.query(&command.into())?.into_block()?;
        decode_real64(&payload, Endian::Little)
    }
}
