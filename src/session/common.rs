use std::time::Duration;

use log::{debug, info};

use super::Session;
use crate::error::VnaError;
use crate::scpi::codec::{CLEAR_STATUS, OPC_QUERY};
use crate::scpi::Command;
use crate::transport::Transport;
use crate::types::{Capabilities, InstrumentId, ReplyShape, ValueType, Warnings};

// Bit 2 of the questionable hardware condition register: source unleveled
const UNLEVELED_BIT: i64 = 1 << 2;

impl<T: Transport> Session<T> {
    /// Query the instrument identity (`*IDN?`).
    ///
    /// # Returns
    /// Manufacturer, model, serial number and firmware revision
    ///
    /// # Errors
    /// Returns `MalformedReply` if the reply does not have four fields.
    ///
    /// # Examples
    /// ```no_run
    /// use vna_link::Session;
    ///
    /// let mut session = Session::connect("192.168.1.50", 5025)?;
    /// let id = session.identify()?;
    /// println!("{} {} (fw {})", id.manufacturer, id.model, id.firmware);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn identify(&mut self) -> Result<InstrumentId, VnaError> {
        let raw = self.query_raw("*IDN?")?;
        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [manufacturer, model, serial, firmware] => {
                let id = InstrumentId {
                    manufacturer: manufacturer.to_string(),
                    model: model.to_string(),
                    serial: serial.to_string(),
                    firmware: firmware.to_string(),
                };
                info!("Instrument: {} {} ({})", id.manufacturer, id.model, id.serial);
                Ok(id)
            }
            _ => Err(VnaError::malformed(raw.as_str(), "expected 4 identity fields")),
        }
    }

    /// Installed option codes (`*OPT?`). An instrument without options
    /// returns an empty list.
    pub fn options(&mut self) -> Result<Vec<String>, VnaError> {
        let reply = self.query(&Command::query("*OPT?", ReplyShape::Catalog).build())?;
        let options = reply.as_strings()?;
        Ok(options
            .into_iter()
            .filter(|o| !o.is_empty() && o != "0")
            .collect())
    }

    /// Port and source counts and their names.
    ///
    /// # Errors
    /// Returns `MalformedReply` if a count is not an integer or a catalog
    /// disagrees with its count.
    pub fn capabilities(&mut self) -> Result<Capabilities, VnaError> {
        let port_count = self.count("SYST:CAP:HARD:PORT:COUN?")?;
        let port_catalog = self.catalog("SYST:CAP:HARD:PORT:CAT?")?;
        let source_count = self.count("SYST:CAP:HARD:SOUR:COUN?")?;
        let source_catalog = self.catalog("SYST:CAP:HARD:SOUR:CAT?")?;

        if port_catalog.len() != port_count as usize {
            return Err(VnaError::malformed(
                port_catalog.join(","),
                format!("catalog lists {} ports, count is {port_count}", port_catalog.len()),
            ));
        }
        if source_catalog.len() != source_count as usize {
            return Err(VnaError::malformed(
                source_catalog.join(","),
                format!("catalog lists {} sources, count is {source_count}", source_catalog.len()),
            ));
        }

        Ok(Capabilities {
            port_count,
            port_catalog,
            source_count,
            source_catalog,
        })
    }

    /// Clear the status registers and error queue (`*CLS`)
    pub fn clear_status(&mut self) -> Result<(), VnaError> {
        self.execute(&Command::action(CLEAR_STATUS).build())?;
        Ok(())
    }

    /// Return the instrument to its default state.
    ///
    /// With `clear_all` the factory preset `SYST:FPR` is used, which leaves no
    /// measurements defined; otherwise `*RST`. Both wait on the completion
    /// barrier before the error check, and both drop the cached selections.
    pub fn preset(&mut self, clear_all: bool) -> Result<Warnings, VnaError> {
        let reset = if clear_all { "SYST:FPR" } else { "*RST" };
        self.execute_group(&[
            Command::action(CLEAR_STATUS).build(),
            Command::action(reset).long_running().build(),
        ])
    }

    /// Block until all pending operations finish (`*OPC?`).
    ///
    /// `timeout` overrides the session deadline for long sweeps.
    pub fn wait_for_opc(&mut self, timeout: Option<Duration>) -> Result<(), VnaError> {
        let mut command = Command::query(OPC_QUERY, ReplyShape::Scalar(ValueType::Integer));
        if let Some(timeout) = timeout {
            command = command.timeout(timeout);
        }
        let reply = self.query(&command.build())?;
        match reply.as_i64()? {
            1 => Ok(()),
            other => Err(VnaError::malformed(other.to_string(), "*OPC? must answer 1")),
        }
    }

    /// Run one sweep on channel `ch` and block until it completes.
    ///
    /// The trigger source is set to immediate, then `SENSn:SWE:MODE SING`
    /// goes out as the long-running member of one group, so the completion
    /// barrier follows it directly. `timeout` overrides the session deadline
    /// for sweeps slower than that.
    ///
    /// # Examples
    /// ```no_run
    /// use std::time::Duration;
    /// use vna_link::Session;
    ///
    /// let mut session = Session::connect("192.168.1.50", 5025)?;
    /// session.single_trigger(Some(Duration::from_secs(60)), 1)?;
    /// let trace = session.fetch_trace(1, "CH1_S21_1")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn single_trigger(&mut self, timeout: Option<Duration>, ch: u32) -> Result<Warnings, VnaError> {
        let mut sweep = Command::action(format!("SENS{ch}:SWE:MODE"))
            .token("SING")
            .long_running();
        if let Some(timeout) = timeout {
            sweep = sweep.timeout(timeout);
        }
        self.execute_group(&[
            Command::action("TRIG:SOUR").token("IMM").build(),
            sweep.build(),
        ])
    }

    /// Stop channel `ch` from sweeping (`SENSn:SWE:MODE HOLD`)
    pub fn hold_trigger(&mut self, ch: u32) -> Result<Warnings, VnaError> {
        self.execute_group(&[
            Command::action("TRIG:SOUR").token("IMM").build(),
            Command::action(format!("SENS{ch}:SWE:MODE")).token("HOLD").build(),
        ])
    }

    /// True while any source reports an unleveled output
    pub fn source_unleveled(&mut self) -> Result<bool, VnaError> {
        let condition = self.count_raw("STAT:QUES:INT:HARD:COND?")?;
        let unleveled = condition & UNLEVELED_BIT != 0;
        if unleveled {
            debug!("Questionable hardware condition {condition:#x}: source unleveled");
        }
        Ok(unleveled)
    }

    /// Currently active channel (`SYST:ACT:CHAN?`). The answer is cached in
    /// the state mirror.
    pub fn active_channel(&mut self) -> Result<u32, VnaError> {
        let channel = self.count("SYST:ACT:CHAN?")?;
        self.mirror.record_channel(channel);
        Ok(channel)
    }

    fn count_raw(&mut self, mnemonic: &str) -> Result<i64, VnaError> {
        self.query(&Command::query(mnemonic, ReplyShape::Scalar(ValueType::Integer)).build())?
            .as_i64()
    }

    pub(crate) fn count(&mut self, mnemonic: &str) -> Result<u32, VnaError> {
        let value = self.count_raw(mnemonic)?;
        u32::try_from(value).map_err(|_| VnaError::malformed(value.to_string(), "expected a non-negative count"))
    }

    pub(crate) fn catalog(&mut self, mnemonic: &str) -> Result<Vec<String>, VnaError> {
        self.query(&Command::query(mnemonic, ReplyShape::Catalog).build())?
            .as_strings()
    }
}
