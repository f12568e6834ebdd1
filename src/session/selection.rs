use log::debug;

use super::Session;
use crate::error::VnaError;
use crate::scpi::Command;
use crate::transport::Transport;
use crate::types::{ReplyShape, ValueType};

impl<T: Transport> Session<T> {
    /// Make `name` the selected measurement of channel `ch`, which also makes
    /// `ch` the active channel.
    ///
    /// Nothing is sent when the state mirror already knows this measurement
    /// is selected on the active channel.
    ///
    /// # Examples
    /// ```no_run
    /// use vna_link::Session;
    ///
    /// let mut session = Session::connect("192.168.1.50", 5025)?;
    /// session.select_measurement(1, "CH1_S11_1")?;
    /// // Already selected: no traffic
    /// session.select_measurement(1, "CH1_S11_1")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn select_measurement(&mut self, ch: u32, name: &str) -> Result<(), VnaError> {
        if self.mirror.is_measurement_selected(ch, name) {
            debug!("Measurement {name:?} already selected on channel {ch}");
            return Ok(());
        }
        self.execute(&Command::action(format!("CALC{ch}:PAR:SEL")).string(name).build())?;
        self.mirror.record_measurement(ch, name);
        Ok(())
    }

    /// Activate display window `w`
    pub fn select_window(&mut self, w: u32) -> Result<(), VnaError> {
        if self.mirror.active_window() == Some(w) {
            debug!("Window {w} already active");
            return Ok(());
        }
        self.execute(&Command::action(format!("DISP:WIND{w}:ACT")).build())?;
        self.mirror.record_window(w);
        Ok(())
    }

    /// Select trace `t` in window `w`
    pub fn select_trace(&mut self, w: u32, t: u32) -> Result<(), VnaError> {
        if self.mirror.active_trace() == Some((w, t)) {
            debug!("Trace {t} in window {w} already selected");
            return Ok(());
        }
        self.execute(&Command::action(format!("DISP:WIND{w}:TRAC{t}:SEL")).build())?;
        self.mirror.record_trace(w, t);
        Ok(())
    }

    /// Names of the measurements defined on channel `ch`.
    ///
    /// The extended catalog alternates names and parameters
    /// (`"CH1_S11,S11,CH1_S21,S21"`); only the names are returned.
    pub fn measurement_names(&mut self, ch: u32) -> Result<Vec<String>, VnaError> {
        let catalog = self.catalog(&format!("CALC{ch}:PAR:CAT:EXT?"))?;
        Ok(catalog.into_iter().step_by(2).collect())
    }

    /// Instrument-wide number of measurement `name` on channel `ch`
    pub fn measurement_number(&mut self, ch: u32, name: &str) -> Result<u32, VnaError> {
        self.select_measurement(ch, name)?;
        let reply = self.query(
            &Command::query(format!("CALC{ch}:PAR:MNUM?"), ReplyShape::Scalar(ValueType::Integer))
                .build(),
        )?;
        let number = reply.as_i64()?;
        u32::try_from(number).map_err(|_| VnaError::malformed(number.to_string(), "negative measurement number"))
    }
}
