use log::info;

use super::Session;
use crate::error::VnaError;
use crate::scpi::Command;
use crate::transport::Transport;
use crate::types::Warnings;

impl<T: Transport> Session<T> {
    /// Names of the calibration sets stored on the instrument (`CSET:CAT?`)
    pub fn list_cal_sets(&mut self) -> Result<Vec<String>, VnaError> {
        self.catalog("CSET:CAT?")
    }

    /// Apply calibration set `name` to channel `ch`.
    ///
    /// With `use_stimulus` the channel also takes the stimulus settings
    /// stored in the set. Applying a set can take several seconds, so the
    /// command waits on the completion barrier.
    ///
    /// # Errors
    /// Returns `InvalidCommand` without sending anything if the instrument
    /// does not list a set called `name`.
    ///
    /// # Examples
    /// ```no_run
    /// use vna_link::Session;
    ///
    /// let mut session = Session::connect("192.168.1.50", 5025)?;
    /// for set in session.list_cal_sets()? {
    ///     println!("{set}");
    /// }
    /// session.load_cal_set("Fixture A", true, 1)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load_cal_set(&mut self, name: &str, use_stimulus: bool, ch: u32) -> Result<Warnings, VnaError> {
        if !self.list_cal_sets()?.iter().any(|set| set == name) {
            return Err(VnaError::InvalidCommand(format!(
                "calibration set {name:?} does not exist"
            )));
        }
        let warnings = self.execute(
            &Command::action(format!("SENS{ch}:CORR:CSET:ACT"))
                .string(name)
                .boolean(use_stimulus)
                .long_running()
                .build(),
        )?;
        info!("Calibration set {name:?} active on channel {ch}");
        Ok(warnings)
    }

    /// Recall an instrument state or calibration file (`MMEM:LOAD`).
    ///
    /// The recalled file replaces channels and measurements, so cached
    /// selections are dropped.
    pub fn recall_state(&mut self, file: &str) -> Result<Warnings, VnaError> {
        let warnings = self.execute(&Command::action("MMEM:LOAD").string(file).long_running().build())?;
        info!("Recalled {file:?}");
        Ok(warnings)
    }
}
