//! Last-known selection state, used to skip redundant select commands.
//!
//! The instrument stays the source of truth. Everything here is dropped on
//! connect, after any instrument fault, and whenever a command that resets
//! state or moves a selection goes out, since the real state is then unknown.

use std::collections::HashMap;

use log::debug;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateMirror {
    active_channel: Option<u32>,
    measurements: HashMap<u32, String>,
    active_window: Option<u32>,
    active_trace: Option<(u32, u32)>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self) {
        if !self.is_empty() {
            debug!("State mirror invalidated");
        }
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.active_channel.is_none()
            && self.measurements.is_empty()
            && self.active_window.is_none()
            && self.active_trace.is_none()
    }

    pub fn active_channel(&self) -> Option<u32> {
        self.active_channel
    }

    pub fn measurement(&self, channel: u32) -> Option<&str> {
        self.measurements.get(&channel).map(String::as_str)
    }

    pub fn active_window(&self) -> Option<u32> {
        self.active_window
    }

    pub fn active_trace(&self) -> Option<(u32, u32)> {
        self.active_trace
    }

    /// True when `name` is known to be the selected measurement of the active channel
    pub fn is_measurement_selected(&self, channel: u32, name: &str) -> bool {
        self.active_channel == Some(channel) && self.measurement(channel) == Some(name)
    }

    pub fn record_channel(&mut self, channel: u32) {
        self.active_channel = Some(channel);
    }

    pub fn record_measurement(&mut self, channel: u32, name: &str) {
        self.active_channel = Some(channel);
        self.measurements.insert(channel, name.to_string());
    }

    pub fn record_window(&mut self, window: u32) {
        self.active_window = Some(window);
    }

    pub fn record_trace(&mut self, window: u32, trace: u32) {
        self.active_window = Some(window);
        self.active_trace = Some((window, trace));
    }
}

// A header node as its (short, long) keyword forms
type Keyword = (&'static str, &'static str);

const ACT: Keyword = ("ACT", "ACTIVATE");
const ACTIVE: Keyword = ("ACT", "ACTIVE");
const CALC: Keyword = ("CALC", "CALCULATE");
const DEF: Keyword = ("DEF", "DEFINE");
const DEL: Keyword = ("DEL", "DELETE");
const DISP: Keyword = ("DISP", "DISPLAY");
const FPR: Keyword = ("FPR", "FPRESET");
const LOAD: Keyword = ("LOAD", "LOAD");
const MMEM: Keyword = ("MMEM", "MMEMORY");
const MNUM: Keyword = ("MNUM", "MNUMBER");
const PAR: Keyword = ("PAR", "PARAMETER");
const PRES: Keyword = ("PRES", "PRESET");
const SEL: Keyword = ("SEL", "SELECT");
const SYST: Keyword = ("SYST", "SYSTEM");
const TRAC: Keyword = ("TRAC", "TRACE");
const WIND: Keyword = ("WIND", "WINDOW");

const RESETTING_COMMON: &[&str] = &["*RST", "*RCL"];

// Leading nodes of set commands that reset state or move a selection
const SELECTION_HEADERS: &[&[Keyword]] = &[
    &[SYST, FPR],
    &[SYST, PRES],
    &[SYST, ACTIVE],
    &[MMEM, LOAD],
    &[CALC, PAR, SEL],
    &[CALC, PAR, DEF],
    &[CALC, PAR, MNUM],
    &[DISP, WIND, ACT],
    &[DISP, WIND, TRAC, SEL],
];

fn node_is(node: &str, (short, long): Keyword) -> bool {
    node.starts_with(short) && long.starts_with(node)
}

/// Whether sending `mnemonic` makes cached selections meaningless.
///
/// Nodes are compared in either their short or long form, ignoring numeric
/// suffixes, so `CALCulate2:PARameter:SELect` and `CALC2:PAR:SEL` agree.
/// Queries never invalidate.
pub fn invalidates_selection(mnemonic: &str) -> bool {
    let header = mnemonic
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches(':')
        .to_ascii_uppercase();

    if header.ends_with('?') {
        return false;
    }
    if RESETTING_COMMON.contains(&header.as_str()) {
        return true;
    }

    let nodes: Vec<&str> = header
        .split(':')
        .map(|node| node.trim_end_matches(|c: char| c.is_ascii_digit()))
        .collect();

    let moves_selection = SELECTION_HEADERS.iter().any(|pattern| {
        pattern.len() <= nodes.len()
            && pattern.iter().zip(&nodes).all(|(keyword, node)| node_is(node, *keyword))
    });
    // Deleting measurements or traces leaves selections dangling
    let deletes = nodes
        .windows(2)
        .any(|pair| (node_is(pair[0], PAR) || node_is(pair[0], TRAC)) && node_is(pair[1], DEL));

    moves_selection || deletes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_tracking() {
        let mut mirror = StateMirror::new();
        assert!(!mirror.is_measurement_selected(1, "CH1_S11"));

        mirror.record_measurement(1, "CH1_S11");
        assert!(mirror.is_measurement_selected(1, "CH1_S11"));
        assert!(!mirror.is_measurement_selected(1, "CH1_S21"));

        // Selecting on another channel moves the active channel
        mirror.record_measurement(2, "CH2_S21");
        assert!(!mirror.is_measurement_selected(1, "CH1_S11"));
        assert_eq!(mirror.measurement(1), Some("CH1_S11"));

        mirror.record_trace(3, 2);
        assert_eq!(mirror.active_window(), Some(3));
        assert_eq!(mirror.active_trace(), Some((3, 2)));

        mirror.invalidate();
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_resetting_commands() {
        assert!(invalidates_selection("*RST"));
        assert!(invalidates_selection("syst:fpreset"));
        assert!(invalidates_selection(":SYSTem:PRESet"));
        assert!(invalidates_selection("MMEM:LOAD:CSAR"));
        assert!(invalidates_selection("CALC1:PAR:DEL:ALL"));
        assert!(!invalidates_selection("SENS1:SWE:MODE"));
        assert!(!invalidates_selection("*OPC?"));
    }

    #[test]
    fn test_selection_moving_commands() {
        assert!(invalidates_selection("CALC1:PAR:SEL"));
        assert!(invalidates_selection(":calculate2:parameter:select"));
        assert!(invalidates_selection("CALC1:PAR:DEF:EXT"));
        assert!(invalidates_selection("CALC1:PAR:MNUM:SEL"));
        assert!(invalidates_selection("DISP:WIND2:ACT"));
        assert!(invalidates_selection("DISPlay:WINDow1:TRACe3:SELect"));
        assert!(invalidates_selection("SYST:ACT:CHAN"));
        assert!(invalidates_selection("SYSTem:ACTive:MEASurement"));

        // Reading a selection back leaves it where it is
        assert!(!invalidates_selection("CALC1:PAR:SEL?"));
        assert!(!invalidates_selection("CALC1:PAR:MNUM?"));
        assert!(!invalidates_selection("SYST:ACT:CHAN?"));
        assert!(!invalidates_selection("CALC1:PAR:CAT:EXT?"));
        assert!(!invalidates_selection("DISP:WIND1:TRAC1:Y:SCAL:AUTO"));
        assert!(!invalidates_selection("CALC1:DATA?"));
    }

    #[test]
    fn test_deletes_in_mixed_forms() {
        assert!(invalidates_selection("CALC1:PARAMETER:DEL"));
        assert!(invalidates_selection("CALCulate1:PAR:DELete:ALL"));
        assert!(invalidates_selection("CALC1:PAR:DELETE"));
        assert!(invalidates_selection("DISP:WIND1:TRACE2:DEL"));
        assert!(invalidates_selection("DISP:WIND1:TRAC2:DELete"));
        // Neither a parameter nor a trace node
        assert!(!invalidates_selection("MMEM:DEL"));
        assert!(!invalidates_selection("CALC1:PARX:DEL"));
    }
}
