use std::time::{Duration, Instant};

use vna_link::{
    Command, OperationKind, ReplyShape, Session, SessionConfig, SessionState, Severity,
    SimulatedInstrument, TranscriptEntry, ValueType, VnaError,
};

fn config(timeout_ms: u64) -> SessionConfig {
    SessionConfig {
        timeout: Duration::from_millis(timeout_ms),
        ..SessionConfig::default()
    }
}

fn open(sim: &SimulatedInstrument) -> Session<SimulatedInstrument> {
    Session::with_transport(sim.clone(), config(500)).unwrap()
}

#[test]
fn undefined_header_yields_exactly_one_fault() {
    let sim = SimulatedInstrument::new();
    let mut session = open(&sim);
    sim.push_error(-113, "undefined header");

    let err = session.write("SENS1:AVER:STAT ON").unwrap_err();
    match err {
        VnaError::InstrumentFault { command, faults } => {
            assert_eq!(command, "SENS1:AVER:STAT ON");
            assert_eq!(faults.len(), 1);
            assert_eq!(faults[0].code, -113);
            assert_eq!(faults[0].message, "undefined header");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(sim.pending_errors(), 0);
}

#[test]
fn faults_stay_with_the_command_that_raised_them() {
    let sim = SimulatedInstrument::new();
    // Left over from before the session opened; cleared by *CLS
    sim.push_error(-410, "Query INTERRUPTED");
    let mut session = open(&sim);

    session.write("SENS1:FREQ:STAR 1E9").unwrap();

    sim.fail_on("SENS1:FREQ:STOP", -222, "Data out of range");
    let err = session.write("SENS1:FREQ:STOP 1E15").unwrap_err();
    assert!(matches!(
        &err,
        VnaError::InstrumentFault { command, .. } if command == "SENS1:FREQ:STOP 1E15"
    ));

    // The next command starts from an empty queue
    assert!(session.write("SENS1:SWE:POIN 201").unwrap().is_empty());
}

#[test]
fn status_events_are_warnings() {
    let sim = SimulatedInstrument::new();
    let mut session = Session::with_transport(
        sim.clone(),
        SessionConfig {
            warning_codes: vec![201],
            ..config(500)
        },
    )
    .unwrap();

    sim.fail_on("SYST:BEEP", -800, "Operation complete");
    let warnings = session.write("SYST:BEEP").unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].severity, Severity::Warning);

    sim.fail_on("SENS1:CORR:STAT", 201, "Calibration stale");
    let warnings = session.write("SENS1:CORR:STAT ON").unwrap();
    assert_eq!(warnings[0].code, 201);
}

#[test]
fn silent_instrument_times_out_no_earlier_than_the_deadline() {
    let sim = SimulatedInstrument::new();
    let mut session = Session::with_transport(sim.clone(), config(150)).unwrap();
    sim.set_silent(true);

    let started = Instant::now();
    let err = session.query_raw("*IDN?").unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(matches!(err, VnaError::Timeout(_)));
    assert!(session.is_faulted());

    assert!(matches!(
        session.write("*CLS"),
        Err(VnaError::SessionFaulted)
    ));
}

#[test]
fn completion_wait_honours_the_command_timeout_and_faults() {
    let sim = SimulatedInstrument::new();
    let mut session = Session::with_transport(sim.clone(), config(2000)).unwrap();
    sim.set_silent(true);

    let sweep = Command::action("INIT1:IMM")
        .long_running()
        .timeout(Duration::from_millis(150))
        .build();
    let started = Instant::now();
    let err = session.execute(&sweep).unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(2000), "session timeout used: {elapsed:?}");
    assert!(matches!(err, VnaError::Timeout(d) if d == Duration::from_millis(150)));
    assert!(session.is_faulted());
    assert_eq!(session.state(), SessionState::Faulted);

    let history = sim.history();
    assert_eq!(&history[history.len() - 2..], &["INIT1:IMM".to_string(), "*OPC?".to_string()]);
}

#[test]
fn execute_times_out_no_earlier_than_the_deadline() {
    let sim = SimulatedInstrument::new();
    let mut session = Session::with_transport(sim.clone(), config(150)).unwrap();
    sim.set_silent(true);

    let started = Instant::now();
    let err = session
        .execute(&Command::action("SENS1:SWE:POIN").int(201).build())
        .unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(matches!(err, VnaError::Timeout(_)));
    assert!(session.is_faulted());
}

#[test]
fn never_empty_queue_desyncs_after_max_polls() {
    let sim = SimulatedInstrument::new();
    let mut session = Session::with_transport(
        sim.clone(),
        SessionConfig {
            max_error_polls: 5,
            ..config(500)
        },
    )
    .unwrap();
    sim.set_stuck_error(-221, "Settings conflict");

    let before = sim.error_polls();
    let err = session.write("SENS1:BAND 1E3").unwrap_err();
    assert!(matches!(err, VnaError::ProtocolDesync(_)));
    assert_eq!(sim.error_polls() - before, 5);
    assert!(session.is_faulted());
}

#[test]
fn overlong_reply_line_desyncs_before_the_deadline() {
    let sim = SimulatedInstrument::new();
    sim.set_reply("CALC1:PAR:CAT?", &"X".repeat(500));
    let mut session = Session::with_transport(
        sim.clone(),
        SessionConfig {
            max_block_size: 64,
            ..config(5000)
        },
    )
    .unwrap();

    let started = Instant::now();
    let err = session.query_raw("CALC1:PAR:CAT?").unwrap_err();
    assert!(matches!(err, VnaError::ProtocolDesync(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(session.is_faulted());
}

#[test]
fn malformed_reply_leaves_session_usable() {
    let sim = SimulatedInstrument::new();
    sim.set_reply("SENS1:FREQ:STAR?", "not-a-number");
    sim.set_reply("SENS1:FREQ:STOP?", "+9.00000000000E+009");
    let mut session = open(&sim);

    let start = Command::query("SENS1:FREQ:STAR?", ReplyShape::Scalar(ValueType::Float)).build();
    assert!(matches!(
        session.query(&start),
        Err(VnaError::MalformedReply { .. })
    ));
    assert!(!session.is_faulted());

    let stop = Command::query("SENS1:FREQ:STOP?", ReplyShape::Scalar(ValueType::Float)).build();
    assert_eq!(session.query(&stop).unwrap().as_f64().unwrap(), 9e9);
}

#[test]
fn group_shares_one_barrier_and_one_error_check() {
    let sim = SimulatedInstrument::new();
    let mut session = open(&sim);
    let polls = sim.error_polls();

    session
        .execute_group(&[
            Command::action("SENS1:SWE:MODE").token("HOLD").build(),
            Command::action("SENS1:FREQ:STAR").float(1e9).build(),
            Command::action("INIT1:IMM").long_running().build(),
        ])
        .unwrap();

    let history = sim.history();
    let tail: Vec<&str> = history[history.len() - 5..].iter().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec!["SENS1:SWE:MODE HOLD", "SENS1:FREQ:STAR 1E9", "INIT1:IMM", "*OPC?", "SYST:ERR?"]
    );
    assert_eq!(sim.error_polls() - polls, 1);
}

#[test]
fn group_with_query_is_rejected_before_sending() {
    let sim = SimulatedInstrument::new();
    let mut session = open(&sim);
    let sent = sim.history().len();

    let err = session
        .execute_group(&[
            Command::action("*RST").build(),
            Command::query("*IDN?", ReplyShape::Raw).build(),
        ])
        .unwrap_err();
    assert!(matches!(err, VnaError::InvalidCommand(_)));
    assert_eq!(sim.history().len(), sent);
}

#[test]
fn delimiter_in_argument_is_rejected_locally() {
    let sim = SimulatedInstrument::new();
    let mut session = open(&sim);
    let sent = sim.history().len();

    let command = Command::action("DISP:WIND1:TITL:DATA").string("two\nlines").build();
    assert!(matches!(
        session.execute(&command),
        Err(VnaError::InvalidCommand(_))
    ));
    assert_eq!(sim.history().len(), sent);
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn mirror_dropped_on_reset_and_on_fault() {
    let sim = SimulatedInstrument::new();
    let mut session = open(&sim);

    session.select_measurement(1, "CH1_S11").unwrap();
    session.write("*RST").unwrap();
    assert!(session.mirror().is_empty());

    session.select_measurement(1, "CH1_S11").unwrap();
    sim.fail_on("CALC1:MARK1:X", -222, "Data out of range");
    assert!(session.write("CALC1:MARK1:X 1E15").is_err());
    assert!(session.mirror().is_empty());
}

#[test]
fn raw_selection_write_is_not_trusted_by_the_mirror() {
    let sim = SimulatedInstrument::new();
    sim.set_block_reply("CALC1:DATA?", [1.0f64, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect());
    sim.set_block_reply("CALC1:X?", [1e9f64, 2e9].iter().flat_map(|v| v.to_le_bytes()).collect());
    let mut session = open(&sim);

    session.select_measurement(1, "CH1_A").unwrap();
    session.write("CALC1:PAR:SEL \"CH1_B\"").unwrap();
    assert!(session.mirror().is_empty());

    session.fetch_trace(1, "CH1_A").unwrap();
    let history = sim.history();
    let fetch = history.iter().position(|l| l.starts_with("CALC1:DATA?")).unwrap();
    let last_select = history[..fetch]
        .iter()
        .rev()
        .find(|l| l.starts_with("CALC1:PAR:SEL"))
        .unwrap();
    assert_eq!(last_select, "CALC1:PAR:SEL \"CH1_A\"");
}

#[test]
fn hang_up_faults_the_session() {
    let sim = SimulatedInstrument::new();
    let mut session = open(&sim);
    sim.hang_up();

    assert!(matches!(session.write("*CLS"), Err(VnaError::Io { .. })));
    assert!(session.is_faulted());
}

#[test]
fn transcript_records_each_operation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    let sim = SimulatedInstrument::new();
    let mut session = open(&sim);
    session.enable_transcript(&path);

    session.query_raw("*IDN?").unwrap();
    sim.fail_on("SENS1:BOGUS", -113, "Undefined header");
    let _ = session.write("SENS1:BOGUS");
    session.disconnect().unwrap();

    let entries: Vec<TranscriptEntry> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, OperationKind::Query);
    assert_eq!(entries[0].outcome, "ok");
    assert!(entries[1].outcome.contains("-113"));
    assert!(entries[1].sequence > entries[0].sequence);
}
