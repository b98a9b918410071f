use anyhow::bail;
use confique::Config;
use fescan::sim::{NoBoard, SimBoard, SimFrontend, SimOp};
use fescan::{
    Conf, DigitalScan, DigitalScanParams, MaskPlan, RunOptions, RunStatus, Scan, ScanContext,
    ScanController, ScanError, ScanIdentity,
};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn conf_in(dir: &Path, extra: &str) -> Conf {
    let path = dir.join("scan.toml");
    fs::write(
        &path,
        format!(
            "[scan]\nidentifier = \"digital_scan\"\ndata_path = {:?}\npoll_interval_ms = 5\n{extra}",
            dir.display().to_string()
        ),
    )
    .unwrap();
    Conf::builder().file(&path).load().unwrap()
}

fn small_plan() -> DigitalScanParams {
    DigitalScanParams {
        plan: MaskPlan {
            enabled_columns: vec![0, 1, 2],
            repeat_count: 10,
            ..MaskPlan::default()
        },
        use_delay: false,
    }
}

fn ledger(dir: &Path) -> String {
    fs::read_to_string(dir.join("digital_scan.cfg")).unwrap()
}

fn background() -> RunOptions {
    RunOptions {
        background: true,
        ..RunOptions::default()
    }
}

/// Spins until asked to stop.
#[derive(Default)]
struct Idle {
    polls: u64,
}

impl Scan for Idle {
    type Params = ();

    fn scan(&mut self, ctx: &mut ScanContext<'_>, _: ()) -> anyhow::Result<()> {
        while !ctx.stop_requested() {
            self.polls += 1;
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn analyze(&mut self, _: &ScanIdentity) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Failing;

impl Scan for Failing {
    type Params = ();

    fn scan(&mut self, _: &mut ScanContext<'_>, _: ()) -> anyhow::Result<()> {
        bail!("readout overflow")
    }

    fn analyze(&mut self, _: &ScanIdentity) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn background_run_completes_and_is_recorded() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::default();
    let mut controller = ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();

    controller.start(background(), small_plan()).unwrap();
    assert_eq!(ledger(dir.path()), "0\n");
    assert_eq!(controller.identity().run_number, Some(0));

    assert!(controller.stop(None).unwrap());
    assert_eq!(ledger(dir.path()), "0 SUCCESS\n");
    assert!(sim.board.is_disposed());
    assert!(!controller.is_running());

    controller.analyze().unwrap();
    let ops = sim.board.ops();
    let starts = ops
        .iter()
        .filter(|op| matches!(op, SimOp::Start { repeat: 10 }))
        .count();
    assert_eq!(starts, 3 * 3);
}

#[test]
fn run_numbers_increase_across_runs() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::default();
    let mut controller = ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();

    for expected in 0..3 {
        controller.start(RunOptions::default(), small_plan()).unwrap();
        assert_eq!(controller.identity().run_number, Some(expected));
        assert!(controller.stop(None).unwrap());
    }
    assert_eq!(ledger(dir.path()), "0 SUCCESS\n1 SUCCESS\n2 SUCCESS\n");
    assert_eq!(controller.store().runs("digital_scan").unwrap().len(), 3);
}

#[test]
fn stop_without_start_is_refused() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let mut controller =
        ScanController::new(&conf, &SimFrontend::default(), DigitalScan::new()).unwrap();

    assert!(matches!(controller.stop(None), Err(ScanError::InvalidState(_))));
    assert!(!dir.path().join("digital_scan.cfg").exists());
}

#[test]
fn second_start_is_refused_while_active() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let mut controller =
        ScanController::new(&conf, &SimFrontend::default(), Idle::default()).unwrap();

    controller.start(background(), ()).unwrap();
    assert!(controller.is_running());
    assert!(matches!(
        controller.start(background(), ()),
        Err(ScanError::AlreadyRunning)
    ));

    controller.cancel_token().set();
    assert!(controller.stop(None).unwrap());
    assert_eq!(ledger(dir.path()), "0 SUCCESS\n");
}

#[test]
fn lost_sync_aborts_start() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::new(SimBoard::new().with_sync(vec![false; 4]));
    let mut controller = ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();

    let options = RunOptions {
        restore_configuration: true,
        ..RunOptions::default()
    };
    assert!(matches!(
        controller.start(options, small_plan()),
        Err(ScanError::NoSync)
    ));
    assert!(sim.board.is_disposed());
    assert!(sim.register.restore_points().is_empty());
    assert_eq!(ledger(dir.path()), "0 ABORTED\n");

    // Nothing is active after a refused start.
    assert!(matches!(controller.stop(None), Err(ScanError::InvalidState(_))));
}

#[test]
fn missing_board_is_reported() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let result = ScanController::new(&conf, &NoBoard, DigitalScan::new());
    assert!(matches!(result, Err(ScanError::NoDevice(_))));
}

#[test]
fn firmware_download_is_skipped_when_loaded() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "[device]\nbit_file = \"chip.bit\"\n");
    let sim = SimFrontend::default();

    ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();
    ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();

    let downloads: Vec<_> = sim
        .board
        .ops()
        .into_iter()
        .filter(|op| matches!(op, SimOp::LoadFirmware(_)))
        .collect();
    assert_eq!(downloads, vec![SimOp::LoadFirmware("chip.bit".into())]);
}

#[test]
fn timeout_forces_stop_and_marks_run_aborted() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::new(SimBoard::new().with_exec_time(Duration::from_millis(5)));
    let mut controller = ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();

    // 3 steps x 40 columns x 100 repeats of 5 ms is far beyond the timeout.
    let params = DigitalScanParams {
        plan: MaskPlan::default(),
        use_delay: false,
    };
    controller.start(background(), params).unwrap();
    assert!(!controller.stop(Some(Duration::from_millis(50))).unwrap());
    assert!(controller.cancel_token().is_set());
    assert_eq!(ledger(dir.path()), "0 ABORTED\n");
    assert!(sim.register.restore_points().is_empty());
}

#[test]
fn restore_configuration_round_trip() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::default();
    let mut controller = ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();

    let options = RunOptions {
        restore_configuration: true,
        ..background()
    };
    controller.start(options, small_plan()).unwrap();
    assert_eq!(sim.register.restore_points(), vec!["digital_scan".to_owned()]);
    assert!(controller.stop(None).unwrap());
    assert!(sim.register.restore_points().is_empty());
    assert_eq!(sim.register.global("DIGHITIN_SEL"), Some(0));
}

#[test]
fn foreground_failure_is_returned_and_recorded() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::default();
    let mut controller = ScanController::new(&conf, &sim, Failing).unwrap();

    let err = controller.start(RunOptions::default(), ()).unwrap_err();
    assert!(matches!(err, ScanError::Scan(_)));
    assert!(err.to_string().contains("readout overflow"));

    assert!(!controller.stop(None).unwrap());
    assert_eq!(ledger(dir.path()), "0 ABORTED\n");
}

#[test]
fn background_failure_marks_run_incomplete() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::default();
    let mut controller = ScanController::new(&conf, &sim, Failing).unwrap();

    controller.start(background(), ()).unwrap();
    assert!(!controller.stop(None).unwrap());
    assert_eq!(ledger(dir.path()), "0 ABORTED\n");
}

#[test]
fn device_failure_during_scan_restores_registers() {
    let dir = TempDir::new().unwrap();
    let conf = conf_in(dir.path(), "");
    let sim = SimFrontend::new(SimBoard::new().failing_after(4));
    let mut controller = ScanController::new(&conf, &sim, DigitalScan::new()).unwrap();

    controller.start(background(), small_plan()).unwrap();
    assert!(!controller.stop(None).unwrap());
    assert!(sim.register.restore_points().is_empty());
    assert_eq!(sim.register.global("Colpr_Addr"), Some(0));
    assert_eq!(ledger(dir.path()), "0 ABORTED\n");
}

#[test]
fn leading_separators_are_trimmed_from_identifier() {
    let dir = TempDir::new().unwrap();
    let mut conf = conf_in(dir.path(), "");
    conf.scan.identifier = "/digital_scan".to_owned();
    let mut controller =
        ScanController::new(&conf, &SimFrontend::default(), DigitalScan::new()).unwrap();

    assert_eq!(controller.identity().identifier, "digital_scan");
    controller.start(RunOptions::default(), small_plan()).unwrap();
    assert!(controller.stop(None).unwrap());
    assert_eq!(
        controller.identity().output_prefix(),
        Some(dir.path().join("digital_scan_0"))
    );
    assert_eq!(
        controller.store().runs("digital_scan").unwrap().get(&0),
        Some(&RunStatus::Success)
    );
}
