use crate::{
    configure_global, make_pixel_mask, CancelToken, Command, CommandKind, CommandSink,
    PixelValue, RegisterModel, RestoreGuard, Result, ScanError, COLUMNS, DOUBLE_COLUMNS, ROWS,
};
use log::{debug, info};
use ndarray::Array2;
use std::collections::BTreeSet;

const INJECTION_MASK: &str = "EnableDigInj";
const INJECTION_SELECT: &str = "DIGHITIN_SEL";
const COLUMN_ADDRESS: &str = "Colpr_Addr";

/// How one trigger of the scan command is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    /// The FPGA repeats the queued command; one start per double column.
    Hardware(u32),
    /// The host issues one start per repetition.
    Software(u32),
}

/// What to shift and where during a scan loop.
#[derive(Debug, Clone)]
pub struct MaskPlan {
    pub mask_steps: u32,
    /// Steps to run, in order. Empty means all of `0..mask_steps`.
    pub enabled_mask_steps: Vec<u32>,
    /// Double columns to run, in order. Empty means all of `0..40`.
    pub enabled_columns: Vec<u32>,
    pub same_mask_for_all_columns: bool,
    pub shift_masks: Vec<String>,
    pub digital_injection: bool,
    pub enable_c_high: Option<bool>,
    pub enable_c_low: Option<bool>,
    pub hardware_repeat: bool,
    pub repeat_count: u32,
    /// Write the restored pixel masks back to the chip at the end.
    pub restore_shift_masks: bool,
    /// Pixels that are never enabled, indexed `[column, row]`.
    pub excluded: Option<Array2<bool>>,
}

impl Default for MaskPlan {
    fn default() -> Self {
        Self {
            mask_steps: 3,
            enabled_mask_steps: Vec::new(),
            enabled_columns: Vec::new(),
            same_mask_for_all_columns: false,
            shift_masks: vec!["Enable".into(), "C_High".into(), "C_Low".into()],
            digital_injection: false,
            enable_c_high: None,
            enable_c_low: None,
            hardware_repeat: true,
            repeat_count: 100,
            restore_shift_masks: true,
            excluded: None,
        }
    }
}

impl MaskPlan {
    pub fn repeat_mode(&self) -> RepeatMode {
        if self.hardware_repeat {
            RepeatMode::Hardware(self.repeat_count)
        } else {
            RepeatMode::Software(self.repeat_count)
        }
    }

    pub fn mask_steps_to_run(&self) -> Vec<u32> {
        if self.enabled_mask_steps.is_empty() {
            (0..self.mask_steps).collect()
        } else {
            self.enabled_mask_steps.clone()
        }
    }

    pub fn columns_to_run(&self) -> Vec<u32> {
        if self.enabled_columns.is_empty() {
            (0..DOUBLE_COLUMNS).collect()
        } else {
            self.enabled_columns.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mask_steps == 0 {
            return Err(ScanError::InvalidPlan("mask_steps must be at least 1".into()));
        }
        if self.repeat_count == 0 {
            return Err(ScanError::InvalidPlan("repeat_count must be at least 1".into()));
        }
        if let Some(step) = self.enabled_mask_steps.iter().find(|&&s| s >= self.mask_steps) {
            return Err(ScanError::InvalidPlan(format!(
                "mask step {step} out of range 0..{}",
                self.mask_steps
            )));
        }
        if let Some(dc) = self.enabled_columns.iter().find(|&&dc| dc >= DOUBLE_COLUMNS) {
            return Err(ScanError::InvalidPlan(format!(
                "double column {dc} out of range 0..{DOUBLE_COLUMNS}"
            )));
        }
        if let Some(step) = first_repeat(&self.enabled_mask_steps) {
            return Err(ScanError::InvalidPlan(format!("mask step {step} listed twice")));
        }
        if let Some(dc) = first_repeat(&self.enabled_columns) {
            return Err(ScanError::InvalidPlan(format!("double column {dc} listed twice")));
        }
        if let Some(excluded) = &self.excluded {
            if excluded.dim() != (COLUMNS, ROWS) {
                return Err(ScanError::InvalidPlan(format!(
                    "excluded mask is {:?}, expected {:?}",
                    excluded.dim(),
                    (COLUMNS, ROWS)
                )));
            }
        }
        Ok(())
    }
}

fn first_repeat(values: &[u32]) -> Option<u32> {
    let mut seen = BTreeSet::new();
    values.iter().copied().find(|v| !seen.insert(*v))
}

/// Called after the scan command was triggered for a double column, with the
/// mask step and the double column.
pub type EndOfColumn<'f> = &'f mut dyn FnMut(u32, u32);

/// Shifts pixel masks across the matrix and runs a command on every enabled
/// double column of every enabled mask step.
pub struct MaskStepSequencer<'a> {
    commands: &'a mut dyn CommandSink,
    register: &'a mut dyn RegisterModel,
    restore_point: String,
    cancel: Option<CancelToken>,
}

impl<'a> MaskStepSequencer<'a> {
    /// `scan_identifier` namespaces the loop's restore point.
    pub fn new(
        commands: &'a mut dyn CommandSink,
        register: &'a mut dyn RegisterModel,
        scan_identifier: &str,
    ) -> Self {
        Self {
            commands,
            register,
            restore_point: format!("{scan_identifier}_scan_loop"),
            cancel: None,
        }
    }

    /// Leaves the loop early at the next mask step or double column once
    /// `token` is set.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Runs `command` over the mask plan.
    ///
    /// Pixel and global registers touched here are reverted when the call
    /// returns, also on error.
    pub fn run(
        &mut self,
        command: &Command,
        plan: &MaskPlan,
        use_delay: bool,
        mut end_of_column: Option<EndOfColumn<'_>>,
    ) -> Result<()> {
        if command.is_empty() {
            return Err(ScanError::MalformedCommand("scan command has no bits".into()));
        }
        plan.validate()?;

        let cancel = self.cancel.clone();
        let cancelled = || cancel.as_ref().is_some_and(CancelToken::is_set);
        let mut register = RestoreGuard::create(&mut *self.register, self.restore_point.clone())?;

        let conf_mode = register.render_one(&CommandKind::ConfMode)?;
        let run_mode = register.render_one(&CommandKind::RunMode)?;
        let delay = register.render_one(&CommandKind::Zeros {
            mask_steps: plan.mask_steps,
        })?;
        let scan_command = if use_delay {
            command.clone() + &delay
        } else {
            command.clone()
        };

        let mask_steps = plan.mask_steps_to_run();
        let columns = plan.columns_to_run();
        let same_mask = plan.same_mask_for_all_columns;

        // Global setup.
        let mut setup = vec![conf_mode.clone()];
        if plan.digital_injection {
            register.set_global_register(INJECTION_SELECT, 1)?;
        } else {
            register.set_global_register(INJECTION_SELECT, 0)?;
            register.set_pixel_register(INJECTION_MASK, PixelValue::Fill(0))?;
        }
        setup.extend(register.render(&CommandKind::write_register(&[INJECTION_SELECT]))?);
        for (name, enable) in [("C_High", plan.enable_c_high), ("C_Low", plan.enable_c_low)] {
            if let Some(enable) = enable {
                register.set_pixel_register(name, PixelValue::Fill(u8::from(enable)))?;
                setup.extend(register.render(&CommandKind::write_frontend(&[name], true))?);
            }
        }
        self.commands.send(&setup, true)?;

        let repeat = plan.repeat_mode();
        let step_range = match (mask_steps.first(), mask_steps.last()) {
            (Some(first), Some(last)) if mask_steps.len() > 1 => format!("[{first} - {last}]"),
            (Some(first), _) => format!("[{first}]"),
            _ => String::new(),
        };

        'steps: for &mask_step in &mask_steps {
            if cancelled() {
                info!("Scan loop stopped before mask step {mask_step}");
                break;
            }

            let mask = make_pixel_mask(plan.mask_steps, mask_step, plan.excluded.as_ref());
            let mut writes = vec![conf_mode.clone()];
            for name in &plan.shift_masks {
                if !name.eq_ignore_ascii_case(INJECTION_MASK) {
                    register.set_pixel_register(name, PixelValue::Mask(&mask))?;
                }
            }
            writes.extend(register.render(&CommandKind::write_frontend(&plan.shift_masks, same_mask))?);
            if plan.digital_injection {
                // Injection mask goes last, then re-select digital injection.
                register.set_pixel_register(INJECTION_MASK, PixelValue::Mask(&mask))?;
                writes.extend(register.render(&CommandKind::write_frontend(&[INJECTION_MASK], same_mask))?);
                register.set_global_register(INJECTION_SELECT, 1)?;
                writes.extend(register.render(&CommandKind::write_register(&[INJECTION_SELECT]))?);
            }
            self.commands.send(&writes, true)?;
            info!("{} injection(s): mask step {mask_step} {step_range}", plan.repeat_count);

            if let RepeatMode::Hardware(n) = repeat {
                self.commands.set_repeat_count(n)?;
            }

            // Command memory holds [column address | scan command]; inside the
            // loop only the address part is rewritten.
            let first = column_address(&*self.commands, &mut *register, &conf_mode, &run_mode, columns[0])?;
            let full = self.commands.concatenate(&[first, scan_command.clone()], false);
            self.commands.set_command(&full, true)?;

            for (index, &dc) in columns.iter().enumerate() {
                if index != 0 {
                    // Build the next address while the board is still busy.
                    let address = column_address(&*self.commands, &mut *register, &conf_mode, &run_mode, dc)?;
                    self.commands.wait_until_idle()?;
                    self.commands.set_command(&address, false)?;
                }

                match repeat {
                    RepeatMode::Hardware(_) => self.commands.start()?,
                    RepeatMode::Software(n) => {
                        for _ in 0..n {
                            self.commands.start()?;
                        }
                    }
                }

                if let Some(callback) = end_of_column.as_deref_mut() {
                    callback(mask_step, dc);
                }

                if cancelled() {
                    debug!("Scan loop stopped at mask step {mask_step}, double column {dc}");
                    self.commands.wait_until_idle()?;
                    break 'steps;
                }
            }

            self.commands.wait_until_idle()?;
        }

        register.restore()?;
        configure_global(&mut *self.commands, &*self.register)?;
        if plan.restore_shift_masks {
            let mut writes = vec![conf_mode];
            writes.extend(self.register.render(&CommandKind::write_frontend(&plan.shift_masks, false))?);
            writes.extend(self.register.render(&CommandKind::write_frontend(&[INJECTION_MASK], false))?);
            writes.push(run_mode);
            self.commands.send(&writes, true)?;
        }
        Ok(())
    }
}

/// Selects double column `dc`, byte padded so it can be swapped in place.
fn column_address(
    commands: &dyn CommandSink,
    register: &mut dyn RegisterModel,
    conf_mode: &Command,
    run_mode: &Command,
    dc: u32,
) -> Result<Command> {
    register.set_global_register(COLUMN_ADDRESS, dc)?;
    let write = register.render_one(&CommandKind::write_register(&[COLUMN_ADDRESS]))?;
    Ok(commands.concatenate(&[conf_mode.clone(), write, run_mode.clone()], true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBoard, SimOp, SimRegister};

    fn scan_command() -> Command {
        Command::parse("1011_0100_0100").unwrap() + &Command::zeros(40) + &Command::parse("11101").unwrap()
    }

    fn count(ops: &[SimOp], f: impl Fn(&SimOp) -> bool) -> usize {
        ops.iter().filter(|op| f(op)).count()
    }

    #[test]
    fn hardware_repeat_starts_once_per_column() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            mask_steps: 3,
            enabled_columns: vec![0, 1, 2],
            hardware_repeat: true,
            repeat_count: 100,
            ..MaskPlan::default()
        };
        MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&scan_command(), &plan, false, None)
            .unwrap();

        let ops = board.ops();
        assert_eq!(count(&ops, |op| *op == SimOp::Start { repeat: 100 }), 9);
        assert_eq!(count(&ops, |op| *op == SimOp::SetRepeat(100)), 3);
        let overwrites = count(&ops, |op| matches!(op, SimOp::SetCommand { set_length: false, .. }));
        assert_eq!(overwrites, 6);
    }

    #[test]
    fn address_is_rewritten_only_after_the_board_is_idle() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            mask_steps: 2,
            enabled_columns: vec![5, 6, 7, 8],
            repeat_count: 10,
            ..MaskPlan::default()
        };
        MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&scan_command(), &plan, true, None)
            .unwrap();

        let ops = board.ops();
        for (i, op) in ops.iter().enumerate() {
            if matches!(op, SimOp::SetCommand { set_length: false, .. }) {
                assert_eq!(ops[i - 1], SimOp::WaitIdle, "overwrite at {i} not preceded by wait");
            }
        }
    }

    #[test]
    fn overwritten_buffer_keeps_the_scan_command_tail() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            mask_steps: 1,
            enabled_columns: vec![0, 39],
            ..MaskPlan::default()
        };
        let command = scan_command();
        let mut tails = Vec::new();
        let mut probe = board.clone();
        let mut record = |_: u32, _: u32| {
            let queued = probe.queued_command();
            tails.push(queued.bits()[queued.len() - command.len()..].to_vec());
            let _ = probe.wait_until_idle();
        };
        MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&command, &plan, false, Some(&mut record))
            .unwrap();

        assert_eq!(tails.len(), 2);
        assert!(tails.iter().all(|t| t.as_slice() == command.bits()));
    }

    #[test]
    fn visits_steps_and_columns_in_the_given_order() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            mask_steps: 6,
            enabled_mask_steps: vec![4, 1, 3],
            enabled_columns: vec![9, 2],
            ..MaskPlan::default()
        };
        let mut seen = Vec::new();
        let mut record = |step: u32, dc: u32| seen.push((step, dc));
        MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&scan_command(), &plan, false, Some(&mut record))
            .unwrap();
        assert_eq!(seen, vec![(4, 9), (4, 2), (1, 9), (1, 2), (3, 9), (3, 2)]);
    }

    #[test]
    fn empty_selection_means_everything() {
        let plan = MaskPlan {
            mask_steps: 4,
            ..MaskPlan::default()
        };
        assert_eq!(plan.mask_steps_to_run(), vec![0, 1, 2, 3]);
        assert_eq!(plan.columns_to_run().len(), 40);
    }

    #[test]
    fn software_repeat_issues_one_start_per_repetition() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            mask_steps: 1,
            enabled_columns: vec![0, 1],
            hardware_repeat: false,
            repeat_count: 5,
            ..MaskPlan::default()
        };
        MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&scan_command(), &plan, false, None)
            .unwrap();
        let ops = board.ops();
        assert_eq!(count(&ops, |op| matches!(op, SimOp::SetRepeat(n) if *n != 1)), 0);
        // two setup sends + two restore sends start once each
        let starts = count(&ops, |op| matches!(op, SimOp::Start { .. }));
        assert_eq!(starts, 10 + 4);
    }

    #[test]
    fn registers_are_restored_after_the_loop() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            mask_steps: 3,
            enabled_columns: vec![3],
            digital_injection: true,
            enable_c_high: Some(true),
            ..MaskPlan::default()
        };
        MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&scan_command(), &plan, false, None)
            .unwrap();
        assert_eq!(register.global("Colpr_Addr"), Some(0));
        assert_eq!(register.global("DIGHITIN_SEL"), Some(0));
        assert_eq!(register.pixel("Enable").unwrap().sum(), 0);
        assert_eq!(register.pixel("C_High").unwrap().sum(), 0);
        assert!(register.restore_points().is_empty());
    }

    #[test]
    fn device_failure_still_restores_registers() {
        let mut board = SimBoard::new().failing_after(3);
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            mask_steps: 2,
            digital_injection: true,
            ..MaskPlan::default()
        };
        let err = MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&scan_command(), &plan, false, None)
            .unwrap_err();
        assert!(matches!(err, ScanError::Device(_)));
        assert_eq!(register.global("DIGHITIN_SEL"), Some(0));
        assert!(register.restore_points().is_empty());
    }

    #[test]
    fn empty_command_fails_before_any_io() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let err = MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&Command::new(), &MaskPlan::default(), false, None)
            .unwrap_err();
        assert!(matches!(err, ScanError::MalformedCommand(_)));
        assert!(board.ops().is_empty());
        assert!(register.restore_points().is_empty());
    }

    #[test]
    fn out_of_range_column_is_rejected() {
        let plan = MaskPlan {
            enabled_columns: vec![0, 40],
            ..MaskPlan::default()
        };
        assert!(matches!(plan.validate(), Err(ScanError::InvalidPlan(_))));
    }

    #[test]
    fn repeated_step_or_column_is_rejected_before_any_io() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let plan = MaskPlan {
            enabled_mask_steps: vec![1, 1],
            enabled_columns: vec![0],
            ..MaskPlan::default()
        };
        let mut seen = Vec::new();
        let mut record = |step: u32, dc: u32| seen.push((step, dc));
        let err = MaskStepSequencer::new(&mut board, &mut register, "digital")
            .run(&scan_command(), &plan, false, Some(&mut record))
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidPlan(_)));
        assert!(seen.is_empty());
        assert!(board.ops().is_empty());

        let plan = MaskPlan {
            enabled_columns: vec![3, 7, 3],
            ..MaskPlan::default()
        };
        assert!(matches!(plan.validate(), Err(ScanError::InvalidPlan(_))));
    }

    #[test]
    fn excluded_mask_must_cover_the_matrix() {
        let plan = MaskPlan {
            excluded: Some(Array2::from_elem((ROWS, COLUMNS), false)),
            ..MaskPlan::default()
        };
        assert!(matches!(plan.validate(), Err(ScanError::InvalidPlan(_))));

        let plan = MaskPlan {
            excluded: Some(Array2::from_elem((COLUMNS, ROWS), false)),
            ..MaskPlan::default()
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn cancellation_stops_at_the_next_column() {
        let mut board = SimBoard::new();
        let mut register = SimRegister::new();
        let token = CancelToken::new();
        token.clear();
        let plan = MaskPlan {
            mask_steps: 3,
            enabled_columns: vec![0, 1, 2, 3],
            ..MaskPlan::default()
        };
        let mut visited = 0;
        let stopper = token.clone();
        let mut record = |_: u32, _: u32| {
            visited += 1;
            if visited == 2 {
                stopper.set();
            }
        };
        MaskStepSequencer::new(&mut board, &mut register, "digital")
            .with_cancel(token)
            .run(&scan_command(), &plan, false, Some(&mut record))
            .unwrap();
        assert_eq!(visited, 2);
        assert!(register.restore_points().is_empty());
    }
}
