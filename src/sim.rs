//! Software stand-in for a board and its chip.
//!
//! `SimFrontend` behaves like a connected device closely enough to dry-run a
//! scan: command memory with a programmable length, a busy window after each
//! start, per-channel sync flags, and a register model with restore points.
//! Every host call is appended to a shared [`SimOp`] log.

use crate::{
    Command, CommandKind, CommandSink, Connector, Frontend, PixelMask, PixelValue, Readout,
    RegisterModel, Result, ScanError, Transport, COLUMNS, ROWS,
};
use log::info;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    LoadFirmware(PathBuf),
    Dispose,
    ResetReceiver,
    SetRepeat(u32),
    SetCommand { len: usize, set_length: bool },
    Start { repeat: u32 },
    WaitIdle,
}

#[derive(Debug)]
struct BoardState {
    ops: Vec<SimOp>,
    memory: Vec<bool>,
    length: usize,
    repeat: u32,
    busy_until: Instant,
    exec_time: Duration,
    sync: Vec<bool>,
    firmware_loaded: bool,
    disposed: bool,
    fail_starts_after: Option<usize>,
}

/// Handle on the simulated board; clones share the same state.
#[derive(Debug, Clone)]
pub struct SimBoard {
    state: Arc<Mutex<BoardState>>,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                ops: Vec::new(),
                memory: Vec::new(),
                length: 0,
                repeat: 1,
                busy_until: Instant::now(),
                exec_time: Duration::ZERO,
                sync: vec![true; 4],
                firmware_loaded: false,
                disposed: false,
                fail_starts_after: None,
            })),
        }
    }

    /// Time one execution of the queued command keeps the board busy.
    pub fn with_exec_time(self, exec_time: Duration) -> Self {
        self.state.lock().exec_time = exec_time;
        self
    }

    pub fn with_sync(self, sync: Vec<bool>) -> Self {
        self.state.lock().sync = sync;
        self
    }

    /// Makes every `start` after the first `n` fail with a device error.
    pub fn failing_after(self, n: usize) -> Self {
        self.state.lock().fail_starts_after = Some(n);
        self
    }

    pub fn ops(&self) -> Vec<SimOp> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// The programmed part of command memory.
    pub fn queued_command(&self) -> Command {
        let state = self.state.lock();
        Command::from_bits(state.memory[..state.length].iter().copied())
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn check_idle(state: &BoardState, what: &str) -> Result<()> {
        if Instant::now() < state.busy_until {
            return Err(ScanError::Device(format!("{what} while command is executing")));
        }
        Ok(())
    }
}

impl Transport for SimBoard {
    fn board_id(&mut self) -> Result<String> {
        Ok("SIM-0".to_owned())
    }

    fn firmware_loaded(&mut self) -> Result<bool> {
        Ok(self.state.lock().firmware_loaded)
    }

    fn load_firmware(&mut self, image: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::LoadFirmware(image.to_owned()));
        state.firmware_loaded = true;
        Ok(())
    }

    fn dispose(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::Dispose);
        state.disposed = true;
        Ok(())
    }
}

impl Readout for SimBoard {
    fn reset_receiver(&mut self) -> Result<()> {
        self.state.lock().ops.push(SimOp::ResetReceiver);
        Ok(())
    }

    fn channel_sync_status(&mut self) -> Result<Vec<bool>> {
        Ok(self.state.lock().sync.clone())
    }

    fn print_status(&mut self) -> Result<()> {
        let sync = self.state.lock().sync.clone();
        for (ch, ok) in sync.iter().enumerate() {
            info!("Channel {ch}: sync {}", if *ok { "ok" } else { "LOST" });
        }
        Ok(())
    }
}

impl CommandSink for SimBoard {
    fn set_repeat_count(&mut self, n: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.ops.push(SimOp::SetRepeat(n));
        state.repeat = n;
        Ok(())
    }

    fn set_command(&mut self, command: &Command, set_length: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_idle(&state, "command memory written")?;
        state.ops.push(SimOp::SetCommand {
            len: command.len(),
            set_length,
        });
        if set_length {
            state.length = command.len();
        } else if command.len() > state.length {
            return Err(ScanError::Device(format!(
                "{} bit overwrite exceeds programmed length {}",
                command.len(),
                state.length
            )));
        }
        if state.memory.len() < command.len() {
            state.memory.resize(command.len(), false);
        }
        state.memory[..command.len()].copy_from_slice(command.bits());
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        let starts = state
            .ops
            .iter()
            .filter(|op| matches!(op, SimOp::Start { .. }))
            .count();
        if state.fail_starts_after.is_some_and(|n| starts >= n) {
            return Err(ScanError::Device("start failed".to_owned()));
        }
        let repeat = state.repeat;
        state.ops.push(SimOp::Start { repeat });
        let now = Instant::now();
        let from = state.busy_until.max(now);
        state.busy_until = from + state.exec_time * repeat;
        Ok(())
    }

    fn wait_until_idle(&mut self) -> Result<()> {
        let busy_until = {
            let mut state = self.state.lock();
            state.ops.push(SimOp::WaitIdle);
            state.busy_until
        };
        let now = Instant::now();
        if busy_until > now {
            thread::sleep(busy_until - now);
        }
        Ok(())
    }
}

const GLOBAL_REGISTERS: &[&str] = &["Colpr_Addr", "Colpr_Mode", "DIGHITIN_SEL", "PlsrDAC", "Vthin_AltFine"];
const PIXEL_REGISTERS: &[&str] = &["Enable", "C_High", "C_Low", "EnableDigInj", "Imon", "TDAC", "FDAC"];

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    globals: BTreeMap<String, u32>,
    pixels: BTreeMap<String, PixelMask>,
}

#[derive(Debug)]
struct RegisterState {
    current: Snapshot,
    restore_points: Vec<(String, Snapshot)>,
}

/// Register model of the simulated chip; clones share the same state.
#[derive(Debug, Clone)]
pub struct SimRegister {
    state: Arc<Mutex<RegisterState>>,
}

impl Default for SimRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRegister {
    pub fn new() -> Self {
        let globals = GLOBAL_REGISTERS.iter().map(|n| (n.to_string(), 0)).collect();
        let pixels = PIXEL_REGISTERS
            .iter()
            .map(|n| (n.to_string(), PixelMask::zeros((COLUMNS, ROWS))))
            .collect();
        Self {
            state: Arc::new(Mutex::new(RegisterState {
                current: Snapshot { globals, pixels },
                restore_points: Vec::new(),
            })),
        }
    }

    pub fn global(&self, name: &str) -> Option<u32> {
        self.state.lock().current.globals.get(name).copied()
    }

    pub fn pixel(&self, name: &str) -> Option<PixelMask> {
        self.state.lock().current.pixels.get(name).cloned()
    }

    pub fn restore_points(&self) -> Vec<String> {
        self.state
            .lock()
            .restore_points
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Register write: 8 bit header, 8 bit address, 16 bit value.
    fn write_command(header: u8, address: usize, value: u32) -> Command {
        Command::from_bits(
            (0..8)
                .rev()
                .map(move |i| header >> i & 1 == 1)
                .chain((0..8).rev().map(move |i| address >> i & 1 == 1))
                .chain((0..16).rev().map(move |i| value >> i & 1 == 1)),
        )
    }
}

fn select<'a>(names: &'a [String], all: &'a [&'a str]) -> Vec<&'a str> {
    if names.is_empty() {
        all.to_vec()
    } else {
        names.iter().map(String::as_str).collect()
    }
}

impl RegisterModel for SimRegister {
    fn create_restore_point(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.restore_points.iter().any(|(n, _)| n == name) {
            return Err(ScanError::Register(format!("restore point {name} already exists")));
        }
        let snapshot = state.current.clone();
        state.restore_points.push((name.to_owned(), snapshot));
        Ok(())
    }

    fn restore(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let idx = state
            .restore_points
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| ScanError::Register(format!("no restore point {name}")))?;
        let (_, snapshot) = state.restore_points.remove(idx);
        state.current = snapshot;
        Ok(())
    }

    fn set_global_register(&mut self, name: &str, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        match state.current.globals.get_mut(name) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => Err(ScanError::Register(format!("unknown global register {name}"))),
        }
    }

    fn set_pixel_register(&mut self, name: &str, value: PixelValue<'_>) -> Result<()> {
        let mut state = self.state.lock();
        let reg = state
            .current
            .pixels
            .get_mut(name)
            .ok_or_else(|| ScanError::Register(format!("unknown pixel register {name}")))?;
        match value {
            PixelValue::Fill(v) => reg.fill(v),
            PixelValue::Mask(mask) => reg.assign(mask),
        }
        Ok(())
    }

    fn render(&self, kind: &CommandKind) -> Result<Vec<Command>> {
        let fixed = |s: &str| Command::parse(s).into_iter().collect::<Vec<_>>();
        let state = self.state.lock();
        let commands = match kind {
            CommandKind::ConfMode => fixed("1011_0100_0111"),
            CommandKind::RunMode => fixed("1011_0100_0011_1000"),
            CommandKind::GlobalReset => fixed("1011_0100_1000"),
            CommandKind::Calibrate => fixed("1011_0100_0100"),
            CommandKind::Trigger => fixed("11101"),
            CommandKind::Zeros { mask_steps } => vec![Command::zeros(100 * *mask_steps as usize)],
            CommandKind::WriteRegister { names } => {
                let mut out = Vec::new();
                for name in select(names, GLOBAL_REGISTERS) {
                    let value = *state.current.globals.get(name).ok_or_else(|| {
                        ScanError::Register(format!("unknown global register {name}"))
                    })?;
                    let address = GLOBAL_REGISTERS.iter().position(|n| *n == name).unwrap_or(0);
                    out.push(Self::write_command(0b1011_0100, address, value));
                }
                out
            }
            CommandKind::WriteFrontend {
                names,
                same_mask_for_all_dc,
            } => {
                let mut out = Vec::new();
                for name in select(names, PIXEL_REGISTERS) {
                    let mask = state.current.pixels.get(name).ok_or_else(|| {
                        ScanError::Register(format!("unknown pixel register {name}"))
                    })?;
                    let address = PIXEL_REGISTERS.iter().position(|n| *n == name).unwrap_or(0);
                    let header = if *same_mask_for_all_dc { 0b1011_1100 } else { 0b1011_1000 };
                    let enabled = mask.iter().filter(|&&v| v != 0).count() as u32;
                    out.push(Self::write_command(header, address, enabled));
                }
                out
            }
        };
        Ok(commands)
    }
}

/// Board and chip pair, ready to be handed to a controller.
#[derive(Debug, Clone, Default)]
pub struct SimFrontend {
    pub board: SimBoard,
    pub register: SimRegister,
}

impl SimFrontend {
    pub fn new(board: SimBoard) -> Self {
        Self {
            board,
            register: SimRegister::new(),
        }
    }

    pub fn frontend(&self) -> Frontend {
        Frontend {
            transport: Box::new(self.board.clone()),
            readout: Box::new(self.board.clone()),
            commands: Box::new(self.board.clone()),
            register: Box::new(self.register.clone()),
        }
    }
}

impl Connector for SimFrontend {
    fn connect(&self) -> Result<Frontend> {
        Ok(self.frontend())
    }
}

/// Connector that never finds a board.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBoard;

impl Connector for NoBoard {
    fn connect(&self) -> Result<Frontend> {
        Err(ScanError::NoDevice(
            "Can't find USB board. Connect or reset USB board!".to_owned(),
        ))
    }
}
