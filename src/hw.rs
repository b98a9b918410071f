//! Seams to the hardware side of a scan.
//!
//! The board transport, the readout receiver, the command memory of the FPGA
//! and the register model of the chip are owned by other layers. A scan only
//! talks to them through the traits below, bundled into a [`Frontend`].

use crate::{Command, PixelMask, Result};
use std::path::Path;

/// Host side of the USB board.
pub trait Transport: Send {
    fn board_id(&mut self) -> Result<String>;

    fn firmware_loaded(&mut self) -> Result<bool>;

    fn load_firmware(&mut self, image: &Path) -> Result<()>;

    /// Releases host side resources. Calling it twice is fine.
    fn dispose(&mut self) -> Result<()>;
}

pub trait Readout: Send {
    fn reset_receiver(&mut self) -> Result<()>;

    /// One entry per input channel, `true` when the receiver is aligned.
    fn channel_sync_status(&mut self) -> Result<Vec<bool>>;

    /// Logs the receiver state.
    fn print_status(&mut self) -> Result<()>;
}

/// Command memory and sequencer of the FPGA.
pub trait CommandSink: Send {
    fn concatenate(&self, parts: &[Command], byte_padding: bool) -> Command {
        Command::concat(parts, byte_padding)
    }

    /// Number of times one `start` executes the queued command.
    fn set_repeat_count(&mut self, n: u32) -> Result<()>;

    /// Writes `command` to the start of command memory. Without `set_length`
    /// the previously programmed length is kept, so a shorter command only
    /// overwrites the head of the buffer.
    fn set_command(&mut self, command: &Command, set_length: bool) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Blocks until the FPGA has shifted out the queued command(s).
    fn wait_until_idle(&mut self) -> Result<()>;

    /// Sends `parts` once and waits for completion, resetting the repeat
    /// count to 1. With `concatenate` the parts go out as one byte padded
    /// buffer, otherwise one after another.
    fn send(&mut self, parts: &[Command], concatenate: bool) -> Result<()> {
        self.set_repeat_count(1)?;
        if concatenate {
            let joined = self.concatenate(parts, true);
            self.set_command(&joined, true)?;
            self.start()?;
            self.wait_until_idle()?;
        } else {
            for part in parts {
                self.set_command(part, true)?;
                self.start()?;
                self.wait_until_idle()?;
            }
        }
        Ok(())
    }
}

/// Symbolic commands the register model knows how to render.
///
/// An empty name list in the write variants means every register of that kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    ConfMode,
    RunMode,
    /// Idle bits, sized for the given number of mask steps.
    Zeros { mask_steps: u32 },
    GlobalReset,
    Calibrate,
    Trigger,
    WriteRegister { names: Vec<String> },
    WriteFrontend {
        names: Vec<String>,
        same_mask_for_all_dc: bool,
    },
}

impl CommandKind {
    pub fn write_register<S: AsRef<str>>(names: &[S]) -> Self {
        Self::WriteRegister {
            names: names.iter().map(|n| n.as_ref().to_owned()).collect(),
        }
    }

    pub fn write_frontend<S: AsRef<str>>(names: &[S], same_mask_for_all_dc: bool) -> Self {
        Self::WriteFrontend {
            names: names.iter().map(|n| n.as_ref().to_owned()).collect(),
            same_mask_for_all_dc,
        }
    }
}

/// Value written into a pixel register.
#[derive(Debug, Clone, Copy)]
pub enum PixelValue<'a> {
    Fill(u8),
    Mask(&'a PixelMask),
}

/// Configuration state of the chip.
pub trait RegisterModel: Send {
    fn create_restore_point(&mut self, name: &str) -> Result<()>;

    /// Reapplies and drops the named restore point.
    fn restore(&mut self, name: &str) -> Result<()>;

    fn set_global_register(&mut self, name: &str, value: u32) -> Result<()>;

    fn set_pixel_register(&mut self, name: &str, value: PixelValue<'_>) -> Result<()>;

    fn render(&self, kind: &CommandKind) -> Result<Vec<Command>>;

    /// Renders a kind that yields exactly one command.
    fn render_one(&self, kind: &CommandKind) -> Result<Command> {
        self.render(kind)?
            .into_iter()
            .next()
            .ok_or_else(|| crate::ScanError::Register(format!("{kind:?} rendered no command")))
    }
}

/// Everything a scan needs from one connected device.
pub struct Frontend {
    pub transport: Box<dyn Transport>,
    pub readout: Box<dyn Readout>,
    pub commands: Box<dyn CommandSink>,
    pub register: Box<dyn RegisterModel>,
}

/// Finds and opens a device. Fails with [`crate::ScanError::NoDevice`] when
/// nothing is attached.
pub trait Connector {
    fn connect(&self) -> Result<Frontend>;
}

pub fn global_reset(commands: &mut dyn CommandSink, register: &dyn RegisterModel) -> Result<()> {
    let parts = [
        register.render_one(&CommandKind::ConfMode)?,
        register.render_one(&CommandKind::GlobalReset)?,
        register.render_one(&CommandKind::RunMode)?,
    ];
    commands.send(&parts, true)
}

pub fn configure_global(
    commands: &mut dyn CommandSink,
    register: &dyn RegisterModel,
) -> Result<()> {
    let mut parts = vec![register.render_one(&CommandKind::ConfMode)?];
    parts.extend(register.render(&CommandKind::WriteRegister { names: vec![] })?);
    parts.push(register.render_one(&CommandKind::RunMode)?);
    commands.send(&parts, true)
}

pub fn configure_pixel(
    commands: &mut dyn CommandSink,
    register: &dyn RegisterModel,
) -> Result<()> {
    let mut parts = vec![register.render_one(&CommandKind::ConfMode)?];
    parts.extend(register.render(&CommandKind::WriteFrontend {
        names: vec![],
        same_mask_for_all_dc: false,
    })?);
    parts.push(register.render_one(&CommandKind::RunMode)?);
    commands.send(&parts, true)
}

pub fn configure_all(commands: &mut dyn CommandSink, register: &dyn RegisterModel) -> Result<()> {
    configure_global(commands, register)?;
    configure_pixel(commands, register)
}
