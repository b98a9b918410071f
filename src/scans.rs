use crate::{Command, CommandKind, MaskPlan, Scan, ScanContext, ScanIdentity};
use anyhow::{anyhow, Context};
use log::{debug, info};

#[derive(Debug, Clone)]
pub struct DigitalScanParams {
    pub plan: MaskPlan,
    pub use_delay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitalScanSummary {
    /// (mask step, double column) pairs that were triggered.
    pub columns_done: u64,
    pub repeat_count: u32,
    pub stopped_early: bool,
}

/// Injects a digital hit into every pixel, `repeat_count` times per mask
/// step, by sending calibrate + trigger with digital injection enabled.
#[derive(Debug, Default)]
pub struct DigitalScan {
    last_run: Option<DigitalScanSummary>,
}

impl DigitalScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_run(&self) -> Option<DigitalScanSummary> {
        self.last_run
    }
}

impl Scan for DigitalScan {
    type Params = DigitalScanParams;

    fn scan(&mut self, ctx: &mut ScanContext<'_>, params: DigitalScanParams) -> anyhow::Result<()> {
        let command = ctx.register.render_one(&CommandKind::Calibrate)?
            + &Command::zeros(40)
            + &ctx.register.render_one(&CommandKind::Trigger)?;

        let mut plan = params.plan;
        plan.digital_injection = true;
        let expected = plan.mask_steps_to_run().len() * plan.columns_to_run().len();

        let mut columns_done = 0u64;
        let mut end_of_column = |step: u32, dc: u32| {
            columns_done += 1;
            debug!("mask step {step}, double column {dc} done");
        };
        ctx.sequencer()
            .run(&command, &plan, params.use_delay, Some(&mut end_of_column))
            .context("digital scan loop")?;

        let stopped_early = columns_done < expected as u64;
        if stopped_early {
            info!("Digital scan stopped after {columns_done} of {expected} double column(s)");
        }
        self.last_run = Some(DigitalScanSummary {
            columns_done,
            repeat_count: plan.repeat_count,
            stopped_early,
        });
        Ok(())
    }

    fn analyze(&mut self, identity: &ScanIdentity) -> anyhow::Result<()> {
        let summary = self
            .last_run
            .ok_or_else(|| anyhow!("{} has not run yet", identity.identifier))?;
        let output = identity
            .output_prefix()
            .ok_or_else(|| anyhow!("{} has no run number", identity.identifier))?;
        if summary.stopped_early {
            info!(
                "{}: incomplete, {} double column(s) injected",
                output.display(),
                summary.columns_done
            );
        } else {
            info!(
                "{}: {} injection(s) expected per enabled pixel",
                output.display(),
                summary.repeat_count
            );
        }
        Ok(())
    }
}
