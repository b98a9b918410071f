use crate::{MaskPlan, Result, ScanError};
use confique::Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub scan: ScanSettings,
    #[config(nested)]
    pub run: RunSettings,
    #[config(nested)]
    pub device: DeviceSettings,
    #[config(nested)]
    pub mask: MaskSettings,
    #[config(nested)]
    pub logging: LogSettings,
}

impl Conf {
    /// Environment (`FESCAN_*`) over `path` over defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Conf::builder().env().file(path.as_ref()).load()?)
    }

    /// Defaults only, with the environment applied.
    pub fn from_env() -> Result<Self> {
        Ok(Conf::builder().env().load()?)
    }
}

#[derive(Config, Debug, Clone)]
pub struct ScanSettings {
    #[config(default = "base_scan", env = "FESCAN_SCAN_IDENTIFIER")]
    pub identifier: String,
    #[config(default = ".", env = "FESCAN_DATA_PATH")]
    pub data_path: PathBuf,
    /// How often `stop` re-checks the stop flag.
    #[config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Give up waiting for a background scan after this many seconds.
    pub stop_timeout_s: Option<f64>,
}

impl ScanSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_s
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = true)]
    pub configure: bool,
    #[config(default = false)]
    pub restore_configuration: bool,
    #[config(default = true)]
    pub background: bool,
    #[config(default = true)]
    pub global_reset: bool,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    /// FPGA bitstream to download before the first run.
    pub bit_file: Option<PathBuf>,
    #[config(default = false)]
    pub force_download: bool,
}

#[derive(Config, Debug, Clone)]
pub struct MaskSettings {
    #[config(default = 3)]
    pub mask_steps: u32,
    /// `true` or unset for every step, or a list of step indices.
    pub enabled_mask_steps: Option<Selection>,
    /// `true` or unset for every double column, or a list of indices.
    pub enabled_columns: Option<Selection>,
    #[config(default = false)]
    pub same_mask_for_all_columns: bool,
    #[config(default = ["Enable", "C_High", "C_Low"])]
    pub shift_masks: Vec<String>,
    #[config(default = false)]
    pub digital_injection: bool,
    pub enable_c_high: Option<bool>,
    pub enable_c_low: Option<bool>,
    #[config(default = true)]
    pub hardware_repeat: bool,
    #[config(default = 100)]
    pub repeat_count: u32,
    #[config(default = false)]
    pub use_delay: bool,
    #[config(default = true)]
    pub restore_shift_masks: bool,
}

impl TryFrom<&MaskSettings> for MaskPlan {
    type Error = ScanError;

    fn try_from(s: &MaskSettings) -> Result<Self> {
        Ok(MaskPlan {
            mask_steps: s.mask_steps,
            enabled_mask_steps: Selection::indices(&s.enabled_mask_steps, "mask steps")?,
            enabled_columns: Selection::indices(&s.enabled_columns, "columns")?,
            same_mask_for_all_columns: s.same_mask_for_all_columns,
            shift_masks: s.shift_masks.clone(),
            digital_injection: s.digital_injection,
            enable_c_high: s.enable_c_high,
            enable_c_low: s.enable_c_low,
            hardware_repeat: s.hardware_repeat,
            repeat_count: s.repeat_count,
            restore_shift_masks: s.restore_shift_masks,
            excluded: None,
        })
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Selection {
    All(bool),
    List(Vec<u32>),
}

impl Selection {
    /// Index list as the sequencer takes it, where empty means all.
    fn indices(selection: &Option<Selection>, what: &str) -> Result<Vec<u32>> {
        match selection {
            None | Some(Selection::All(true)) => Ok(Vec::new()),
            Some(Selection::List(list)) if !list.is_empty() => Ok(list.clone()),
            Some(_) => Err(ScanError::InvalidPlan(format!("no {what} enabled"))),
        }
    }
}

#[derive(Config, Debug, Clone)]
pub struct LogSettings {
    #[config(default = "info", env = "FESCAN_LOG")]
    pub level: String,
    pub file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.toml");
        fs::write(
            &path,
            r#"
[scan]
identifier = "digital_scan"
stop_timeout_s = 2.5

[run]
background = false

[mask]
mask_steps = 6
enabled_mask_steps = true
enabled_columns = [0, 1, 2]
enable_c_high = true
"#,
        )
        .unwrap();

        let conf = Conf::builder().file(&path).load().unwrap();
        assert_eq!(conf.scan.identifier, "digital_scan");
        assert_eq!(conf.scan.stop_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(conf.scan.poll_interval(), Duration::from_secs(1));
        assert!(!conf.run.background);
        assert!(conf.run.configure);

        assert_eq!(conf.mask.enabled_mask_steps, Some(Selection::All(true)));
        let plan = MaskPlan::try_from(&conf.mask).unwrap();
        assert_eq!(plan.mask_steps, 6);
        assert!(plan.enabled_mask_steps.is_empty());
        assert_eq!(plan.enabled_columns, vec![0, 1, 2]);
        assert_eq!(plan.enable_c_high, Some(true));
        assert_eq!(plan.enable_c_low, None);
        assert_eq!(plan.shift_masks, vec!["Enable", "C_High", "C_Low"]);
        assert_eq!(plan.repeat_count, 100);
    }

    #[test]
    fn empty_selection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.toml");
        fs::write(&path, "[mask]\nenabled_columns = false\n").unwrap();

        let conf = Conf::builder().file(&path).load().unwrap();
        assert!(matches!(
            MaskPlan::try_from(&conf.mask),
            Err(ScanError::InvalidPlan(_))
        ));
    }
}
