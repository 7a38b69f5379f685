use crate::{
    ChannelMask, ConnectionKind, DigitizerError, DigitizerModel, LinkParams, MemoryFullMode,
    ModelConstants, Result, MAX_CHANNELS_PER_GROUP,
};
use confique::Config;
use serde::{Deserialize, Serialize};

/// What a trigger source is allowed to do.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Disabled,
    /// Only drives the trigger output.
    ExtOutOnly,
    /// Only generates the acquisition trigger.
    #[default]
    AcqOnly,
    AcqAndExtOut,
}

impl TriggerMode {
    /// Whether a trigger from this source captures an event.
    pub fn acquires(self) -> bool {
        matches!(self, Self::AcqOnly | Self::AcqAndExtOut)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolarity {
    #[default]
    RisingEdge,
    FallingEdge,
}

/// Voltage standard of the front-panel digital I/O.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum IoLevel {
    #[default]
    Nim,
    Ttl,
}

/// How the run is started once the board is armed.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    #[default]
    SwControlled,
    /// Run starts on the first TRG-IN pulse; triggers count from the second.
    FirstTriggerControlled,
    SInControlled,
    /// VME only.
    LvdsControlled,
}

/// What the device does with a trigger that arrives while its buffer is full.
///
/// Both behaviors are observed on real hardware depending on firmware
/// settings, so neither is assumed: the caller picks one.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferFullPolicy {
    /// Acquisition stalls: new triggers are rejected until the host drains.
    #[default]
    Stall,
    /// The oldest stored event is overwritten by the new one.
    OverwriteOldest,
}

/// Acquisition-wide settings.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GlobalConfig {
    /// Upper bound on events moved per device read.
    pub max_events_per_read: u32,
    /// Samples per channel per event.
    pub record_length: u32,
    /// Share of the record taken after the trigger, in %.
    pub post_trigger_percent: u32,
    pub ext_trigger_mode: TriggerMode,
    pub sw_trigger_mode: TriggerMode,
    pub ch_trigger_mode: TriggerMode,
    pub acquisition_mode: AcquisitionMode,
    pub trigger_polarity: TriggerPolarity,
    pub io_level: IoLevel,
    /// Only trigger while TRG-IN is high.
    pub ext_as_gate: bool,
    pub trigger_overlap_allowed: bool,
    pub memory_full_mode: MemoryFullMode,
    pub buffer_full_policy: BufferFullPolicy,
    /// Sample rate is divided by this power of two. 0 or 1 disables it.
    pub decimation_factor: u16,
    /// The trigger fires when at least `majority_level + 1` requests are
    /// over threshold inside the coincidence window.
    pub majority_level: u32,
    /// In trigger clock units, 4 bits.
    pub majority_window: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_events_per_read: 512,
            record_length: 100,
            post_trigger_percent: 50,
            ext_trigger_mode: TriggerMode::AcqOnly,
            sw_trigger_mode: TriggerMode::AcqOnly,
            ch_trigger_mode: TriggerMode::AcqOnly,
            acquisition_mode: AcquisitionMode::SwControlled,
            trigger_polarity: TriggerPolarity::RisingEdge,
            io_level: IoLevel::Nim,
            ext_as_gate: false,
            trigger_overlap_allowed: false,
            memory_full_mode: MemoryFullMode::OneBufferFree,
            buffer_full_policy: BufferFullPolicy::Stall,
            decimation_factor: 0,
            majority_level: 0,
            majority_window: 0,
        }
    }
}

const MAX_MAJORITY_LEVEL: u32 = 7;
const MAX_MAJORITY_WINDOW: u32 = 0xF;
const MAX_DECIMATION: u16 = 128;
const MAX_DC_OFFSET: u32 = 0xFFFF;

impl GlobalConfig {
    /// Checks every field against the capabilities of `model`.
    pub fn validate(&self, model: &ModelConstants) -> Result<()> {
        if self.max_events_per_read == 0 || self.max_events_per_read > model.max_num_buffers {
            return Err(DigitizerError::config(
                "global.max_events_per_read",
                format!("must be within 1..={}", model.max_num_buffers),
            ));
        }
        if self.record_length == 0 || self.record_length > model.memory_per_channel {
            return Err(DigitizerError::config(
                "global.record_length",
                format!("must be within 1..={}", model.memory_per_channel),
            ));
        }
        if self.post_trigger_percent > 100 {
            return Err(DigitizerError::config(
                "global.post_trigger_percent",
                "must be within 0..=100",
            ));
        }
        let dec = self.decimation_factor;
        if dec > MAX_DECIMATION || (dec > 1 && !dec.is_power_of_two()) {
            return Err(DigitizerError::config(
                "global.decimation_factor",
                format!("must be 0 or a power of two up to {MAX_DECIMATION}"),
            ));
        }
        if dec > 1 && !model.supports_decimation {
            return Err(DigitizerError::config(
                "global.decimation_factor",
                format!("{} does not support decimation", model.name),
            ));
        }
        if self.majority_level > MAX_MAJORITY_LEVEL {
            return Err(DigitizerError::config(
                "global.majority_level",
                format!("must be within 0..={MAX_MAJORITY_LEVEL}"),
            ));
        }
        if self.majority_window > MAX_MAJORITY_WINDOW {
            return Err(DigitizerError::config(
                "global.majority_window",
                format!("must be within 0..={MAX_MAJORITY_WINDOW}"),
            ));
        }
        Ok(())
    }

    /// Samples recorded before the trigger instant.
    pub fn pre_trigger_samples(&self) -> u32 {
        self.record_length * (100 - self.post_trigger_percent.min(100)) / 100
    }
}

/// Settings of one channel group. Ungrouped models use one entry per channel.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GroupConfig {
    pub enabled: bool,
    /// 16-bit DAC value.
    pub dc_offset: u32,
    /// Fine per-channel offset, one entry per channel in the group.
    pub dc_corrections: [u8; MAX_CHANNELS_PER_GROUP],
    /// Index into the model's input ranges.
    pub dc_range: u8,
    /// In ADC counts.
    pub trigger_threshold: u32,
    /// Channels of the group that are read out.
    pub acquisition_mask: ChannelMask,
    /// Channels of the group that take part in self-triggering.
    pub trigger_mask: ChannelMask,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dc_offset: 0x8000,
            dc_corrections: [0; MAX_CHANNELS_PER_GROUP],
            dc_range: 0,
            trigger_threshold: 0,
            acquisition_mask: ChannelMask::none(),
            trigger_mask: ChannelMask::none(),
        }
    }
}

impl GroupConfig {
    /// An enabled group acquiring and triggering on its first `channels`.
    pub fn enabled(channels: usize) -> Self {
        Self {
            enabled: true,
            acquisition_mask: ChannelMask::first(channels),
            trigger_mask: ChannelMask::first(channels),
            ..Default::default()
        }
    }

    /// One default entry per group of `model`, all disabled.
    pub fn defaults_for(model: &ModelConstants) -> Vec<Self> {
        vec![Self::default(); model.num_groups]
    }

    pub fn validate(&self, index: usize, model: &ModelConstants) -> Result<()> {
        let field = |name: &str| format!("groups[{index}].{name}");
        let width = model.channels_per_group;

        if self.dc_offset > MAX_DC_OFFSET {
            return Err(DigitizerError::config(
                field("dc_offset"),
                format!("must be within 0..={MAX_DC_OFFSET:#x}"),
            ));
        }
        if usize::from(self.dc_range) >= model.voltage_ranges.len() {
            return Err(DigitizerError::config(
                field("dc_range"),
                format!("{} has {} input ranges", model.name, model.voltage_ranges.len()),
            ));
        }
        if self.trigger_threshold > u32::from(model.max_sample()) {
            return Err(DigitizerError::config(
                field("trigger_threshold"),
                format!("must be within 0..={}", model.max_sample()),
            ));
        }
        for (name, mask) in [
            ("acquisition_mask", &self.acquisition_mask),
            ("trigger_mask", &self.trigger_mask),
        ] {
            if mask.highest().is_some_and(|ch| ch >= width) {
                return Err(DigitizerError::config(
                    field(name),
                    format!("mask is {width} channels wide"),
                ));
            }
        }
        if self.dc_corrections[width..].iter().any(|&c| c != 0) {
            return Err(DigitizerError::config(
                field("dc_corrections"),
                format!("only {width} corrections are used"),
            ));
        }
        if self.enabled && model.grouped && self.acquisition_mask.is_empty() {
            return Err(DigitizerError::config(
                field("acquisition_mask"),
                "enabled group acquires no channel",
            ));
        }
        Ok(())
    }

    /// Absolute channel numbers this group reads out, ascending.
    pub fn acquired_channels(&self, index: usize, model: &ModelConstants) -> Vec<usize> {
        if !self.enabled {
            return Vec::new();
        }
        if !model.grouped {
            return vec![index];
        }
        self.acquisition_mask
            .iter()
            .filter(|&ch| ch < model.channels_per_group)
            .map(|ch| index * model.channels_per_group + ch)
            .collect()
    }

    /// Input range in Vpp, `None` if `dc_range` is not valid for `model`.
    pub fn voltage_range(&self, model: &ModelConstants) -> Option<f64> {
        model.voltage_ranges.get(usize::from(self.dc_range)).copied()
    }
}

/// Validates a complete set of group settings for `model`.
pub fn validate_groups(groups: &[GroupConfig], model: &ModelConstants) -> Result<()> {
    if groups.len() != model.num_groups {
        return Err(DigitizerError::config(
            "groups",
            format!(
                "{} expects {} group entries, got {}",
                model.name,
                model.num_groups,
                groups.len()
            ),
        ));
    }
    for (index, group) in groups.iter().enumerate() {
        group.validate(index, model)?;
    }
    if !groups.iter().any(|g| g.enabled) {
        return Err(DigitizerError::config("groups", "no group is enabled"));
    }
    Ok(())
}

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device: DeviceSettings,
    #[config(nested)]
    pub acquisition: AcquisitionSettings,
    #[config(nested)]
    pub run: RunSettings,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    pub model: DigitizerModel,
    #[config(default = "USB")]
    pub connection: ConnectionKind,
    #[config(default = 0)]
    pub link_number: u32,
    #[config(default = 0)]
    pub conet_node: u32,
    #[config(default = 0)]
    pub vme_base_address: u32,
}

impl DeviceSettings {
    pub fn link(&self) -> LinkParams {
        LinkParams {
            link_number: self.link_number,
            conet_node: self.conet_node,
            vme_base_address: self.vme_base_address,
        }
    }
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionSettings {
    pub global: GlobalConfig,
    pub groups: Vec<GroupConfig>,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 100)]
    pub software_triggers: u32,
    #[config(default = 1000)]
    pub trigger_interval_us: u64,
    #[config(default = 500)]
    pub drain_batch: u32,
    pub test_pulse_period_ms: Option<u64>,
    #[config(default = 0)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt5740() -> &'static ModelConstants {
        DigitizerModel::Dt5740d.constants()
    }

    fn four_groups() -> Vec<GroupConfig> {
        vec![GroupConfig::enabled(8); 4]
    }

    #[test]
    fn defaults_are_valid() {
        assert!(GlobalConfig::default().validate(dt5740()).is_ok());
        assert!(validate_groups(&four_groups(), dt5740()).is_ok());
    }

    #[test]
    fn first_invalid_global_field_is_named() {
        let global = GlobalConfig {
            record_length: 0,
            post_trigger_percent: 150,
            ..Default::default()
        };
        let err = global.validate(dt5740()).unwrap_err();
        assert_eq!(err.field(), Some("global.record_length"));

        let global = GlobalConfig {
            post_trigger_percent: 101,
            ..Default::default()
        };
        let err = global.validate(dt5740()).unwrap_err();
        assert_eq!(err.field(), Some("global.post_trigger_percent"));
    }

    #[test]
    fn decimation_must_be_supported_power_of_two() {
        let global = GlobalConfig {
            decimation_factor: 3,
            ..Default::default()
        };
        assert!(global.validate(dt5740()).is_err());

        let global = GlobalConfig {
            decimation_factor: 4,
            ..Default::default()
        };
        assert!(global.validate(dt5740()).is_ok());
        let err = global
            .validate(DigitizerModel::Dt5730b.constants())
            .unwrap_err();
        assert_eq!(err.field(), Some("global.decimation_factor"));
    }

    #[test]
    fn majority_limits() {
        let global = GlobalConfig {
            majority_level: 8,
            ..Default::default()
        };
        assert_eq!(
            global.validate(dt5740()).unwrap_err().field(),
            Some("global.majority_level")
        );
        let global = GlobalConfig {
            majority_window: 16,
            ..Default::default()
        };
        assert_eq!(
            global.validate(dt5740()).unwrap_err().field(),
            Some("global.majority_window")
        );
    }

    #[test]
    fn group_count_must_match_model() {
        let err = validate_groups(&vec![GroupConfig::enabled(8); 8], dt5740()).unwrap_err();
        assert_eq!(err.field(), Some("groups"));
    }

    #[test]
    fn group_fields_are_range_checked() {
        let mut groups = four_groups();
        groups[2].dc_offset = 0x1_0000;
        let err = validate_groups(&groups, dt5740()).unwrap_err();
        assert_eq!(err.field(), Some("groups[2].dc_offset"));

        let mut groups = four_groups();
        groups[1].trigger_threshold = 4096;
        let err = validate_groups(&groups, dt5740()).unwrap_err();
        assert_eq!(err.field(), Some("groups[1].trigger_threshold"));

        let mut groups = four_groups();
        groups[0].dc_range = 2;
        let err = validate_groups(&groups, dt5740()).unwrap_err();
        assert_eq!(err.field(), Some("groups[0].dc_range"));
    }

    #[test]
    fn masks_limited_to_group_width() {
        let model = DigitizerModel::Dt5730b.constants();
        let mut groups = GroupConfig::defaults_for(model);
        groups[0] = GroupConfig::enabled(1);
        assert!(validate_groups(&groups, model).is_ok());

        groups[3] = GroupConfig::enabled(2);
        let err = validate_groups(&groups, model).unwrap_err();
        assert_eq!(err.field(), Some("groups[3].acquisition_mask"));
    }

    fn load(name: &str, groups: &str) -> std::result::Result<Conf, confique::Error> {
        let path = std::env::temp_dir().join(format!("wavedaq-{}-{name}.toml", std::process::id()));
        let text = format!(
            "[device]\nmodel = \"DT5740D\"\n\n[acquisition.global]\n\n{groups}\n[run]\n"
        );
        std::fs::write(&path, text).unwrap();
        let conf = Conf::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        conf
    }

    #[test]
    fn config_file_masks_load_per_channel() {
        let conf = load(
            "short-mask",
            "[[acquisition.groups]]\nenabled = true\nacquisition_mask = [true, false, true]\n",
        )
        .unwrap();
        assert_eq!(conf.acquisition.groups[0].acquisition_mask.bits(), 0b101);
    }

    #[test]
    fn config_file_mask_wider_than_group_fails_to_load() {
        let groups = "[[acquisition.groups]]\nenabled = true\nacquisition_mask = \
                      [true, true, true, true, true, true, true, true, true]\n";
        assert!(load("wide-mask", groups).is_err());
    }

    #[test]
    fn acquired_channels_are_absolute() {
        let mut group = GroupConfig::enabled(0);
        group.acquisition_mask = ChannelMask::from_bits(0b1000_0010);
        assert_eq!(group.acquired_channels(2, dt5740()), vec![17, 23]);

        let model = DigitizerModel::Dt5730b.constants();
        assert_eq!(GroupConfig::enabled(1).acquired_channels(5, model), vec![5]);
        assert!(GroupConfig::default().acquired_channels(5, model).is_empty());
    }

    #[test]
    fn pre_trigger_split() {
        let global = GlobalConfig {
            record_length: 180,
            post_trigger_percent: 25,
            ..Default::default()
        };
        assert_eq!(global.pre_trigger_samples(), 135);
    }
}
