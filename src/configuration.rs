use crate::{
    validate_groups, AcquisitionController, Connection, DigitizerDevice, GlobalConfig,
    GroupConfig, ModelConstants, Result,
};
use log::info;
use std::fmt::Write;

/// A complete set of settings: one global block plus one entry per group.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedConfig {
    pub global: GlobalConfig,
    pub groups: Vec<GroupConfig>,
}

/// Validates, writes and remembers the device configuration.
#[derive(Debug, Default)]
pub struct ConfigurationManager {
    cache: Option<AppliedConfig>,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `global` and `groups` against the connected model and writes
    /// them to the device.
    ///
    /// Nothing is written unless every field is valid. Rejected while armed.
    /// On success the settings become the cached configuration.
    pub fn apply<D: DigitizerDevice>(
        &mut self,
        conn: &mut Connection<D>,
        acquisition: &AcquisitionController,
        global: &GlobalConfig,
        groups: &[GroupConfig],
    ) -> Result<()> {
        acquisition.require_disarmed("apply")?;
        let model = conn.model().constants();
        global.validate(model)?;
        validate_groups(groups, model)?;

        conn.call("write_global_config", |d| d.write_global_config(global))?;
        for (index, group) in groups.iter().enumerate() {
            conn.call("write_group_config", |d| d.write_group_config(index, group))?;
        }

        let applied = AppliedConfig {
            global: global.clone(),
            groups: groups.to_vec(),
        };
        log_applied(model, &applied);
        self.cache = Some(applied);
        Ok(())
    }

    /// The configuration in effect, `None` before the first successful apply.
    ///
    /// Read back from the device where it can report its settings; blocks it
    /// cannot read back come from the cache.
    pub fn current<D: DigitizerDevice>(
        &self,
        conn: &mut Connection<D>,
    ) -> Result<Option<AppliedConfig>> {
        let Some(cached) = self.cache.as_ref() else {
            return Ok(None);
        };
        let global = conn
            .call_optional("read_global_config", |d| d.read_global_config())?
            .unwrap_or_else(|| cached.global.clone());
        let mut groups = Vec::with_capacity(cached.groups.len());
        for (index, fallback) in cached.groups.iter().enumerate() {
            let group = conn
                .call_optional("read_group_config", |d| d.read_group_config(index))?
                .unwrap_or_else(|| fallback.clone());
            groups.push(group);
        }
        Ok(Some(AppliedConfig { global, groups }))
    }

    /// The last successfully applied configuration, without device access.
    pub fn cached(&self) -> Option<&AppliedConfig> {
        self.cache.as_ref()
    }

    pub fn is_applied(&self) -> bool {
        self.cache.is_some()
    }

    /// Drops the cache, e.g. after a device reset.
    pub(crate) fn forget(&mut self) {
        self.cache = None;
    }
}

fn log_applied(model: &ModelConstants, applied: &AppliedConfig) {
    let g = &applied.global;
    let mut param_log = String::new();
    let _ = writeln!(param_log, "MaxEventsPerRead: {}", g.max_events_per_read);
    let _ = writeln!(param_log, "RecordLength: {}", g.record_length);
    let _ = writeln!(param_log, "PostTrigger: {}%", g.post_trigger_percent);
    let _ = writeln!(param_log, "ExtTriggerMode: {:?}", g.ext_trigger_mode);
    let _ = writeln!(param_log, "SwTriggerMode: {:?}", g.sw_trigger_mode);
    let _ = writeln!(param_log, "ChTriggerMode: {:?}", g.ch_trigger_mode);
    let _ = writeln!(param_log, "AcquisitionMode: {:?}", g.acquisition_mode);
    let _ = writeln!(param_log, "TriggerPolarity: {:?}", g.trigger_polarity);
    let _ = writeln!(param_log, "IOLevel: {:?}", g.io_level);
    let _ = writeln!(param_log, "ExtAsGate: {}", g.ext_as_gate);
    let _ = writeln!(param_log, "TriggerOverlap: {}", g.trigger_overlap_allowed);
    let _ = writeln!(param_log, "MemoryFullMode: {:?}", g.memory_full_mode);
    let _ = writeln!(param_log, "BufferFullPolicy: {:?}", g.buffer_full_policy);
    let _ = writeln!(param_log, "DecimationFactor: {}", g.decimation_factor);
    let _ = writeln!(
        param_log,
        "Majority: level {} window {}",
        g.majority_level, g.majority_window
    );

    for (index, group) in applied.groups.iter().enumerate() {
        if !group.enabled {
            let _ = writeln!(param_log, "Group[{index}]: disabled");
            continue;
        }
        let width = model.channels_per_group;
        let _ = writeln!(
            param_log,
            "Group[{index}]: DCOffset {:#06x} Range {:?} Vpp Threshold {} AcqMask {:?} TrgMask {:?} Corrections {:?}",
            group.dc_offset,
            group.voltage_range(model).unwrap_or_default(),
            group.trigger_threshold,
            group.acquisition_mask,
            group.trigger_mask,
            &group.dc_corrections[..width],
        );
    }

    if param_log.ends_with('\n') {
        param_log.pop();
    }
    info!("{} configuration applied:\n{}", model.name, param_log);
}
