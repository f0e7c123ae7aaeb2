//! Device stimulus commands: trial factors resolved to a thermal voltage, serialized as JSON.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::trial::{Illusion, TrialFactors};

/// Target temperature to peltier voltage lookup.
pub trait VoltageTable {
    /// Voltage for an absolute target temperature, or None when the table has no entry.
    fn voltage_for(&self, temperature: i32) -> Option<f32>;
}

/// Table backed by an ordered map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VoltageMap {
    entries: BTreeMap<i32, f32>,
}

impl VoltageMap {
    pub fn new(entries: BTreeMap<i32, f32>) -> Self {
        Self { entries }
    }

    /// Five-entry table keyed by factor offset (use with base temperature 0).
    pub fn coarse() -> Self {
        Self::new(BTreeMap::from([(9, 1.5), (6, 1.5), (0, 0.0), (-12, 1.8), (-15, 1.8)]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VoltageTable for VoltageMap {
    fn voltage_for(&self, temperature: i32) -> Option<f32> {
        self.entries.get(&temperature).copied()
    }
}

/// A target temperature outside the voltage table. Nothing may be sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no voltage for target temperature {target} (base {base} {offset:+})")]
pub struct LookupError {
    pub target: i32,
    pub base: i32,
    pub offset: i32,
}

/// JSON message for the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulusCommand {
    pub illusion: &'static str,
    pub thermal_voltage: f64,
    pub duration: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<i32>,
}

impl StimulusCommand {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Resolve `factors` into a device command.
///
/// The target is `base_temperature + factors.temperature` and must exist in `table`,
/// even when `override_hot_voltage` replaces the voltage of a hot (positive offset) trial.
pub fn build_stimulus_command(
    factors: &TrialFactors,
    base_temperature: i32,
    override_hot_voltage: Option<f32>,
    table: &dyn VoltageTable,
) -> Result<StimulusCommand, LookupError> {
    let target = base_temperature.saturating_add(factors.temperature);
    let looked_up = table.voltage_for(target).ok_or(LookupError {
        target,
        base: base_temperature,
        offset: factors.temperature,
    })?;
    let volts = match override_hot_voltage {
        Some(v) if factors.temperature > 0 => v,
        _ => looked_up,
    };
    let (location, direction) = match factors.illusion {
        Illusion::Funneling { location } | Illusion::Saltation { location } => (Some(location), None),
        Illusion::Motion { direction } => (None, Some(direction)),
        Illusion::Baseline => (None, None),
    };
    Ok(StimulusCommand {
        illusion: factors.kind().name(),
        thermal_voltage: round_tenths(volts),
        duration: factors.duration,
        location,
        direction,
    })
}

fn round_tenths(v: f32) -> f64 {
    (f64::from(v) * 10.0).round() / 10.0
}
