//! Runtime configuration (§4.16, §3 "Runtime configuration").
//!
//! `PrsConfig` is the typed, validated knob set a hosting binary supplies at
//! startup — worker count, default stack size, timer wheel shape, tick rate,
//! and which scheduler policy to build. It loads from an optional TOML file,
//! mirroring the teacher's `app.toml`-style application descriptors, or can
//! be assembled programmatically via `PrsConfig::builder()` for embedding
//! without a file on disk.

use abi::SchedulerKind;
use serde::{Deserialize, Serialize};

use crate::error::{PrsError, Result};

const PAGE_SIZE: usize = 4096;

/// A deserialized-but-unvalidated `PrsConfig`. Kept distinct from the public
/// type so invalid files are rejected at one well-defined seam
/// (`PrsConfig::from_toml`) rather than leaving half-checked values floating
/// around the rest of the crate.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_worker_count")]
    worker_count: usize,
    #[serde(default = "default_stack_size")]
    default_stack_size: usize,
    #[serde(default = "default_wheel_slots")]
    wheel_slots: usize,
    #[serde(default = "default_wheel_levels")]
    wheel_levels: usize,
    #[serde(default = "default_ticks_per_second")]
    ticks_per_second: u32,
    #[serde(default)]
    scheduler_kind: SchedulerKind,
}

fn default_worker_count() -> usize {
    1
}
fn default_stack_size() -> usize {
    16 * 1024
}
fn default_wheel_slots() -> usize {
    256
}
fn default_wheel_levels() -> usize {
    8
}
fn default_ticks_per_second() -> u32 {
    1000
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            default_stack_size: default_stack_size(),
            wheel_slots: default_wheel_slots(),
            wheel_levels: default_wheel_levels(),
            ticks_per_second: default_ticks_per_second(),
            scheduler_kind: SchedulerKind::Cooperative,
        }
    }
}

/// Validated runtime configuration (§3 "Runtime configuration").
#[derive(Clone, Debug)]
pub struct PrsConfig {
    pub worker_count: usize,
    pub default_stack_size: usize,
    pub wheel_slots: usize,
    pub wheel_levels: usize,
    pub ticks_per_second: u32,
    pub scheduler_kind: SchedulerKind,
}

impl PrsConfig {
    /// Parses and validates a TOML document (§4.16).
    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text).map_err(|e| PrsError::InvalidConfig(e.to_string()))?;
        Self::from_raw(raw)
    }

    #[must_use]
    pub fn builder() -> PrsConfigBuilder {
        PrsConfigBuilder { raw: RawConfig::default() }
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        if raw.worker_count == 0 {
            return Err(PrsError::InvalidConfig("worker_count must be at least 1".into()));
        }
        if raw.default_stack_size < PAGE_SIZE {
            return Err(PrsError::InvalidConfig(format!(
                "default_stack_size must be at least one page ({PAGE_SIZE} bytes)"
            )));
        }
        if !raw.wheel_slots.is_power_of_two() {
            return Err(PrsError::InvalidConfig("wheel_slots must be a power of two".into()));
        }
        if raw.wheel_levels == 0 {
            return Err(PrsError::InvalidConfig("wheel_levels must be at least 1".into()));
        }
        if raw.ticks_per_second == 0 {
            return Err(PrsError::InvalidConfig("ticks_per_second must be nonzero".into()));
        }
        Ok(Self {
            worker_count: raw.worker_count,
            default_stack_size: raw.default_stack_size,
            wheel_slots: raw.wheel_slots,
            wheel_levels: raw.wheel_levels,
            ticks_per_second: raw.ticks_per_second,
            scheduler_kind: raw.scheduler_kind,
        })
    }
}

/// Programmatic assembly path for `PrsConfig`, for hosts that embed the
/// runtime without an `app.toml`-style file on disk.
pub struct PrsConfigBuilder {
    raw: RawConfig,
}

impl PrsConfigBuilder {
    #[must_use]
    pub fn worker_count(mut self, n: usize) -> Self {
        self.raw.worker_count = n;
        self
    }

    #[must_use]
    pub fn default_stack_size(mut self, bytes: usize) -> Self {
        self.raw.default_stack_size = bytes;
        self
    }

    #[must_use]
    pub fn wheel_shape(mut self, slots: usize, levels: usize) -> Self {
        self.raw.wheel_slots = slots;
        self.raw.wheel_levels = levels;
        self
    }

    #[must_use]
    pub fn ticks_per_second(mut self, hz: u32) -> Self {
        self.raw.ticks_per_second = hz;
        self
    }

    #[must_use]
    pub fn scheduler_kind(mut self, kind: SchedulerKind) -> Self {
        self.raw.scheduler_kind = kind;
        self
    }

    pub fn build(self) -> Result<PrsConfig> {
        PrsConfig::from_raw(self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_the_builder() {
        let cfg = PrsConfig::builder().build().unwrap();
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(cfg.wheel_slots, 256);
    }

    #[test]
    fn a_well_formed_toml_document_parses() {
        let cfg = PrsConfig::from_toml(
            r#"
            worker-count = 4
            default-stack-size = 32768
            wheel-slots = 512
            wheel-levels = 8
            ticks-per-second = 100
            scheduler-kind = "priority"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.scheduler_kind, SchedulerKind::Priority);
    }

    #[test]
    fn a_non_power_of_two_wheel_slot_count_is_rejected() {
        let result = PrsConfig::builder().wheel_shape(200, 8).build();
        assert!(result.is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result = PrsConfig::builder().worker_count(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn a_stack_size_below_one_page_is_rejected() {
        let result = PrsConfig::builder().default_stack_size(1024).build();
        assert!(result.is_err());
    }

    #[test]
    fn unknown_fields_in_toml_are_rejected() {
        let result = PrsConfig::from_toml("bogus-field = 1");
        assert!(result.is_err());
    }
}
