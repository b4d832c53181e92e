//! # Configuration
//!
//! Tunables of the residency engine, with the module-parameter defaults.
//!
//! Parameters can be supplied as a whitespace-separated `key=value` string:
//!
//! ```text
//! uvm_perf_thrashing_threshold=5 uvm_perf_thrashing_lapse_usec=250
//! ```
//!
//! Unknown keys and unparsable values are rejected; out-of-range values are
//! clamped with a warning.

use crate::clock::{NSEC_PER_MSEC, NSEC_PER_USEC};
use crate::error::{Error, Result};
use crate::types::ByteSize;

// =============================================================================
// THRASHING
// =============================================================================

/// Largest accepted thrashing threshold
pub const THRASHING_THRESHOLD_MAX: u8 = 127;

/// Thrashing detector tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrashingConfig {
    /// Detection enabled
    pub enable: bool,
    /// Consecutive events within `lapse_ns` that flag a page
    pub threshold: u8,
    /// Throttles of one processor after which the page is pinned
    pub pin_threshold: u8,
    /// Maximum spacing of two events counted as consecutive
    pub lapse_ns: u64,
    /// How long a throttled processor backs off
    pub nap_ns: u64,
    /// Quiet time after which a block's thrashing state is reset
    pub epoch_ns: u64,
    /// How long a pinned page stays pinned
    pub pin_ns: u64,
    /// Maximum number of resets per block
    pub max_resets: u32,
}

impl Default for ThrashingConfig {
    fn default() -> Self {
        Self {
            enable: true,
            threshold: 3,
            pin_threshold: 10,
            lapse_ns: 100 * NSEC_PER_USEC,
            nap_ns: NSEC_PER_MSEC,
            epoch_ns: 1000 * NSEC_PER_MSEC,
            pin_ns: 300 * NSEC_PER_MSEC,
            max_resets: 4,
        }
    }
}

// =============================================================================
// MIGRATION
// =============================================================================

/// Migration engine tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Largest single copy-engine transfer
    pub max_copy_size: ByteSize,
    /// Bound on lock-drop retries per operation
    pub retry_limit: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_copy_size: ByteSize::MIB_2,
            retry_limit: 8,
        }
    }
}

// =============================================================================
// MAPPING
// =============================================================================

/// Page-table shape tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingConfig {
    /// Use 2M PTEs on GPUs that support them
    pub enable_2m_ptes: bool,
    /// Use big PTEs
    pub enable_big_ptes: bool,
    /// Honour big-page swizzling on GPUs that need it
    pub enable_swizzling: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            enable_2m_ptes: true,
            enable_big_ptes: true,
            enable_swizzling: true,
        }
    }
}

// =============================================================================
// UVM CONFIG
// =============================================================================

/// Complete engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UvmConfig {
    /// Thrashing detection
    pub thrashing: ThrashingConfig,
    /// Migration
    pub migration: MigrationConfig,
    /// Page-table shapes
    pub mapping: MappingConfig,
}

fn parse_u64(value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| Error::InvalidParameter)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "y" | "Y" => Ok(true),
        "0" | "false" | "n" | "N" => Ok(false),
        _ => Err(Error::InvalidParameter),
    }
}

fn clamp(key: &str, value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        log::warn!("{}={} out of range [{}, {}], using {}", key, value, min, max, clamped);
    }
    clamped
}

impl UvmConfig {
    /// Defaults overridden by a `key=value` parameter string
    pub fn parse_params(params: &str) -> Result<Self> {
        let mut config = Self::default();
        for param in params.split_whitespace() {
            let (key, value) = param.split_once('=').ok_or(Error::InvalidParameter)?;
            config.apply_param(key, value)?;
        }
        config.fixup();
        Ok(config)
    }

    /// Apply a single parameter
    pub fn apply_param(&mut self, key: &str, value: &str) -> Result<()> {
        let max = u64::from(THRASHING_THRESHOLD_MAX);
        let t = &mut self.thrashing;
        match key {
            "uvm_perf_thrashing_enable" => t.enable = parse_bool(value)?,
            "uvm_perf_thrashing_threshold" => {
                t.threshold = clamp(key, parse_u64(value)?, 1, max) as u8;
            }
            "uvm_perf_thrashing_pin_threshold" => {
                t.pin_threshold = clamp(key, parse_u64(value)?, 1, max) as u8;
            }
            "uvm_perf_thrashing_lapse_usec" => {
                t.lapse_ns = clamp(key, parse_u64(value)?, 1, 1_000_000) * NSEC_PER_USEC;
            }
            "uvm_perf_thrashing_nap" => {
                t.nap_ns = clamp(key, parse_u64(value)?, 1, 100) * NSEC_PER_MSEC;
            }
            "uvm_perf_thrashing_epoch" => {
                t.epoch_ns = clamp(key, parse_u64(value)?, 1, 3_600_000) * NSEC_PER_MSEC;
            }
            "uvm_perf_thrashing_pin" => {
                t.pin_ns = clamp(key, parse_u64(value)?, 0, 3_600_000) * NSEC_PER_MSEC;
            }
            "uvm_perf_thrashing_max_resets" => {
                t.max_resets = clamp(key, parse_u64(value)?, 0, u64::from(u32::MAX)) as u32;
            }
            "uvm_migrate_max_copy_kb" => {
                let kb = clamp(key, parse_u64(value)?, 4, 2048);
                self.migration.max_copy_size = ByteSize::from_kib(kb);
            }
            "uvm_alloc_retry_limit" => {
                self.migration.retry_limit = clamp(key, parse_u64(value)?, 1, 64) as u32;
            }
            "uvm_enable_2m_ptes" => self.mapping.enable_2m_ptes = parse_bool(value)?,
            "uvm_enable_big_ptes" => self.mapping.enable_big_ptes = parse_bool(value)?,
            "uvm_enable_swizzling" => self.mapping.enable_swizzling = parse_bool(value)?,
            _ => {
                log::warn!("unknown parameter {}", key);
                return Err(Error::InvalidParameter);
            }
        }
        Ok(())
    }

    /// Keep cross-parameter relations consistent
    fn fixup(&mut self) {
        let t = &mut self.thrashing;
        if t.epoch_ns < t.lapse_ns {
            log::warn!("thrashing epoch shorter than lapse, raising to lapse");
            t.epoch_ns = t.lapse_ns;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UvmConfig::default();
        assert!(config.thrashing.enable);
        assert_eq!(config.thrashing.threshold, 3);
        assert_eq!(config.thrashing.pin_threshold, 10);
        assert_eq!(config.thrashing.lapse_ns, 100_000);
        assert_eq!(config.thrashing.max_resets, 4);
        assert!(config.mapping.enable_swizzling);
    }

    #[test]
    fn test_parse_params() {
        let config = UvmConfig::parse_params(
            "uvm_perf_thrashing_threshold=5 uvm_perf_thrashing_lapse_usec=250 uvm_enable_2m_ptes=0",
        )
        .unwrap();
        assert_eq!(config.thrashing.threshold, 5);
        assert_eq!(config.thrashing.lapse_ns, 250_000);
        assert!(!config.mapping.enable_2m_ptes);
    }

    #[test]
    fn test_parse_params_clamps_and_rejects() {
        let config = UvmConfig::parse_params("uvm_perf_thrashing_threshold=1000").unwrap();
        assert_eq!(config.thrashing.threshold, THRASHING_THRESHOLD_MAX);

        assert_eq!(
            UvmConfig::parse_params("uvm_bogus=1"),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            UvmConfig::parse_params("uvm_perf_thrashing_threshold"),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            UvmConfig::parse_params("uvm_perf_thrashing_enable=maybe"),
            Err(Error::InvalidParameter)
        );
    }
}
