// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fmt;
use std::time::Duration;

pub const DEFAULT_TARGET_TEMP: f64 = 75.0;
pub const DEFAULT_MAX_TEMP: f64 = 85.0;
pub const DEFAULT_CRITICAL_TEMP: f64 = 95.0;
pub const DEFAULT_SIZE_TIERS: [usize; 4] = [200, 500, 1000, 1500];
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Largest accepted workload size. Three size x size f64 matrices per
/// worker, and the size has to fit the u32 records of the size channel.
pub const MAX_SIZE_TIER: usize = 4096;

/// Below `target - INCREASE_MARGIN` the controller adds load.
pub const INCREASE_MARGIN: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    EmptyTiers,
    ZeroTier,
    TierTooLarge(usize),
    UnsortedTiers(Vec<usize>),
    ThresholdOrder { target: f64, max: f64, critical: f64 },
    Interval(f64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyTiers => write!(f, "size tier list is empty"),
            ConfigError::ZeroTier => write!(f, "size tiers must be non-zero"),
            ConfigError::TierTooLarge(size) => {
                write!(f, "size tier {} exceeds the maximum {}", size, MAX_SIZE_TIER)
            }
            ConfigError::UnsortedTiers(tiers) => {
                write!(f, "size tiers must be strictly ascending: {:?}", tiers)
            }
            ConfigError::ThresholdOrder {
                target,
                max,
                critical,
            } => write!(
                f,
                "thresholds must satisfy target < max < critical (got {} / {} / {})",
                target, max, critical
            ),
            ConfigError::Interval(secs) => write!(f, "invalid interval {}s", secs),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Temperature thresholds in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub target: f64,
    pub max: f64,
    pub critical: f64,
}

impl Thresholds {
    pub fn new(target: f64, max: f64, critical: f64) -> Result<Self, ConfigError> {
        let thresholds = Self {
            target,
            max,
            critical,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.target < self.max && self.max < self.critical;
        if !ordered || !self.critical.is_finite() || !self.target.is_finite() {
            return Err(ConfigError::ThresholdOrder {
                target: self.target,
                max: self.max,
                critical: self.critical,
            });
        }
        Ok(())
    }

    pub fn is_critical(&self, temperature: f64) -> bool {
        temperature >= self.critical
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET_TEMP,
            max: DEFAULT_MAX_TEMP,
            critical: DEFAULT_CRITICAL_TEMP,
        }
    }
}

/// Ordered set of per-worker workload sizes. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeTiers(Vec<usize>);

impl SizeTiers {
    pub fn new(tiers: Vec<usize>) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::EmptyTiers);
        }
        if tiers.contains(&0) {
            return Err(ConfigError::ZeroTier);
        }
        if let Some(&size) = tiers.iter().find(|&&size| size > MAX_SIZE_TIER) {
            return Err(ConfigError::TierTooLarge(size));
        }
        if tiers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::UnsortedTiers(tiers));
        }
        Ok(Self(tiers))
    }

    pub fn smallest(&self) -> usize {
        self.0[0]
    }

    pub fn second_smallest(&self) -> usize {
        self.0[1.min(self.0.len() - 1)]
    }

    pub fn middle(&self) -> usize {
        self.0[self.0.len() / 2]
    }

    pub fn largest(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl Default for SizeTiers {
    fn default() -> Self {
        Self(DEFAULT_SIZE_TIERS.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub thresholds: Thresholds,
    pub tiers: SizeTiers,
    /// Time between the starts of two control-loop ticks.
    pub interval: Duration,
    pub error_backoff: Duration,
    pub max_consecutive_errors: u32,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()
    }
}

/// Convert a user supplied interval in seconds, rejecting negative and
/// non-finite values.
pub fn interval_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::Interval(secs))
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            tiers: SizeTiers::default(),
            interval: DEFAULT_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}
