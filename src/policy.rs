// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Threshold classification. Pure functions of the latest reading, no I/O,
//! so everything here is testable offline.

use std::fmt;

use crate::config::SizeTiers;
use crate::config::Thresholds;
use crate::config::INCREASE_MARGIN;
use crate::sensor::SystemStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Increase,
    Maintain,
    Reduce,
    Stop,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Increase => "increase",
            ActionKind::Maintain => "maintain",
            ActionKind::Reduce => "reduce",
            ActionKind::Stop => "stop",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scaling decision and the workload size every worker should run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub size: usize,
}

impl Action {
    /// Used whenever the state of the machine is not known.
    pub fn fail_safe(tiers: &SizeTiers) -> Self {
        Self {
            kind: ActionKind::Stop,
            size: tiers.smallest(),
        }
    }
}

/// Map a temperature onto an action. Comparisons are strict, so a reading
/// equal to a threshold lands in the cooler-seeking branch. NaN never
/// compares less than anything and therefore maps to Stop.
pub fn classify_temperature(temperature: f64, thresholds: &Thresholds, tiers: &SizeTiers) -> Action {
    if temperature < thresholds.target - INCREASE_MARGIN {
        Action {
            kind: ActionKind::Increase,
            size: tiers.largest(),
        }
    } else if temperature < thresholds.target {
        Action {
            kind: ActionKind::Maintain,
            size: tiers.middle(),
        }
    } else if temperature < thresholds.max {
        Action {
            kind: ActionKind::Reduce,
            size: tiers.second_smallest(),
        }
    } else {
        Action::fail_safe(tiers)
    }
}

pub fn classify(status: &SystemStatus, thresholds: &Thresholds, tiers: &SizeTiers) -> Action {
    classify_temperature(status.temperature, thresholds, tiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(temp: f64) -> Action {
        classify_temperature(temp, &Thresholds::default(), &SizeTiers::default())
    }

    #[test]
    fn test_branches() {
        assert_eq!(act(40.0).kind, ActionKind::Increase);
        assert_eq!(act(40.0).size, 1500);
        assert_eq!(act(70.0).kind, ActionKind::Maintain);
        assert_eq!(act(70.0).size, 1000);
        assert_eq!(act(80.0).kind, ActionKind::Reduce);
        assert_eq!(act(80.0).size, 500);
        assert_eq!(act(90.0).kind, ActionKind::Stop);
        assert_eq!(act(90.0).size, 200);
    }

    #[test]
    fn test_ties_go_cooler() {
        assert_eq!(act(65.0).kind, ActionKind::Maintain);
        assert_eq!(act(75.0).kind, ActionKind::Reduce);
        assert_eq!(act(85.0).kind, ActionKind::Stop);
        assert_eq!(act(95.0).kind, ActionKind::Stop);
    }

    #[test]
    fn test_nan_is_stop() {
        assert_eq!(act(f64::NAN), Action::fail_safe(&SizeTiers::default()));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(ActionKind::Increase.to_string(), "increase");
        assert_eq!(ActionKind::Stop.as_str(), "stop");
    }
}
