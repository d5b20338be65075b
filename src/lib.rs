// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
pub mod channel;
pub mod config;
pub mod controller;
pub mod load;
pub mod policy;
pub mod sensor;
pub mod status;
pub mod supervisor;
pub mod topology;
pub mod worker;

pub use config::ControllerConfig;
pub use config::SizeTiers;
pub use config::Thresholds;
pub use controller::Controller;
pub use controller::ExitReason;
pub use policy::classify;
pub use policy::Action;
pub use policy::ActionKind;
pub use sensor::SensorSource;
pub use sensor::SystemStatus;
pub use supervisor::ProcessSupervisor;
pub use supervisor::WorkerCommand;
