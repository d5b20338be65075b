// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The control loop.
//!
//! Once per interval: sample the sensors, classify the temperature into an
//! action, let the supervisor realize it (at most one worker added or
//! removed per tick), render the status line and check for the critical
//! threshold. Scaling is gradual so the temperature has time
//! to respond before the next decision.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use log::error;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;

use crate::config::ControllerConfig;
use crate::policy::classify;
use crate::policy::Action;
use crate::sensor::SensorSource;
use crate::sensor::SystemStatus;
use crate::status::format_status;
use crate::status::StatusLine;
use crate::supervisor::ProcessSupervisor;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stop requested by a signal.
    Signal,
    /// The temperature reached the critical threshold.
    Critical,
}

/// Result of one control-loop iteration.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    /// `None` when sampling failed and the fail-safe action was used.
    pub status: Option<SystemStatus>,
    pub action: Action,
    pub critical: bool,
}

struct Metrics {
    temperature: Gauge,
    cpu_busy_pct: Gauge,
    memory_pct: Gauge,
    workers: Gauge,
    sensor_errors: Counter,
    spawn_failures: Counter,
    tick_errors: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            temperature: gauge!("temperature_celsius"),
            cpu_busy_pct: gauge!("cpu_busy_pct"),
            memory_pct: gauge!("memory_used_pct"),
            workers: gauge!("workers"),
            sensor_errors: counter!("sensor_errors_total"),
            spawn_failures: counter!("spawn_failures_total"),
            tick_errors: counter!("tick_errors_total"),
        }
    }
}

pub struct Controller<S: SensorSource> {
    sensor: S,
    supervisor: ProcessSupervisor,
    config: ControllerConfig,
    status_line: StatusLine,
    metrics: Metrics,
    nr_ticks: u64,
}

impl<S: SensorSource> Controller<S> {
    pub fn new(sensor: S, supervisor: ProcessSupervisor, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sensor,
            supervisor,
            config,
            status_line: StatusLine::stdout(),
            metrics: Metrics::new(),
            nr_ticks: 0,
        })
    }

    pub fn with_status_line(mut self, status_line: StatusLine) -> Self {
        self.status_line = status_line;
        self
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn nr_ticks(&self) -> u64 {
        self.nr_ticks
    }

    /// One iteration: sample, classify, apply, render, check critical.
    pub fn tick(&mut self) -> Result<Tick> {
        self.nr_ticks += 1;

        let status = match self.sensor.sample() {
            Ok(status) => Some(status),
            Err(e) => {
                self.status_line.break_line();
                warn!("{}, falling back to fail-safe action", e);
                self.metrics.sensor_errors.increment(1);
                None
            }
        };
        let action = match status.as_ref() {
            Some(s) => classify(s, &self.config.thresholds, &self.config.tiers),
            None => Action::fail_safe(&self.config.tiers),
        };

        let exited = self.supervisor.reap();
        if !exited.is_empty() {
            self.status_line.break_line();
            for (id, status) in exited {
                warn!("worker {} exited unexpectedly: {}", id, status);
            }
        }
        let nr_spawn_failures = self.supervisor.nr_spawn_failures();
        let applied = self.supervisor.apply(&action);
        if self.supervisor.nr_spawn_failures() > nr_spawn_failures {
            self.status_line.break_line();
            warn!(
                "Failed to spawn a worker, continuing with {}",
                self.supervisor.len()
            );
            self.metrics.spawn_failures.increment(1);
        }

        counter!("actions_total", "action" => action.kind.as_str()).increment(1);
        self.metrics.workers.set(self.supervisor.len() as f64);
        if let Some(s) = status.as_ref() {
            self.metrics.temperature.set(s.temperature);
            self.metrics.cpu_busy_pct.set(s.cpu_percent);
            self.metrics.memory_pct.set(s.memory_percent);
        }

        self.status_line
            .render(&format_status(
                status.as_ref(),
                self.supervisor.len(),
                &action,
            ))
            .context("Failed to render status line")?;

        let critical = status
            .as_ref()
            .map_or(false, |s| self.config.thresholds.is_critical(s.temperature));
        if !critical {
            applied.with_context(|| format!("Failed to apply {} action", action.kind))?;
        } else if let Err(e) = applied {
            self.status_line.break_line();
            warn!("Failed to apply {} action: {}", action.kind, e);
        }

        Ok(Tick {
            status,
            action,
            critical,
        })
    }

    fn sleep_until(&self, deadline: Instant, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }

    fn run_loop(&mut self, shutdown: &AtomicBool) -> Result<ExitReason> {
        let mut nr_errors: u32 = 0;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                self.status_line.break_line();
                info!("Received signal to stop");
                return Ok(ExitReason::Signal);
            }

            let started_at = Instant::now();
            match self.tick() {
                Ok(tick) if tick.critical => {
                    self.status_line.break_line();
                    error!(
                        "Critical temperature {:.1}°C reached (critical {:.1}°C), shutting down",
                        tick.status.map_or(f64::NAN, |s| s.temperature),
                        self.config.thresholds.critical
                    );
                    return Ok(ExitReason::Critical);
                }
                Ok(_) => nr_errors = 0,
                Err(e) => {
                    nr_errors += 1;
                    self.metrics.tick_errors.increment(1);
                    self.status_line.break_line();
                    warn!(
                        "Control loop error ({}/{}): {:#}",
                        nr_errors, self.config.max_consecutive_errors, e
                    );
                    if nr_errors >= self.config.max_consecutive_errors {
                        return Err(e).context(format!(
                            "Giving up after {} consecutive control loop errors",
                            nr_errors
                        ));
                    }
                    self.sleep_until(Instant::now() + self.config.error_backoff, shutdown);
                    continue;
                }
            }

            self.sleep_until(started_at + self.config.interval, shutdown);
        }
    }

    /// Run until a stop is requested or the critical threshold is hit.
    /// Workers are cleaned up and a final temperature is reported on every
    /// exit path.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<ExitReason> {
        info!(
            "Target {:.1}°C, max {:.1}°C, critical {:.1}°C, tiers {:?}, {} to {} workers",
            self.config.thresholds.target,
            self.config.thresholds.max,
            self.config.thresholds.critical,
            self.config.tiers.as_slice(),
            self.supervisor.nr_cpus(),
            self.supervisor.max_workers()
        );

        let res = self.run_loop(shutdown);
        let final_temp = self.cleanup();
        info!("Final temperature: {:.1}°C", final_temp);
        res
    }

    /// Stop every worker and return a fresh temperature reading. Idempotent.
    pub fn cleanup(&mut self) -> f64 {
        self.status_line.break_line();
        self.supervisor.cleanup();
        self.metrics.workers.set(0.0);
        self.sensor.temperature()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizeTiers;
    use crate::config::Thresholds;
    use crate::policy::ActionKind;
    use crate::sensor::ScriptedSensor;
    use crate::supervisor::WorkerCommand;
    use std::io;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn is_zombie(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map_or(true, |stat| stat.contains(") Z "))
    }

    fn controller(temps: Vec<Option<f64>>, nr_cpus: usize) -> Controller<ScriptedSensor> {
        let supervisor =
            ProcessSupervisor::new(nr_cpus, WorkerCommand::new("sleep").arg("30")).unwrap();
        let config = ControllerConfig {
            interval: Duration::ZERO,
            error_backoff: Duration::ZERO,
            ..Default::default()
        };
        Controller::new(ScriptedSensor::new(temps), supervisor, config)
            .unwrap()
            .with_status_line(StatusLine::sink())
    }

    #[test]
    fn test_sampling_failure_is_fail_safe() {
        let mut ctl = controller(vec![None], 1);
        let tick = ctl.tick().unwrap();
        assert!(tick.status.is_none());
        assert_eq!(tick.action, Action::fail_safe(&SizeTiers::default()));
        assert!(!tick.critical);
        ctl.cleanup();
    }

    #[test]
    fn test_sentinel_reading_increases() {
        let mut ctl = controller(vec![Some(0.0)], 1);
        let tick = ctl.tick().unwrap();
        assert_eq!(tick.action.kind, ActionKind::Increase);
        assert_eq!(ctl.supervisor().len(), 1);
        ctl.cleanup();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let supervisor = ProcessSupervisor::new(1, WorkerCommand::new("sleep")).unwrap();
        let config = ControllerConfig {
            thresholds: Thresholds {
                target: 90.0,
                max: 85.0,
                critical: 95.0,
            },
            ..Default::default()
        };
        assert!(Controller::new(ScriptedSensor::from_temps(&[]), supervisor, config).is_err());
    }

    #[test]
    fn test_shutdown_before_first_tick() {
        let mut ctl = controller(vec![Some(40.0)], 1);
        let shutdown = AtomicBool::new(true);
        assert_eq!(ctl.run(&shutdown).unwrap(), ExitReason::Signal);
        assert_eq!(ctl.nr_ticks(), 0);
        assert!(ctl.supervisor().is_stopped());
    }

    #[test]
    fn test_cleanup_twice() {
        let mut ctl = controller(vec![Some(40.0), Some(40.0)], 1);
        ctl.tick().unwrap();
        ctl.tick().unwrap();
        assert_eq!(ctl.supervisor().len(), 2);
        assert_eq!(ctl.cleanup(), 40.0);
        assert!(ctl.supervisor().is_empty());
        assert_eq!(ctl.cleanup(), 40.0);
        assert!(ctl.supervisor().is_empty());
    }

    #[test]
    fn test_status_line_broken_before_reaping() {
        let out = Shared::default();
        let supervisor = ProcessSupervisor::new(2, WorkerCommand::new("true")).unwrap();
        let config = ControllerConfig {
            interval: Duration::ZERO,
            error_backoff: Duration::ZERO,
            ..Default::default()
        };
        let mut ctl = Controller::new(ScriptedSensor::from_temps(&[40.0]), supervisor, config)
            .unwrap()
            .with_status_line(StatusLine::new(Box::new(out.clone())));

        ctl.tick().unwrap();
        let pid = ctl.supervisor().workers()[0].pid();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_zombie(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!String::from_utf8_lossy(&out.0.lock().unwrap()).contains('\n'));

        ctl.tick().unwrap();
        let text = String::from_utf8_lossy(&out.0.lock().unwrap()).into_owned();
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Action: increase"));
        assert!(lines[1].starts_with("\r\x1b[2K"));
        ctl.cleanup();
    }
}
