// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::warn;

/// Sentinel for "no temperature available". Classified as the coldest
/// possible reading.
pub const UNKNOWN_TEMPERATURE: f64 = 0.0;

pub const DEFAULT_CPU_WINDOW: Duration = Duration::from_millis(100);

/// One reading of the machine, taken fresh every tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SystemStatus {
    /// Degrees Celsius, `UNKNOWN_TEMPERATURE` when no sensor could be read.
    pub temperature: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Whole seconds since the sensor was created.
    pub runtime: u64,
}

#[derive(Debug)]
pub enum SensorError {
    Cpu(anyhow::Error),
    Memory(anyhow::Error),
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::Cpu(e) => write!(f, "failed to sample CPU utilization: {:#}", e),
            SensorError::Memory(e) => write!(f, "failed to sample memory usage: {:#}", e),
        }
    }
}

impl std::error::Error for SensorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SensorError::Cpu(e) | SensorError::Memory(e) => Some(e.as_ref()),
        }
    }
}

pub trait SensorSource {
    /// Take a full reading. May block for a short sampling window.
    fn sample(&mut self) -> std::result::Result<SystemStatus, SensorError>;

    /// Read the temperature alone. Never fails, returns
    /// `UNKNOWN_TEMPERATURE` when nothing can be read.
    fn temperature(&mut self) -> f64;
}

/// Cumulative (busy, not busy) microseconds of one snapshot. iowait counts
/// as not busy.
fn busy_idle_usec(stat: &procfs::CpuStat) -> Option<(u64, u64)> {
    let busy = stat.user_usec?
        + stat.nice_usec?
        + stat.system_usec?
        + stat.irq_usec?
        + stat.softirq_usec?
        + stat.stolen_usec?;
    Some((busy, stat.idle_usec? + stat.iowait_usec?))
}

/// Busy fraction in [0.0, 1.0] between two cumulative CPU stat snapshots.
/// No elapsed time reads as idle.
pub fn calc_util(curr: &procfs::CpuStat, prev: &procfs::CpuStat) -> Result<f64> {
    let ((curr_busy, curr_idle), (prev_busy, prev_idle)) =
        match (busy_idle_usec(curr), busy_idle_usec(prev)) {
            (Some(curr), Some(prev)) => (curr, prev),
            _ => bail!("Missing stats in cpustat"),
        };
    let busy = curr_busy.saturating_sub(prev_busy);
    let total = busy + curr_idle.saturating_sub(prev_idle);
    if total == 0 {
        return Ok(0.0);
    }
    Ok((busy as f64 / total as f64).clamp(0.0, 1.0))
}

/// Percentage of memory in use, counting reclaimable memory as free.
pub fn calc_memory_percent(meminfo: &procfs::MemInfo) -> Result<f64> {
    match (meminfo.total, meminfo.available) {
        (Some(total), Some(available)) if total > 0 => {
            let used = total.saturating_sub(available);
            Ok(used as f64 * 100.0 / total as f64)
        }
        _ => bail!("MemTotal/MemAvailable missing from meminfo"),
    }
}

/// Sensors report millidegrees Celsius.
fn read_millicelsius(path: &Path) -> Option<f64> {
    let val = std::fs::read_to_string(path).ok()?;
    let millis = val.trim_end_matches('\0').trim().parse::<i64>().ok()?;
    if millis <= 0 {
        return None;
    }
    Some(millis as f64 / 1000.0)
}

fn hottest(pattern: &Path) -> Option<f64> {
    let paths = glob(pattern.to_string_lossy().as_ref()).ok()?;
    paths
        .filter_map(|p| p.ok())
        .filter_map(|p| read_millicelsius(&p))
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
}

/// Hottest hwmon temperature input under `sysfs_root`, falling back to the
/// thermal zones when no hwmon sensor exposes a reading.
pub fn read_temperature(sysfs_root: &Path) -> Option<f64> {
    hottest(&sysfs_root.join("class/hwmon/hwmon*/temp*_input"))
        .or_else(|| hottest(&sysfs_root.join("class/thermal/thermal_zone*/temp")))
}

/// Linux sensor source backed by procfs and sysfs.
pub struct SysSensor {
    proc_reader: procfs::ProcReader,
    sysfs_root: PathBuf,
    cpu_window: Duration,
    started_at: Instant,
    warned_no_temp: bool,
}

impl SysSensor {
    pub fn new() -> Result<Self> {
        Self::with_sysfs_root("/sys")
    }

    pub fn with_sysfs_root<P: AsRef<Path>>(sysfs_root: P) -> Result<Self> {
        let proc_reader = procfs::ProcReader::new();
        // Make sure procfs is usable before the control loop depends on it.
        proc_reader
            .read_stat()
            .context("Failed to read /proc/stat")?
            .total_cpu
            .ok_or_else(|| anyhow!("Could not read total cpu stat in proc"))?;

        Ok(Self {
            proc_reader,
            sysfs_root: sysfs_root.as_ref().to_path_buf(),
            cpu_window: DEFAULT_CPU_WINDOW,
            started_at: Instant::now(),
            warned_no_temp: false,
        })
    }

    pub fn set_cpu_window(&mut self, window: Duration) {
        self.cpu_window = window;
    }

    fn read_total_cpu(&self) -> Result<procfs::CpuStat> {
        self.proc_reader
            .read_stat()
            .context("Failed to read procfs")?
            .total_cpu
            .ok_or_else(|| anyhow!("Could not read total cpu stat in proc"))
    }

    fn cpu_percent(&self) -> Result<f64> {
        let prev = self.read_total_cpu()?;
        std::thread::sleep(self.cpu_window);
        let curr = self.read_total_cpu()?;
        Ok(calc_util(&curr, &prev)? * 100.0)
    }

    fn memory_percent(&self) -> Result<f64> {
        let meminfo = self
            .proc_reader
            .read_meminfo()
            .context("Failed to read /proc/meminfo")?;
        calc_memory_percent(&meminfo)
    }
}

impl SensorSource for SysSensor {
    fn sample(&mut self) -> std::result::Result<SystemStatus, SensorError> {
        let cpu_percent = self.cpu_percent().map_err(SensorError::Cpu)?;
        let memory_percent = self.memory_percent().map_err(SensorError::Memory)?;
        Ok(SystemStatus {
            temperature: self.temperature(),
            cpu_percent,
            memory_percent,
            runtime: self.started_at.elapsed().as_secs(),
        })
    }

    fn temperature(&mut self) -> f64 {
        match read_temperature(&self.sysfs_root) {
            Some(temp) => temp,
            None => {
                if !self.warned_no_temp {
                    warn!(
                        "No temperature sensor found under {}, reporting {}",
                        self.sysfs_root.display(),
                        UNKNOWN_TEMPERATURE
                    );
                    self.warned_no_temp = true;
                }
                debug!("temperature unavailable");
                UNKNOWN_TEMPERATURE
            }
        }
    }
}

/// Replays a fixed list of temperatures, one per sample. `None` entries
/// produce a sampling failure. The last reading repeats once the script is
/// exhausted.
pub struct ScriptedSensor {
    script: VecDeque<Option<f64>>,
    last: f64,
    samples: u64,
}

impl ScriptedSensor {
    pub fn new<I: IntoIterator<Item = Option<f64>>>(script: I) -> Self {
        Self {
            script: script.into_iter().collect(),
            last: UNKNOWN_TEMPERATURE,
            samples: 0,
        }
    }

    pub fn from_temps(temps: &[f64]) -> Self {
        Self::new(temps.iter().map(|t| Some(*t)))
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl SensorSource for ScriptedSensor {
    fn sample(&mut self) -> std::result::Result<SystemStatus, SensorError> {
        self.samples += 1;
        let temperature = match self.script.pop_front() {
            Some(Some(temp)) => temp,
            Some(None) => return Err(SensorError::Cpu(anyhow!("scripted sampling failure"))),
            None => self.last,
        };
        self.last = temperature;
        Ok(SystemStatus {
            temperature,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            runtime: self.samples,
        })
    }

    fn temperature(&mut self) -> f64 {
        self.last
    }
}
