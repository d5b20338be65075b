// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::warn;

const CPU_ONLINE_PATH: &str = "/sys/devices/system/cpu/online";

/// Count the CPUs in a kernel cpulist such as "0-3,8,10-11".
pub fn parse_cpulist(list: &str) -> Result<usize> {
    let list = list.trim_end_matches('\0').trim();
    if list.is_empty() {
        bail!("Empty cpulist");
    }

    let mut nr_cpus = 0;
    for group in list.split(',') {
        let group = group.trim();
        let (min, max) = match group.split_once('-') {
            Some((lo, hi)) => (lo.trim().parse::<usize>(), hi.trim().parse::<usize>()),
            None => (group.parse::<usize>(), group.parse::<usize>()),
        };
        let (min, max) = match (min, max) {
            (Ok(min), Ok(max)) if min <= max => (min, max),
            _ => bail!("Failed to parse online cpus {}", group),
        };
        nr_cpus += max - min + 1;
    }
    Ok(nr_cpus)
}

fn read_cpulist(path: &Path) -> Result<usize> {
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open or read file {:?}", path))?;
    parse_cpulist(&val)
}

fn sysconf_online_cpus() -> Option<usize> {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret > 0 {
        Some(ret as usize)
    } else {
        None
    }
}

/// Number of online logical CPUs. Falls back to sysconf and finally to 1.
pub fn nr_cpus_online() -> usize {
    match read_cpulist(Path::new(CPU_ONLINE_PATH)) {
        Ok(nr) if nr > 0 => nr,
        res => {
            if let Err(e) = res {
                warn!("{:#}, falling back to sysconf", e);
            }
            sysconf_online_cpus().unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-7\n").unwrap(), 8);
        assert_eq!(parse_cpulist("0").unwrap(), 1);
        assert_eq!(parse_cpulist("0-3,8,10-11").unwrap(), 7);
    }

    #[test]
    fn test_parse_cpulist_invalid() {
        assert!(parse_cpulist("").is_err());
        assert!(parse_cpulist("3-1").is_err());
        assert!(parse_cpulist("a-b").is_err());
    }

    #[test]
    fn test_nr_cpus_online() {
        assert!(nr_cpus_online() >= 1);
    }
}
