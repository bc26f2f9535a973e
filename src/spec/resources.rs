//! Cgroup resources and the cgroups path

use crate::config::CgroupManager;
use crate::error::{CtlError, Result};
use oci_spec::runtime::{
    LinuxCpuBuilder, LinuxDeviceCgroup, LinuxMemoryBuilder, LinuxPidsBuilder, LinuxResources,
    LinuxResourcesBuilder,
};

/// CFS period used for `--cpus`
pub const CPU_PERIOD: u64 = 100_000;

/// Resource flags as typed by the user
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    pub cpus: Option<f64>,
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,
    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub memory_reservation: Option<String>,
    pub pids_limit: Option<i64>,
    pub cgroup_parent: Option<String>,
}

/// Parse a human size (`512`, `64k`, `1.5g`, `2GiB`) in binary units
pub fn parse_size(value: &str) -> Result<i64> {
    let s = value.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| CtlError::usage(format!("invalid size: {:?}", value)))?;
    let unit = unit.trim_end_matches("ib").trim_end_matches('b');
    let multiplier: f64 = match unit {
        "" => 1.0,
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => 1024.0 * 1024.0 * 1024.0,
        "t" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(CtlError::usage(format!("invalid size: {:?}", value))),
    };
    if number < 0.0 {
        return Err(CtlError::usage(format!("invalid size: {:?}", value)));
    }
    Ok((number * multiplier) as i64)
}

/// Memory limit and memory+swap total, in bytes
///
/// `swap == memory` disables swap, an unset swap allows as much swap as
/// memory (total `2 * memory`), and `-1` means unlimited.
pub fn memory_limits(memory: Option<&str>, swap: Option<&str>) -> Result<(Option<i64>, Option<i64>)> {
    let memory = memory.map(parse_size).transpose()?;
    let swap = match swap {
        Some("-1") => Some(-1),
        Some(s) => Some(parse_size(s)?),
        None => None,
    };
    match (memory, swap) {
        (None, Some(_)) => Err(CtlError::usage(
            "--memory-swap requires --memory to be set as well",
        )),
        (Some(m), Some(s)) if s != -1 && s < m => Err(CtlError::usage(
            "--memory-swap must be larger than or equal to --memory",
        )),
        (Some(m), None) => Ok((Some(m), Some(m.saturating_mul(2)))),
        (m, s) => Ok((m, s)),
    }
}

/// Translate resource flags into cgroup settings
///
/// `device_rules` comes from the security settings so that device access and
/// limits end up in one resources block.
pub fn build(
    opts: &ResourceOptions,
    host_cpus: usize,
    device_rules: Vec<LinuxDeviceCgroup>,
) -> Result<LinuxResources> {
    let mut cpu = LinuxCpuBuilder::default();
    let mut has_cpu = false;
    if let Some(cpus) = opts.cpus {
        if !cpus.is_finite() || cpus <= 0.0 {
            return Err(CtlError::usage(format!("invalid --cpus value {}", cpus)));
        }
        if cpus > host_cpus as f64 {
            return Err(CtlError::usage(format!(
                "range of CPUs is from 0.01 to {}.00, as there are only {} CPUs available",
                host_cpus, host_cpus
            )));
        }
        cpu = cpu
            .quota((cpus * CPU_PERIOD as f64).round() as i64)
            .period(CPU_PERIOD);
        has_cpu = true;
    }
    if let Some(shares) = opts.cpu_shares {
        cpu = cpu.shares(shares);
        has_cpu = true;
    }
    if let Some(cpus) = &opts.cpuset_cpus {
        cpu = cpu.cpus(cpus.clone());
        has_cpu = true;
    }
    if let Some(mems) = &opts.cpuset_mems {
        cpu = cpu.mems(mems.clone());
        has_cpu = true;
    }

    let (limit, swap) = memory_limits(opts.memory.as_deref(), opts.memory_swap.as_deref())?;
    let reservation = opts.memory_reservation.as_deref().map(parse_size).transpose()?;

    let mut resources = LinuxResourcesBuilder::default().devices(device_rules);
    if has_cpu {
        resources = resources.cpu(cpu.build()?);
    }
    if limit.is_some() || reservation.is_some() {
        let mut memory = LinuxMemoryBuilder::default();
        if let Some(limit) = limit {
            memory = memory.limit(limit);
        }
        if let Some(swap) = swap {
            memory = memory.swap(swap);
        }
        if let Some(reservation) = reservation {
            memory = memory.reservation(reservation);
        }
        resources = resources.memory(memory.build()?);
    }
    if let Some(pids) = opts.pids_limit {
        if pids != 0 {
            resources = resources.pids(LinuxPidsBuilder::default().limit(pids).build()?);
        }
    }
    Ok(resources.build()?)
}

/// Cgroups path handed to the runtime, if any
pub fn cgroups_path(
    manager: CgroupManager,
    namespace: &str,
    id: &str,
    parent: Option<&str>,
) -> Result<Option<String>> {
    match manager {
        CgroupManager::None => Ok(None),
        CgroupManager::Cgroupfs => {
            let parent = parent.unwrap_or("").trim_end_matches('/');
            if parent.is_empty() {
                Ok(Some(format!("/{}/{}", namespace, id)))
            } else {
                Ok(Some(format!("{}/{}", parent, id)))
            }
        }
        CgroupManager::Systemd => {
            let slice = parent.filter(|p| !p.is_empty()).unwrap_or("system.slice");
            if !slice.ends_with(".slice") {
                return Err(CtlError::usage(format!(
                    "cgroup-parent for systemd cgroup should be a valid slice named as \"xxx.slice\", got {:?}",
                    slice
                )));
            }
            Ok(Some(format!("{}:runectl:{}", slice, id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64k").unwrap(), 65536);
        assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_size("1.5g").unwrap(), 3 << 29);
        assert!(parse_size("12x").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_memory_swap_rules() {
        let m = 256 * 1024 * 1024;
        assert_eq!(memory_limits(Some("256m"), None).unwrap(), (Some(m), Some(2 * m)));
        assert_eq!(memory_limits(Some("256m"), Some("256m")).unwrap(), (Some(m), Some(m)));
        assert_eq!(memory_limits(Some("256m"), Some("-1")).unwrap(), (Some(m), Some(-1)));
        assert!(memory_limits(None, Some("1g")).is_err());
        assert!(memory_limits(Some("1g"), Some("256m")).is_err());
        assert_eq!(memory_limits(None, None).unwrap(), (None, None));
    }

    #[test]
    fn test_cpus_translate_to_quota() {
        let opts = ResourceOptions {
            cpus: Some(1.5),
            ..Default::default()
        };
        let resources = build(&opts, 4, Vec::new()).unwrap();
        let json = serde_json::to_value(&resources).unwrap();
        assert_eq!(json["cpu"]["quota"], 150_000);
        assert_eq!(json["cpu"]["period"], 100_000);

        let too_many = ResourceOptions {
            cpus: Some(8.0),
            ..Default::default()
        };
        assert!(build(&too_many, 4, Vec::new()).is_err());

        for bad in [f64::NAN, f64::INFINITY, -1.0] {
            let opts = ResourceOptions {
                cpus: Some(bad),
                ..Default::default()
            };
            assert!(build(&opts, 4, Vec::new()).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_cgroups_path() {
        assert_eq!(
            cgroups_path(CgroupManager::Cgroupfs, "default", "abc", None).unwrap(),
            Some("/default/abc".to_string())
        );
        assert_eq!(
            cgroups_path(CgroupManager::Systemd, "default", "abc", None).unwrap(),
            Some("system.slice:runectl:abc".to_string())
        );
        assert_eq!(
            cgroups_path(CgroupManager::Systemd, "default", "abc", Some("user.slice")).unwrap(),
            Some("user.slice:runectl:abc".to_string())
        );
        assert!(cgroups_path(CgroupManager::Systemd, "default", "abc", Some("/bad")).is_err());
        assert_eq!(cgroups_path(CgroupManager::None, "default", "abc", None).unwrap(), None);
    }
}
