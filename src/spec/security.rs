//! Capabilities, security profiles, devices and sysctls

use super::defaults::{DEFAULT_CAPABILITIES, DEFAULT_MASKED_PATHS, DEFAULT_READONLY_PATHS};
use crate::error::{CtlError, Result};
use oci_spec::runtime::{
    Capability, LinuxCapabilities, LinuxCapabilitiesBuilder, LinuxDevice, LinuxDeviceBuilder,
    LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxDeviceType, LinuxSeccomp,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// Every capability a privileged container receives
pub const ALL_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_PERFMON",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

/// Security flags as typed by the user
#[derive(Debug, Clone, Default)]
pub struct SecurityOptions {
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub devices: Vec<String>,
    pub sysctls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SeccompProfile {
    #[default]
    Default,
    Unconfined,
    File(PathBuf),
}

/// Parsed `--security-opt` values
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityProfile {
    pub seccomp: SeccompProfile,
    pub apparmor: Option<String>,
    pub selinux_label: Option<String>,
    pub no_new_privileges: bool,
}

pub fn parse_security_opts(opts: &[String]) -> Result<SecurityProfile> {
    let mut profile = SecurityProfile::default();
    for opt in opts {
        let (key, value) = opt
            .split_once('=')
            .or_else(|| opt.split_once(':'))
            .unwrap_or((opt.as_str(), ""));
        match key {
            "seccomp" => {
                profile.seccomp = match value {
                    "unconfined" => SeccompProfile::Unconfined,
                    "" => return Err(CtlError::usage("seccomp requires a profile or \"unconfined\"")),
                    path => SeccompProfile::File(PathBuf::from(path)),
                }
            }
            "apparmor" => {
                profile.apparmor = match value {
                    "" => return Err(CtlError::usage("apparmor requires a profile name")),
                    "unconfined" => None,
                    name => Some(name.to_string()),
                }
            }
            "label" => {
                profile.selinux_label = match value {
                    "disable" | "" => None,
                    label => Some(label.to_string()),
                }
            }
            "no-new-privileges" => {
                profile.no_new_privileges = match value {
                    "" | "true" => true,
                    "false" => false,
                    other => {
                        return Err(CtlError::usage(format!(
                            "invalid no-new-privileges value {:?}",
                            other
                        )))
                    }
                }
            }
            other => {
                return Err(CtlError::usage(format!(
                    "unknown security option {:?}",
                    other
                )))
            }
        }
    }
    Ok(profile)
}

fn normalize_cap(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    if upper == "ALL" || upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    }
}

/// Effective capability names after privileged handling, then drops, then adds
pub fn capability_names(privileged: bool, add: &[String], drop: &[String]) -> Vec<String> {
    let base: &[&str] = if privileged {
        ALL_CAPABILITIES
    } else {
        DEFAULT_CAPABILITIES
    };
    let mut caps: Vec<String> = base.iter().map(|c| c.to_string()).collect();

    let drop: Vec<String> = drop.iter().map(|c| normalize_cap(c)).collect();
    if drop.iter().any(|c| c == "ALL") {
        caps.clear();
    } else {
        caps.retain(|c| !drop.contains(c));
    }

    for cap in add.iter().map(|c| normalize_cap(c)) {
        if cap == "ALL" {
            for all in ALL_CAPABILITIES {
                if !caps.iter().any(|c| c == all) {
                    caps.push(all.to_string());
                }
            }
        } else if !caps.contains(&cap) {
            caps.push(cap);
        }
    }
    caps.sort();
    caps
}

pub fn capabilities(names: &[String]) -> Result<LinuxCapabilities> {
    let mut set = HashSet::new();
    for name in names {
        let cap: Capability = serde_json::from_value(json!(name))
            .map_err(|_| CtlError::usage(format!("unknown capability {:?}", name)))?;
        set.insert(cap);
    }
    Ok(LinuxCapabilitiesBuilder::default()
        .bounding(set.clone())
        .effective(set.clone())
        .permitted(set)
        .build()?)
}

/// Seccomp filter for the container, `None` when unconfined
pub fn seccomp(profile: &SeccompProfile, privileged: bool) -> Result<Option<LinuxSeccomp>> {
    if privileged {
        return Ok(None);
    }
    match profile {
        SeccompProfile::Unconfined => Ok(None),
        SeccompProfile::File(path) => {
            let data = std::fs::read(path).map_err(|e| {
                CtlError::usage(format!(
                    "failed to read seccomp profile {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Ok(Some(serde_json::from_slice(&data)?))
        }
        SeccompProfile::Default => Ok(Some(serde_json::from_value(default_seccomp())?)),
    }
}

/// Default filter: allow everything except syscalls that escape or
/// reconfigure the host
fn default_seccomp() -> serde_json::Value {
    json!({
        "defaultAction": "SCMP_ACT_ALLOW",
        "syscalls": [{
            "names": [
                "acct", "add_key", "bpf", "clock_adjtime", "clock_settime", "create_module",
                "delete_module", "finit_module", "get_kernel_syms", "get_mempolicy",
                "init_module", "ioperm", "iopl", "kcmp", "kexec_file_load", "kexec_load",
                "keyctl", "lookup_dcookie", "mbind", "mount", "move_pages", "name_to_handle_at",
                "nfsservctl", "open_by_handle_at", "perf_event_open", "personality",
                "pivot_root", "process_vm_readv", "process_vm_writev", "ptrace",
                "query_module", "quotactl", "reboot", "request_key", "set_mempolicy",
                "setns", "settimeofday", "stime", "swapoff", "swapon", "sysfs",
                "umount", "umount2", "unshare", "uselib", "userfaultfd", "ustat",
                "vm86", "vm86old"
            ],
            "action": "SCMP_ACT_ERRNO",
            "errnoRet": 1
        }]
    })
}

pub fn masked_paths(privileged: bool) -> Vec<String> {
    if privileged {
        return Vec::new();
    }
    DEFAULT_MASKED_PATHS.iter().map(|p| p.to_string()).collect()
}

pub fn readonly_paths(privileged: bool) -> Vec<String> {
    if privileged {
        return Vec::new();
    }
    DEFAULT_READONLY_PATHS.iter().map(|p| p.to_string()).collect()
}

/// A parsed `--device host[:container[:perms]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub host: PathBuf,
    pub container: PathBuf,
    pub access: String,
}

pub fn parse_device(value: &str) -> Result<DeviceRequest> {
    let parts: Vec<&str> = value.split(':').collect();
    let valid_access = |s: &str| !s.is_empty() && s.chars().all(|c| matches!(c, 'r' | 'w' | 'm'));
    let (host, container, access) = match parts.as_slice() {
        [host] => (*host, *host, "rwm"),
        [host, second] if valid_access(second) => (*host, *host, *second),
        [host, container] => (*host, *container, "rwm"),
        [host, container, access] if valid_access(access) => (*host, *container, *access),
        _ => return Err(CtlError::usage(format!("invalid device specification {:?}", value))),
    };
    if !host.starts_with('/') || !container.starts_with('/') {
        return Err(CtlError::usage(format!(
            "invalid device specification {:?}: paths must be absolute",
            value
        )));
    }
    Ok(DeviceRequest {
        host: PathBuf::from(host),
        container: PathBuf::from(container),
        access: access.to_string(),
    })
}

fn device_node(request: &DeviceRequest) -> Result<(LinuxDevice, LinuxDeviceCgroup)> {
    let meta = std::fs::metadata(&request.host).map_err(|e| {
        CtlError::usage(format!("error gathering device information for {}: {}", request.host.display(), e))
    })?;
    let typ = if meta.file_type().is_char_device() {
        LinuxDeviceType::C
    } else if meta.file_type().is_block_device() {
        LinuxDeviceType::B
    } else {
        return Err(CtlError::usage(format!(
            "{} is not a device node",
            request.host.display()
        )));
    };
    let major = nix::sys::stat::major(meta.rdev()) as i64;
    let minor = nix::sys::stat::minor(meta.rdev()) as i64;
    let device = LinuxDeviceBuilder::default()
        .path(request.container.clone())
        .typ(typ)
        .major(major)
        .minor(minor)
        .file_mode(meta.mode() & 0o7777)
        .uid(meta.uid())
        .gid(meta.gid())
        .build()?;
    let rule = LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .major(major)
        .minor(minor)
        .access(request.access.clone())
        .build()?;
    Ok((device, rule))
}

fn rule(allow: bool, typ: Option<LinuxDeviceType>, major: Option<i64>, minor: Option<i64>, access: &str) -> Result<LinuxDeviceCgroup> {
    let mut builder = LinuxDeviceCgroupBuilder::default().allow(allow).access(access);
    if let Some(typ) = typ {
        builder = builder.typ(typ);
    }
    if let Some(major) = major {
        builder = builder.major(major);
    }
    if let Some(minor) = minor {
        builder = builder.minor(minor);
    }
    Ok(builder.build()?)
}

/// Device nodes and the cgroup device rules that go with them
pub fn devices(requests: &[String], privileged: bool) -> Result<(Vec<LinuxDevice>, Vec<LinuxDeviceCgroup>)> {
    if privileged {
        return Ok((Vec::new(), vec![rule(true, None, None, None, "rwm")?]));
    }
    let c = Some(LinuxDeviceType::C);
    let mut rules = vec![
        rule(false, None, None, None, "rwm")?,
        rule(true, c, Some(1), Some(3), "rwm")?,   // null
        rule(true, c, Some(1), Some(5), "rwm")?,   // zero
        rule(true, c, Some(1), Some(7), "rwm")?,   // full
        rule(true, c, Some(1), Some(8), "rwm")?,   // random
        rule(true, c, Some(1), Some(9), "rwm")?,   // urandom
        rule(true, c, Some(5), Some(0), "rwm")?,   // tty
        rule(true, c, Some(5), Some(2), "rwm")?,   // ptmx
        rule(true, c, Some(136), None, "rwm")?,    // pts
    ];
    let mut nodes = Vec::new();
    for value in requests {
        let (node, allow) = device_node(&parse_device(value)?)?;
        nodes.push(node);
        rules.push(allow);
    }
    Ok((nodes, rules))
}

const NAMESPACED_SYSCTL_PREFIXES: &[&str] = &["kernel.msg", "kernel.shm", "fs.mqueue.", "net."];
const NAMESPACED_SYSCTLS: &[&str] = &["kernel.sem", "kernel.domainname", "kernel.hostname"];

/// Parse `--sysctl key=value` entries
pub fn sysctls(entries: &[String], host_network: bool) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| CtlError::usage(format!("invalid sysctl {:?}, expected key=value", entry)))?;
        let key = key.trim();
        let namespaced = NAMESPACED_SYSCTLS.contains(&key)
            || NAMESPACED_SYSCTL_PREFIXES.iter().any(|p| key.starts_with(p));
        if !namespaced {
            return Err(CtlError::usage(format!(
                "sysctl {:?} is not allowed: not a namespaced kernel parameter",
                key
            )));
        }
        if host_network && key.starts_with("net.") {
            return Err(CtlError::usage(format!(
                "sysctl {:?} is not allowed in host network mode",
                key
            )));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// Reject hook and device paths that are not absolute
pub fn ensure_absolute(path: &Path, what: &str) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(CtlError::InvalidPath {
            path: path.display().to_string(),
            reason: format!("{} must be an absolute path", what),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_capability_sets() {
        let caps = capability_names(false, &strings(&["net_admin"]), &strings(&["CAP_MKNOD", "chown"]));
        assert!(caps.contains(&"CAP_NET_ADMIN".to_string()));
        assert!(!caps.contains(&"CAP_MKNOD".to_string()));
        assert!(!caps.contains(&"CAP_CHOWN".to_string()));
        assert_eq!(caps.len(), DEFAULT_CAPABILITIES.len() - 1);

        let privileged = capability_names(true, &[], &[]);
        assert_eq!(privileged.len(), ALL_CAPABILITIES.len());

        let only_kill = capability_names(false, &strings(&["KILL"]), &strings(&["ALL"]));
        assert_eq!(only_kill, vec!["CAP_KILL"]);

        let converted = capabilities(&strings(&["CAP_CHOWN", "CAP_KILL"])).unwrap();
        assert_eq!(converted.bounding().as_ref().map(|s| s.len()), Some(2));
        assert!(capabilities(&strings(&["CAP_NOT_A_THING"])).is_err());
    }

    #[test]
    fn test_security_opts() {
        let profile = parse_security_opts(&strings(&[
            "seccomp=unconfined",
            "apparmor=my-profile",
            "no-new-privileges",
            "label=disable",
        ]))
        .unwrap();
        assert_eq!(profile.seccomp, SeccompProfile::Unconfined);
        assert_eq!(profile.apparmor.as_deref(), Some("my-profile"));
        assert!(profile.no_new_privileges);
        assert!(profile.selinux_label.is_none());
        assert!(parse_security_opts(&strings(&["bogus=1"])).is_err());

        assert!(seccomp(&SeccompProfile::Default, false).unwrap().is_some());
        assert!(seccomp(&SeccompProfile::Default, true).unwrap().is_none());
        assert!(masked_paths(true).is_empty());
        assert!(!masked_paths(false).is_empty());
    }

    #[test]
    fn test_device_parse() {
        let d = parse_device("/dev/sda:/dev/xvda:r").unwrap();
        assert_eq!(d.container, PathBuf::from("/dev/xvda"));
        assert_eq!(d.access, "r");
        let d = parse_device("/dev/fuse:rw").unwrap();
        assert_eq!(d.container, PathBuf::from("/dev/fuse"));
        assert_eq!(d.access, "rw");
        assert!(parse_device("dev/fuse").is_err());
        assert!(parse_device("/a:/b:xyz").is_err());

        let (nodes, rules) = devices(&[], true).unwrap();
        assert!(nodes.is_empty());
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_sysctls() {
        let ok = sysctls(&strings(&["net.ipv4.ip_forward=1", "kernel.shmmax=1024"]), false).unwrap();
        assert_eq!(ok.get("net.ipv4.ip_forward").map(String::as_str), Some("1"));
        assert!(sysctls(&strings(&["net.ipv4.ip_forward=1"]), true).is_err());
        assert!(sysctls(&strings(&["vm.swappiness=10"]), false).is_err());
        assert!(sysctls(&strings(&["kernel.shmmax"]), false).is_err());
    }
}
