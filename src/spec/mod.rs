//! Spec assembly
//!
//! Builds the OCI runtime spec for a container from the image configuration,
//! the user's flags and the host defaults. Assembly is a pure function of its
//! inputs: side effects (volume creation, host directories, snapshot
//! preparation) happen before [`assemble`] is called and are handed in as
//! resolved values.

pub mod defaults;
pub mod env;
pub mod mounts;
pub mod resources;
pub mod security;
pub mod user;

pub use mounts::{secure_join, MountKind, MountPoint, MountRequests, ResolvedMounts};
pub use resources::ResourceOptions;
pub use security::SecurityOptions;
pub use user::{ResolvedUser, RootfsView};

use crate::config::CgroupManager;
use crate::error::{CtlError, Result};
use crate::image::ImageConfig;
use crate::network::hook::HookEvent;
use crate::network::NetworkMode;
use oci_spec::runtime::{
    Hook, HookBuilder, HooksBuilder, LinuxBuilder, LinuxNamespaceBuilder, LinuxNamespaceType,
    Process, ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// How the container reaches the network, plus the files runectl manages
/// for it
#[derive(Debug, Clone)]
pub struct NetworkSetup {
    pub mode: NetworkMode,
    /// `/proc/<pid>/ns/net` of the target in `container:` mode
    pub join_netns: Option<PathBuf>,
    pub hosts: Option<PathBuf>,
    pub resolv_conf: Option<PathBuf>,
    pub hostname_file: Option<PathBuf>,
}

impl Default for NetworkSetup {
    fn default() -> Self {
        Self {
            mode: NetworkMode::None,
            join_netns: None,
            hosts: None,
            resolv_conf: None,
            hostname_file: None,
        }
    }
}

/// Command the runtime runs for the network hooks
#[derive(Debug, Clone)]
pub struct HookCommand {
    pub path: PathBuf,
    /// Global flags that must reach the hook process
    pub args: Vec<String>,
}

impl HookCommand {
    fn hook(&self, event: HookEvent) -> Result<Hook> {
        let mut args = vec![self.path.display().to_string()];
        args.extend(self.args.iter().cloned());
        args.extend([
            "internal".to_string(),
            "oci-hook".to_string(),
            event.as_str().to_string(),
        ]);
        Ok(HookBuilder::default()
            .path(self.path.clone())
            .args(args)
            .build()?)
    }
}

/// Everything the assembler needs
#[derive(Debug, Clone, Default)]
pub struct SpecOptions {
    pub id: String,
    pub namespace: String,
    pub image: ImageConfig,
    pub rootfs: RootfsView,
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub group_add: Vec<String>,
    pub tty: bool,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub read_only: bool,
    pub shm_size: Option<String>,
    pub mounts: Vec<MountPoint>,
    pub network: NetworkSetup,
    pub resources: ResourceOptions,
    pub security: SecurityOptions,
    pub cgroup_manager: Option<CgroupManager>,
    pub hook: Option<HookCommand>,
    pub annotations: BTreeMap<String, String>,
    pub host_cpus: usize,
}

/// Combine `--entrypoint`, positional args and the image's Entrypoint/Cmd
///
/// `--entrypoint` replaces the image entrypoint and drops the image cmd;
/// `--entrypoint ""` means no entrypoint at all.
pub fn process_args(
    entrypoint: Option<&str>,
    user_args: &[String],
    image: &ImageConfig,
) -> Result<Vec<String>> {
    let (entry, cmd): (Vec<String>, Vec<String>) = match entrypoint {
        Some("") => (Vec::new(), user_args.to_vec()),
        Some(ep) => (vec![ep.to_string()], user_args.to_vec()),
        None if user_args.is_empty() => (image.entrypoint.clone(), image.cmd.clone()),
        None => (image.entrypoint.clone(), user_args.to_vec()),
    };
    let argv: Vec<String> = entry.into_iter().chain(cmd).collect();
    if argv.is_empty() {
        return Err(CtlError::usage(
            "no command specified: the image has no Entrypoint or Cmd and none was given",
        ));
    }
    Ok(argv)
}

/// Hostname the container sees, if any
///
/// Host and container network modes keep the hostname they share unless the
/// user asked for one.
pub fn hostname_for(id: &str, requested: Option<&str>, mode: &NetworkMode) -> Option<String> {
    if let Some(name) = requested.filter(|h| !h.is_empty()) {
        return Some(name.to_string());
    }
    match mode {
        NetworkMode::Host | NetworkMode::Container(_) => None,
        _ => Some(crate::error::short_id(id).to_string()),
    }
}

fn working_dir(requested: Option<&str>, image: &ImageConfig) -> Result<PathBuf> {
    let dir = requested
        .filter(|w| !w.is_empty())
        .or(image.working_dir.as_deref().filter(|w| !w.is_empty()))
        .unwrap_or("/");
    if !dir.starts_with('/') {
        return Err(CtlError::usage(format!(
            "the working directory {:?} is invalid, it needs to be an absolute path",
            dir
        )));
    }
    Ok(PathBuf::from(dir))
}

/// Assemble the runtime spec
pub fn assemble(opts: &SpecOptions) -> Result<Spec> {
    let argv = process_args(opts.entrypoint.as_deref(), &opts.args, &opts.image)?;
    let hostname = hostname_for(&opts.id, opts.hostname.as_deref(), &opts.network.mode);

    let user_spec = opts.user.as_deref().or(opts.image.user.as_deref());
    let user = user::resolve(user_spec, &opts.rootfs, &opts.group_add)?;

    let mut extra = Vec::new();
    if let Some(hostname) = &hostname {
        extra.push(format!("HOSTNAME={}", hostname));
    }
    if opts.tty {
        extra.push("TERM=xterm".to_string());
    }
    if !opts.image.env.iter().any(|e| e.starts_with("HOME=")) {
        extra.push(format!("HOME={}", user.home.as_deref().unwrap_or("/")));
    }
    let environment = env::build(&opts.image.env, &opts.env_files, &opts.env, &extra)?;

    let privileged = opts.security.privileged;
    let profile = security::parse_security_opts(&opts.security.security_opt)?;
    let cap_names = security::capability_names(
        privileged,
        &opts.security.cap_add,
        &opts.security.cap_drop,
    );

    let mut process = ProcessBuilder::default()
        .terminal(opts.tty)
        .args(argv)
        .env(environment)
        .cwd(working_dir(opts.workdir.as_deref(), &opts.image)?)
        .user(
            UserBuilder::default()
                .uid(user.uid)
                .gid(user.gid)
                .additional_gids(user.additional_gids.clone())
                .build()?,
        )
        .capabilities(security::capabilities(&cap_names)?)
        .rlimits(defaults::rlimits()?)
        .no_new_privileges(profile.no_new_privileges);
    if !privileged {
        if let Some(apparmor) = &profile.apparmor {
            process = process.apparmor_profile(apparmor.clone());
        }
    }
    if let Some(label) = &profile.selinux_label {
        process = process.selinux_label(label.clone());
    }

    let shm_size = match &opts.shm_size {
        Some(size) => resources::parse_size(size)? as u64,
        None => defaults::DEFAULT_SHM_SIZE,
    };
    let mut oci_mounts: Vec<_> = defaults::mounts(shm_size, !privileged)?
        .into_iter()
        .filter(|m| !opts.mounts.iter().any(|u| &u.destination == m.destination()))
        .collect();
    let managed = [
        (&opts.network.hosts, "/etc/hosts"),
        (&opts.network.resolv_conf, "/etc/resolv.conf"),
        (&opts.network.hostname_file, "/etc/hostname"),
    ];
    for (source, destination) in managed {
        if let Some(source) = source {
            if !opts.mounts.iter().any(|u| u.destination == PathBuf::from(destination)) {
                oci_mounts.push(mounts::file_bind(source, destination, opts.read_only)?);
            }
        }
    }
    for mount in &opts.mounts {
        oci_mounts.push(mounts::to_oci(mount)?);
    }
    // Parents before children; the sort is stable so equal depths keep
    // their order.
    oci_mounts.sort_by_key(|m| m.destination().components().count());

    let mut namespaces = defaults::namespaces()?;
    match &opts.network.mode {
        NetworkMode::Host => {}
        NetworkMode::Container(target) => {
            let path = opts.network.join_netns.clone().ok_or_else(|| {
                CtlError::internal(format!("no network namespace path for container:{}", target))
            })?;
            namespaces.push(
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::Network)
                    .path(path)
                    .build()?,
            );
        }
        NetworkMode::None | NetworkMode::Named(_) => namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .build()?,
        ),
    }
    if hostname.is_some() || opts.network.mode != NetworkMode::Host {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Uts)
                .build()?,
        );
    }

    let host_network = opts.network.mode == NetworkMode::Host;
    let sysctls: HashMap<String, String> =
        security::sysctls(&opts.security.sysctls, host_network)?
            .into_iter()
            .collect();
    let (devices, device_rules) = security::devices(&opts.security.devices, privileged)?;

    let mut linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .resources(resources::build(&opts.resources, opts.host_cpus.max(1), device_rules)?)
        .devices(devices)
        .masked_paths(security::masked_paths(privileged))
        .readonly_paths(security::readonly_paths(privileged))
        .sysctl(sysctls);
    if let Some(manager) = opts.cgroup_manager {
        if let Some(path) = resources::cgroups_path(
            manager,
            &opts.namespace,
            &opts.id,
            opts.resources.cgroup_parent.as_deref(),
        )? {
            linux = linux.cgroups_path(PathBuf::from(path));
        }
    }
    if let Some(filter) = security::seccomp(&profile.seccomp, privileged)? {
        linux = linux.seccomp(filter);
    }

    let mut spec = SpecBuilder::default()
        .version(defaults::OCI_VERSION)
        .root(
            RootBuilder::default()
                .path(PathBuf::from("rootfs"))
                .readonly(opts.read_only)
                .build()?,
        )
        .mounts(oci_mounts)
        .process(process.build()?)
        .annotations(
            opts.annotations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        )
        .linux(linux.build()?);
    if let (Some(hook), NetworkMode::Named(_)) = (&opts.hook, &opts.network.mode) {
        spec = spec.hooks(
            HooksBuilder::default()
                .create_runtime(vec![hook.hook(HookEvent::CreateRuntime)?])
                .poststop(vec![hook.hook(HookEvent::Poststop)?])
                .build()?,
        );
    }
    let mut spec = spec.build()?;
    // The builder starts from a spec that already carries a hostname.
    spec.set_hostname(hostname);
    spec.set_domainname(
        opts.domainname
            .clone()
            .filter(|d| !d.is_empty()),
    );
    Ok(spec)
}

/// Options of `exec`
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub privileged: bool,
}

/// Process for `exec`, derived from the container's init process
///
/// The new process inherits environment, capabilities and security profile;
/// `--user` is resolved against the container's rootfs just like at create.
pub fn exec_process(base: &Process, opts: &ExecOptions, rootfs: &RootfsView) -> Result<Process> {
    if opts.args.is_empty() {
        return Err(CtlError::usage("exec requires at least one argument"));
    }
    let mut layers = base.env().clone().unwrap_or_default();
    if opts.tty {
        layers.push("TERM=xterm".to_string());
    }
    layers.extend(env::user_entries(&opts.env_files, &opts.env)?);
    let environment = env::merge(layers);

    let mut builder = ProcessBuilder::default()
        .terminal(opts.tty)
        .args(opts.args.clone())
        .env(environment)
        .no_new_privileges(base.no_new_privileges().clone().unwrap_or(false));

    builder = match opts.workdir.as_deref().filter(|w| !w.is_empty()) {
        Some(dir) if dir.starts_with('/') => builder.cwd(PathBuf::from(dir)),
        Some(dir) => {
            return Err(CtlError::usage(format!(
                "the working directory {:?} is invalid, it needs to be an absolute path",
                dir
            )))
        }
        None => builder.cwd(base.cwd().clone()),
    };

    builder = match opts.user.as_deref() {
        Some(spec) => {
            let user = user::resolve(Some(spec), rootfs, &[])?;
            builder.user(
                UserBuilder::default()
                    .uid(user.uid)
                    .gid(user.gid)
                    .additional_gids(user.additional_gids)
                    .build()?,
            )
        }
        None => builder.user(base.user().clone()),
    };

    let capabilities = if opts.privileged {
        Some(security::capabilities(&security::capability_names(true, &[], &[]))?)
    } else {
        base.capabilities().clone()
    };
    if let Some(capabilities) = capabilities {
        builder = builder.capabilities(capabilities);
    }
    if let Some(profile) = base.apparmor_profile().clone() {
        builder = builder.apparmor_profile(profile);
    }
    if let Some(label) = base.selinux_label().clone() {
        builder = builder.selinux_label(label);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
        ImageConfig {
            entrypoint: entrypoint.iter().map(|s| s.to_string()).collect(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            env: vec!["PATH=/usr/bin:/bin".to_string(), "LANG=C".to_string()],
            ..Default::default()
        }
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_entrypoint_cmd_merge() {
        let img = image(&["/entry.sh"], &["serve", "--port", "80"]);
        assert_eq!(
            process_args(None, &[], &img).unwrap(),
            strings(&["/entry.sh", "serve", "--port", "80"])
        );
        assert_eq!(
            process_args(None, &strings(&["shell"]), &img).unwrap(),
            strings(&["/entry.sh", "shell"])
        );
        assert_eq!(
            process_args(Some("/bin/sh"), &[], &img).unwrap(),
            strings(&["/bin/sh"])
        );
        assert_eq!(
            process_args(Some(""), &strings(&["ls", "-l"]), &img).unwrap(),
            strings(&["ls", "-l"])
        );
        assert!(process_args(Some(""), &[], &img).is_err());
        assert!(process_args(None, &[], &image(&[], &[])).is_err());
    }

    #[test]
    fn test_hostname_rules() {
        let id = "0123456789abcdef";
        assert_eq!(
            hostname_for(id, None, &NetworkMode::Named(vec!["bridge".into()])).as_deref(),
            Some("0123456789ab")
        );
        assert_eq!(hostname_for(id, None, &NetworkMode::Host), None);
        assert_eq!(
            hostname_for(id, Some("web"), &NetworkMode::Host).as_deref(),
            Some("web")
        );
    }

    fn options(temp: &tempfile::TempDir) -> SpecOptions {
        SpecOptions {
            id: "0123456789abcdef".into(),
            namespace: "default".into(),
            image: image(&[], &["sh"]),
            rootfs: RootfsView::dir(temp.path()),
            host_cpus: 4,
            cgroup_manager: Some(CgroupManager::Cgroupfs),
            network: NetworkSetup {
                mode: NetworkMode::Named(vec!["bridge".into()]),
                hosts: Some(temp.path().join("hosts")),
                ..Default::default()
            },
            hook: Some(HookCommand {
                path: PathBuf::from("/usr/local/bin/runectl"),
                args: strings(&["--data-root", "/var/lib/runectl"]),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_assemble_named_network() {
        let temp = tempdir().unwrap();
        let mut opts = options(&temp);
        opts.env = strings(&["LANG=en_US.UTF-8"]);
        let spec = assemble(&opts).unwrap();
        let json = serde_json::to_value(&spec).unwrap();

        assert_eq!(json["hostname"], "0123456789ab");
        assert_eq!(json["process"]["args"], serde_json::json!(["sh"]));
        let env: Vec<String> = serde_json::from_value(json["process"]["env"].clone()).unwrap();
        assert!(env.contains(&"LANG=en_US.UTF-8".to_string()));
        assert!(env.contains(&"HOSTNAME=0123456789ab".to_string()));
        assert!(env.contains(&"HOME=/".to_string()));
        assert_eq!(json["linux"]["cgroupsPath"], "/default/0123456789abcdef");

        let hook = &json["hooks"]["createRuntime"][0];
        assert_eq!(hook["path"], "/usr/local/bin/runectl");
        assert_eq!(
            hook["args"],
            serde_json::json!([
                "/usr/local/bin/runectl",
                "--data-root",
                "/var/lib/runectl",
                "internal",
                "oci-hook",
                "createRuntime"
            ])
        );
        assert_eq!(json["hooks"]["poststop"][0]["args"][5], "postStop");

        let namespaces: Vec<String> = json["linux"]["namespaces"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["type"].as_str().unwrap().to_string())
            .collect();
        assert!(namespaces.contains(&"network".to_string()));
        assert!(namespaces.contains(&"uts".to_string()));

        let destinations: Vec<&str> = json["mounts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["destination"].as_str().unwrap())
            .collect();
        assert!(destinations.contains(&"/etc/hosts"));

        // Identical inputs give an identical spec.
        assert_eq!(spec, assemble(&opts).unwrap());
    }

    #[test]
    fn test_assemble_host_mode() {
        let temp = tempdir().unwrap();
        let mut opts = options(&temp);
        opts.network.mode = NetworkMode::Host;
        opts.security.sysctls = strings(&["net.core.somaxconn=1024"]);
        assert!(assemble(&opts).is_err());

        opts.security.sysctls.clear();
        let json = serde_json::to_value(assemble(&opts).unwrap()).unwrap();
        assert!(json.get("hostname").map(|h| h.is_null()).unwrap_or(true));
        assert!(json.get("hooks").map(|h| h.is_null()).unwrap_or(true));
        assert!(json.get("domainname").map(|d| d.is_null()).unwrap_or(true));
        let namespaces = json["linux"]["namespaces"].as_array().unwrap();
        assert!(!namespaces.iter().any(|n| n["type"] == "network"));

        opts.hostname = Some("web".into());
        opts.domainname = Some("example.com".into());
        let spec = assemble(&opts).unwrap();
        assert_eq!(spec.hostname().as_deref(), Some("web"));
        assert_eq!(spec.domainname().as_deref(), Some("example.com"));
    }

    #[test]
    fn test_container_mode_has_no_hostname() {
        let temp = tempdir().unwrap();
        let mut opts = options(&temp);
        opts.network.mode = NetworkMode::Container("db".into());
        opts.network.join_netns = Some(PathBuf::from("/proc/42/ns/net"));
        let spec = assemble(&opts).unwrap();
        assert_eq!(spec.hostname(), &None);
        assert_eq!(spec.domainname(), &None);
    }

    #[test]
    fn test_mounts_are_ordered_parents_first() {
        let temp = tempdir().unwrap();
        let mut opts = options(&temp);
        opts.network.resolv_conf = Some(temp.path().join("resolv.conf"));
        opts.network.hostname_file = Some(temp.path().join("hostname"));
        opts.mounts = vec![MountPoint {
            kind: MountKind::Bind,
            name: String::new(),
            source: temp.path().join("etcdir"),
            destination: PathBuf::from("/etc"),
            rw: true,
            options: Vec::new(),
        }];
        let spec = assemble(&opts).unwrap();
        let destinations: Vec<PathBuf> = spec
            .mounts()
            .clone()
            .unwrap()
            .iter()
            .map(|m| m.destination().clone())
            .collect();
        let position = |path: &str| {
            destinations
                .iter()
                .position(|d| d == &PathBuf::from(path))
                .unwrap()
        };
        assert!(position("/etc") < position("/etc/hosts"));
        assert!(position("/etc") < position("/etc/resolv.conf"));
        assert!(position("/etc") < position("/etc/hostname"));
        assert!(position("/dev") < position("/dev/pts"));
        let depths: Vec<usize> = destinations.iter().map(|d| d.components().count()).collect();
        let mut sorted = depths.clone();
        sorted.sort();
        assert_eq!(depths, sorted);
    }

    #[test]
    fn test_assemble_privileged_and_user() {
        let temp = tempdir().unwrap();
        let mut opts = options(&temp);
        opts.security.privileged = true;
        opts.user = Some("1000:1000".into());
        opts.read_only = true;
        let json = serde_json::to_value(assemble(&opts).unwrap()).unwrap();
        assert_eq!(json["process"]["user"]["uid"], 1000);
        assert!(json["linux"].get("seccomp").map(|s| s.is_null()).unwrap_or(true));
        assert_eq!(
            json["process"]["capabilities"]["bounding"].as_array().unwrap().len(),
            security::ALL_CAPABILITIES.len()
        );
        assert_eq!(json["root"]["readonly"], true);

        opts.user = Some("app".into());
        assert!(matches!(assemble(&opts), Err(CtlError::UserNotFound(_))));
    }

    #[test]
    fn test_exec_inherits_base() {
        let temp = tempdir().unwrap();
        let spec = assemble(&options(&temp)).unwrap();
        let base = spec.process().clone().unwrap();
        let process = exec_process(
            &base,
            &ExecOptions {
                args: strings(&["echo", "success"]),
                env: strings(&["EXTRA=1"]),
                ..Default::default()
            },
            &RootfsView::dir(temp.path()),
        )
        .unwrap();
        let env = process.env().clone().unwrap();
        assert!(env.contains(&"EXTRA=1".to_string()));
        assert!(env.contains(&"LANG=C".to_string()));
        assert_eq!(process.capabilities(), base.capabilities());
        assert!(exec_process(&base, &ExecOptions::default(), &RootfsView::default()).is_err());
    }
}
