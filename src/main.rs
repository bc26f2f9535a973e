//! runectl - a Docker-compatible command-line client
//!
//! This is the CLI entry point. Besides the user verbs it hosts two hidden
//! entry points the runtime calls back into: the OCI hook and the binary
//! log driver.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crossterm::{cursor::MoveTo, execute, terminal::Clear, terminal::ClearType};
use runectl::compose::{
    project_name, ComposeOrchestrator, ComposeParser, DownOptions, RunOptions, UpOptions,
};
use runectl::config::{ConfigFile, GlobalConfig, GlobalFlags};
use runectl::container::config::parse_labels;
use runectl::container::images::render_images;
use runectl::container::ps::{render_table, PsFilter};
use runectl::container::run::detach_keys;
use runectl::container::stats::render_stats;
use runectl::container::{ContainerManager, CreateOptions, ExecRequestOptions, RemoveOptions};
use runectl::error::{short_id, CtlError, Result};
use runectl::logging::{parse_timestamp, LogsOptions, LOGGING_ENTRY};
use runectl::network::hook::{self, HookEvent};
use runectl::network::NetworkCreate;
use runectl::runtime::build::BuildOptions;
use runectl::signals::SignalRouter;
use runectl::spec::mounts::MountRequests;
use runectl::spec::{ResourceOptions, SecurityOptions};
use runectl::task::LocalStdio;
use serde::Serialize;
use std::future::Future;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// runectl - Docker-compatible container client
#[derive(Parser)]
#[command(name = "runectl")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "A Docker-compatible client for containerd-style runtimes", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Enable debug logging
    #[arg(long, global = true, env = "RUNECTL_DEBUG")]
    debug: bool,
    /// Runtime daemon address
    #[arg(long, short = 'H', global = true, env = "RUNECTL_ADDRESS")]
    address: Option<String>,
    /// Namespace of the runtime daemon
    #[arg(long, global = true, env = "RUNECTL_NAMESPACE")]
    namespace: Option<String>,
    #[arg(long, global = true, env = "RUNECTL_SNAPSHOTTER")]
    snapshotter: Option<String>,
    /// cgroupfs, systemd or none
    #[arg(long, global = true, env = "RUNECTL_CGROUP_MANAGER")]
    cgroup_manager: Option<String>,
    /// Directory for client-side state
    #[arg(long, global = true, env = "RUNECTL_DATA_ROOT")]
    data_root: Option<PathBuf>,
    /// Directories holding per-registry hosts.toml files
    #[arg(long, global = true, env = "RUNECTL_HOSTS_DIR", value_delimiter = ',')]
    hosts_dir: Vec<PathBuf>,
    /// Registries reached over plain HTTP
    #[arg(long, global = true, env = "RUNECTL_INSECURE_REGISTRY", value_delimiter = ',')]
    insecure_registry: Vec<String>,
    #[arg(long, global = true, env = "RUNECTL_CNI_PATH")]
    cni_path: Option<PathBuf>,
    #[arg(long, global = true, env = "RUNECTL_CNI_NETCONFPATH")]
    cni_netconfpath: Option<PathBuf>,
    #[arg(long, global = true, env = "BUILDKIT_HOST")]
    buildkit_host: Option<String>,
}

impl GlobalArgs {
    fn flags(&self) -> GlobalFlags {
        GlobalFlags {
            debug: self.debug.then_some(true),
            address: self.address.clone(),
            namespace: self.namespace.clone(),
            snapshotter: self.snapshotter.clone(),
            cgroup_manager: self.cgroup_manager.clone(),
            data_root: self.data_root.clone(),
            hosts_dir: self.hosts_dir.clone(),
            insecure_registry: self.insecure_registry.clone(),
            cni_path: self.cni_path.clone(),
            cni_netconfpath: self.cni_netconfpath.clone(),
            buildkit_host: self.buildkit_host.clone(),
        }
    }
}

/// Flags shared by `create` and `run`
#[derive(Args, Debug, Clone)]
struct CreateArgs {
    /// Container name
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    entrypoint: Option<String>,
    /// Environment variable (KEY=VALUE or KEY)
    #[arg(short, long)]
    env: Vec<String>,
    #[arg(long)]
    env_file: Vec<PathBuf>,
    #[arg(short, long)]
    workdir: Option<String>,
    /// user[:group]
    #[arg(short, long)]
    user: Option<String>,
    #[arg(long)]
    group_add: Vec<String>,
    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    tty: bool,
    /// Keep stdin open
    #[arg(short, long)]
    interactive: bool,
    /// Key sequence that detaches from a TTY session
    #[arg(long)]
    detach_keys: Option<String>,
    /// Remove the container when it exits
    #[arg(long)]
    rm: bool,

    #[arg(long)]
    hostname: Option<String>,
    #[arg(long)]
    domainname: Option<String>,
    /// bridge, host, none, container:<name> or a network name
    #[arg(long = "network", visible_alias = "net")]
    networks: Vec<String>,
    /// [hostIP:][hostPort:]containerPort[/proto]
    #[arg(short, long)]
    publish: Vec<String>,
    #[arg(long)]
    dns: Vec<String>,
    #[arg(long)]
    dns_search: Vec<String>,
    #[arg(long = "dns-option", visible_alias = "dns-opt")]
    dns_options: Vec<String>,
    /// host:ip
    #[arg(long)]
    add_host: Vec<String>,

    /// [source:]target[:options]
    #[arg(short, long)]
    volume: Vec<String>,
    #[arg(long)]
    mount: Vec<String>,
    #[arg(long)]
    tmpfs: Vec<String>,
    #[arg(long)]
    read_only: bool,
    #[arg(long)]
    shm_size: Option<String>,

    #[arg(long)]
    cpus: Option<f64>,
    #[arg(long)]
    cpu_shares: Option<u64>,
    #[arg(long)]
    cpuset_cpus: Option<String>,
    #[arg(long)]
    cpuset_mems: Option<String>,
    #[arg(short, long)]
    memory: Option<String>,
    #[arg(long)]
    memory_swap: Option<String>,
    #[arg(long)]
    memory_reservation: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    pids_limit: Option<i64>,
    #[arg(long)]
    cgroup_parent: Option<String>,

    #[arg(long)]
    privileged: bool,
    #[arg(long)]
    cap_add: Vec<String>,
    #[arg(long)]
    cap_drop: Vec<String>,
    #[arg(long)]
    security_opt: Vec<String>,
    #[arg(long)]
    device: Vec<String>,
    #[arg(long)]
    sysctl: Vec<String>,

    #[arg(short, long)]
    label: Vec<String>,
    #[arg(long)]
    log_driver: Option<String>,
    #[arg(long)]
    log_opt: Vec<String>,
    /// no, always, on-failure[:N] or unless-stopped
    #[arg(long, default_value = "no")]
    restart: String,
    #[arg(long)]
    stop_signal: Option<String>,
    #[arg(long)]
    stop_timeout: Option<u64>,
    /// always, missing or never
    #[arg(long, default_value = "missing")]
    pull: String,
    /// os/arch[/variant]
    #[arg(long)]
    platform: Option<String>,

    /// Image to run
    image: String,
    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl CreateArgs {
    fn into_options(self, detach: bool) -> Result<CreateOptions> {
        let mut opts = CreateOptions::new(self.image, self.args);
        opts.name = self.name;
        opts.entrypoint = self.entrypoint;
        opts.env = self.env;
        opts.env_files = self.env_file;
        opts.workdir = self.workdir;
        opts.user = self.user;
        opts.group_add = self.group_add;
        opts.tty = self.tty;
        opts.interactive = self.interactive;
        opts.detach = detach;
        opts.rm = self.rm;
        opts.detach_keys = self.detach_keys;
        opts.hostname = self.hostname;
        opts.domainname = self.domainname;
        opts.networks = self.networks;
        opts.publish = self.publish;
        opts.dns = self.dns;
        opts.dns_search = self.dns_search;
        opts.dns_options = self.dns_options;
        opts.add_hosts = self.add_host;
        opts.mounts = MountRequests {
            volumes: self.volume,
            mounts: self.mount,
            tmpfs: self.tmpfs,
        };
        opts.read_only = self.read_only;
        opts.shm_size = self.shm_size;
        opts.resources = ResourceOptions {
            cpus: self.cpus,
            cpu_shares: self.cpu_shares,
            cpuset_cpus: self.cpuset_cpus,
            cpuset_mems: self.cpuset_mems,
            memory: self.memory,
            memory_swap: self.memory_swap,
            memory_reservation: self.memory_reservation,
            pids_limit: self.pids_limit,
            cgroup_parent: self.cgroup_parent,
        };
        opts.security = SecurityOptions {
            privileged: self.privileged,
            cap_add: self.cap_add,
            cap_drop: self.cap_drop,
            security_opt: self.security_opt,
            devices: self.device,
            sysctls: self.sysctl,
        };
        opts.labels = parse_labels(&self.label)?;
        opts.log_driver = self.log_driver;
        opts.log_opts = self.log_opt;
        opts.restart = self.restart.parse()?;
        opts.stop_signal = self.stop_signal;
        opts.stop_timeout = self.stop_timeout;
        opts.pull = self.pull.parse()?;
        opts.platform = self.platform;
        opts.validate()?;
        Ok(opts)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start a container
    Run {
        /// Run in the background and print the container ID
        #[arg(short, long)]
        detach: bool,
        #[command(flatten)]
        create: CreateArgs,
    },

    /// Create a container without starting it
    Create {
        #[command(flatten)]
        create: CreateArgs,
    },

    /// Start one or more stopped containers
    Start {
        /// Attach to the container's output
        #[arg(short, long)]
        attach: bool,
        #[arg(short, long)]
        interactive: bool,
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Stop one or more running containers
    Stop {
        /// Seconds to wait before killing
        #[arg(short, long)]
        time: Option<u64>,
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Restart one or more containers
    Restart {
        #[arg(short, long)]
        time: Option<u64>,
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Send a signal to running containers
    Kill {
        #[arg(short, long, default_value = "KILL")]
        signal: String,
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Pause all processes of containers
    Pause {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Resume paused containers
    Unpause {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Block until containers stop, then print their exit codes
    Wait {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Run a command in a running container
    Exec {
        #[arg(short, long)]
        detach: bool,
        #[arg(short, long)]
        interactive: bool,
        #[arg(short, long)]
        tty: bool,
        #[arg(short, long)]
        env: Vec<String>,
        #[arg(long)]
        env_file: Vec<PathBuf>,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        workdir: Option<String>,
        #[arg(long)]
        privileged: bool,
        container: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Remove one or more containers
    Rm {
        /// Kill running containers first
        #[arg(short, long)]
        force: bool,
        /// Remove anonymous volumes too
        #[arg(short, long)]
        volumes: bool,
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Rename a container
    Rename { container: String, new_name: String },

    /// Attach to a running container's output
    Attach {
        #[arg(long)]
        detach_keys: Option<String>,
        container: String,
    },

    /// Fetch the logs of a container
    Logs {
        #[arg(short, long)]
        follow: bool,
        /// Number of lines from the end, or "all"
        #[arg(short = 'n', long, default_value = "all")]
        tail: String,
        #[arg(short, long)]
        timestamps: bool,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        container: String,
    },

    /// Copy files between a container and the host
    Cp { source: String, destination: String },

    /// List containers
    Ps {
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        quiet: bool,
        #[arg(long)]
        no_trunc: bool,
        /// key=value
        #[arg(short, long)]
        filter: Vec<String>,
        /// table or json
        #[arg(long)]
        format: Option<String>,
    },

    /// Low-level information on containers
    Inspect {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Display the running processes of a container
    Top {
        container: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        ps_args: Vec<String>,
    },

    /// Live resource usage of containers
    Stats {
        #[arg(long)]
        no_stream: bool,
        #[arg(long)]
        format: Option<String>,
        containers: Vec<String>,
    },

    /// Manage networks
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },

    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// Pull an image from a registry
    Pull {
        #[arg(long)]
        platform: Option<String>,
        image: String,
    },

    /// Push an image to a registry
    Push {
        #[arg(long)]
        platform: Option<String>,
        image: String,
    },

    /// List images
    Images {
        #[arg(short, long)]
        quiet: bool,
        #[arg(long)]
        format: Option<String>,
    },

    /// Create an image from a container's changes
    Commit {
        #[arg(short, long)]
        message: Option<String>,
        #[arg(short, long)]
        author: Option<String>,
        /// Pause the container while committing
        #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set)]
        pause: bool,
        container: String,
        reference: String,
    },

    /// Build an image through the build daemon
    Build {
        /// Name and optionally tag
        #[arg(short, long)]
        tag: Vec<String>,
        /// Dockerfile path
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        build_arg: Vec<String>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        platform: Vec<String>,
        #[arg(long)]
        no_cache: bool,
        /// auto, plain or tty
        #[arg(long)]
        progress: Option<String>,
        #[arg(long)]
        label: Vec<String>,
        /// Build context path
        #[arg(default_value = ".")]
        context: PathBuf,
    },

    /// Docker Compose commands
    Compose {
        /// Compose file
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long)]
        project_name: Option<String>,
        #[arg(long)]
        project_directory: Option<PathBuf>,
        #[command(subcommand)]
        command: ComposeCommands,
    },

    #[command(hide = true)]
    Internal {
        #[command(subcommand)]
        command: InternalCommands,
    },
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// Create a network
    Create {
        #[arg(short, long, default_value = "bridge")]
        driver: String,
        #[arg(long)]
        subnet: Vec<String>,
        #[arg(long)]
        gateway: Option<String>,
        #[arg(long)]
        ip_range: Option<String>,
        /// Driver option key=value
        #[arg(short, long)]
        opt: Vec<String>,
        #[arg(long)]
        label: Vec<String>,
        name: String,
    },
    /// List networks
    #[command(name = "ls", visible_alias = "list")]
    List {
        #[arg(short, long)]
        quiet: bool,
    },
    /// Inspect networks
    Inspect {
        #[arg(required = true)]
        networks: Vec<String>,
    },
    /// Remove networks
    #[command(name = "rm", visible_alias = "remove")]
    Remove {
        #[arg(required = true)]
        networks: Vec<String>,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// Create a volume
    Create {
        #[arg(long)]
        label: Vec<String>,
        name: Option<String>,
    },
    /// List volumes
    #[command(name = "ls", visible_alias = "list")]
    List {
        #[arg(short, long)]
        quiet: bool,
    },
    /// Inspect volumes
    Inspect {
        #[arg(required = true)]
        volumes: Vec<String>,
    },
    /// Remove volumes
    #[command(name = "rm", visible_alias = "remove")]
    Remove {
        /// Remove even when containers use it
        #[arg(short, long)]
        force: bool,
        #[arg(required = true)]
        volumes: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ComposeCommands {
    /// Create and start containers
    Up {
        #[arg(short, long)]
        detach: bool,
        /// Build images before starting
        #[arg(long)]
        build: bool,
        /// always, missing or never
        #[arg(long)]
        pull: Option<String>,
        services: Vec<String>,
    },
    /// Stop and remove containers and networks
    Down {
        /// Remove named volumes
        #[arg(short, long)]
        volumes: bool,
        #[arg(long)]
        remove_orphans: bool,
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Create containers without starting them
    Create {
        #[arg(long)]
        build: bool,
        #[arg(long)]
        pull: Option<String>,
        services: Vec<String>,
    },
    /// Start existing containers
    Start { services: Vec<String> },
    /// Stop services
    Stop {
        #[arg(short, long)]
        timeout: Option<u64>,
        services: Vec<String>,
    },
    /// Restart services
    Restart {
        #[arg(short, long)]
        timeout: Option<u64>,
        services: Vec<String>,
    },
    /// List containers
    Ps {
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        quiet: bool,
        #[arg(long)]
        format: Option<String>,
        services: Vec<String>,
    },
    /// Run a one-off command on a service
    Run {
        #[arg(short, long)]
        detach: bool,
        #[arg(long)]
        rm: bool,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        entrypoint: Option<String>,
        #[arg(short, long)]
        env: Vec<String>,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        workdir: Option<String>,
        /// Disable pseudo-TTY allocation
        #[arg(short = 'T', long = "no-TTY")]
        no_tty: bool,
        #[arg(long)]
        no_deps: bool,
        #[arg(long)]
        service_ports: bool,
        service: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Execute a command in a running service container
    Exec {
        #[arg(short, long)]
        detach: bool,
        #[arg(short, long)]
        env: Vec<String>,
        #[arg(short, long)]
        user: Option<String>,
        #[arg(short, long)]
        workdir: Option<String>,
        #[arg(long)]
        privileged: bool,
        /// Disable pseudo-TTY allocation
        #[arg(short = 'T', long = "no-TTY")]
        no_tty: bool,
        /// Replica to run in
        #[arg(long, default_value_t = 1)]
        index: u32,
        service: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// View output from containers
    Logs {
        #[arg(short, long)]
        follow: bool,
        #[arg(short = 'n', long, default_value = "all")]
        tail: String,
        #[arg(short, long)]
        timestamps: bool,
        services: Vec<String>,
    },
}

#[derive(Subcommand)]
enum InternalCommands {
    /// OCI runtime hook
    OciHook { event: String },
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit status of an internal entry point
fn report(result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    if argv.get(1).map(String::as_str) == Some(LOGGING_ENTRY) {
        init_tracing(false);
        let result = match argv.get(2) {
            Some(root) => runectl::logging::driver::run(Path::new(root)).await,
            None => Err(anyhow::anyhow!("{} needs the data root", LOGGING_ENTRY)),
        };
        std::process::exit(report(result));
    }

    let cli = Cli::parse();
    init_tracing(cli.global.debug);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            if !e.is_quiet() {
                eprintln!("{}", e.render());
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn oci_hook(cfg: &GlobalConfig, event: &str) -> anyhow::Result<()> {
    let event: HookEvent = event.parse()?;
    let name = event.as_str();
    let state = hook::read_state(std::io::stdin().lock())
        .context("failed to read the container state from stdin")?;
    hook::handle(cfg, event, &state)
        .await
        .with_context(|| format!("{} hook for {} failed", name, state.id))
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let file = ConfigFile::load(&ConfigFile::default_path())?;
    let cfg = GlobalConfig::resolve(cli.global.flags(), file)?;

    if let Commands::Internal {
        command: InternalCommands::OciHook { event },
    } = &cli.command
    {
        return Ok(report(oci_hook(&cfg, event).await));
    }

    let router = SignalRouter::new();
    let _signals = router.install()?;
    let runtime = runectl::runtime::connect(&cfg.address)?;
    let manager = ContainerManager::new(cfg, runtime, router)?;
    run_command(&manager, cli.command).await?;
    Ok(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn stop_timeout(seconds: Option<u64>) -> Option<Duration> {
    seconds.map(Duration::from_secs)
}

fn parse_tail(value: &str) -> Result<Option<usize>> {
    if value == "all" {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| CtlError::usage(format!("invalid --tail value {:?}", value)))
}

/// Run `op` on every target, printing the ones that succeeded
async fn each<F, Fut>(targets: &[String], mut op: F) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut failures = Vec::new();
    for target in targets {
        match op(target.clone()).await {
            Ok(_) => println!("{}", target),
            Err(e) => failures.push((target.clone(), e)),
        }
    }
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0).1),
        _ => Err(CtlError::Multiple(failures)),
    }
}

async fn run_command(manager: &ContainerManager, command: Commands) -> Result<()> {
    match command {
        Commands::Run { detach, create } => {
            let opts = create.into_options(detach)?;
            let keys = detach_keys(opts.tty, opts.detach_keys.as_deref())?;
            let local = LocalStdio::process(opts.interactive, keys);
            let id = manager.run(&opts, local).await?;
            if opts.detach {
                println!("{}", id);
            }
        }

        Commands::Create { create } => {
            let opts = create.into_options(false)?;
            let record = manager.create(&opts).await?;
            println!("{}", record.id);
        }

        Commands::Start {
            attach,
            interactive,
            containers,
        } => {
            if attach {
                let [container] = containers.as_slice() else {
                    return Err(CtlError::usage("you cannot attach to more than one container"));
                };
                let local = LocalStdio::process(interactive, detach_keys(true, None)?);
                manager.start(container, Some(local)).await?;
            } else {
                each(&containers, |q| async move { manager.start(&q, None).await }).await?;
            }
        }

        Commands::Stop { time, containers } => {
            let timeout = stop_timeout(time);
            each(&containers, |q| async move { manager.stop(&q, timeout).await }).await?;
        }

        Commands::Restart { time, containers } => {
            let timeout = stop_timeout(time);
            each(&containers, |q| async move { manager.restart(&q, timeout).await }).await?;
        }

        Commands::Kill { signal, containers } => {
            let signal = &signal;
            each(&containers, |q| async move { manager.kill(&q, signal).await }).await?;
        }

        Commands::Pause { containers } => {
            each(&containers, |q| async move { manager.pause(&q).await }).await?;
        }

        Commands::Unpause { containers } => {
            each(&containers, |q| async move { manager.unpause(&q).await }).await?;
        }

        Commands::Wait { containers } => {
            for code in manager.wait(&containers).await? {
                println!("{}", code);
            }
        }

        Commands::Exec {
            detach,
            interactive,
            tty,
            env,
            env_file,
            user,
            workdir,
            privileged,
            container,
            command,
        } => {
            let opts = ExecRequestOptions {
                args: command,
                env,
                env_files: env_file,
                workdir,
                user,
                tty,
                interactive,
                detach,
                privileged,
            };
            let local = LocalStdio::process(interactive && !detach, detach_keys(tty, None)?);
            manager.exec(&container, &opts, local).await?;
        }

        Commands::Rm {
            force,
            volumes,
            containers,
        } => {
            let removed = manager
                .rm(&containers, &RemoveOptions { force, volumes })
                .await?;
            for name in removed {
                println!("{}", name);
            }
        }

        Commands::Rename {
            container,
            new_name,
        } => manager.rename(&container, &new_name).await?,

        Commands::Attach {
            detach_keys: keys,
            container,
        } => {
            let local = LocalStdio::process(false, detach_keys(true, keys.as_deref())?);
            manager.attach(&container, local).await?;
        }

        Commands::Logs {
            follow,
            tail,
            timestamps,
            since,
            until,
            container,
        } => {
            let now = chrono::Utc::now();
            let opts = LogsOptions {
                follow,
                tail: parse_tail(&tail)?,
                since: since.map(|s| parse_timestamp(&s, now)).transpose()?,
                until: until.map(|u| parse_timestamp(&u, now)).transpose()?,
                timestamps,
            };
            manager
                .logs(&container, &opts, &mut std::io::stdout(), &mut std::io::stderr())
                .await?;
        }

        Commands::Cp {
            source,
            destination,
        } => {
            manager
                .cp(
                    &source,
                    &destination,
                    &mut std::io::stdin(),
                    &mut std::io::stdout(),
                )
                .await?;
        }

        Commands::Ps {
            all,
            quiet,
            no_trunc,
            filter,
            format,
        } => {
            let rows = manager.ps(all, &PsFilter::parse(&filter)?).await?;
            if quiet {
                for row in &rows {
                    let id = if no_trunc { row.id.as_str() } else { short_id(&row.id) };
                    println!("{}", id);
                }
            } else if format.as_deref() == Some("json") {
                for row in &rows {
                    println!("{}", serde_json::to_string(row)?);
                }
            } else {
                print!("{}", render_table(&rows, no_trunc, chrono::Utc::now()));
            }
        }

        Commands::Inspect { containers } => print_json(&manager.inspect(&containers).await?)?,

        Commands::Top { container, ps_args } => {
            print!("{}", manager.top(&container, &ps_args).await?.render());
        }

        Commands::Stats {
            no_stream,
            format,
            containers,
        } => {
            let json = format.as_deref() == Some("json");
            let clear = !no_stream && !json && std::io::stdout().is_terminal();
            manager
                .stats(&containers, no_stream, |rows| {
                    let mut out = std::io::stdout();
                    if json {
                        for row in rows {
                            writeln!(out, "{}", serde_json::to_string(row)?)?;
                        }
                    } else {
                        if clear {
                            execute!(out, Clear(ClearType::All), MoveTo(0, 0))?;
                        }
                        write!(out, "{}", render_stats(rows))?;
                    }
                    out.flush()?;
                    Ok(())
                })
                .await?;
        }

        Commands::Network { command } => network_command(manager, command).await?,

        Commands::Volume { command } => volume_command(manager, command).await?,

        Commands::Pull { platform, image } => {
            let record = manager.pull(&image, platform.as_deref()).await?;
            println!("{}", record.name);
        }

        Commands::Push { platform, image } => manager.push(&image, platform.as_deref()).await?,

        Commands::Images { quiet, format } => {
            let rows = manager.image_list().await?;
            if quiet {
                for row in &rows {
                    println!("{}", row.id);
                }
            } else if format.as_deref() == Some("json") {
                for row in &rows {
                    println!("{}", serde_json::to_string(row)?);
                }
            } else {
                print!("{}", render_images(&rows));
            }
        }

        Commands::Commit {
            message,
            author,
            pause,
            container,
            reference,
        } => {
            let image = manager
                .commit(&container, &reference, message, author, pause)
                .await?;
            println!("{}", image.target.digest);
        }

        Commands::Build {
            tag,
            file,
            build_arg,
            target,
            platform,
            no_cache,
            progress,
            label,
            context,
        } => {
            let opts = BuildOptions {
                context,
                file,
                tags: tag,
                build_args: parse_labels(&build_arg)?,
                target,
                platforms: platform,
                no_cache,
                progress,
                labels: parse_labels(&label)?,
            };
            manager.build(&opts).await?;
        }

        Commands::Compose {
            file,
            project_name: name,
            project_directory,
            command,
        } => {
            let orchestrator =
                load_project(manager, file, name.as_deref(), project_directory)?;
            compose_command(&orchestrator, command).await?;
        }

        Commands::Internal { .. } => {
            return Err(CtlError::internal("internal commands are dispatched earlier"));
        }
    }
    Ok(())
}

async fn network_command(manager: &ContainerManager, command: NetworkCommands) -> Result<()> {
    match command {
        NetworkCommands::Create {
            driver,
            subnet,
            gateway,
            ip_range,
            opt,
            label,
            name,
        } => {
            let network = manager.network_create(NetworkCreate {
                name,
                driver: driver.parse()?,
                subnets: subnet,
                gateway,
                ip_range,
                options: parse_labels(&opt)?,
                labels: parse_labels(&label)?,
            })?;
            println!("{}", network.id);
        }
        NetworkCommands::List { quiet } => {
            let networks = manager.network_ls()?;
            if quiet {
                for network in &networks {
                    println!("{}", short_id(&network.id));
                }
            } else {
                println!("{:<16}{:<24}{}", "NETWORK ID", "NAME", "DRIVER");
                for network in &networks {
                    println!(
                        "{:<16}{:<24}{}",
                        short_id(&network.id),
                        network.name,
                        network.driver
                    );
                }
            }
        }
        NetworkCommands::Inspect { networks } => print_json(&manager.network_inspect(&networks)?)?,
        NetworkCommands::Remove { networks } => {
            for name in manager.network_rm(&networks)? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

async fn volume_command(manager: &ContainerManager, command: VolumeCommands) -> Result<()> {
    match command {
        VolumeCommands::Create { label, name } => {
            let volume = manager.volume_create(name.as_deref(), parse_labels(&label)?)?;
            println!("{}", volume.name);
        }
        VolumeCommands::List { quiet } => {
            let volumes = manager.volume_ls()?;
            if quiet {
                for volume in &volumes {
                    println!("{}", volume.name);
                }
            } else {
                println!("{:<16}{}", "DRIVER", "VOLUME NAME");
                for volume in &volumes {
                    println!("{:<16}{}", volume.driver, volume.name);
                }
            }
        }
        VolumeCommands::Inspect { volumes } => print_json(&manager.volume_inspect(&volumes)?)?,
        VolumeCommands::Remove { force, volumes } => {
            for name in manager.volume_rm(&volumes, force).await? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

fn load_project(
    manager: &ContainerManager,
    file: Option<PathBuf>,
    name: Option<&str>,
    project_directory: Option<PathBuf>,
) -> Result<ComposeOrchestrator> {
    let cwd = std::env::current_dir()?;
    let dir = project_directory
        .or_else(|| {
            file.as_ref()
                .and_then(|f| f.parent())
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(|| cwd.clone());
    let file = match file {
        Some(file) => file,
        None => ComposeParser::find_compose_file(&dir).ok_or_else(|| {
            CtlError::usage(format!("no compose file found in {}", dir.display()))
        })?,
    };
    let config = ComposeParser::parse_file(&file)?;
    let project = project_name(name, &config, &dir)?;
    let working_dir = if dir.is_absolute() { dir } else { cwd.join(dir) };
    Ok(ComposeOrchestrator::new(
        project,
        config,
        manager.clone(),
        working_dir,
    ))
}

fn parse_pull(value: Option<String>) -> Result<Option<runectl::image::PullPolicy>> {
    value.map(|p| p.parse()).transpose()
}

async fn compose_command(orchestrator: &ComposeOrchestrator, command: ComposeCommands) -> Result<()> {
    match command {
        ComposeCommands::Up {
            detach,
            build,
            pull,
            services,
        } => {
            let opts = UpOptions {
                services,
                detach,
                build,
                pull: parse_pull(pull)?,
            };
            orchestrator.up(&opts, &mut std::io::stdout()).await?;
        }
        ComposeCommands::Down {
            volumes,
            remove_orphans,
            timeout,
        } => {
            orchestrator
                .down(&DownOptions {
                    volumes,
                    remove_orphans,
                    timeout: stop_timeout(timeout),
                })
                .await?;
        }
        ComposeCommands::Create {
            build,
            pull,
            services,
        } => {
            let opts = UpOptions {
                services,
                detach: true,
                build,
                pull: parse_pull(pull)?,
            };
            orchestrator.create(&opts).await?;
        }
        ComposeCommands::Start { services } => orchestrator.start(&services).await?,
        ComposeCommands::Stop { timeout, services } => {
            orchestrator.stop(&services, stop_timeout(timeout)).await?
        }
        ComposeCommands::Restart { timeout, services } => {
            orchestrator.restart(&services, stop_timeout(timeout)).await?
        }
        ComposeCommands::Ps {
            all,
            quiet,
            format,
            services,
        } => {
            let rows = orchestrator.ps(all, &services).await?;
            if quiet {
                for row in &rows {
                    println!("{}", row.id);
                }
            } else if format.as_deref() == Some("json") {
                for row in &rows {
                    println!("{}", serde_json::to_string(row)?);
                }
            } else {
                print!("{}", render_table(&rows, false, chrono::Utc::now()));
            }
        }
        ComposeCommands::Run {
            detach,
            rm,
            name,
            entrypoint,
            env,
            user,
            workdir,
            no_tty,
            no_deps,
            service_ports,
            service,
            command,
        } => {
            let tty = !no_tty && !detach && std::io::stdin().is_terminal();
            let opts = RunOptions {
                service,
                args: command,
                name,
                entrypoint,
                env,
                user,
                workdir,
                detach,
                rm,
                tty,
                interactive: !detach,
                no_deps,
                service_ports,
            };
            let local = LocalStdio::process(!detach, detach_keys(tty, None)?);
            let id = orchestrator.run(&opts, local).await?;
            if detach {
                println!("{}", id);
            }
        }
        ComposeCommands::Exec {
            detach,
            env,
            user,
            workdir,
            privileged,
            no_tty,
            index,
            service,
            command,
        } => {
            let tty = !no_tty && !detach && std::io::stdin().is_terminal();
            let opts = ExecRequestOptions {
                args: command,
                env,
                env_files: Vec::new(),
                workdir,
                user,
                tty,
                interactive: !detach,
                detach,
                privileged,
            };
            let local = LocalStdio::process(!detach, detach_keys(tty, None)?);
            orchestrator.exec(&service, index, &opts, local).await?;
        }
        ComposeCommands::Logs {
            follow,
            tail,
            timestamps,
            services,
        } => {
            let opts = LogsOptions {
                follow,
                tail: parse_tail(&tail)?,
                timestamps,
                ..Default::default()
            };
            orchestrator
                .logs(&services, &opts, &mut std::io::stdout())
                .await?;
        }
    }
    Ok(())
}
