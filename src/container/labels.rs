//! Label keys runectl stores on runtime containers
//!
//! The runtime only keeps opaque labels; everything the client needs to
//! rebuild its view of a container after the fact lives here.

/// User-visible container name
pub const NAME: &str = "runectl/name";
/// Hostname inside the container
pub const HOSTNAME: &str = "runectl/hostname";
/// JSON list of attached network names, or the special mode
pub const NETWORKS: &str = "runectl/networks";
/// JSON list of published ports
pub const PORTS: &str = "runectl/ports";
/// JSON list of anonymous volume names created for this container
pub const ANON_VOLUMES: &str = "runectl/anon-volumes";
/// JSON list of user mounts, for inspect and volume in-use checks
pub const MOUNTS: &str = "runectl/mounts";
/// Log driver URI for detached tasks
pub const LOG_URI: &str = "runectl/log-uri";
/// `true` when created with `--rm`
pub const AUTO_REMOVE: &str = "runectl/auto-remove";
/// Per-container state directory
pub const STATE_DIR: &str = "runectl/state-dir";
/// `os/arch[/variant]` the image was selected for
pub const PLATFORM: &str = "runectl/platform";
/// JSON list of `--add-host` entries
pub const EXTRA_HOSTS: &str = "runectl/extra-hosts";
/// User-facing image reference as typed
pub const IMAGE_REF: &str = "runectl/image";
/// Graceful stop timeout in seconds
pub const STOP_TIMEOUT: &str = "runectl/stop-timeout";
/// `--user` given at create time, re-used by exec
pub const USER: &str = "runectl/user";

/// Restart policy name (`no`, `always`, `on-failure`, `unless-stopped`)
pub const RESTART_POLICY: &str = "containerd.io/restart.policy";
/// Desired status the restart monitor keeps the container in
pub const RESTART_STATUS: &str = "containerd.io/restart.status";
/// Whether the user stopped the container explicitly
pub const RESTART_EXPLICITLY_STOPPED: &str = "containerd.io/restart.explicitly-stopped";

pub const COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE: &str = "com.docker.compose.service";
pub const COMPOSE_NUMBER: &str = "com.docker.compose.container-number";
pub const COMPOSE_ONEOFF: &str = "com.docker.compose.oneoff";
pub const COMPOSE_NETWORK: &str = "com.docker.compose.network";
pub const COMPOSE_VOLUME: &str = "com.docker.compose.volume";
