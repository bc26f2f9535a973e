//! Build daemon adapter
//!
//! Images are built by `buildctl` against a BuildKit daemon. The client only
//! assembles the invocation, streams the daemon's progress to stderr and
//! terminates the child when the command is cancelled.

use crate::error::{CtlError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options for one `build` invocation
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub context: PathBuf,
    /// Dockerfile path; defaults to `<context>/Dockerfile`
    pub file: Option<PathBuf>,
    pub tags: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
    pub platforms: Vec<String>,
    pub no_cache: bool,
    /// `auto`, `plain` or `tty`
    pub progress: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Driver for the `buildctl` binary
#[derive(Debug, Clone)]
pub struct BuildClient {
    program: PathBuf,
    host: String,
}

impl BuildClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("buildctl"),
            host: host.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Argument vector passed to `buildctl`
    pub fn args(&self, opts: &BuildOptions) -> Result<Vec<String>> {
        if !opts.context.is_dir() {
            return Err(CtlError::usage(format!(
                "unable to prepare context: path {:?} not found",
                opts.context.display().to_string()
            )));
        }
        let dockerfile = opts
            .file
            .clone()
            .unwrap_or_else(|| opts.context.join("Dockerfile"));
        let (dockerfile_dir, filename) = split_dockerfile(&dockerfile)?;

        let mut args = vec![
            format!("--addr={}", self.host),
            "build".to_string(),
            format!("--progress={}", opts.progress.as_deref().unwrap_or("auto")),
            "--frontend=dockerfile.v0".to_string(),
            format!("--local=context={}", opts.context.display()),
            format!("--local=dockerfile={}", dockerfile_dir.display()),
            format!("--opt=filename={}", filename),
        ];

        let names = opts.tags.join(",");
        if names.is_empty() {
            args.push("--output=type=image,unpack=true".to_string());
        } else {
            args.push(format!("--output=type=image,\"name={}\",unpack=true", names));
        }

        for (key, value) in &opts.build_args {
            args.push(format!("--opt=build-arg:{}={}", key, value));
        }
        for (key, value) in &opts.labels {
            args.push(format!("--opt=label:{}={}", key, value));
        }
        if let Some(target) = &opts.target {
            args.push(format!("--opt=target={}", target));
        }
        if !opts.platforms.is_empty() {
            args.push(format!("--opt=platform={}", opts.platforms.join(",")));
        }
        if opts.no_cache {
            args.push("--no-cache".to_string());
        }
        Ok(args)
    }

    /// Run the build, forwarding cancellation as child termination
    pub async fn build(&self, opts: &BuildOptions, cancel: &CancellationToken) -> Result<()> {
        let args = self.args(opts)?;
        debug!("running {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CtlError::runtime(
                    crate::error::RpcCode::Unavailable,
                    format!("failed to run {}: {}", self.program.display(), e),
                )
            })?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    info!("build finished: {}", opts.tags.join(", "));
                    Ok(())
                } else {
                    Err(CtlError::runtime(
                        crate::error::RpcCode::Internal,
                        format!("buildctl exited with {}", status),
                    ))
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(CtlError::Canceled { user: true })
            }
        }
    }
}

fn split_dockerfile(path: &Path) -> Result<(PathBuf, String)> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CtlError::usage(format!("invalid Dockerfile path {}", path.display())))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((dir, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_buildctl_args() {
        let temp = tempdir().unwrap();
        let client = BuildClient::new("unix:///run/buildkit/buildkitd.sock");
        let mut opts = BuildOptions {
            context: temp.path().to_path_buf(),
            tags: vec!["docker.io/library/app:latest".to_string()],
            target: Some("release".to_string()),
            no_cache: true,
            ..Default::default()
        };
        opts.build_args.insert("VERSION".into(), "1.2".into());

        let args = client.args(&opts).unwrap();
        assert_eq!(args[0], "--addr=unix:///run/buildkit/buildkitd.sock");
        assert_eq!(args[1], "build");
        assert!(args.contains(&"--frontend=dockerfile.v0".to_string()));
        assert!(args.contains(&"--opt=filename=Dockerfile".to_string()));
        assert!(args.contains(&"--opt=build-arg:VERSION=1.2".to_string()));
        assert!(args.contains(&"--opt=target=release".to_string()));
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(args
            .iter()
            .any(|a| a.contains("name=docker.io/library/app:latest")));
    }

    #[test]
    fn test_missing_context_is_usage_error() {
        let client = BuildClient::new("unix:///nonexistent.sock");
        let opts = BuildOptions {
            context: PathBuf::from("/nonexistent/context"),
            ..Default::default()
        };
        assert!(matches!(client.args(&opts), Err(CtlError::Usage(_))));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let temp = tempdir().unwrap();
        let script = temp.path().join("buildctl");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = BuildClient::new("unix:///x.sock").with_program(&script);
        let opts = BuildOptions {
            context: temp.path().to_path_buf(),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = client.build(&opts, &cancel).await.unwrap_err();
        assert_eq!(err.exit_code(), 130);
    }
}
