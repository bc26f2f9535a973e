//! CNI plugin chain invocation
//!
//! Each plugin of a conflist is executed with the CNI environment and its
//! network configuration as JSON on stdin. ADD walks the chain in order and
//! threads the previous result through `prevResult`; DEL walks it backwards.

use crate::error::{CtlError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Published port, passed to `portmap` as a runtime capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
}

/// Per-invocation runtime parameters
#[derive(Debug, Clone)]
pub struct RuntimeConf {
    pub container_id: String,
    pub netns: PathBuf,
    pub ifname: String,
    pub args: Vec<(String, String)>,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Executes CNI plugins found on the plugin search path
#[derive(Debug, Clone)]
pub struct CniRunner {
    plugin_dirs: Vec<PathBuf>,
}

impl CniRunner {
    pub fn new(plugin_dirs: Vec<PathBuf>) -> Self {
        Self { plugin_dirs }
    }

    /// `--cni-path` may hold several directories separated by ':'
    pub fn from_path(path: &Path) -> Self {
        let dirs = path
            .to_string_lossy()
            .split(':')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        Self::new(dirs)
    }

    fn find_plugin(&self, name: &str) -> Result<PathBuf> {
        self.plugin_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| CtlError::Cni {
                plugin: name.to_string(),
                code: 0,
                message: format!(
                    "failed to find plugin in path [{}]",
                    self.plugin_dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
            })
    }

    /// Run ADD over the whole chain; returns the final result
    pub async fn add(&self, conflist: &Value, rt: &RuntimeConf) -> Result<Value> {
        let mut prev: Option<Value> = None;
        for plugin in plugins(conflist)? {
            let netconf = plugin_config(conflist, plugin, prev.as_ref(), rt);
            let result = self.exec(plugin_type(plugin)?, "ADD", &netconf, rt).await?;
            if let Some(result) = result {
                prev = Some(result);
            }
        }
        Ok(prev.unwrap_or_else(|| json!({ "cniVersion": cni_version(conflist) })))
    }

    /// Run DEL over the chain in reverse, with the cached ADD result if known
    pub async fn del(&self, conflist: &Value, rt: &RuntimeConf, cached: Option<&Value>) -> Result<()> {
        let mut first_error = None;
        for plugin in plugins(conflist)?.iter().rev() {
            let netconf = plugin_config(conflist, plugin, cached, rt);
            let name = plugin_type(plugin)?;
            if let Err(e) = self.exec(name, "DEL", &netconf, rt).await {
                tracing::warn!("CNI DEL via {} failed: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn exec(
        &self,
        plugin: &str,
        command: &str,
        netconf: &Value,
        rt: &RuntimeConf,
    ) -> Result<Option<Value>> {
        let path = self.find_plugin(plugin)?;
        let cni_args = rt
            .args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");
        let search_path = std::env::join_paths(&self.plugin_dirs)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("CNI {} {} for {}", command, plugin, rt.container_id);

        let mut child = Command::new(&path)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.netns)
            .env("CNI_IFNAME", &rt.ifname)
            .env("CNI_ARGS", cni_args)
            .env("CNI_PATH", search_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let data = serde_json::to_vec(netconf)?;
            // The plugin may exit before reading all of its input.
            if let Err(e) = stdin.write_all(&data).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let message = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(err) if !err.details.is_empty() => {
                    return Err(CtlError::Cni {
                        plugin: plugin.to_string(),
                        code: err.code,
                        message: format!("{}: {}", err.msg, err.details),
                    })
                }
                Ok(err) => {
                    return Err(CtlError::Cni {
                        plugin: plugin.to_string(),
                        code: err.code,
                        message: err.msg,
                    })
                }
                Err(_) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            };
            return Err(CtlError::Cni {
                plugin: plugin.to_string(),
                code: output.status.code().unwrap_or(-1) as u32,
                message,
            });
        }

        if command != "ADD" || output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&output.stdout)?))
    }
}

fn plugins(conflist: &Value) -> Result<&Vec<Value>> {
    conflist["plugins"]
        .as_array()
        .ok_or_else(|| CtlError::InvalidConfig("conflist has no plugins".to_string()))
}

fn plugin_type(plugin: &Value) -> Result<&str> {
    plugin["type"]
        .as_str()
        .ok_or_else(|| CtlError::InvalidConfig("CNI plugin without type".to_string()))
}

fn cni_version(conflist: &Value) -> &str {
    conflist["cniVersion"].as_str().unwrap_or("1.0.0")
}

fn plugin_config(conflist: &Value, plugin: &Value, prev: Option<&Value>, rt: &RuntimeConf) -> Value {
    let mut netconf = plugin.clone();
    netconf["name"] = conflist["name"].clone();
    netconf["cniVersion"] = json!(cni_version(conflist));
    if let Some(prev) = prev {
        netconf["prevResult"] = prev.clone();
    }
    let wants_ports = plugin["capabilities"]["portMappings"]
        .as_bool()
        .unwrap_or(false);
    if wants_ports && !rt.port_mappings.is_empty() {
        netconf["runtimeConfig"] = json!({ "portMappings": rt.port_mappings });
    }
    netconf
}

/// IPv4 addresses (without prefix length) assigned in a CNI result
pub fn result_addresses(result: &Value) -> Vec<String> {
    result["ips"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|ip| ip["address"].as_str())
        .map(|cidr| cidr.split('/').next().unwrap_or(cidr).to_string())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    /// A plugin that appends `<COMMAND> <name> <plugin>` to `log` and
    /// fails ADD for networks listed in `fail_on`.
    pub fn fake_plugin(dir: &Path, name: &str, log: &Path, fail_on: &[&str], ip: &str) {
        let fail_checks: String = fail_on
            .iter()
            .map(|n| {
                format!(
                    "if [ \"$CNI_COMMAND\" = ADD ] && [ \"$net\" = \"{}\" ]; then echo '{{\"code\":11,\"msg\":\"boom\"}}'; exit 1; fi\n",
                    n
                )
            })
            .collect();
        let script = format!(
            "#!/bin/sh\n\
             input=$(cat)\n\
             net=$(printf '%s' \"$input\" | sed -n 's/.*\"name\":\"\\([^\"]*\\)\".*/\\1/p')\n\
             echo \"$CNI_COMMAND $net {name}\" >> {log}\n\
             {fail_checks}\
             if [ \"$CNI_COMMAND\" = ADD ]; then echo '{{\"cniVersion\":\"1.0.0\",\"ips\":[{{\"address\":\"{ip}/24\"}}]}}'; fi\n",
            name = name,
            log = log.display(),
            fail_checks = fail_checks,
            ip = ip,
        );
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn rt() -> RuntimeConf {
        RuntimeConf {
            container_id: "abc".into(),
            netns: PathBuf::from("/proc/1/ns/net"),
            ifname: "eth0".into(),
            args: vec![("IgnoreUnknown".into(), "1".into())],
            port_mappings: vec![PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: "tcp".into(),
                host_ip: String::new(),
            }],
        }
    }

    #[tokio::test]
    async fn test_chain_order_and_result() {
        let temp = tempdir().unwrap();
        let log = temp.path().join("calls.log");
        fake_plugin(temp.path(), "bridge", &log, &[], "10.4.0.2");
        fake_plugin(temp.path(), "portmap", &log, &[], "10.4.0.2");

        let conflist = json!({
            "cniVersion": "1.0.0",
            "name": "n1",
            "plugins": [
                { "type": "bridge" },
                { "type": "portmap", "capabilities": { "portMappings": true } },
            ],
        });
        let runner = CniRunner::new(vec![temp.path().to_path_buf()]);
        let result = runner.add(&conflist, &rt()).await.unwrap();
        assert_eq!(result_addresses(&result), vec!["10.4.0.2"]);

        runner.del(&conflist, &rt(), Some(&result)).await.unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec!["ADD n1 bridge", "ADD n1 portmap", "DEL n1 portmap", "DEL n1 bridge"]
        );
    }

    #[test]
    fn test_port_mappings_only_for_capable_plugins() {
        let conflist = json!({ "name": "n1", "cniVersion": "1.0.0", "plugins": [] });
        let bridge = plugin_config(&conflist, &json!({ "type": "bridge" }), None, &rt());
        assert!(bridge.get("runtimeConfig").is_none());
        let portmap = plugin_config(
            &conflist,
            &json!({ "type": "portmap", "capabilities": { "portMappings": true } }),
            None,
            &rt(),
        );
        assert_eq!(portmap["runtimeConfig"]["portMappings"][0]["hostPort"], 8080);
    }

    #[tokio::test]
    async fn test_missing_plugin() {
        let temp = tempdir().unwrap();
        let runner = CniRunner::new(vec![temp.path().to_path_buf()]);
        let conflist = json!({ "name": "n1", "plugins": [{ "type": "nope" }] });
        let err = runner.add(&conflist, &rt()).await.unwrap_err();
        assert!(matches!(err, CtlError::Cni { ref plugin, .. } if plugin == "nope"));
    }
}
