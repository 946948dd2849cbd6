use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use ipnet::Ipv4Net;
use log::debug;
use tokio::process::Command;

use super::endpoint::PortMapping;
use crate::core::error::{NetError, Result};

const IPTABLES: &str = "iptables";
const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Append,
    Check,
    Delete,
}

impl Action {
    fn flag(self) -> &'static str {
        match self {
            Action::Append => "-A",
            Action::Check => "-C",
            Action::Delete => "-D",
        }
    }
}

/// How to reach the firewall: a program plus arguments placed before every rule.
#[derive(Debug, Clone)]
pub struct Iptables {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new(IPTABLES)
    }
}

impl Iptables {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// E.g. `sh wrapper.sh` in front of each rule.
    pub fn with_leading_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            leading_args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub async fn exec(&self, rule: &[String]) -> Result<()> {
        debug!("Running {} {}", self.program.display(), rule.join(" "));

        let output = tokio::time::timeout(
            TIMEOUT,
            Command::new(&self.program)
                .args(&self.leading_args)
                .args(rule)
                .output(),
        )
        .await
        .map_err(|_| NetError::ExternalTool {
            tool: IPTABLES,
            message: format!("timed out after {}s", TIMEOUT.as_secs()),
        })?
        .map_err(|e| NetError::ExternalTool {
            tool: IPTABLES,
            message: format!("{}: {e}", self.program.display()),
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(NetError::ExternalTool {
                tool: IPTABLES,
                message: format!(
                    "{} exited with {}: {}",
                    rule.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    /// Append `rule` unless the chain already holds an identical one.
    pub async fn ensure<F>(&self, rule: F) -> Result<()>
    where
        F: Fn(Action) -> Vec<String>,
    {
        let check = rule(Action::Check);
        if self.exec(&check).await.is_ok() {
            debug!("Rule already present: {}", check.join(" "));
            return Ok(());
        }

        self.exec(&rule(Action::Append)).await
    }
}

/// Source-NAT everything leaving `subnet` through any device but `bridge`.
pub fn masquerade_rule(action: Action, subnet: &Ipv4Net, bridge: &str) -> Vec<String> {
    let source = subnet.trunc().to_string();
    [
        "-t",
        "nat",
        action.flag(),
        "POSTROUTING",
        "-s",
        source.as_str(),
        "!",
        "-o",
        bridge,
        "-j",
        "MASQUERADE",
    ]
    .map(String::from)
    .to_vec()
}

pub fn forward_rule(action: Action, bridge: &str) -> Vec<String> {
    [action.flag(), "FORWARD", "-i", bridge, "-j", "ACCEPT"]
        .map(String::from)
        .to_vec()
}

/// Forward host TCP `mapping.host` to `ip:mapping.container`.
pub fn dnat_rule(action: Action, mapping: &PortMapping, ip: Ipv4Addr) -> Vec<String> {
    let dport = mapping.host.to_string();
    let destination = format!("{}:{}", ip, mapping.container);
    [
        "-t",
        "nat",
        action.flag(),
        "PREROUTING",
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        dport.as_str(),
        "-j",
        "DNAT",
        "--to-destination",
        destination.as_str(),
    ]
    .map(String::from)
    .to_vec()
}

/// A firewall stand-in that records every rule it is handed.
#[cfg(test)]
pub(crate) mod stub {
    use std::{fs, path::Path};

    use super::Iptables;

    /// Rules containing `reject` fail; every call is appended to the log.
    pub fn recording(dir: &Path, reject: Option<&str>) -> (Iptables, std::path::PathBuf) {
        let log = dir.join("iptables.log");
        let script = dir.join("iptables.sh");

        let mut body = format!("echo \"$*\" >> '{}'\n", log.display());
        if let Some(pattern) = reject {
            body.push_str(&format!(
                "case \"$*\" in *'{pattern}'*) echo 'rule rejected' >&2; exit 1 ;; esac\n"
            ));
        }
        fs::write(&script, body).unwrap();

        let iptables = Iptables::with_leading_args("sh", [script.display().to_string()]);
        (iptables, log)
    }

    pub fn calls(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
