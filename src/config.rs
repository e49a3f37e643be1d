//! Command-line configuration for replica and primary processes.
//!
//! Usage mirrors the two roles a process can play:
//!
//! ```text
//! corkboard client_port coordinator_port                      # replica
//! corkboard client_port coordinator_port policy [Nw [Nr]]    # primary
//! ```
//!
//! with `policy` one of `sequential`, `quorum`, `ryw`. Flags:
//!
//! - `--primary <host:port>`   coordinator address (default localhost:10000)
//! - `--delay`                 enable the 100-399 ms WAN delay emulation
//! - `--sync-interval <secs>`  coordinator sync period (default 30)

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use tracing::warn;

use crate::constants::{DEFAULT_PRIMARY_ADDR, DEFAULT_SYNC_INTERVAL_SECS};
use crate::error::{CorkboardError, Result};
use crate::wire::PolicyTag;

/// Usage text printed on configuration errors.
pub const USAGE: &str = "\
Usage (replica server): corkboard client_port coordinator_port
Usage (primary server): corkboard client_port coordinator_port policy [Nw [Nr]]
Options: --primary <host:port>  --delay  --sync-interval <secs>";

/// Settings for the primary role, parsed from the policy arguments.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    pub policy: PolicyTag,
    /// Configured write-quorum size; 0 means "use the floor".
    pub write_quorum: usize,
    /// Configured read-quorum size; 0 means "use the floor".
    pub read_quorum: usize,
}

/// Fully parsed process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub client_port: u16,
    pub coordinator_port: u16,
    /// Present iff a policy argument was given, making this the primary.
    pub primary_role: Option<PrimaryConfig>,
    /// Where the coordinator listens (primary) or is reached (replicas).
    pub primary_addr: SocketAddr,
    pub delay: bool,
    pub sync_interval_secs: u64,
}

impl Config {
    /// Parses the process arguments (program name already stripped).
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut primary_addr = DEFAULT_PRIMARY_ADDR.to_string();
        let mut delay = false;
        let mut sync_interval_secs = DEFAULT_SYNC_INTERVAL_SECS;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--primary" => {
                    primary_addr = args
                        .next()
                        .ok_or_else(|| CorkboardError::config("--primary requires an address"))?;
                }
                "--delay" => delay = true,
                "--sync-interval" => {
                    let value = args.next().ok_or_else(|| {
                        CorkboardError::config("--sync-interval requires a value")
                    })?;
                    sync_interval_secs = value.parse().map_err(|_| {
                        CorkboardError::config(format!("invalid sync interval '{}'", value))
                    })?;
                }
                other if other.starts_with("--") => {
                    return Err(CorkboardError::config(format!("unknown flag '{}'", other)));
                }
                _ => positional.push(arg),
            }
        }

        if positional.len() < 2 {
            return Err(CorkboardError::config("missing port arguments"));
        }

        let client_port = parse_port(&positional[0])?;
        let coordinator_port = parse_port(&positional[1])?;

        let primary_role = match positional.get(2) {
            None => None,
            Some(policy_arg) => {
                let policy = match PolicyTag::from_str(&policy_arg.to_lowercase()) {
                    Ok(policy) => policy,
                    Err(_) => {
                        warn!(
                            "Not a valid consistency policy: '{}'. Defaulting to sequential.",
                            policy_arg
                        );
                        PolicyTag::Sequential
                    }
                };
                let write_quorum = parse_quorum(positional.get(3))?;
                let read_quorum = parse_quorum(positional.get(4))?;
                Some(PrimaryConfig {
                    policy,
                    write_quorum,
                    read_quorum,
                })
            }
        };

        let primary_addr = resolve_addr(&primary_addr)?;

        Ok(Self {
            client_port,
            coordinator_port,
            primary_role,
            primary_addr,
            delay,
            sync_interval_secs,
        })
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| CorkboardError::config(format!("invalid port '{}'", value)))
}

fn parse_quorum(value: Option<&String>) -> Result<usize> {
    match value {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| CorkboardError::config(format!("invalid quorum size '{}'", v))),
    }
}

fn resolve_addr(value: &str) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = value
        .to_socket_addrs()
        .map_err(|e| CorkboardError::config(format!("cannot resolve '{}': {}", value, e)))?
        .collect();
    // The coordinator binds an IPv4 wildcard, so prefer an IPv4 result.
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| CorkboardError::config(format!("'{}' resolves to no address", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_replica_arguments() {
        let config = Config::from_args(args(&["8000", "8001"])).expect("parse failed");
        assert_eq!(config.client_port, 8000);
        assert_eq!(config.coordinator_port, 8001);
        assert!(config.primary_role.is_none());
        assert!(!config.delay);
        assert_eq!(config.sync_interval_secs, 30);
    }

    #[test]
    fn test_primary_arguments_with_quorum_sizes() {
        let config =
            Config::from_args(args(&["8000", "8001", "quorum", "2", "3"])).expect("parse failed");
        let primary = config.primary_role.expect("expected primary role");
        assert_eq!(primary.policy, PolicyTag::Quorum);
        assert_eq!(primary.write_quorum, 2);
        assert_eq!(primary.read_quorum, 3);
    }

    #[test]
    fn test_unknown_policy_defaults_to_sequential() {
        let config =
            Config::from_args(args(&["8000", "8001", "eventual"])).expect("parse failed");
        let primary = config.primary_role.expect("expected primary role");
        assert_eq!(primary.policy, PolicyTag::Sequential);
    }

    #[test]
    fn test_policy_is_case_insensitive() {
        let config = Config::from_args(args(&["8000", "8001", "RYW"])).expect("parse failed");
        assert_eq!(
            config.primary_role.expect("expected primary role").policy,
            PolicyTag::Ryw
        );
    }

    #[test]
    fn test_flags() {
        let config = Config::from_args(args(&[
            "8000",
            "8001",
            "--primary",
            "127.0.0.1:9999",
            "--delay",
            "--sync-interval",
            "5",
        ]))
        .expect("parse failed");
        assert_eq!(config.primary_addr, "127.0.0.1:9999".parse().unwrap());
        assert!(config.delay);
        assert_eq!(config.sync_interval_secs, 5);
    }

    #[test]
    fn test_missing_ports_rejected() {
        assert!(Config::from_args(args(&[])).is_err());
        assert!(Config::from_args(args(&["8000"])).is_err());
        assert!(Config::from_args(args(&["not_a_port", "8001"])).is_err());
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Config::from_args(args(&["8000", "8001", "--bogus"])).is_err());
    }
}
