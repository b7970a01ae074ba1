//! Environment-driven configuration.
//!
//! The collect config handed to peers is recomputed on every use rather than
//! cached in coordinator state, so an operator can adjust sampling parameters
//! between boots without restarting the coordinator.

use std::path::PathBuf;

use doghair_proto::CollectConfig;

use crate::cluster::{parse_peers, PeerAddr};

/// Build the collect config from the process environment. The interval and
/// topn must be positive; anything else is rejected in favor of the default
/// rather than handed to the peers.
pub fn init_config() -> CollectConfig {
    let defaults = CollectConfig::default();
    CollectConfig {
        interval_ms: env_parse_positive("DOGHAIR_INTERVAL", defaults.interval_ms),
        topn: env_parse_positive("DOGHAIR_TOPN", defaults.topn),
        smp: env_flag("DOGHAIR_SMP", defaults.smp),
    }
}

/// Directory under which `doghair_*` pull repositories are created.
pub fn home_dir() -> PathBuf {
    PathBuf::from(env_str("DOGHAIR_HOME", "."))
}

/// Path of the flag file the mesh service publishes once the cluster is
/// fully connected.
pub fn mesh_flag_path() -> PathBuf {
    PathBuf::from(env_str("DOGHAIR_MESH_FLAG", "doghair_meshed"))
}

/// Host peers use to reach the coordinator's per-file transfer listeners.
pub fn advertise_host() -> String {
    if let Ok(host) = std::env::var("DOGHAIR_ADVERTISE_HOST") {
        if !host.trim().is_empty() {
            return host;
        }
    }
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Control endpoints of the cluster's collector nodes, from `DOGHAIR_PEERS`.
pub fn peer_endpoints() -> anyhow::Result<Vec<PeerAddr>> {
    let raw = std::env::var("DOGHAIR_PEERS")
        .map_err(|_| anyhow::anyhow!("DOGHAIR_PEERS is not set (expected node=host:port,...)"))?;
    parse_peers(&raw)
}

pub(crate) fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_parse_positive<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Default + PartialOrd + Copy,
{
    match std::env::var(key) {
        Ok(raw) => parse_positive(&raw).unwrap_or_else(|| {
            tracing::warn!(key, value = %raw, "not a positive number, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_positive<T>(raw: &str) -> Option<T>
where
    T: std::str::FromStr + Default + PartialOrd,
{
    raw.trim().parse::<T>().ok().filter(|v| *v > T::default())
}

pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v != "0" && v.to_lowercase() != "false",
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_values_parse() {
        assert_eq!(parse_positive::<u64>("60000"), Some(60_000));
        assert_eq!(parse_positive::<u32>(" 5 "), Some(5));
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        assert_eq!(parse_positive::<u64>("0"), None);
        assert_eq!(parse_positive::<u32>("-3"), None);
        assert_eq!(parse_positive::<u64>("fast"), None);
        assert_eq!(parse_positive::<u64>(""), None);
    }
}
