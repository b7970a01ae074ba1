//! Cluster membership and the mesh gate.
//!
//! The peer set is static configuration: the out-of-scope mesh service is
//! responsible for connecting the members and publishing a flag file once
//! every node can reach every other. The coordinator only reads that flag.

use std::collections::HashSet;
use std::path::Path;

use doghair_proto::NodeId;

/// Control endpoint of one collector node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub node: NodeId,
    pub addr: String,
}

/// Parse a `node=host:port,node=host:port` peer list.
pub fn parse_peers(raw: &str) -> anyhow::Result<Vec<PeerAddr>> {
    let mut peers = Vec::new();
    let mut seen = HashSet::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (node, addr) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("malformed peer entry '{entry}' (want node=host:port)"))?;
        let node = node.trim();
        let addr = addr.trim();
        if node.is_empty() || addr.is_empty() {
            anyhow::bail!("malformed peer entry '{entry}' (want node=host:port)");
        }
        if !seen.insert(node.to_string()) {
            anyhow::bail!("duplicate peer node '{node}'");
        }
        peers.push(PeerAddr {
            node: NodeId(node.to_string()),
            addr: addr.to_string(),
        });
    }
    if peers.is_empty() {
        anyhow::bail!("peer list is empty");
    }
    Ok(peers)
}

/// True once the mesh service has published a truthy flag file.
pub async fn is_meshed(flag: &Path) -> bool {
    match tokio::fs::read_to_string(flag).await {
        Ok(contents) => {
            let v = contents.trim();
            v == "1" || v.eq_ignore_ascii_case("true")
        }
        Err(_) => false,
    }
}
