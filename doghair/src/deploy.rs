//! Collector code distribution.
//!
//! Peers ship with the collector binary pre-installed, so distribution is a
//! version-check handshake on a short-lived control connection rather than a
//! code push. `distribute` runs exactly once per coordinator lifetime, before
//! the first boot; `retire` is the symmetric teardown on shutdown and on
//! abnormal coordinator termination.

use std::time::Duration;

use tokio::net::TcpStream;

use doghair_proto::{read_frame, write_frame, FrameError, NodeId, Reply, Request};

use crate::cluster::PeerAddr;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("peer did not answer within {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("peer closed the connection mid-handshake")]
    Disconnected,
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(Reply),
    #[error("peer {0} rejected version {1}")]
    Rejected(NodeId, String),
}

/// Run the version handshake against every configured peer. Individual
/// failures are logged and do not abort the batch.
pub async fn distribute(peers: &[PeerAddr], version: &str, timeout: Duration) {
    for peer in peers {
        match deploy_one(peer, version, timeout).await {
            Ok(()) => {
                tracing::info!(node = %peer.node, version, "collector code loaded");
            }
            Err(e) => {
                tracing::warn!(node = %peer.node, error = %e, "collector code load failed");
            }
        }
    }
}

async fn deploy_one(peer: &PeerAddr, version: &str, timeout: Duration) -> Result<(), DeployError> {
    let fut = async {
        let mut stream = TcpStream::connect(&peer.addr)
            .await
            .map_err(DeployError::Connect)?;
        write_frame(
            &mut stream,
            &Request::Deploy {
                version: version.to_string(),
            },
        )
        .await?;
        match read_frame::<_, Reply>(&mut stream).await? {
            Some(Reply::DeployAck { ok: true, .. }) => Ok(()),
            Some(Reply::DeployAck { node, ok: false }) => {
                Err(DeployError::Rejected(node, version.to_string()))
            }
            Some(other) => Err(DeployError::UnexpectedReply(other)),
            None => Err(DeployError::Disconnected),
        }
    };
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DeployError::Timeout(timeout))?
}

/// Best-effort unload sweep. Peers that already quit simply refuse the
/// connection; that is expected and only logged at debug.
pub async fn retire(peers: &[PeerAddr], timeout: Duration) {
    for peer in peers {
        let fut = async {
            let mut stream = TcpStream::connect(&peer.addr).await?;
            write_frame(&mut stream, &Request::Retire)
                .await
                .map_err(std::io::Error::other)?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(())) => tracing::debug!(node = %peer.node, "collector code unloaded"),
            Ok(Err(e)) => tracing::debug!(node = %peer.node, error = %e, "unload skipped"),
            Err(_) => tracing::debug!(node = %peer.node, "unload timed out"),
        }
    }
}
