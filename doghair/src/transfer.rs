//! Per-file TCP receivers for the pull protocol.
//!
//! Each announced file gets its own listener on an OS-assigned ephemeral
//! port. The listener is bound and the receiver task spawned before the peer
//! is told where to connect, so the peer can never dial a port that is not
//! yet accepting.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ractor::ActorRef;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use doghair_proto::NodeId;

use crate::actors::coordinator::CoordinatorMsg;

const READ_BUF_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no connection within {0:?}")]
    AcceptTimeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reduce an announced filename to its final component. Peers are trusted
/// collaborators but their announcements must never escape the repository.
pub fn sanitize_filename(announced: &str) -> Option<String> {
    let name = Path::new(announced).file_name()?.to_str()?;
    if name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Spawn the receiver task for one announced file. The completion message is
/// posted back to the coordinator only after a clean EOF; any failure leaves
/// that file out of the repository and the cycle continues without it.
pub fn spawn_receiver(
    listener: TcpListener,
    dest: PathBuf,
    node: NodeId,
    filename: String,
    accept_timeout: Duration,
    coordinator: ActorRef<CoordinatorMsg>,
) {
    tokio::spawn(async move {
        match receive_file(listener, &dest, accept_timeout).await {
            Ok(bytes) => {
                let _ = coordinator.cast(CoordinatorMsg::Retrieved {
                    node,
                    filename,
                    bytes,
                });
            }
            Err(e) => {
                tracing::error!(
                    node = %node,
                    filename = %filename,
                    error = %e,
                    "file transfer failed"
                );
                tokio::fs::remove_file(&dest).await.ok();
            }
        }
    });
}

/// Accept exactly one connection and append everything it sends to `dest`
/// until the peer closes the socket.
pub async fn receive_file(
    listener: TcpListener,
    dest: &Path,
    accept_timeout: Duration,
) -> Result<u64, TransferError> {
    let (mut socket, _remote) = tokio::time::timeout(accept_timeout, listener.accept())
        .await
        .map_err(|_| TransferError::AcceptTimeout(accept_timeout))??;
    drop(listener);

    let mut file = tokio::fs::File::create(dest).await?;
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut total = 0u64;
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;
    Ok(total)
}

/// Peer side of the sub-protocol: connect and stream the file, then close.
/// The receiver tests and the scripted test peers drive transfers with it.
pub async fn stream_file(path: &Path, host: &str, port: u16) -> Result<u64, TransferError> {
    let mut socket = TcpStream::connect((host, port)).await?;
    let mut file = tokio::fs::File::open(path).await?;
    let sent = tokio::io::copy(&mut file, &mut socket).await?;
    socket.shutdown().await?;
    Ok(sent)
}
