//! Wire types shared by the doghair coordinator and its peer agents.
//!
//! The control channel between the coordinator and a peer carries
//! length-prefixed JSON frames: a `u32` big-endian byte count followed by a
//! serialized [`Request`] or [`Reply`]. Sample file contents travel on
//! separate, per-file TCP connections as raw bytes and never pass through
//! this codec.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Identifier of a collector node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Sampling parameters handed to a collector at boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectConfig {
    /// Sampling period in milliseconds.
    pub interval_ms: u64,
    /// Number of top entries reported per sample.
    pub topn: u32,
    /// Whether the collector samples SMP statistics.
    pub smp: bool,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
            topn: 30,
            smp: true,
        }
    }
}

/// How a collector is being started on its node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// First boot; the node is expected to have no collector state.
    Boot,
    /// Restart after a crash; the node may hold stale files from the
    /// previous incarnation.
    Reboot,
}

/// Coordinator-to-peer control frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Version-check handshake run once per coordinator lifetime, before the
    /// first boot.
    Deploy { version: String },
    /// Symmetric teardown of the deploy handshake. Best-effort, no reply.
    Retire,
    /// Boot or reboot the collector worker on this node.
    Start { mode: StartMode, config: CollectConfig },
    StartCollect,
    StopCollect,
    /// Announce accumulated sample files to the named coordinator.
    Pull { coord: String },
    /// Stream the named file to `host:port` and close the socket.
    TransReq {
        filename: String,
        host: String,
        port: u16,
    },
    Quit,
}

/// Peer-to-coordinator control frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    DeployAck { node: NodeId, ok: bool },
    /// Acknowledgement of `Start`, read synchronously during the boot
    /// handshake.
    Started { node: NodeId, ok: bool },
    /// One per file the peer intends to transfer.
    PullAck { node: NodeId, filename: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(frame)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `None` on a clean EOF at a frame
/// boundary; EOF mid-frame is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_the_codec() {
        let mut buf = Vec::new();
        let req = Request::Start {
            mode: StartMode::Reboot,
            config: CollectConfig::default(),
        };
        write_frame(&mut buf, &req).await.unwrap();
        write_frame(&mut buf, &Request::Quit).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: Request = read_frame(&mut cursor).await.unwrap().unwrap();
        let second: Request = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, req);
        assert_eq!(second, Request::Quit);
        assert_eq!(read_frame::<_, Request>(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::StartCollect).await.unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, Request>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn collect_config_defaults() {
        let config = CollectConfig::default();
        assert_eq!(config.interval_ms, 300_000);
        assert_eq!(config.topn, 30);
        assert!(config.smp);
    }
}
