//! Collector agent: the peer side of the doghair lifecycle contract.
//!
//! The agent listens on a control port for the coordinator, answers the
//! deploy handshake, boots a sampler worker on `Start`, toggles it with
//! `StartCollect`/`StopCollect`, announces its accumulated sample files on
//! `Pull`, streams them on `TransReq`, and exits on `Quit`.
//!
//! The sampler itself is deliberately shallow - what exactly gets measured
//! per tick is not this crate's concern; it exists so the lifecycle and the
//! transfer path move real bytes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use doghair_proto::{
    read_frame, write_frame, CollectConfig, FrameError, NodeId, Reply, Request, StartMode,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("can not bind control listener on {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone)]
pub struct PeerAgentConfig {
    pub node: NodeId,
    /// Control listener address, e.g. `0.0.0.0:7199`. Port 0 picks an
    /// ephemeral port, which tests rely on.
    pub listen: String,
    /// Where sample files accumulate between pulls.
    pub data_dir: PathBuf,
    /// Build version answered during the deploy handshake.
    pub version: String,
}

impl PeerAgentConfig {
    pub fn new(node: NodeId, listen: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node,
            listen: listen.into(),
            data_dir: data_dir.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A running collector agent. Dropping the handle does not stop it; call
/// [`PeerAgent::shutdown`] or let the coordinator send `Quit`.
pub struct PeerAgent {
    node: NodeId,
    addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl PeerAgent {
    pub async fn spawn(config: PeerAgentConfig) -> Result<Self, AgentError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|e| AgentError::Bind(config.listen.clone(), e))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let node = config.node.clone();
        let inner = Arc::new(AgentInner {
            node: config.node,
            data_dir: config.data_dir,
            version: config.version,
            deployed: Mutex::new(None),
            sampler: Mutex::new(None),
        });

        tracing::info!(node = %node, %addr, "collector agent listening");
        let task = tokio::spawn(accept_loop(listener, inner, shutdown_rx));
        Ok(Self {
            node,
            addr,
            shutdown_tx,
            task,
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Stop the agent from the outside, as if the node went away.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }

    /// Run until the coordinator sends `Quit`.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

struct AgentInner {
    node: NodeId,
    data_dir: PathBuf,
    version: String,
    deployed: Mutex<Option<String>>,
    sampler: Mutex<Option<Sampler>>,
}

enum LinkOutcome {
    /// Coordinator went away; keep accepting.
    Disconnected,
    /// Coordinated exit.
    Quit,
}

async fn accept_loop(
    listener: TcpListener,
    inner: Arc<AgentInner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(node = %inner.node, error = %e, "accept failed");
                continue;
            }
        };
        tracing::debug!(node = %inner.node, %remote, "coordinator connected");
        let outcome = tokio::select! {
            _ = shutdown_rx.changed() => break,
            outcome = serve_link(stream, &inner) => outcome,
        };
        match outcome {
            Ok(LinkOutcome::Disconnected) => continue,
            Ok(LinkOutcome::Quit) => {
                tracing::info!(node = %inner.node, "quitting");
                break;
            }
            Err(e) => {
                tracing::warn!(node = %inner.node, error = %e, "control channel error");
                continue;
            }
        }
    }
    if let Some(sampler) = inner.sampler.lock().await.take() {
        sampler.stop();
    }
}

async fn serve_link(mut stream: TcpStream, inner: &Arc<AgentInner>) -> Result<LinkOutcome, AgentError> {
    loop {
        let Some(request) = read_frame::<_, Request>(&mut stream).await? else {
            return Ok(LinkOutcome::Disconnected);
        };
        match request {
            Request::Deploy { version } => {
                let ok = version == inner.version;
                if ok {
                    *inner.deployed.lock().await = Some(version);
                } else {
                    tracing::warn!(
                        node = %inner.node,
                        ours = %inner.version,
                        theirs = %version,
                        "version mismatch"
                    );
                }
                write_frame(
                    &mut stream,
                    &Reply::DeployAck {
                        node: inner.node.clone(),
                        ok,
                    },
                )
                .await?;
            }
            Request::Retire => {
                *inner.deployed.lock().await = None;
            }
            Request::Start { mode, config } => {
                if inner.deployed.lock().await.is_none() {
                    tracing::warn!(node = %inner.node, "starting without a version handshake");
                }
                let ok = start_sampler(inner, mode, config).await;
                write_frame(
                    &mut stream,
                    &Reply::Started {
                        node: inner.node.clone(),
                        ok,
                    },
                )
                .await?;
            }
            Request::StartCollect => {
                if let Some(sampler) = inner.sampler.lock().await.as_ref() {
                    sampler.set_collecting(true);
                } else {
                    tracing::warn!(node = %inner.node, "start_collect before start");
                }
            }
            Request::StopCollect => {
                if let Some(sampler) = inner.sampler.lock().await.as_ref() {
                    sampler.set_collecting(false);
                }
            }
            Request::Pull { coord } => {
                tracing::info!(node = %inner.node, coord = %coord, "announcing sample files");
                announce_files(&mut stream, inner).await?;
            }
            Request::TransReq {
                filename,
                host,
                port,
            } => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let path = inner.data_dir.join(&filename);
                    match send_file(&path, &host, port).await {
                        Ok(sent) => {
                            tracing::info!(node = %inner.node, filename = %filename, sent, "file sent");
                        }
                        Err(e) => {
                            tracing::warn!(node = %inner.node, filename = %filename, error = %e, "transfer failed");
                        }
                    }
                });
            }
            Request::Quit => return Ok(LinkOutcome::Quit),
        }
    }
}

async fn start_sampler(inner: &Arc<AgentInner>, mode: StartMode, config: CollectConfig) -> bool {
    if mode == StartMode::Reboot {
        // The previous incarnation's files may still be in the data dir;
        // they stay and are announced on the next pull.
        tracing::info!(node = %inner.node, "rebooting over existing state");
    }
    if let Err(e) = tokio::fs::create_dir_all(&inner.data_dir).await {
        tracing::error!(node = %inner.node, error = %e, "data dir unusable");
        return false;
    }
    let mut slot = inner.sampler.lock().await;
    if let Some(old) = slot.take() {
        old.stop();
    }
    *slot = Some(Sampler::start(
        inner.node.clone(),
        inner.data_dir.clone(),
        config,
    ));
    true
}

async fn announce_files(stream: &mut TcpStream, inner: &Arc<AgentInner>) -> Result<(), AgentError> {
    let mut entries = tokio::fs::read_dir(&inner.data_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        write_frame(
            stream,
            &Reply::PullAck {
                node: inner.node.clone(),
                filename,
            },
        )
        .await?;
    }
    Ok(())
}

async fn send_file(path: &Path, host: &str, port: u16) -> Result<u64, AgentError> {
    let mut socket = TcpStream::connect((host, port)).await?;
    let mut file = tokio::fs::File::open(path).await?;
    let sent = tokio::io::copy(&mut file, &mut socket).await?;
    socket.shutdown().await?;
    Ok(sent)
}

/// Interval-driven sample writer. Appends one record per tick while
/// collecting is on.
struct Sampler {
    collecting: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl Sampler {
    fn start(node: NodeId, data_dir: PathBuf, config: CollectConfig) -> Self {
        let collecting = Arc::new(AtomicBool::new(false));
        let flag = collecting.clone();
        let task = tokio::spawn(async move {
            let path = data_dir.join(format!("doghair_samples_{node}.log"));
            let mut seq = 0u64;
            let period = std::time::Duration::from_millis(config.interval_ms.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !flag.load(Ordering::Relaxed) {
                    continue;
                }
                let record = format!(
                    "{} node={} seq={} topn={} smp={}\n",
                    chrono::Utc::now().to_rfc3339(),
                    node,
                    seq,
                    config.topn,
                    config.smp,
                );
                seq += 1;
                if let Err(e) = append(&path, record.as_bytes()).await {
                    tracing::warn!(node = %node, error = %e, "sample not written");
                }
            }
        });
        Self { collecting, task }
    }

    fn set_collecting(&self, on: bool) {
        self.collecting.store(on, Ordering::Relaxed);
    }

    fn stop(self) {
        self.task.abort();
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("doghair-peer-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn deploy_start_and_quit_over_the_contract() {
        let data_dir = scratch("contract");
        let agent = PeerAgent::spawn(PeerAgentConfig::new(
            NodeId::from("n1"),
            "127.0.0.1:0",
            &data_dir,
        ))
        .await
        .unwrap();
        let addr = agent.addr();

        // Deploy handshake on its own connection.
        let mut conn = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut conn,
            &Request::Deploy {
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
        .await
        .unwrap();
        let ack: Reply = read_frame(&mut conn).await.unwrap().unwrap();
        assert_eq!(
            ack,
            Reply::DeployAck {
                node: NodeId::from("n1"),
                ok: true
            }
        );
        drop(conn);

        // Lifecycle link: boot, then quit.
        let mut link = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut link,
            &Request::Start {
                mode: StartMode::Boot,
                config: CollectConfig::default(),
            },
        )
        .await
        .unwrap();
        let started: Reply = read_frame(&mut link).await.unwrap().unwrap();
        assert_eq!(
            started,
            Reply::Started {
                node: NodeId::from("n1"),
                ok: true
            }
        );

        write_frame(&mut link, &Request::Quit).await.unwrap();
        agent.wait().await;
        std::fs::remove_dir_all(&data_dir).ok();
    }

    #[tokio::test]
    async fn pull_announces_every_accumulated_file() {
        let data_dir = scratch("announce");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("a.log"), b"aa").unwrap();
        std::fs::write(data_dir.join("b.log"), b"bb").unwrap();

        let agent = PeerAgent::spawn(PeerAgentConfig::new(
            NodeId::from("n2"),
            "127.0.0.1:0",
            &data_dir,
        ))
        .await
        .unwrap();

        let mut link = TcpStream::connect(agent.addr()).await.unwrap();
        write_frame(
            &mut link,
            &Request::Pull {
                coord: "test".to_string(),
            },
        )
        .await
        .unwrap();

        let mut announced = Vec::new();
        for _ in 0..2 {
            match read_frame::<_, Reply>(&mut link).await.unwrap().unwrap() {
                Reply::PullAck { filename, .. } => announced.push(filename),
                other => panic!("unexpected reply: {other:?}"),
            }
        }
        announced.sort();
        assert_eq!(announced, vec!["a.log", "b.log"]);

        agent.shutdown().await;
        std::fs::remove_dir_all(&data_dir).ok();
    }
}
