#![allow(dead_code)]

//! Shared harness for the coordinator integration tests: a scripted peer
//! that speaks the control protocol with injectable faults, plus scratch
//! directories and shortened coordinator timings.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use doghair::actors::coordinator::CoordinatorArguments;
use doghair::cluster::PeerAddr;
use doghair_proto::{read_frame, write_frame, NodeId, Reply, Request, StartMode};

/// Fresh scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "doghair-test-{}-{}-{}",
        std::process::id(),
        name,
        nonce()
    ));
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

fn nonce() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Publish (or retract) the mesh flag the coordinator's probe reads.
pub fn set_meshed(flag: &Path, meshed: bool) {
    std::fs::write(flag, if meshed { "true\n" } else { "false\n" }).expect("mesh flag");
}

/// Coordinator arguments with production semantics but test-friendly timings.
pub fn test_args(peers: Vec<PeerAddr>, home: &Path, mesh_flag: &Path) -> CoordinatorArguments {
    let mut args = CoordinatorArguments::new(
        peers,
        home.to_path_buf(),
        mesh_flag.to_path_buf(),
        "127.0.0.1".to_string(),
    );
    args.probe_interval = Duration::from_millis(200);
    args.boot_timeout = Duration::from_secs(3);
    args.deploy_timeout = Duration::from_secs(1);
    args.accept_timeout = Duration::from_secs(2);
    args.settle = Duration::from_millis(100);
    args.stagger = Duration::from_millis(20);
    args.drain = Duration::from_millis(300);
    args
}

/// Poll `probe` until it returns true or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// A peer that follows the wire contract but whose failures are scripted:
/// it can refuse reboots, refuse to dial transfer sockets, or drop the live
/// control link on command.
pub struct ScriptedPeer {
    node: NodeId,
    addr: SocketAddr,
    behavior: Arc<Behavior>,
    task: tokio::task::JoinHandle<()>,
}

struct Behavior {
    accept_boot: AtomicBool,
    accept_reboot: AtomicBool,
    connect_transfers: AtomicBool,
    files: Mutex<Vec<(String, Vec<u8>)>>,
    requests: Mutex<Vec<Request>>,
    drop_link: Notify,
}

impl ScriptedPeer {
    pub async fn spawn(node: &str) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let node = NodeId::from(node);
        let behavior = Arc::new(Behavior {
            accept_boot: AtomicBool::new(true),
            accept_reboot: AtomicBool::new(true),
            connect_transfers: AtomicBool::new(true),
            files: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            drop_link: Notify::new(),
        });
        let task = tokio::spawn(accept_loop(listener, node.clone(), behavior.clone()));
        Self {
            node,
            addr,
            behavior,
            task,
        }
    }

    pub fn peer_addr(&self) -> PeerAddr {
        PeerAddr {
            node: self.node.clone(),
            addr: self.addr.to_string(),
        }
    }

    pub fn add_file(&self, name: &str, bytes: &[u8]) {
        self.behavior
            .files
            .lock()
            .expect("files lock")
            .push((name.to_string(), bytes.to_vec()));
    }

    pub fn refuse_reboots(&self) {
        self.behavior.accept_reboot.store(false, Ordering::SeqCst);
    }

    pub fn refuse_transfers(&self) {
        self.behavior
            .connect_transfers
            .store(false, Ordering::SeqCst);
    }

    /// Drop the live control link, as if this node's collector crashed.
    /// The listener stays up, so a reboot succeeds.
    pub fn sever_link(&self) {
        self.behavior.drop_link.notify_one();
    }

    pub fn requests(&self) -> Vec<Request> {
        self.behavior.requests.lock().expect("requests lock").clone()
    }

    /// Kill the whole node: nothing accepts afterwards.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn accept_loop(listener: TcpListener, node: NodeId, behavior: Arc<Behavior>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            break;
        };
        serve(stream, &node, &behavior).await;
    }
}

async fn serve(mut stream: TcpStream, node: &NodeId, behavior: &Arc<Behavior>) {
    loop {
        let request = tokio::select! {
            _ = behavior.drop_link.notified() => return,
            frame = read_frame::<_, Request>(&mut stream) => match frame {
                Ok(Some(request)) => request,
                _ => return,
            },
        };
        behavior
            .requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        match request {
            Request::Deploy { .. } => {
                let reply = Reply::DeployAck {
                    node: node.clone(),
                    ok: true,
                };
                if write_frame(&mut stream, &reply).await.is_err() {
                    return;
                }
            }
            Request::Retire => {}
            Request::Start { mode, .. } => {
                let ok = match mode {
                    StartMode::Boot => behavior.accept_boot.load(Ordering::SeqCst),
                    StartMode::Reboot => behavior.accept_reboot.load(Ordering::SeqCst),
                };
                let reply = Reply::Started {
                    node: node.clone(),
                    ok,
                };
                if write_frame(&mut stream, &reply).await.is_err() || !ok {
                    return;
                }
            }
            Request::StartCollect | Request::StopCollect => {}
            Request::Pull { .. } => {
                let files = behavior.files.lock().expect("files lock").clone();
                for (filename, _) in files {
                    let reply = Reply::PullAck {
                        node: node.clone(),
                        filename,
                    };
                    if write_frame(&mut stream, &reply).await.is_err() {
                        return;
                    }
                }
            }
            Request::TransReq {
                filename,
                host,
                port,
            } => {
                if behavior.connect_transfers.load(Ordering::SeqCst) {
                    let bytes = behavior
                        .files
                        .lock()
                        .expect("files lock")
                        .iter()
                        .find(|(name, _)| *name == filename)
                        .map(|(_, bytes)| bytes.clone());
                    if let Some(bytes) = bytes {
                        tokio::spawn(async move {
                            if let Ok(mut socket) = TcpStream::connect((host.as_str(), port)).await
                            {
                                let _ = socket.write_all(&bytes).await;
                                let _ = socket.shutdown().await;
                            }
                        });
                    }
                }
            }
            Request::Quit => return,
        }
    }
}
