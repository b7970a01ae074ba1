//! PeerLinkActor - one live control channel to one collector node.
//!
//! The link actor owns the TCP connection that carries lifecycle frames to a
//! peer. Its `pre_start` performs the boot handshake (connect, `Start`,
//! `Started` ack) within the boot deadline, so a successful spawn IS the
//! peer's init/reboot acknowledgement. A reader task forwards asynchronous
//! peer frames to the coordinator; any connection loss makes the actor fail,
//! which the linked coordinator observes as the death of this collector. The
//! actor's id is therefore the roster's monitor token.

use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use doghair_proto::{
    read_frame, write_frame, CollectConfig, FrameError, NodeId, Reply, Request, StartMode,
};

use crate::actors::coordinator::CoordinatorMsg;
use crate::cluster::PeerAddr;

const CONNECT_RETRY: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
pub struct PeerLinkActor;

#[derive(Debug)]
pub struct PeerLinkArguments {
    pub peer: PeerAddr,
    pub mode: StartMode,
    pub config: CollectConfig,
    pub coordinator: ActorRef<CoordinatorMsg>,
    /// Overall budget for connect + handshake. A reboot retries the connect
    /// inside this window so a node that is briefly mid-restart still makes
    /// it back.
    pub boot_deadline: Duration,
}

pub struct PeerLinkState {
    node: NodeId,
    writer: OwnedWriteHalf,
    reader_task: tokio::task::JoinHandle<()>,
}

#[derive(Debug)]
pub enum PeerLinkMsg {
    StartCollect,
    StopCollect,
    Pull { coord: String },
    TransReq {
        filename: String,
        host: String,
        port: u16,
    },
    Quit,
    /// Internal: the reader task saw EOF or a read error.
    LinkClosed { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("collector on {0} did not start within {1:?}")]
    BootTimeout(NodeId, Duration),
    #[error("collector on {0} refused to start")]
    BootRefused(NodeId),
    #[error("expected a start acknowledgement from {0}, got {1:?}")]
    BadAck(NodeId, Option<Reply>),
    #[error("peer answered as {answered} but {expected} was booted")]
    WrongNode { expected: NodeId, answered: NodeId },
    #[error("control channel to {0} lost: {1}")]
    Lost(NodeId, String),
    #[error("{0}")]
    Frame(#[from] FrameError),
}

#[ractor::async_trait]
impl Actor for PeerLinkActor {
    type Msg = PeerLinkMsg;
    type State = PeerLinkState;
    type Arguments = PeerLinkArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let node = args.peer.node.clone();
        let stream = tokio::time::timeout(
            args.boot_deadline,
            boot_handshake(&args.peer, args.mode, &args.config),
        )
        .await
        .map_err(|_| LinkError::BootTimeout(node.clone(), args.boot_deadline))??;

        let (read_half, writer) = stream.into_split();
        let reader_task = tokio::spawn(read_loop(
            read_half,
            node.clone(),
            myself.clone(),
            args.coordinator,
        ));

        tracing::debug!(node = %node, mode = ?args.mode, "control channel up");
        Ok(PeerLinkState {
            node,
            writer,
            reader_task,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PeerLinkMsg::StartCollect => self.send(state, &Request::StartCollect).await,
            PeerLinkMsg::StopCollect => self.send(state, &Request::StopCollect).await,
            PeerLinkMsg::Pull { coord } => self.send(state, &Request::Pull { coord }).await,
            PeerLinkMsg::TransReq {
                filename,
                host,
                port,
            } => {
                self.send(
                    state,
                    &Request::TransReq {
                        filename,
                        host,
                        port,
                    },
                )
                .await
            }
            PeerLinkMsg::Quit => {
                // The peer exits on quit and the socket goes with it, so a
                // write failure here is not a death worth reporting.
                if let Err(e) = write_frame(&mut state.writer, &Request::Quit).await {
                    tracing::debug!(node = %state.node, error = %e, "quit not delivered");
                }
                myself.stop(Some("quit".to_string()));
                Ok(())
            }
            PeerLinkMsg::LinkClosed { reason } => {
                Err(LinkError::Lost(state.node.clone(), reason).into())
            }
        }
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.reader_task.abort();
        Ok(())
    }
}

impl PeerLinkActor {
    async fn send(
        &self,
        state: &mut PeerLinkState,
        request: &Request,
    ) -> Result<(), ActorProcessingErr> {
        write_frame(&mut state.writer, request)
            .await
            .map_err(|e| LinkError::Lost(state.node.clone(), e.to_string()).into())
    }
}

/// Connect (retrying within the caller's deadline) and run the `Start`
/// handshake. The peer's `Started` ack is read synchronously; everything
/// after it belongs to the reader task.
async fn boot_handshake(
    peer: &PeerAddr,
    mode: StartMode,
    config: &CollectConfig,
) -> Result<TcpStream, LinkError> {
    let mut stream = loop {
        match TcpStream::connect(&peer.addr).await {
            Ok(stream) => break stream,
            Err(e) => {
                tracing::debug!(node = %peer.node, error = %e, "connect retry");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    };

    write_frame(
        &mut stream,
        &Request::Start {
            mode,
            config: config.clone(),
        },
    )
    .await?;

    match read_frame::<_, Reply>(&mut stream).await? {
        Some(Reply::Started { node, ok: true }) => {
            if node != peer.node {
                return Err(LinkError::WrongNode {
                    expected: peer.node.clone(),
                    answered: node,
                });
            }
            Ok(stream)
        }
        Some(Reply::Started { ok: false, .. }) => Err(LinkError::BootRefused(peer.node.clone())),
        other => Err(LinkError::BadAck(peer.node.clone(), other)),
    }
}

/// Pump asynchronous peer frames into the coordinator's inbox. On EOF or a
/// read error the loop reports the loss to its own actor, which fails and
/// thereby delivers the death notice.
async fn read_loop(
    mut reader: OwnedReadHalf,
    node: NodeId,
    link: ActorRef<PeerLinkMsg>,
    coordinator: ActorRef<CoordinatorMsg>,
) {
    loop {
        match read_frame::<_, Reply>(&mut reader).await {
            Ok(Some(Reply::PullAck { node: from, filename })) => {
                let _ = coordinator.cast(CoordinatorMsg::PullAck {
                    node: from,
                    filename,
                });
            }
            Ok(Some(other)) => {
                tracing::warn!(node = %node, frame = ?other, "unexpected frame on control channel");
            }
            Ok(None) => {
                let _ = link.cast(PeerLinkMsg::LinkClosed {
                    reason: "connection closed".to_string(),
                });
                break;
            }
            Err(e) => {
                let _ = link.cast(PeerLinkMsg::LinkClosed {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
}
