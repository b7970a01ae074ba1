//! CoordinatorActor - the sampling cluster's single point of control.
//!
//! One actor owns every piece of mutable coordinator state; its inbox is the
//! serialized command stream through which operator commands, peer replies,
//! timers, and death notices all pass. Startup is a chain of deferred
//! self-posts (`CheckMeshed` → `DistributeCode` → `InitAll`, ~300 ms apart)
//! so administrative queries can interleave with it. Collector liveness rides
//! on ractor supervision: each roster entry is a linked [`PeerLinkActor`]
//! whose failure is the death notice for that node's collector.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use tokio::net::TcpListener;

use doghair_proto::{CollectConfig, NodeId, StartMode};

use crate::actors::peer_link::{PeerLinkActor, PeerLinkArguments, PeerLinkMsg};
use crate::cluster::{is_meshed, PeerAddr};
use crate::{config, deploy, transfer};

/// Delay between the steps of the startup chain.
const STARTUP_STEP: Duration = Duration::from_millis(300);

#[derive(Debug, Default)]
pub struct CoordinatorActor;

/// One live collector: its home node, the control channel, and the monitor
/// token by which its death notice is recognized.
pub struct CollectorHandle {
    pub peer: PeerAddr,
    pub link: ActorRef<PeerLinkMsg>,
    pub token: ActorId,
}

#[derive(Debug, Clone)]
pub struct CoordinatorArguments {
    pub peers: Vec<PeerAddr>,
    /// Directory under which pull repositories are created.
    pub home: PathBuf,
    /// Flag file published by the mesh service.
    pub mesh_flag: PathBuf,
    /// Host peers use to reach per-file transfer listeners.
    pub advertise_host: String,
    /// Collector build version checked during distribution.
    pub version: String,
    pub probe_tries: u32,
    pub probe_interval: Duration,
    pub boot_timeout: Duration,
    pub deploy_timeout: Duration,
    pub accept_timeout: Duration,
    /// Settle before telling a peer where to connect for a transfer.
    pub settle: Duration,
    /// Stagger between per-peer dispatches of stop/quit.
    pub stagger: Duration,
    /// Grace period for peers to finalize after quit.
    pub drain: Duration,
}

impl CoordinatorArguments {
    pub fn new(
        peers: Vec<PeerAddr>,
        home: PathBuf,
        mesh_flag: PathBuf,
        advertise_host: String,
    ) -> Self {
        Self {
            peers,
            home,
            mesh_flag,
            advertise_host,
            version: env!("CARGO_PKG_VERSION").to_string(),
            probe_tries: 3,
            probe_interval: Duration::from_secs(5),
            boot_timeout: Duration::from_secs(5),
            deploy_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(5),
            settle: Duration::from_millis(500),
            stagger: Duration::from_millis(100),
            drain: Duration::from_secs(3),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(
            config::peer_endpoints()?,
            config::home_dir(),
            config::mesh_flag_path(),
            config::advertise_host(),
        ))
    }
}

pub struct CoordinatorState {
    args: CoordinatorArguments,
    collectors: HashMap<NodeId, CollectorHandle>,
    collecting: bool,
    start_clct_time: Option<DateTime<Utc>>,
    end_clct_time: Option<DateTime<Utc>>,
    /// Destination of the pull cycle in flight, if any.
    repo: Option<PathBuf>,
    transferred: usize,
    /// Roster size snapshotted when the pull was issued; completion compares
    /// against this, not the live roster.
    pull_goal: Option<usize>,
    /// Set by shutdown: the roster is logically gone and lifecycle commands
    /// are rejected.
    retired: bool,
    shutdown_reply: Option<RpcReplyPort<()>>,
}

#[derive(Debug)]
pub enum CoordinatorMsg {
    // Startup chain, self-posted.
    CheckMeshed { attempt: u32 },
    DistributeCode,
    InitAll,
    // Operator surface.
    StartCollect,
    StopCollect,
    Status { reply: RpcReplyPort<StatusReport> },
    Pull,
    Shutdown { reply: RpcReplyPort<()> },
    FinishShutdown,
    // Peer replies and transfer completions.
    PullAck { node: NodeId, filename: String },
    Retrieved {
        node: NodeId,
        filename: String,
        bytes: u64,
    },
}

/// Snapshot of the coordinator for the status command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub collectors: Vec<String>,
    pub collecting: bool,
    pub start_clct_time: String,
    pub end_clct_time: String,
    pub repo: Option<String>,
    pub transferred: usize,
    pub config: CollectConfig,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "collectors=[{}] collecting={} started={} ended={} interval={}ms topn={} smp={}",
            self.collectors.join(","),
            self.collecting,
            self.start_clct_time,
            self.end_clct_time,
            self.config.interval_ms,
            self.config.topn,
            self.config.smp,
        )
    }
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "undefined".to_string())
}

/// Repository directory name for a pull cycle started at `now`.
pub fn repo_dir_name(now: DateTime<Utc>) -> String {
    now.format("doghair_%Y_%m_%d_%H_%M_%S").to_string()
}

#[ractor::async_trait]
impl Actor for CoordinatorActor {
    type Msg = CoordinatorMsg;
    type State = CoordinatorState;
    type Arguments = CoordinatorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(peers = args.peers.len(), "coordinator starting");
        let _ = myself.send_after(STARTUP_STEP, || CoordinatorMsg::CheckMeshed { attempt: 1 });
        Ok(CoordinatorState {
            args,
            collectors: HashMap::new(),
            collecting: false,
            start_clct_time: None,
            end_clct_time: None,
            repo: None,
            transferred: 0,
            pull_goal: None,
            retired: false,
            shutdown_reply: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMsg::CheckMeshed { attempt } => {
                self.check_meshed(&myself, attempt, state).await
            }
            CoordinatorMsg::DistributeCode => {
                if state.retired {
                    return Ok(());
                }
                deploy::distribute(&state.args.peers, &state.args.version, state.args.deploy_timeout)
                    .await;
                let _ = myself.send_after(STARTUP_STEP, || CoordinatorMsg::InitAll);
                Ok(())
            }
            CoordinatorMsg::InitAll => self.init_all(&myself, state).await,
            CoordinatorMsg::StartCollect => {
                self.start_collect(state);
                Ok(())
            }
            CoordinatorMsg::StopCollect => {
                self.stop_collect(state).await;
                Ok(())
            }
            CoordinatorMsg::Status { reply } => {
                let report = self.status(state);
                tracing::info!(status = %report, "coordinator status");
                let _ = reply.send(report);
                Ok(())
            }
            CoordinatorMsg::Pull => {
                self.pull(state).await;
                Ok(())
            }
            CoordinatorMsg::Shutdown { reply } => {
                self.shutdown(&myself, reply, state).await;
                Ok(())
            }
            CoordinatorMsg::FinishShutdown => {
                self.finish_shutdown(&myself, state).await;
                Ok(())
            }
            CoordinatorMsg::PullAck { node, filename } => {
                self.pull_ack(&myself, node, filename, state).await;
                Ok(())
            }
            CoordinatorMsg::Retrieved {
                node,
                filename,
                bytes,
            } => {
                self.retrieved(node, filename, bytes, state);
                Ok(())
            }
        }
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorStarted(_) => Ok(()),
            SupervisionEvent::ActorFailed(cell, error) => {
                self.collector_down(&myself, cell.get_id(), error.to_string(), state)
                    .await
            }
            SupervisionEvent::ActorTerminated(cell, _last_state, reason) => {
                let reason = reason.unwrap_or_else(|| "terminated".to_string());
                self.collector_down(&myself, cell.get_id(), reason, state)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(collectors = state.collectors.len(), "coordinator stopped");
        Ok(())
    }
}

impl CoordinatorActor {
    async fn check_meshed(
        &self,
        myself: &ActorRef<CoordinatorMsg>,
        attempt: u32,
        state: &mut CoordinatorState,
    ) -> Result<(), ActorProcessingErr> {
        if state.retired {
            return Ok(());
        }
        if is_meshed(&state.args.mesh_flag).await {
            tracing::info!(attempt, "cluster is meshed");
            let _ = myself.send_after(STARTUP_STEP, || CoordinatorMsg::DistributeCode);
            return Ok(());
        }
        if attempt < state.args.probe_tries {
            tracing::debug!(attempt, "cluster not meshed yet, retrying");
            let next = attempt + 1;
            let _ = myself.send_after(state.args.probe_interval, move || {
                CoordinatorMsg::CheckMeshed { attempt: next }
            });
            return Ok(());
        }
        tracing::error!(tries = state.args.probe_tries, "cluster can not be meshed");
        Err(ActorProcessingErr::from("cluster can not be meshed"))
    }

    /// Boot a collector on every configured peer. Any boot failure or
    /// timeout here is fatal: later guarantees depend on a known,
    /// responsive peer set.
    async fn init_all(
        &self,
        myself: &ActorRef<CoordinatorMsg>,
        state: &mut CoordinatorState,
    ) -> Result<(), ActorProcessingErr> {
        if state.retired {
            return Ok(());
        }
        if !state.collectors.is_empty() {
            tracing::warn!("collectors are already initialized");
            return Ok(());
        }
        for peer in state.args.peers.clone() {
            match boot_link(myself, &peer, StartMode::Boot, state.args.boot_timeout).await {
                Ok(handle) => {
                    tracing::info!(node = %peer.node, "collector started");
                    state.collectors.insert(peer.node.clone(), handle);
                }
                Err(e) => {
                    tracing::error!(node = %peer.node, error = %e, "collector can not start");
                    return Err(ActorProcessingErr::from(format!(
                        "collector on {} can not start: {e}",
                        peer.node
                    )));
                }
            }
        }
        tracing::info!(count = state.collectors.len(), "collectors running on all nodes");
        Ok(())
    }

    fn start_collect(&self, state: &mut CoordinatorState) {
        if state.retired {
            tracing::warn!("coordinator is retired");
            return;
        }
        if state.collectors.is_empty() {
            tracing::warn!("there are no collectors at all");
            return;
        }
        if state.collecting {
            tracing::warn!("collecting is going");
            return;
        }
        state.collecting = true;
        state.start_clct_time = Some(Utc::now());
        state.end_clct_time = None;
        for handle in state.collectors.values() {
            if let Err(e) = handle.link.cast(PeerLinkMsg::StartCollect) {
                tracing::warn!(node = %handle.peer.node, error = %e, "start not delivered");
            }
        }
        tracing::info!(count = state.collectors.len(), "collecting started");
    }

    async fn stop_collect(&self, state: &mut CoordinatorState) {
        if state.retired {
            tracing::warn!("coordinator is retired");
            return;
        }
        if state.collectors.is_empty() {
            tracing::warn!("there are no collectors at all");
            return;
        }
        if !state.collecting {
            tracing::warn!("collecting is already stopped");
            return;
        }
        state.collecting = false;
        state.end_clct_time = Some(Utc::now());
        // Staggered so the peers do not all checkpoint at the same instant.
        for handle in state.collectors.values() {
            if let Err(e) = handle.link.cast(PeerLinkMsg::StopCollect) {
                tracing::warn!(node = %handle.peer.node, error = %e, "stop not delivered");
            }
            tokio::time::sleep(state.args.stagger).await;
        }
        tracing::info!("collecting stopped");
    }

    fn status(&self, state: &CoordinatorState) -> StatusReport {
        let mut collectors: Vec<String> = state
            .collectors
            .keys()
            .map(|n| n.as_str().to_string())
            .collect();
        collectors.sort();
        StatusReport {
            collectors,
            collecting: state.collecting,
            start_clct_time: fmt_time(state.start_clct_time),
            end_clct_time: fmt_time(state.end_clct_time),
            repo: state
                .repo
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            transferred: state.transferred,
            config: config::init_config(),
        }
    }

    async fn pull(&self, state: &mut CoordinatorState) {
        if state.retired {
            tracing::warn!("coordinator is retired");
            return;
        }
        if state.collecting {
            tracing::warn!("collector is working now");
            return;
        }
        let repo = state.args.home.join(repo_dir_name(Utc::now()));
        if let Err(e) = tokio::fs::create_dir_all(&repo).await {
            tracing::error!(repo = %repo.display(), error = %e, "can not create repository");
            return;
        }
        state.repo = Some(repo.clone());
        state.transferred = 0;
        state.pull_goal = Some(state.collectors.len());
        for handle in state.collectors.values() {
            if let Err(e) = handle.link.cast(PeerLinkMsg::Pull {
                coord: state.args.advertise_host.clone(),
            }) {
                tracing::warn!(node = %handle.peer.node, error = %e, "pull not delivered");
            }
        }
        tracing::info!(
            repo = %repo.display(),
            collectors = state.collectors.len(),
            "pulling data from collectors"
        );
    }

    /// A peer announced one file. Open the listener and spawn its receiver
    /// before replying, so the peer cannot connect ahead of the accept.
    async fn pull_ack(
        &self,
        myself: &ActorRef<CoordinatorMsg>,
        node: NodeId,
        filename: String,
        state: &mut CoordinatorState,
    ) {
        let Some(repo) = state.repo.clone() else {
            tracing::warn!(node = %node, filename = %filename, "pull ack outside a pull cycle");
            return;
        };
        let Some(safe_name) = transfer::sanitize_filename(&filename) else {
            tracing::warn!(node = %node, filename = %filename, "unusable filename announced");
            return;
        };
        let Some(handle) = state.collectors.get(&node) else {
            tracing::warn!(node = %node, "pull ack from a node no longer in the roster");
            return;
        };

        let listener = match TcpListener::bind(("0.0.0.0", 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(node = %node, error = %e, "can not open transfer listener");
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::error!(node = %node, error = %e, "can not read listener address");
                return;
            }
        };

        transfer::spawn_receiver(
            listener,
            repo.join(&safe_name),
            node.clone(),
            filename.clone(),
            state.args.accept_timeout,
            myself.clone(),
        );

        let link = handle.link.clone();
        let host = state.args.advertise_host.clone();
        let settle = state.args.settle;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            if let Err(e) = link.cast(PeerLinkMsg::TransReq {
                filename,
                host,
                port,
            }) {
                tracing::warn!(node = %node, error = %e, "trans_req not delivered");
            }
        });
    }

    fn retrieved(&self, node: NodeId, filename: String, bytes: u64, state: &mut CoordinatorState) {
        if state.repo.is_none() {
            tracing::warn!(node = %node, filename = %filename, "retrieval outside a pull cycle");
            return;
        }
        state.transferred += 1;
        tracing::info!(
            node = %node,
            filename = %filename,
            bytes,
            transferred = state.transferred,
            "file retrieved"
        );
        if state.pull_goal == Some(state.transferred) {
            tracing::info!("data on all nodes transfered");
        }
    }

    async fn shutdown(
        &self,
        myself: &ActorRef<CoordinatorMsg>,
        reply: RpcReplyPort<()>,
        state: &mut CoordinatorState,
    ) {
        if state.retired {
            let _ = reply.send(());
            return;
        }
        tracing::info!(collectors = state.collectors.len(), "coordinator shutting down");
        state.retired = true;
        state.collecting = false;
        state.shutdown_reply = Some(reply);

        // Demonitor before quitting so the exits are not taken for crashes.
        for handle in state.collectors.values() {
            handle.link.get_cell().unlink(myself.get_cell());
        }
        for handle in state.collectors.values() {
            if let Err(e) = handle.link.cast(PeerLinkMsg::Quit) {
                tracing::debug!(node = %handle.peer.node, error = %e, "quit not delivered");
            }
            tokio::time::sleep(state.args.stagger).await;
        }
        let _ = myself.send_after(state.args.drain, || CoordinatorMsg::FinishShutdown);
    }

    async fn finish_shutdown(
        &self,
        myself: &ActorRef<CoordinatorMsg>,
        state: &mut CoordinatorState,
    ) {
        deploy::retire(&state.args.peers, state.args.deploy_timeout).await;
        for handle in state.collectors.values() {
            handle.link.stop(Some("shutdown".to_string()));
        }
        state.collectors.clear();
        if let Some(reply) = state.shutdown_reply.take() {
            let _ = reply.send(());
        }
        myself.stop(Some("shutdown".to_string()));
    }

    /// Death notice for one collector: remove it, reboot it on its home
    /// node, and only once the reboot is acknowledged rejoin it to the run
    /// if collecting is still on. An unreachable node shrinks the roster
    /// instead of looping.
    async fn collector_down(
        &self,
        myself: &ActorRef<CoordinatorMsg>,
        token: ActorId,
        reason: String,
        state: &mut CoordinatorState,
    ) -> Result<(), ActorProcessingErr> {
        if state.retired {
            return Ok(());
        }
        let Some(node) = state
            .collectors
            .iter()
            .find(|(_, handle)| handle.token == token)
            .map(|(node, _)| node.clone())
        else {
            tracing::debug!(%token, reason = %reason, "death notice for an unknown collector");
            return Ok(());
        };
        let Some(handle) = state.collectors.remove(&node) else {
            return Ok(());
        };
        tracing::warn!(node = %node, reason = %reason, "collector died");

        match boot_link(myself, &handle.peer, StartMode::Reboot, state.args.boot_timeout).await {
            Ok(new_handle) => {
                tracing::info!(node = %node, "collector reborn");
                if state.collecting {
                    if let Err(e) = new_handle.link.cast(PeerLinkMsg::StartCollect) {
                        tracing::warn!(node = %node, error = %e, "start not delivered after rebirth");
                    }
                }
                state.collectors.insert(node, new_handle);
            }
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "collector goes home");
            }
        }
        Ok(())
    }
}

/// Spawn a linked control channel to one peer. The spawn succeeds only if
/// the peer acknowledged the boot within the deadline, so the returned
/// handle always satisfies roster purity.
async fn boot_link(
    myself: &ActorRef<CoordinatorMsg>,
    peer: &PeerAddr,
    mode: StartMode,
    boot_timeout: Duration,
) -> Result<CollectorHandle, ractor::SpawnErr> {
    let args = PeerLinkArguments {
        peer: peer.clone(),
        mode,
        config: config::init_config(),
        coordinator: myself.clone(),
        boot_deadline: boot_timeout,
    };
    let (link, _join) = Actor::spawn_linked(None, PeerLinkActor, args, myself.get_cell()).await?;
    Ok(CollectorHandle {
        peer: peer.clone(),
        token: link.get_cell().get_id(),
        link,
    })
}

// ============================================================================
// Operator surface
// ============================================================================

pub async fn start_collect(
    coordinator: &ActorRef<CoordinatorMsg>,
) -> Result<(), ractor::RactorErr<CoordinatorMsg>> {
    coordinator
        .cast(CoordinatorMsg::StartCollect)
        .map_err(ractor::RactorErr::from)
}

pub async fn stop_collect(
    coordinator: &ActorRef<CoordinatorMsg>,
) -> Result<(), ractor::RactorErr<CoordinatorMsg>> {
    coordinator
        .cast(CoordinatorMsg::StopCollect)
        .map_err(ractor::RactorErr::from)
}

pub async fn status(
    coordinator: &ActorRef<CoordinatorMsg>,
) -> Result<StatusReport, ractor::RactorErr<CoordinatorMsg>> {
    ractor::call!(coordinator, |reply| CoordinatorMsg::Status { reply })
}

pub async fn pull(
    coordinator: &ActorRef<CoordinatorMsg>,
) -> Result<(), ractor::RactorErr<CoordinatorMsg>> {
    coordinator
        .cast(CoordinatorMsg::Pull)
        .map_err(ractor::RactorErr::from)
}

pub async fn shutdown(
    coordinator: &ActorRef<CoordinatorMsg>,
) -> Result<(), ractor::RactorErr<CoordinatorMsg>> {
    ractor::call!(coordinator, |reply| CoordinatorMsg::Shutdown { reply })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn repo_names_carry_the_timestamp() {
        let t = Utc.with_ymd_and_hms(2026, 8, 2, 9, 5, 41).unwrap();
        assert_eq!(repo_dir_name(t), "doghair_2026_08_02_09_05_41");
    }

    #[test]
    fn undefined_until_first_use() {
        assert_eq!(fmt_time(None), "undefined");
        let t = Utc.with_ymd_and_hms(2026, 8, 2, 9, 5, 41).unwrap();
        assert_eq!(fmt_time(Some(t)), "2026-08-02T09:05:41Z");
    }
}
