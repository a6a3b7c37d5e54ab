use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pgwarden_core::{
    ClusterView, Fault, Identity, PeerStatus, PostgresControl, Role, RoleAssessment, StopMode,
};

use crate::DaemonError;

/// The reconciliation daemon.
///
/// Every tick it reads the cluster-arbitrated role and converges the local
/// PostgreSQL toward it. The tick is strictly serial: no two convergence
/// actions ever overlap on one supervisor, and the decision trees only take
/// destructive steps (`empty_data_dir`, `promote`) behind orthogonal
/// confirmations so a stale read cannot wipe live data or split the brain.
pub struct Daemon {
    cluster: Arc<dyn ClusterView>,
    postgres: Arc<dyn PostgresControl>,
    identity: Identity,
    tick_interval: Duration,
    cancel: CancellationToken,
}

impl Daemon {
    pub fn new(
        cluster: Arc<dyn ClusterView>,
        postgres: Arc<dyn PostgresControl>,
        identity: Identity,
        tick_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            postgres,
            identity,
            tick_interval,
            cancel,
        }
    }

    /// Tick until cancelled or a fatal fault surfaces.
    ///
    /// Transient and unsafe faults are logged and the loop continues; the
    /// next tick retries from fresh observations.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("reconciliation loop shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(()) => {}
                        Err(Fault::Fatal(msg)) => {
                            tracing::error!("fatal fault, aborting supervisor: {}", msg);
                            return Err(DaemonError::Fatal(msg));
                        }
                        Err(Fault::Transient(msg)) => {
                            tracing::warn!("tick deferred: {}", msg);
                        }
                        Err(Fault::Unsafe(msg)) => {
                            tracing::error!("tick refused unsafe action: {}", msg);
                        }
                    }
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn tick(&self) -> Result<(), Fault> {
        let assessment = match self.cluster.assess_role().await {
            Ok(assessment) => assessment,
            Err(fault @ Fault::Fatal(_)) => return Err(fault),
            Err(fault) => {
                tracing::warn!("could not establish role, skipping tick: {}", fault);
                return Ok(());
            }
        };

        if assessment == RoleAssessment::UnverifiedLeader {
            // A writable server whose store is unreachable cannot prove it
            // is the unique primary. Touch nothing; the breaker retries.
            tracing::error!(
                "running writable without a reachable consensus store, holding all actions"
            );
            return Ok(());
        }

        let role = assessment.role();
        tracing::debug!(role = %role, "tick");
        match role {
            Role::Leader => self.leader_converge().await?,
            Role::Replica => self.replica_converge().await?,
        }

        // Presence report is best-effort; convergence already happened.
        if let Err(e) = self.cluster.save_instance_info(role).await {
            tracing::warn!("could not report instance info: {}", e);
        }
        Ok(())
    }

    async fn leader_converge(&self) -> Result<(), Fault> {
        if self.postgres.is_data_dir_empty().await? {
            tracing::info!("empty data directory, bootstrapping as leader");
            self.postgres.init().await?;
            self.postgres.write_configs(Role::Leader, None).await?;
            self.postgres.start().await?;
            self.postgres.setup_replication().await?;
            return Ok(());
        }

        if self.postgres.is_running().await {
            if !self.postgres.is_in_recovery().await? {
                return Ok(());
            }
            // In recovery but elected leader: a failover landed on us.
            // Promote only once no other writable instance can exist.
            match self.is_there_orphan_leader().await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::error!("another writable instance exists, refusing to promote");
                    return Ok(());
                }
                Err(fault) => {
                    tracing::error!("orphan probe inconclusive, refusing to promote: {}", fault);
                    return Ok(());
                }
            }
            self.postgres.promote().await?;
            return Ok(());
        }

        // Data present, server down: bring it back; if it wakes in
        // recovery the next tick handles promotion.
        self.postgres.start().await
    }

    async fn replica_converge(&self) -> Result<(), Fault> {
        if self.postgres.is_data_dir_empty().await? {
            return self.bootstrap_and_start_replica().await;
        }

        if self.postgres.is_running().await {
            if self.postgres.is_in_recovery().await? {
                return Ok(());
            }
            // Writable while the cluster expects a replica: this server is
            // suspect and its timeline may have diverged.
            tracing::warn!("writable but expected to be a replica, stopping and re-bootstrapping");
            self.postgres.stop(StopMode::Fast).await?;
            return self.bootstrap_and_start_replica().await;
        }

        // Data present but the server is down. Its history is unknown, so
        // starting it blindly could resurrect a stale timeline.
        self.bootstrap_and_start_replica().await
    }

    /// Rebuild this instance as a replica of the current leader.
    async fn bootstrap_and_start_replica(&self) -> Result<(), Fault> {
        let leader = self.cluster.leader_info().await?;
        tracing::info!(
            leader_id = %leader.instance_id,
            leader_host = %leader.hostname,
            "bootstrapping replica from leader"
        );

        self.postgres
            .block_and_wait_for_leader(&leader.hostname)
            .await?;
        self.postgres.empty_data_dir().await?;
        self.postgres.make_base_backup(&leader.hostname).await?;
        self.postgres
            .create_replication_slot(&leader.hostname, &self.identity.instance_id)
            .await?;
        self.postgres
            .write_configs(Role::Replica, Some(&leader.hostname))
            .await?;
        self.postgres.start().await
    }

    /// Whether any other instance in the cluster is writable.
    ///
    /// Fails closed: a peer that connects but cannot be queried blocks
    /// promotion. A peer that refuses the connection outright is down and
    /// cannot be an orphan leader.
    async fn is_there_orphan_leader(&self) -> Result<bool, Fault> {
        let instances = self.cluster.list_instances().await?;
        for instance in instances {
            if instance.instance_id == self.identity.instance_id {
                continue;
            }
            match self.postgres.peer_status(&instance.hostname).await? {
                PeerStatus::InRecovery => {}
                PeerStatus::Unreachable => {
                    tracing::warn!(
                        peer = %instance.hostname,
                        "peer unreachable during orphan probe, treating as down"
                    );
                }
                PeerStatus::Writable => {
                    tracing::error!(peer = %instance.hostname, "peer is writable");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pgwarden_core::InstanceInfo;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory PostgreSQL double: tracks process/data-dir state and
    /// records every mutating call in order.
    struct MockPostgres {
        state: Mutex<PgState>,
        calls: Mutex<Vec<String>>,
    }

    #[derive(Clone)]
    struct PgState {
        running: bool,
        in_recovery: bool,
        data_dir_empty: bool,
        /// Whether the data dir carries a standby signal, deciding the
        /// recovery flag at next start.
        standby: bool,
        peers: HashMap<String, PeerStatus>,
        peer_probe_fails: bool,
        write_configs_fails: bool,
    }

    impl Default for PgState {
        fn default() -> Self {
            Self {
                running: false,
                in_recovery: false,
                data_dir_empty: true,
                standby: false,
                peers: HashMap::new(),
                peer_probe_fails: false,
                write_configs_fails: false,
            }
        }
    }

    impl MockPostgres {
        fn new(state: PgState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn state(&self) -> PgState {
            self.state.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PostgresControl for MockPostgres {
        async fn init(&self) -> Result<(), Fault> {
            self.record("init");
            let mut s = self.state.lock().unwrap();
            if !s.data_dir_empty {
                return Err(Fault::unsafe_refusal("already initialised"));
            }
            s.data_dir_empty = false;
            s.standby = false;
            Ok(())
        }

        async fn start(&self) -> Result<(), Fault> {
            self.record("start");
            let mut s = self.state.lock().unwrap();
            if !s.running {
                s.running = true;
                s.in_recovery = s.standby;
            }
            Ok(())
        }

        async fn stop(&self, mode: StopMode) -> Result<(), Fault> {
            self.record(format!("stop({})", mode.as_str()));
            let mut s = self.state.lock().unwrap();
            s.running = false;
            Ok(())
        }

        async fn promote(&self) -> Result<(), Fault> {
            self.record("promote");
            let mut s = self.state.lock().unwrap();
            s.in_recovery = false;
            s.standby = false;
            Ok(())
        }

        async fn is_running(&self) -> bool {
            self.state.lock().unwrap().running
        }

        async fn is_in_recovery(&self) -> Result<bool, Fault> {
            Ok(self.state.lock().unwrap().in_recovery)
        }

        async fn is_data_dir_empty(&self) -> Result<bool, Fault> {
            Ok(self.state.lock().unwrap().data_dir_empty)
        }

        async fn empty_data_dir(&self) -> Result<(), Fault> {
            self.record("empty_data_dir");
            let mut s = self.state.lock().unwrap();
            if s.running {
                return Err(Fault::unsafe_refusal(
                    "server is running, will not wipe its data directory",
                ));
            }
            s.data_dir_empty = true;
            s.standby = false;
            Ok(())
        }

        async fn make_base_backup(&self, leader_host: &str) -> Result<(), Fault> {
            self.record(format!("make_base_backup({})", leader_host));
            let mut s = self.state.lock().unwrap();
            if !s.data_dir_empty {
                return Err(Fault::transient("target directory not empty"));
            }
            s.data_dir_empty = false;
            s.standby = true;
            Ok(())
        }

        async fn block_and_wait_for_leader(&self, leader_host: &str) -> Result<(), Fault> {
            self.record(format!("wait_for_leader({})", leader_host));
            Ok(())
        }

        async fn write_configs(
            &self,
            role: Role,
            _leader_host: Option<&str>,
        ) -> Result<(), Fault> {
            self.record(format!("write_configs({})", role));
            if self.state.lock().unwrap().write_configs_fails {
                return Err(Fault::fatal("config render failed"));
            }
            Ok(())
        }

        async fn setup_replication(&self) -> Result<(), Fault> {
            self.record("setup_replication");
            Ok(())
        }

        async fn create_replication_slot(
            &self,
            host: &str,
            slot_name: &str,
        ) -> Result<(), Fault> {
            self.record(format!("create_slot({}, {})", host, slot_name));
            Ok(())
        }

        async fn peer_status(&self, host: &str) -> Result<PeerStatus, Fault> {
            self.record(format!("peer_status({})", host));
            let s = self.state.lock().unwrap();
            if s.peer_probe_fails {
                return Err(Fault::transient("probe query failed"));
            }
            Ok(*s.peers.get(host).unwrap_or(&PeerStatus::Unreachable))
        }
    }

    /// Scripted cluster view.
    struct MockCluster {
        assessments: Mutex<Vec<Assessment>>,
        leader: Option<InstanceInfo>,
        instances: Vec<InstanceInfo>,
        saved: Mutex<Vec<Role>>,
        save_fails: bool,
    }

    enum Assessment {
        Role(RoleAssessment),
        Unavailable,
    }

    impl MockCluster {
        fn confirmed(role: Role) -> Self {
            Self::with_assessment(Assessment::Role(RoleAssessment::Confirmed(role)))
        }

        fn with_assessment(a: Assessment) -> Self {
            Self {
                assessments: Mutex::new(vec![a]),
                leader: None,
                instances: Vec::new(),
                saved: Mutex::new(Vec::new()),
                save_fails: false,
            }
        }

        fn with_leader(mut self, id: &str, host: &str) -> Self {
            self.leader = Some(InstanceInfo {
                instance_id: id.to_string(),
                hostname: host.to_string(),
                role: Some(Role::Leader),
            });
            self
        }

        fn with_instance(mut self, id: &str, host: &str, role: Option<Role>) -> Self {
            self.instances.push(InstanceInfo {
                instance_id: id.to_string(),
                hostname: host.to_string(),
                role,
            });
            self
        }

        fn saved_roles(&self) -> Vec<Role> {
            self.saved.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterView for MockCluster {
        async fn assess_role(&self) -> Result<RoleAssessment, Fault> {
            let mut scripts = self.assessments.lock().unwrap();
            let next = if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                // Last assessment repeats, so multi-tick tests are stable.
                match &scripts[0] {
                    Assessment::Role(r) => Assessment::Role(*r),
                    Assessment::Unavailable => Assessment::Unavailable,
                }
            };
            match next {
                Assessment::Role(r) => Ok(r),
                Assessment::Unavailable => Err(Fault::transient("could not establish role")),
            }
        }

        async fn save_instance_info(&self, role: Role) -> Result<(), Fault> {
            if self.save_fails {
                return Err(Fault::transient("store write failed"));
            }
            self.saved.lock().unwrap().push(role);
            Ok(())
        }

        async fn leader_info(&self) -> Result<InstanceInfo, Fault> {
            self.leader
                .clone()
                .ok_or_else(|| Fault::transient("no leader info"))
        }

        async fn list_instances(&self) -> Result<Vec<InstanceInfo>, Fault> {
            Ok(self.instances.clone())
        }
    }

    const SELF_ID: &str = "self-0000";

    fn daemon(cluster: Arc<MockCluster>, postgres: Arc<MockPostgres>) -> Daemon {
        Daemon::new(
            cluster,
            postgres,
            Identity {
                instance_id: SELF_ID.to_string(),
                hostname: "db-self".to_string(),
            },
            Duration::from_secs(10),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_leader_bootstrap_on_empty_data_dir() {
        let cluster = Arc::new(MockCluster::confirmed(Role::Leader));
        let pg = MockPostgres::new(PgState::default());
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        assert_eq!(
            pg.calls(),
            vec![
                "init",
                "write_configs(leader)",
                "start",
                "setup_replication"
            ]
        );
        let s = pg.state();
        assert!(s.running && !s.in_recovery);
        assert_eq!(cluster.saved_roles(), vec![Role::Leader]);
    }

    #[tokio::test]
    async fn test_leader_already_writable_is_idempotent() {
        let cluster = Arc::new(MockCluster::confirmed(Role::Leader));
        let pg = MockPostgres::new(PgState {
            running: true,
            in_recovery: false,
            data_dir_empty: false,
            ..PgState::default()
        });
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();
        d.tick().await.unwrap();

        // Probes only: no mutating call on either tick.
        assert!(pg.calls().is_empty());
        assert_eq!(cluster.saved_roles(), vec![Role::Leader, Role::Leader]);
    }

    #[tokio::test]
    async fn test_leader_in_recovery_promotes_when_peers_confirmed_replicas() {
        let cluster = Arc::new(
            MockCluster::confirmed(Role::Leader)
                .with_instance(SELF_ID, "db-self", Some(Role::Replica))
                .with_instance("peer-1", "db-1", Some(Role::Replica)),
        );
        let mut state = PgState {
            running: true,
            in_recovery: true,
            data_dir_empty: false,
            standby: true,
            ..PgState::default()
        };
        state.peers.insert("db-1".into(), PeerStatus::InRecovery);
        let pg = MockPostgres::new(state);
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        assert_eq!(pg.calls(), vec!["peer_status(db-1)", "promote"]);
        assert!(!pg.state().in_recovery);
    }

    #[tokio::test]
    async fn test_promote_guard_refuses_with_writable_peer() {
        let cluster = Arc::new(
            MockCluster::confirmed(Role::Leader)
                .with_instance("peer-1", "db-1", Some(Role::Leader)),
        );
        let mut state = PgState {
            running: true,
            in_recovery: true,
            data_dir_empty: false,
            standby: true,
            ..PgState::default()
        };
        state.peers.insert("db-1".into(), PeerStatus::Writable);
        let pg = MockPostgres::new(state);
        let d = daemon(cluster.clone(), pg.clone());

        // Swallowed with an error log; the tick itself succeeds.
        d.tick().await.unwrap();

        let calls = pg.calls();
        assert!(!calls.contains(&"promote".to_string()));
        assert!(pg.state().in_recovery, "must still be a replica");
    }

    #[tokio::test]
    async fn test_promote_guard_fails_closed_on_probe_error() {
        let cluster = Arc::new(
            MockCluster::confirmed(Role::Leader)
                .with_instance("peer-1", "db-1", Some(Role::Replica)),
        );
        let mut state = PgState {
            running: true,
            in_recovery: true,
            data_dir_empty: false,
            standby: true,
            ..PgState::default()
        };
        state.peer_probe_fails = true;
        state.peers.insert("db-1".into(), PeerStatus::InRecovery);
        let pg = MockPostgres::new(state);
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        assert!(!pg.calls().contains(&"promote".to_string()));
        assert!(pg.state().in_recovery);
    }

    #[tokio::test]
    async fn test_promote_guard_ignores_unreachable_peer() {
        // A SIGKILLed ex-leader is unreachable; failover must proceed.
        let cluster = Arc::new(
            MockCluster::confirmed(Role::Leader)
                .with_instance("dead-leader", "db-dead", Some(Role::Leader)),
        );
        let state = PgState {
            running: true,
            in_recovery: true,
            data_dir_empty: false,
            standby: true,
            ..PgState::default()
        };
        let pg = MockPostgres::new(state);
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        assert!(pg.calls().contains(&"promote".to_string()));
        assert!(!pg.state().in_recovery);
    }

    #[tokio::test]
    async fn test_leader_with_data_but_stopped_is_started_not_wiped() {
        let cluster = Arc::new(MockCluster::confirmed(Role::Leader));
        let pg = MockPostgres::new(PgState {
            running: false,
            data_dir_empty: false,
            ..PgState::default()
        });
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        assert_eq!(pg.calls(), vec!["start"]);
        assert!(pg.state().running);
    }

    #[tokio::test]
    async fn test_replica_bootstrap_order_on_empty_dir() {
        let cluster = Arc::new(
            MockCluster::confirmed(Role::Replica).with_leader("leader-1", "db-leader"),
        );
        let pg = MockPostgres::new(PgState::default());
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        let expected: Vec<String> = vec![
            "wait_for_leader(db-leader)".to_string(),
            "empty_data_dir".to_string(),
            "make_base_backup(db-leader)".to_string(),
            format!("create_slot(db-leader, {})", SELF_ID),
            "write_configs(replica)".to_string(),
            "start".to_string(),
        ];
        assert_eq!(pg.calls(), expected);
        let s = pg.state();
        assert!(s.running && s.in_recovery, "replica must come up in recovery");
        assert_eq!(cluster.saved_roles(), vec![Role::Replica]);
    }

    #[tokio::test]
    async fn test_replica_in_recovery_is_idempotent() {
        let cluster = Arc::new(MockCluster::confirmed(Role::Replica));
        let pg = MockPostgres::new(PgState {
            running: true,
            in_recovery: true,
            data_dir_empty: false,
            standby: true,
            ..PgState::default()
        });
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();
        d.tick().await.unwrap();

        assert!(pg.calls().is_empty());
    }

    #[tokio::test]
    async fn test_suspect_writable_replica_is_stopped_then_rebuilt() {
        let cluster = Arc::new(
            MockCluster::confirmed(Role::Replica).with_leader("leader-1", "db-leader"),
        );
        let pg = MockPostgres::new(PgState {
            running: true,
            in_recovery: false,
            data_dir_empty: false,
            ..PgState::default()
        });
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        let calls = pg.calls();
        assert_eq!(calls[0], "stop(fast)");
        // The wipe happened after the stop, never against a live server.
        let stop_idx = 0;
        let wipe_idx = calls.iter().position(|c| c == "empty_data_dir").unwrap();
        assert!(wipe_idx > stop_idx);
        let s = pg.state();
        assert!(s.running && s.in_recovery);
    }

    #[tokio::test]
    async fn test_replica_with_data_but_stopped_rebootstraps() {
        // S5-style: never start blindly over unknown history.
        let cluster = Arc::new(
            MockCluster::confirmed(Role::Replica).with_leader("leader-1", "db-leader"),
        );
        let pg = MockPostgres::new(PgState {
            running: false,
            data_dir_empty: false,
            ..PgState::default()
        });
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        let calls = pg.calls();
        assert_eq!(calls[0], "wait_for_leader(db-leader)");
        assert!(calls.contains(&"empty_data_dir".to_string()));
        assert!(calls.contains(&"make_base_backup(db-leader)".to_string()));
        // "start" only appears as the final step of the bootstrap.
        assert_eq!(calls.last().unwrap(), "start");
    }

    #[tokio::test]
    async fn test_unverified_leader_tick_touches_nothing() {
        let cluster = Arc::new(MockCluster::with_assessment(Assessment::Role(
            RoleAssessment::UnverifiedLeader,
        )));
        let pg = MockPostgres::new(PgState {
            running: true,
            in_recovery: false,
            data_dir_empty: false,
            ..PgState::default()
        });
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();

        assert!(pg.calls().is_empty(), "no action under degraded store");
        assert!(
            cluster.saved_roles().is_empty(),
            "no role report under degraded store"
        );
    }

    #[tokio::test]
    async fn test_unknown_role_skips_tick() {
        let cluster = Arc::new(MockCluster::with_assessment(Assessment::Unavailable));
        let pg = MockPostgres::new(PgState::default());
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();
        assert!(pg.calls().is_empty());
    }

    #[tokio::test]
    async fn test_inferred_replica_converges_as_replica() {
        // Store down, local server applying WAL: harmless, stays put.
        let cluster = Arc::new(MockCluster::with_assessment(Assessment::Role(
            RoleAssessment::InferredReplica,
        )));
        let pg = MockPostgres::new(PgState {
            running: true,
            in_recovery: true,
            data_dir_empty: false,
            standby: true,
            ..PgState::default()
        });
        let d = daemon(cluster.clone(), pg.clone());

        d.tick().await.unwrap();
        assert!(pg.calls().is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_does_not_fail_tick() {
        let mut cluster = MockCluster::confirmed(Role::Leader);
        cluster.save_fails = true;
        let cluster = Arc::new(cluster);
        let pg = MockPostgres::new(PgState {
            running: true,
            in_recovery: false,
            data_dir_empty: false,
            ..PgState::default()
        });
        let d = daemon(cluster, pg);

        d.tick().await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_converge_fault_surfaces() {
        let cluster = Arc::new(MockCluster::confirmed(Role::Leader));
        let mut state = PgState::default();
        state.write_configs_fails = true;
        let pg = MockPostgres::new(state);
        let d = daemon(cluster, pg);

        let err = d.tick().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_run_loop_exits_on_cancel() {
        let cluster = Arc::new(MockCluster::confirmed(Role::Replica));
        let pg = MockPostgres::new(PgState {
            running: true,
            in_recovery: true,
            data_dir_empty: false,
            standby: true,
            ..PgState::default()
        });
        let cancel = CancellationToken::new();
        let d = Daemon::new(
            cluster,
            pg,
            Identity {
                instance_id: SELF_ID.to_string(),
                hostname: "db-self".to_string(),
            },
            Duration::from_millis(10),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { d.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run loop must exit promptly on cancel")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_loop_aborts_on_fatal() {
        let cluster = Arc::new(MockCluster::confirmed(Role::Leader));
        let mut state = PgState::default();
        state.write_configs_fails = true;
        let pg = MockPostgres::new(state);
        let d = Daemon::new(
            cluster,
            pg,
            Identity {
                instance_id: SELF_ID.to_string(),
                hostname: "db-self".to_string(),
            },
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        let result = tokio::time::timeout(Duration::from_secs(1), d.run())
            .await
            .expect("fatal fault must abort the loop");
        assert!(matches!(result, Err(DaemonError::Fatal(_))));
    }
}
