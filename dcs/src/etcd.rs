use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, GetOptions, LeaderKey, ProclaimOptions, PutOptions, ResignOptions,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pgwarden_core::{Identity, InstanceInfo, Role};

use crate::keys;
use crate::{DcsError, DcsResult};

/// Contract of the consensus-store client, as the proxy consumes it.
///
/// Kept behind a trait so the proxy's breaker and degraded-mode inference
/// can be exercised against a scripted store in tests.
#[async_trait]
pub trait Dcs: Send + Sync {
    fn instance_id(&self) -> &str;

    /// Write this instance's hostname key so peers can find it before the
    /// first converged tick reports a role.
    async fn register(&self) -> DcsResult<()>;

    /// Enroll this instance in the election. Non-blocking: the campaign
    /// runs in the background and completes when this instance wins or the
    /// election session dies. Restartable; a newer call supersedes.
    async fn campaign(&self);

    /// Give up a held election entry. No-op when none is held.
    async fn resign(&self) -> DcsResult<()>;

    /// Instance id held by the oldest surviving election entry.
    async fn leader_id(&self) -> DcsResult<String>;

    async fn instance_info(&self, id: &str) -> DcsResult<InstanceInfo>;

    async fn list_instances(&self) -> DcsResult<Vec<InstanceInfo>>;

    /// Write this instance's hostname and role keys under the info lease.
    async fn put_instance_info(&self, role: Role) -> DcsResult<()>;

    /// Force leadership transfer: after success `leader_id` returns
    /// `candidate_id`. Only the current entry holder can do this.
    async fn promote(&self, candidate_id: &str) -> DcsResult<()>;

    /// Resign, stop background tasks, revoke both sessions.
    async fn close(&self) -> DcsResult<()>;
}

#[derive(Debug, Clone)]
pub struct DcsConfig {
    /// etcd endpoints, e.g. `["http://etcd-0:2379"]`.
    pub endpoints: Vec<String>,
    /// Cluster prefix under which all keys live.
    pub cluster: String,
    /// Election session TTL; bounds how long a dead leader blocks failover.
    pub election_ttl_secs: i64,
    /// Info session TTL; bounds how long stale metadata survives.
    pub info_ttl_secs: i64,
    /// Per-call deadline for unary store operations.
    pub call_timeout: Duration,
}

impl DcsConfig {
    pub fn new(endpoints: Vec<String>, cluster: impl Into<String>) -> Self {
        Self {
            endpoints,
            cluster: cluster.into(),
            election_ttl_secs: 10,
            info_ttl_secs: 3600,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// One lease-backed session. The keepalive task refreshes the lease and,
/// when the store reports it expired, grants a replacement in place so
/// later writes and campaigns have a live lease to attach to.
struct Session {
    label: &'static str,
    ttl_secs: i64,
    lease_id: AtomicI64,
}

impl Session {
    fn current_lease(&self) -> i64 {
        self.lease_id.load(Ordering::SeqCst)
    }
}

/// etcd v3 implementation of the consensus-store contract.
pub struct EtcdDcs {
    client: Client,
    identity: Identity,
    cluster: String,
    call_timeout: Duration,
    election_session: Arc<Session>,
    info_session: Arc<Session>,
    /// Election entry won by our campaign, needed to proclaim or resign.
    leader_key: Arc<tokio::sync::Mutex<Option<LeaderKey>>>,
    campaign_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    /// Child token scoping the keepalive/campaign tasks to this client.
    session_cancel: CancellationToken,
}

impl EtcdDcs {
    /// Connect and establish both sessions.
    ///
    /// # Errors
    ///
    /// Returns `Transient` when the store is unreachable; the caller is
    /// expected to retry connecting at startup.
    pub async fn connect(
        config: DcsConfig,
        identity: Identity,
        cancel: &CancellationToken,
    ) -> DcsResult<Self> {
        let options = ConnectOptions::new().with_connect_timeout(config.call_timeout);
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(DcsError::from_etcd)?;

        let session_cancel = cancel.child_token();

        let election_session =
            Self::grant_session(&client, "election", config.election_ttl_secs).await?;
        let info_session = Self::grant_session(&client, "info", config.info_ttl_secs).await?;

        // Keepalives run until the session token is cancelled; the handles
        // are not joined, cancellation is their only shutdown path.
        let _ = Self::spawn_keepalive_task(client.clone(), election_session.clone(), &session_cancel);
        let _ = Self::spawn_keepalive_task(client.clone(), info_session.clone(), &session_cancel);

        tracing::info!(
            cluster = %config.cluster,
            election_ttl = config.election_ttl_secs,
            info_ttl = config.info_ttl_secs,
            "connected to consensus store"
        );

        Ok(Self {
            client,
            identity,
            cluster: config.cluster,
            call_timeout: config.call_timeout,
            election_session,
            info_session,
            leader_key: Arc::new(tokio::sync::Mutex::new(None)),
            campaign_task: tokio::sync::Mutex::new(None),
            session_cancel,
        })
    }

    async fn grant_session(
        client: &Client,
        label: &'static str,
        ttl_secs: i64,
    ) -> DcsResult<Arc<Session>> {
        let resp = client
            .lease_client()
            .grant(ttl_secs, None)
            .await
            .map_err(DcsError::from_etcd)?;
        tracing::debug!(session = label, lease = resp.id(), ttl_secs, "session granted");
        Ok(Arc::new(Session {
            label,
            ttl_secs,
            lease_id: AtomicI64::new(resp.id()),
        }))
    }

    fn spawn_keepalive_task(
        client: Client,
        session: Arc<Session>,
        cancel: &CancellationToken,
    ) -> JoinHandle<()> {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(((session.ttl_secs as u64) / 3).max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(session = session.label, "keepalive task shutting down");
                        break;
                    }

                    _ = interval.tick() => {
                        if let Err(e) = Self::refresh_lease(&client, &session).await {
                            consecutive_failures += 1;
                            let backoff_ms = 100 * 2u64.pow(consecutive_failures.min(6));
                            tracing::error!(
                                session = session.label,
                                failures = consecutive_failures,
                                backoff_ms,
                                "lease keepalive failed: {}, backing off",
                                e
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                            }
                            continue;
                        }
                        consecutive_failures = 0;
                    }
                }
            }
        })
    }

    /// Send one keepalive; when the store says the lease is gone, grant a
    /// replacement so subsequent writes and campaigns can proceed. A lost
    /// election session takes our election entry with it; loss of
    /// leadership is observed by callers through `leader_id`.
    async fn refresh_lease(client: &Client, session: &Session) -> DcsResult<()> {
        let id = session.current_lease();
        let mut lease = client.lease_client();
        let (mut keeper, mut stream) = lease.keep_alive(id).await.map_err(DcsError::from_etcd)?;
        keeper.keep_alive().await.map_err(DcsError::from_etcd)?;
        let expired = match stream.message().await.map_err(DcsError::from_etcd)? {
            Some(resp) => resp.ttl() <= 0,
            None => true,
        };

        if expired {
            let granted = lease
                .grant(session.ttl_secs, None)
                .await
                .map_err(DcsError::from_etcd)?;
            session.lease_id.store(granted.id(), Ordering::SeqCst);
            tracing::warn!(
                session = session.label,
                new_lease = granted.id(),
                "session expired at the store, granted replacement lease"
            );
        }
        Ok(())
    }

    /// Apply the per-call deadline to a unary store operation.
    async fn deadline<T, F>(&self, fut: F) -> DcsResult<T>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(DcsError::from_etcd(e)),
            Err(_) => Err(DcsError::transient("deadline exceeded")),
        }
    }

    async fn get_prefix(&self, prefix: String) -> DcsResult<Vec<(String, String)>> {
        let mut kv = self.client.kv_client();
        let resp = self
            .deadline(kv.get(prefix, Some(GetOptions::new().with_prefix())))
            .await?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for entry in resp.kvs() {
            let key = entry
                .key_str()
                .map_err(|e| DcsError::corrupt(format!("non-utf8 key: {}", e)))?;
            let value = entry
                .value_str()
                .map_err(|e| DcsError::corrupt(format!("non-utf8 value at {}: {}", key, e)))?;
            pairs.push((key.to_string(), value.to_string()));
        }
        Ok(pairs)
    }
}

#[async_trait]
impl Dcs for EtcdDcs {
    fn instance_id(&self) -> &str {
        &self.identity.instance_id
    }

    async fn register(&self) -> DcsResult<()> {
        let lease = self.info_session.current_lease();
        let mut kv = self.client.kv_client();
        self.deadline(kv.put(
            keys::hostname_key(&self.cluster, &self.identity.instance_id),
            self.identity.hostname.clone(),
            Some(PutOptions::new().with_lease(lease)),
        ))
        .await?;
        tracing::info!(hostname = %self.identity.hostname, "instance registered");
        Ok(())
    }

    async fn campaign(&self) {
        let mut guard = self.campaign_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        let client = self.client.clone();
        let name = keys::election_name(&self.cluster);
        let value = self.identity.instance_id.clone();
        let lease_id = self.election_session.current_lease();
        let cancel = self.session_cancel.clone();
        let leader_slot = self.leader_key.clone();

        // The campaign blocks server-side until this instance holds the
        // oldest surviving entry; the task parks on it without a deadline.
        let handle = tokio::spawn(async move {
            let mut election = client.election_client();
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = election.campaign(name, value, lease_id) => match result {
                    Ok(resp) => {
                        if let Some(leader) = resp.leader() {
                            *leader_slot.lock().await = Some(leader.clone());
                        }
                        tracing::info!("election campaign won");
                    }
                    Err(e) => {
                        tracing::warn!("election campaign ended: {}", e);
                    }
                }
            }
        });
        *guard = Some(handle);
    }

    async fn resign(&self) -> DcsResult<()> {
        let taken = self.leader_key.lock().await.take();
        let Some(leader) = taken else {
            return Ok(());
        };

        let mut election = self.client.election_client();
        let result = self
            .deadline(election.resign(Some(ResignOptions::new().with_leader(leader.clone()))))
            .await;
        match result {
            Ok(_) => {
                tracing::info!("resigned election entry");
                Ok(())
            }
            Err(e) => {
                // Keep the key so a retry (or close) can resign later.
                *self.leader_key.lock().await = Some(leader);
                Err(e)
            }
        }
    }

    async fn leader_id(&self) -> DcsResult<String> {
        let mut election = self.client.election_client();
        let resp = self
            .deadline(election.leader(keys::election_name(&self.cluster)))
            .await?;
        let kv = resp.kv().ok_or(DcsError::NoLeader)?;
        let value = kv
            .value_str()
            .map_err(|e| DcsError::corrupt(format!("non-utf8 election entry: {}", e)))?;
        if value.is_empty() {
            return Err(DcsError::NoLeader);
        }
        Ok(value.to_string())
    }

    async fn instance_info(&self, id: &str) -> DcsResult<InstanceInfo> {
        let prefix = format!("{}{}/", keys::info_prefix(&self.cluster), id);
        let pairs = self.get_prefix(prefix).await?;
        let instances = keys::assemble_instances(&self.cluster, &pairs)?;
        instances
            .into_iter()
            .next()
            .ok_or_else(|| DcsError::transient(format!("instance {} not registered", id)))
    }

    async fn list_instances(&self) -> DcsResult<Vec<InstanceInfo>> {
        let pairs = self.get_prefix(keys::info_prefix(&self.cluster)).await?;
        keys::assemble_instances(&self.cluster, &pairs)
    }

    async fn put_instance_info(&self, role: Role) -> DcsResult<()> {
        let lease = self.info_session.current_lease();
        let mut kv = self.client.kv_client();

        self.deadline(kv.put(
            keys::hostname_key(&self.cluster, &self.identity.instance_id),
            self.identity.hostname.clone(),
            Some(PutOptions::new().with_lease(lease)),
        ))
        .await?;

        self.deadline(kv.put(
            keys::role_key(&self.cluster, &self.identity.instance_id),
            role.as_str(),
            Some(PutOptions::new().with_lease(lease)),
        ))
        .await?;

        Ok(())
    }

    async fn promote(&self, candidate_id: &str) -> DcsResult<()> {
        let leader = {
            let guard = self.leader_key.lock().await;
            guard.as_ref().cloned().ok_or(DcsError::NotLeader)?
        };

        let mut election = self.client.election_client();
        self.deadline(election.proclaim(
            candidate_id,
            Some(ProclaimOptions::new().with_leader(leader)),
        ))
        .await?;
        tracing::info!(candidate = candidate_id, "election entry proclaimed for candidate");
        Ok(())
    }

    async fn close(&self) -> DcsResult<()> {
        if let Err(e) = self.resign().await {
            tracing::warn!("resign during close failed: {}", e);
        }

        if let Some(handle) = self.campaign_task.lock().await.take() {
            handle.abort();
        }
        self.session_cancel.cancel();

        let mut lease = self.client.lease_client();
        for session in [&self.election_session, &self.info_session] {
            let id = session.current_lease();
            if let Err(e) = self.deadline(lease.revoke(id)).await {
                tracing::warn!(session = session.label, "lease revoke failed: {}", e);
            }
        }

        tracing::info!("consensus-store client closed");
        Ok(())
    }
}
