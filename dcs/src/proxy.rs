use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pgwarden_core::{
    ClusterView, Fault, InstanceInfo, RecoveryProbe, RetryPolicy, Role, RoleAssessment,
};

use crate::etcd::Dcs;
use crate::{CircuitBreaker, DcsError, DcsResult};

/// Consecutive transient failures before the breaker opens.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// How long the breaker stays open before probing again.
const BREAKER_COOL_DOWN: Duration = Duration::from_secs(30);

/// Retry + circuit-breaker wrapper around the consensus-store client.
///
/// Every call is retried with the injected policy before surfacing an
/// error. Sustained unavailability opens the `"DCS"` breaker; when a probe
/// call later succeeds the breaker recloses and the proxy starts exactly
/// one fresh election campaign, because the campaign that was running when
/// the store went away died with its session.
pub struct DcsProxy {
    client: Arc<dyn Dcs>,
    probe: Arc<dyn RecoveryProbe>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    cancel: CancellationToken,
}

impl DcsProxy {
    pub fn new(
        client: Arc<dyn Dcs>,
        probe: Arc<dyn RecoveryProbe>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            probe,
            retry,
            breaker: CircuitBreaker::new("DCS", BREAKER_FAILURE_THRESHOLD, BREAKER_COOL_DOWN),
            cancel,
        }
    }

    /// Run one store operation through the breaker with retries.
    ///
    /// `NoLeader` is retried (an election may be settling) but counts as an
    /// availability success: the store answered. Only `Transient` failures
    /// feed the breaker.
    async fn guarded<T, F, Fut>(&self, mut op: F) -> DcsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DcsResult<T>>,
    {
        if !self.breaker.allow() {
            return Err(DcsError::transient("circuit breaker DCS open"));
        }

        let mut attempt = 0u32;
        let result = loop {
            match op().await {
                Ok(v) => break Ok(v),
                Err(e) => {
                    let retryable = matches!(e, DcsError::Transient(_) | DcsError::NoLeader);
                    attempt += 1;
                    if !retryable
                        || attempt >= self.retry.max_attempts
                        || self.cancel.is_cancelled()
                    {
                        break Err(e);
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying consensus-store call: {}",
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        let store_answered = match &result {
            Ok(_) => true,
            Err(e) => e.store_answered(),
        };
        if store_answered {
            if self.breaker.on_success() {
                tracing::info!("consensus store reachable again, restarting election campaign");
                self.client.campaign().await;
            }
        } else {
            self.breaker.on_failure();
        }

        result
    }

    fn to_fault(e: DcsError) -> Fault {
        match e {
            DcsError::Corrupt(msg) => Fault::fatal(format!("consensus store corrupt: {}", msg)),
            other => Fault::transient(other.to_string()),
        }
    }

    /// Pass-through leadership transfer (admin switchover).
    pub async fn promote(&self, candidate_id: &str) -> DcsResult<()> {
        let client = self.client.clone();
        let candidate = candidate_id.to_string();
        self.guarded(move || {
            let client = client.clone();
            let candidate = candidate.clone();
            async move { client.promote(&candidate).await }
        })
        .await
    }

    /// Pass-through election resignation.
    pub async fn resign(&self) -> DcsResult<()> {
        let client = self.client.clone();
        self.guarded(move || {
            let client = client.clone();
            async move { client.resign().await }
        })
        .await
    }

    /// Close the underlying client. Not breaker-guarded: shutdown must
    /// proceed even with the store gone.
    pub async fn disconnect(&self) -> DcsResult<()> {
        self.client.close().await
    }

    pub fn instance_id(&self) -> &str {
        self.client.instance_id()
    }

    #[cfg(test)]
    fn breaker_state(&self) -> crate::BreakerState {
        self.breaker.state()
    }
}

#[async_trait]
impl ClusterView for DcsProxy {
    /// Establish this instance's role, falling back to local inference when
    /// the store cannot answer.
    ///
    /// A running replica is harmless without a store and converges
    /// normally. A running writable server cannot prove it is the unique
    /// primary, so it is surfaced as [`RoleAssessment::UnverifiedLeader`]
    /// and the caller must not act on it.
    async fn assess_role(&self) -> Result<RoleAssessment, Fault> {
        let client = self.client.clone();
        let outcome = self
            .guarded(move || {
                let client = client.clone();
                async move { client.leader_id().await }
            })
            .await;

        match outcome {
            Ok(leader_id) => {
                let role = if leader_id == self.client.instance_id() {
                    Role::Leader
                } else {
                    Role::Replica
                };
                Ok(RoleAssessment::Confirmed(role))
            }
            Err(DcsError::Corrupt(msg)) => Err(Fault::fatal(msg)),
            Err(e) => {
                tracing::warn!("role unavailable from consensus store: {}", e);
                if !self.probe.is_running().await {
                    return Err(Fault::transient(
                        "could not establish role: store unreachable and local server not running",
                    ));
                }
                match self.probe.is_in_recovery().await {
                    Ok(true) => Ok(RoleAssessment::InferredReplica),
                    Ok(false) => Ok(RoleAssessment::UnverifiedLeader),
                    Err(probe_err) => Err(Fault::transient(format!(
                        "could not establish role: local probe failed: {}",
                        probe_err
                    ))),
                }
            }
        }
    }

    async fn save_instance_info(&self, role: Role) -> Result<(), Fault> {
        let client = self.client.clone();
        self.guarded(move || {
            let client = client.clone();
            async move { client.put_instance_info(role).await }
        })
        .await
        .map_err(Self::to_fault)
    }

    async fn leader_info(&self) -> Result<InstanceInfo, Fault> {
        let client = self.client.clone();
        let leader_id = self
            .guarded(move || {
                let client = client.clone();
                async move { client.leader_id().await }
            })
            .await
            .map_err(Self::to_fault)?;

        let client = self.client.clone();
        self.guarded(move || {
            let client = client.clone();
            let leader_id = leader_id.clone();
            async move { client.instance_info(&leader_id).await }
        })
        .await
        .map_err(Self::to_fault)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, Fault> {
        let client = self.client.clone();
        self.guarded(move || {
            let client = client.clone();
            async move { client.list_instances().await }
        })
        .await
        .map_err(Self::to_fault)
    }
}
