use futures::stream::{self, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use hoist_core::{QueueError, QueueResult};

use crate::broker::Broker;

/// Handle for stopping the sweeper
pub struct SweeperHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Gracefully stop the sweeper
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("sweeper join error: {}", e)))
    }
}

/// Periodic reclaim task: returns expired reservations to pending and
/// promotes due delayed jobs across every known scope. This is the liveness
/// mechanism for crashed workers. The interval is jittered so multiple
/// broker processes do not sweep in lockstep.
pub struct VisibilitySweeper {
    broker: Arc<Broker>,
    interval: Duration,
    batch_limit: usize,
    parallelism: usize,
}

impl VisibilitySweeper {
    pub fn new(broker: Arc<Broker>) -> Self {
        let interval = broker.config().reclaim_interval;
        Self {
            broker,
            interval,
            batch_limit: 256,
            parallelism: 4,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Spawn the sweep loop
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        info!(interval = ?self.interval, "starting visibility sweeper");

        let join_handle = tokio::spawn(async move {
            loop {
                let jittered = jitter(self.interval);
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("visibility sweeper stopping");
                        break;
                    }
                    _ = sleep(jittered) => {
                        let reclaimed = self.sweep_once().await;
                        if reclaimed > 0 {
                            info!(reclaimed, "reclaimed expired reservations");
                        } else {
                            debug!("no expired reservations");
                        }
                    }
                }
            }
        });

        SweeperHandle {
            shutdown_tx,
            join_handle,
        }
    }

    /// One full pass over the known scopes; bounded parallelism
    pub async fn sweep_once(&self) -> u64 {
        let scopes = self.broker.known_scopes();
        let broker = &self.broker;
        let limit = self.batch_limit;

        stream::iter(scopes)
            .map(|scope| async move {
                match broker.sweep_scope(&scope, limit).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "sweep failed");
                        0
                    }
                }
            })
            .buffer_unordered(self.parallelism)
            .fold(0u64, |acc, n| async move { acc + n })
            .await
    }
}

/// +/-20% around the base interval
fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DequeueRequest;
    use hoist_backend::registry::BackendManager;
    use hoist_backend::{MemoryBackend, MemoryTenantStore, StorageBackend, TenantStore};
    use hoist_core::{
        ChaosInjector, EnqueueOptions, QueueDefaults, TenantCtx, TenantId, TenantRecord, WorkerId,
    };

    async fn broker_with_memory() -> (Arc<Broker>, Arc<MemoryBackend>) {
        let memory = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn StorageBackend> = memory.clone();
        let tenants = Arc::new(MemoryTenantStore::new());
        tenants
            .create(TenantRecord::new(TenantId::new("acme").unwrap()))
            .await
            .unwrap();
        let broker = Arc::new(Broker::new(
            Arc::new(BackendManager::new(backend)),
            tenants,
            Arc::new(ChaosInjector::new()),
            QueueDefaults::default(),
        ));
        (broker, memory)
    }

    fn ctx() -> TenantCtx {
        TenantCtx::new(TenantId::new("acme").unwrap())
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_reservations() {
        let (broker, memory) = broker_with_memory().await;
        let id = broker
            .enqueue(&ctx(), "default", b"x".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
        let req = DequeueRequest {
            worker_id: WorkerId::from("w1"),
            queues: vec!["default".to_string()],
            wait_timeout: Duration::from_millis(10),
            visibility_timeout: None,
        };
        broker.dequeue(&ctx(), &req).await.unwrap().unwrap();

        let scope =
            hoist_backend::QueueScope::new(TenantId::new("acme").unwrap(), "default");
        memory.force_expire(&scope, &id);

        let sweeper = VisibilitySweeper::new(broker.clone());
        assert_eq!(sweeper.sweep_once().await, 1);

        // Job is deliverable again
        let again = broker.dequeue(&ctx(), &req).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn sweeper_handle_shuts_down() {
        let (broker, _) = broker_with_memory().await;
        let handle = VisibilitySweeper::new(broker)
            .with_interval(Duration::from_millis(10))
            .start();
        sleep(Duration::from_millis(30)).await;
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_secs(5);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= base.mul_f64(0.8));
            assert!(j <= base.mul_f64(1.2));
        }
    }
}
