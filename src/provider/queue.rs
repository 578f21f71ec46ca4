//! Rate-limited, de-duplicating resync queue
//!
//! Endpoint-topology changes and policy transitions enqueue Service keys
//! (`namespace/name`); a single worker dequeues and re-runs the engine's
//! update for each key. A key already waiting in the queue is not enqueued
//! twice, and failed keys are re-enqueued with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::{Api, Client};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::is_load_balancer_service;
use crate::provider::loadbalancer::LoadBalancers;
use crate::Result;

/// First retry delay after a failed resync
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Upper bound on the retry delay
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Handle for enqueueing Service keys
///
/// Cheap to clone; all clones share the same queue state.
#[derive(Clone)]
pub struct ResyncQueue {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<DashSet<String>>,
    failures: Arc<DashMap<String, u32>>,
}

impl ResyncQueue {
    /// Create a queue and the receiver its worker drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(DashSet::new()),
                failures: Arc::new(DashMap::new()),
            },
            rx,
        )
    }

    /// Enqueue a Service key unless it is already waiting
    pub fn enqueue(&self, key: &str) {
        if !self.pending.insert(key.to_string()) {
            debug!(%key, "key already queued, skipping");
            return;
        }
        if self.tx.send(key.to_string()).is_err() {
            warn!(%key, "resync queue is shut down, dropping key");
            self.pending.remove(key);
        }
    }

    /// Re-enqueue a key after a failure, with exponential backoff
    pub fn enqueue_after_failure(&self, key: &str) {
        let attempts = {
            let mut entry = self.failures.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = backoff_delay(attempts);
        debug!(%key, attempts, delay_ms = delay.as_millis() as u64, "re-enqueueing after failure");

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(&key);
        });
    }

    /// Clear the failure history of a key after a successful resync
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Mark a key as picked up, allowing it to be enqueued again
    pub(crate) fn mark_in_flight(&self, key: &str) {
        self.pending.remove(key);
    }
}

/// Nominal backoff for the nth consecutive failure, before jitter
fn nominal_backoff(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let nominal = BACKOFF_BASE.saturating_mul(1u32 << exponent);
    nominal.min(BACKOFF_MAX)
}

/// Backoff with jitter, 0.5x to 1.5x of the nominal delay
fn backoff_delay(attempts: u32) -> Duration {
    let nominal = nominal_backoff(attempts);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(nominal.as_secs_f64() * jitter)
}

/// Whether the node reports a `Ready=True` condition
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// Keep only nodes that are ready to carry traffic
pub fn filter_ready_nodes(nodes: Vec<Node>) -> Vec<Node> {
    nodes.into_iter().filter(is_node_ready).collect()
}

/// Single-threaded worker draining the resync queue
pub struct ResyncWorker {
    client: Client,
    load_balancers: Arc<LoadBalancers>,
    queue: ResyncQueue,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl ResyncWorker {
    /// Create a worker for the given queue
    pub fn new(
        client: Client,
        load_balancers: Arc<LoadBalancers>,
        queue: ResyncQueue,
        receiver: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            client,
            load_balancers,
            queue,
            receiver,
        }
    }

    /// Drain the queue until cancelled
    ///
    /// Shutdown is cooperative: an item being processed when cancellation
    /// arrives is finished before the worker exits.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("resync worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("resync worker shutting down");
                    return;
                }
                key = self.receiver.recv() => {
                    let Some(key) = key else { return };
                    self.queue.mark_in_flight(&key);
                    match self.process(&key).await {
                        Ok(()) => {
                            self.queue.forget(&key);
                            debug!(%key, "resync processed");
                        }
                        Err(e) => {
                            warn!(%key, error = %e, "resync failed, will retry");
                            self.queue.enqueue_after_failure(&key);
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, key: &str) -> Result<()> {
        let Some((namespace, name)) = key.split_once('/') else {
            warn!(%key, "invalid service key, dropping");
            return Ok(());
        };

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let Some(service) = services.get_opt(name).await? else {
            debug!(%key, "service no longer exists, skipping resync");
            return Ok(());
        };
        if !is_load_balancer_service(&service) {
            debug!(%key, "service is not of type LoadBalancer, skipping resync");
            return Ok(());
        }

        let nodes = Api::<Node>::all(self.client.clone())
            .list(&Default::default())
            .await?
            .items;
        let ready_nodes = filter_ready_nodes(nodes);

        info!(%key, nodes = ready_nodes.len(), "processing resync");
        self.load_balancers
            .update_load_balancer(&service, &ready_nodes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node_with_ready(name: &str, ready: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enqueue_deduplicates_waiting_keys() {
        let (queue, mut rx) = ResyncQueue::new();
        queue.enqueue("default/web");
        queue.enqueue("default/web");
        queue.enqueue("default/api");

        assert_eq!(rx.try_recv().unwrap(), "default/web");
        assert_eq!(rx.try_recv().unwrap(), "default/api");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn key_can_be_requeued_once_in_flight() {
        let (queue, mut rx) = ResyncQueue::new();
        queue.enqueue("default/web");
        assert_eq!(rx.try_recv().unwrap(), "default/web");

        queue.mark_in_flight("default/web");
        queue.enqueue("default/web");
        assert_eq!(rx.try_recv().unwrap(), "default/web");
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(nominal_backoff(1), Duration::from_millis(100));
        assert_eq!(nominal_backoff(2), Duration::from_millis(200));
        assert_eq!(nominal_backoff(5), Duration::from_millis(1600));
        assert_eq!(nominal_backoff(12), BACKOFF_MAX);
        assert_eq!(nominal_backoff(40), BACKOFF_MAX);
    }

    #[test]
    fn backoff_jitter_stays_in_bounds() {
        for attempts in 1..6 {
            let nominal = nominal_backoff(attempts);
            let delay = backoff_delay(attempts);
            assert!(delay >= Duration::from_secs_f64(nominal.as_secs_f64() * 0.5));
            assert!(delay <= Duration::from_secs_f64(nominal.as_secs_f64() * 1.5));
        }
    }

    #[tokio::test]
    async fn forget_resets_failure_history() {
        let (queue, _rx) = ResyncQueue::new();
        queue.enqueue_after_failure("default/web");
        queue.enqueue_after_failure("default/web");
        assert_eq!(*queue.failures.get("default/web").unwrap(), 2);

        queue.forget("default/web");
        assert!(queue.failures.get("default/web").is_none());
    }

    #[test]
    fn node_readiness_requires_ready_true_condition() {
        assert!(is_node_ready(&node_with_ready("node-1", "True")));
        assert!(!is_node_ready(&node_with_ready("node-2", "False")));
        assert!(!is_node_ready(&node_with_ready("node-3", "Unknown")));
        assert!(!is_node_ready(&Node::default()));
    }

    #[test]
    fn filter_keeps_only_ready_nodes() {
        let nodes = vec![
            node_with_ready("node-1", "True"),
            node_with_ready("node-2", "False"),
            node_with_ready("node-3", "True"),
        ];
        let ready = filter_ready_nodes(nodes);
        let names: Vec<_> = ready
            .iter()
            .map(|n| n.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["node-1", "node-3"]);
    }
}
