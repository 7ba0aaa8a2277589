//! ABOUTME: Per-agent FIFO execution lanes with bounded queues and exclusive leases
//! ABOUTME: One call per agent at a time; submission past the bound fails fast with AgentBusy

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use trinity_core::{EngineError, ExecutionId, Result};

/// The exclusive lease a running step holds on its agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub agent: String,
    pub execution_id: ExecutionId,
    pub step_id: String,
    /// Absolute deadline; past it the lease is revoked and the call fails
    /// with `AgentTimeout`.
    pub deadline: DateTime<Utc>,
}

#[derive(Debug)]
struct Lane {
    /// Single execution permit; tokio semaphores grant FIFO.
    permit: Arc<Semaphore>,
    /// Active call plus queued waiters.
    occupancy: AtomicUsize,
    active: Mutex<Option<Lease>>,
}

impl Lane {
    fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            occupancy: AtomicUsize::new(0),
            active: Mutex::new(None),
        }
    }
}

/// All per-agent lanes. Downstream agents are single-threaded and
/// expensive; the lane serializes calls and bounds the queue.
pub struct AgentLanes {
    lanes: DashMap<String, Arc<Lane>>,
    queue_max: usize,
}

/// Holds the agent exclusively until dropped.
#[derive(Debug)]
pub struct LaneGuard {
    lane: Arc<Lane>,
    _permit: OwnedSemaphorePermit,
    lease: Lease,
}

impl LaneGuard {
    #[must_use]
    pub const fn lease(&self) -> &Lease {
        &self.lease
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        *self.lane.active.lock() = None;
        self.lane.occupancy.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AgentLanes {
    #[must_use]
    pub fn new(queue_max: usize) -> Self {
        Self {
            lanes: DashMap::new(),
            queue_max,
        }
    }

    fn lane(&self, agent: &str) -> Arc<Lane> {
        self.lanes
            .entry(agent.to_string())
            .or_insert_with(|| Arc::new(Lane::new()))
            .clone()
    }

    /// Join the agent's queue and wait for the exclusive lease. Fails
    /// immediately with `AgentBusy` when the queue is at its bound.
    pub async fn acquire(
        &self,
        agent: &str,
        execution_id: ExecutionId,
        step_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<LaneGuard> {
        let lane = self.lane(agent);
        // CAS on occupancy: one active call plus at most queue_max waiting.
        let bound = self.queue_max + 1;
        if lane
            .occupancy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < bound).then_some(n + 1)
            })
            .is_err()
        {
            return Err(EngineError::AgentBusy {
                agent: agent.to_string(),
            });
        }

        let permit = match lane.permit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                lane.occupancy.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Internal {
                    message: format!("lane for agent '{agent}' is closed"),
                });
            }
        };

        let lease = Lease {
            agent: agent.to_string(),
            execution_id,
            step_id: step_id.to_string(),
            deadline,
        };
        *lane.active.lock() = Some(lease.clone());
        Ok(LaneGuard {
            lane,
            _permit: permit,
            lease,
        })
    }

    /// Number of calls queued behind the active one for an agent.
    #[must_use]
    pub fn queued(&self, agent: &str) -> usize {
        self.lanes
            .get(agent)
            .map_or(0, |lane| lane.occupancy.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// The lease currently held on an agent, if any.
    #[must_use]
    pub fn active_lease(&self, agent: &str) -> Option<Lease> {
        self.lanes.get(agent).and_then(|lane| lane.active.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ulid::Ulid;

    fn deadline() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(30)
    }

    #[tokio::test]
    async fn serializes_calls_per_agent() {
        let lanes = Arc::new(AgentLanes::new(3));
        let execution_id = Ulid::new();

        let guard = lanes.acquire("worker", execution_id, "a", deadline()).await.unwrap();
        assert_eq!(lanes.active_lease("worker").unwrap().step_id, "a");

        let lanes2 = Arc::clone(&lanes);
        let waiter = tokio::spawn(async move {
            lanes2.acquire("worker", execution_id, "b", deadline()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lanes.queued("worker"), 1);

        drop(guard);
        let guard2 = waiter.await.unwrap().unwrap();
        assert_eq!(guard2.lease().step_id, "b");
    }

    #[tokio::test]
    async fn queue_bound_fails_fast() {
        let lanes = Arc::new(AgentLanes::new(1));
        let execution_id = Ulid::new();

        let _active = lanes.acquire("worker", execution_id, "a", deadline()).await.unwrap();
        let lanes2 = Arc::clone(&lanes);
        let _waiting = tokio::spawn(async move {
            let guard = lanes2.acquire("worker", execution_id, "b", deadline()).await;
            // Hold until the test ends.
            tokio::time::sleep(Duration::from_secs(5)).await;
            guard
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = lanes
            .acquire("worker", execution_id, "c", deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AgentBusy { .. }));

        // Other agents are unaffected.
        lanes.acquire("other", execution_id, "c", deadline()).await.unwrap();
    }
}
