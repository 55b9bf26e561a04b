//! Request throttling.
//!
//! Two independent brakes: a per-principal token bucket charged once per
//! ingress frame, and a global gate bounding concurrent LLM invocations
//! across every session. The gate wakes waiters in band order rather than
//! FIFO so short interactive calls are not stuck behind deep research.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use cartwheel_core::config::LimitsConfig;
use cartwheel_core::error::{CartwheelError, Result};
use cartwheel_providers::{Invocation, InvokeRequest, LlmProvider};

/// Scheduling band of work waiting on the global gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Band for an LLM call, keyed by the calling agent. Single-shot agents
    /// the user is actively waiting on jump the queue; fan-out research work
    /// yields it.
    pub fn for_agent(agent: &str) -> Self {
        match agent {
            "filter_agent" | "comparison_agent" => Priority::High,
            "research_agent" | "reviewer_agent" => Priority::Low,
            _ => Priority::Normal,
        }
    }

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Counting semaphore that hands released slots to the highest waiting band.
///
/// A release passes the slot directly to a waiter through a oneshot channel.
/// If the waiter already gave up (queue timeout), the undelivered permit is
/// disarmed before it drops so the slot stays with the releaser, which then
/// tries the next waiter.
#[derive(Debug)]
pub struct PrioritySemaphore {
    gate: Mutex<Gate>,
}

#[derive(Debug)]
struct Gate {
    available: usize,
    waiters: [VecDeque<oneshot::Sender<GatePermit>>; 3],
}

/// A held slot on a [`PrioritySemaphore`]. Dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
    sem: Arc<PrioritySemaphore>,
    armed: bool,
}

impl PrioritySemaphore {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(Gate {
                available: permits,
                waiters: Default::default(),
            }),
        })
    }

    /// Take a slot, waiting at most `wait_budget` behind earlier claimants
    /// of the same or higher band.
    pub async fn acquire(
        self: &Arc<Self>,
        priority: Priority,
        wait_budget: Duration,
    ) -> Result<GatePermit> {
        let receiver = {
            let mut gate = self.gate.lock().unwrap();
            if gate.available > 0 {
                gate.available -= 1;
                return Ok(GatePermit {
                    sem: self.clone(),
                    armed: true,
                });
            }
            let (tx, rx) = oneshot::channel();
            gate.waiters[priority.index()].push_back(tx);
            rx
        };

        match tokio::time::timeout(wait_budget, receiver).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore itself went away while we queued.
            Ok(Err(_)) => Err(CartwheelError::Cancelled),
            Err(_) => Err(CartwheelError::QueueTimeout(wait_budget)),
        }
    }

    fn release(self: &Arc<Self>) {
        let mut gate = self.gate.lock().unwrap();
        for band in &mut gate.waiters {
            while let Some(waiter) = band.pop_front() {
                let permit = GatePermit {
                    sem: self.clone(),
                    armed: true,
                };
                match waiter.send(permit) {
                    Ok(()) => return,
                    Err(mut dead) => {
                        // Receiver is gone; keep the slot and try the next
                        // waiter. Disarm so this drop cannot re-enter us
                        // while the lock is held.
                        dead.armed = false;
                    }
                }
            }
        }
        gate.available += 1;
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.sem.release();
        }
    }
}

/// Refillable per-principal budget.
struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Gateway-wide throttles built from [`LimitsConfig`].
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: Arc<DashMap<String, Bucket>>,
    llm_gate: Arc<PrioritySemaphore>,
    queue_timeout: Duration,
}

impl RateLimiter {
    pub fn from_config(limits: &LimitsConfig) -> Self {
        let limiter = Self {
            rate_per_sec: f64::from(limits.per_principal_per_min) / 60.0,
            burst: f64::from(limits.burst),
            buckets: Arc::new(DashMap::new()),
            llm_gate: PrioritySemaphore::new(limits.llm_concurrency),
            queue_timeout: Duration::from_secs(limits.queue_timeout_secs),
        };

        let buckets = limiter.buckets.clone();
        let rate_per_sec = limiter.rate_per_sec;
        let burst = limiter.burst;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                prune_full(&buckets, rate_per_sec, burst);
                debug!(entries = buckets.len(), "rate limiter cleanup");
            }
        });

        limiter
    }

    /// Charge one request to the principal's bucket.
    pub fn check(&self, principal_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(principal_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.burst,
                refreshed: now,
            });

        let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.refreshed = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        let retry_after_secs = ((1.0 - bucket.tokens) / self.rate_per_sec).ceil() as u64;
        warn!(
            principal = principal_id,
            retry_after_secs, "request over the principal's budget"
        );
        Err(CartwheelError::RateLimited { retry_after_secs })
    }

    /// Wait for a slot on the global LLM gate.
    pub async fn acquire_llm(&self, priority: Priority) -> Result<GatePermit> {
        self.llm_gate.acquire(priority, self.queue_timeout).await
    }
}

/// A bucket refilled to full burst reads the same as no bucket.
fn prune_full(buckets: &DashMap<String, Bucket>, rate_per_sec: f64, burst: f64) {
    let now = Instant::now();
    buckets.retain(|_, bucket| {
        let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens + elapsed * rate_per_sec < burst
    });
}

/// Provider wrapper that holds a gate slot for the span of each invocation.
///
/// Gating sits on the call, not the turn, so a turn parked at the human node
/// holds nothing while it waits for the user.
pub struct GatedProvider {
    inner: Arc<dyn LlmProvider>,
    limits: Arc<RateLimiter>,
}

impl GatedProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, limits: Arc<RateLimiter>) -> Self {
        Self { inner, limits }
    }
}

#[async_trait]
impl LlmProvider for GatedProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let _slot = self
            .limits
            .acquire_llm(Priority::for_agent(&request.agent))
            .await?;
        self.inner.invoke(request).await
    }
}
