use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use common::{PoolCostPair, PoolInfo, PoolTarget};
use parking_lot::RwLock;
use pool_client::{PoolManager, PoolManagerError};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A list of candidate pools that can be re-read from its source.
///
/// `pools` never blocks and always returns one complete snapshot.
#[async_trait]
pub trait RefreshablePoolList: Send + Sync {
    fn pools(&self) -> Arc<Vec<PoolCostPair>>;

    async fn refresh(&self);

    /// Whether the list holds data from its source.
    fn is_valid(&self) -> bool;
}

/// Administrator-pinned pools, all at cost 1.0.
pub struct FixedPoolList {
    pools: Arc<Vec<PoolCostPair>>,
}

impl FixedPoolList {
    pub fn new(pools: impl IntoIterator<Item = (String, String)>) -> Self {
        let pools = pools
            .into_iter()
            .map(|(name, address)| PoolCostPair {
                name,
                address,
                cost: 1.0,
            })
            .collect();
        Self {
            pools: Arc::new(pools),
        }
    }

    /// Parses `name=url,name=url`.
    pub fn parse(list: &str) -> anyhow::Result<Self> {
        let mut pools = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((name, address)) = item.split_once('=') else {
                bail!("fixed pool entry {item:?} must look like name=url");
            };
            if name.trim().is_empty() || address.trim().is_empty() {
                bail!("fixed pool entry {item:?} has an empty name or url");
            }
            pools.push((name.trim().to_string(), address.trim().to_string()));
        }
        Ok(Self::new(pools))
    }
}

#[async_trait]
impl RefreshablePoolList for FixedPoolList {
    fn pools(&self) -> Arc<Vec<PoolCostPair>> {
        Arc::clone(&self.pools)
    }

    async fn refresh(&self) {}

    fn is_valid(&self) -> bool {
        true
    }
}

/// Weights applied to the manager's cost axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostFactors {
    pub space: f64,
    pub cpu: f64,
}

impl CostFactors {
    pub fn new(space: f64, cpu: f64) -> anyhow::Result<Self> {
        for (name, value) in [("space", space), ("cpu", cpu)] {
            if !value.is_finite() || value < 0.0 {
                bail!("{name} cost factor must be a finite non-negative number, got {value}");
            }
        }
        if space == 0.0 && cpu == 0.0 {
            bail!("space and cpu cost factors cannot both be zero");
        }
        Ok(Self { space, cpu })
    }

    pub fn cost(&self, pool: &PoolInfo) -> f64 {
        self.space * pool.space_cost + self.cpu * pool.cpu_cost
    }
}

impl Default for CostFactors {
    fn default() -> Self {
        Self {
            space: 1.0,
            cpu: 0.0,
        }
    }
}

/// Pool names excluded from a manager-backed list. A pattern has to match
/// the whole name.
#[derive(Debug, Clone, Default)]
pub struct ExclusionPatterns(Vec<Regex>);

impl ExclusionPatterns {
    pub fn new<'a>(patterns: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Self> {
        let mut compiled = Vec::new();
        for pattern in patterns {
            let regex = Regex::new(&format!("^(?:{pattern})$"))
                .with_context(|| format!("invalid exclusion pattern {pattern:?}"))?;
            compiled.push(regex);
        }
        Ok(Self(compiled))
    }

    pub fn excludes(&self, name: &str) -> bool {
        self.0.iter().any(|regex| regex.is_match(name))
    }
}

/// Pools as reported by the pool manager, cached between refreshes.
pub struct ManagerPoolList {
    manager: Arc<dyn PoolManager>,
    target: PoolTarget,
    exclude: ExclusionPatterns,
    factors: CostFactors,
    query_timeout: Duration,
    snapshot: RwLock<Arc<Vec<PoolCostPair>>>,
    valid: AtomicBool,
}

impl ManagerPoolList {
    pub fn new(
        manager: Arc<dyn PoolManager>,
        target: PoolTarget,
        exclude: ExclusionPatterns,
        factors: CostFactors,
        query_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            target,
            exclude,
            factors,
            query_timeout,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            valid: AtomicBool::new(false),
        }
    }

    async fn query(&self) -> Result<Vec<PoolInfo>, PoolManagerError> {
        tokio::time::timeout(self.query_timeout, self.manager.query_pools(&self.target))
            .await
            .map_err(|_| PoolManagerError::Timeout)?
    }
}

#[async_trait]
impl RefreshablePoolList for ManagerPoolList {
    fn pools(&self) -> Arc<Vec<PoolCostPair>> {
        Arc::clone(&self.snapshot.read())
    }

    async fn refresh(&self) {
        let reported = match self.query().await {
            Ok(pools) => pools,
            Err(err) => {
                warn!(
                    error = %err,
                    pool_target = ?self.target,
                    "pool manager query failed; keeping previous pool list"
                );
                return;
            }
        };

        let total = reported.len();
        let pools: Vec<PoolCostPair> = reported
            .into_iter()
            .filter(|pool| !self.exclude.excludes(&pool.name))
            .map(|pool| PoolCostPair {
                cost: self.factors.cost(&pool),
                name: pool.name,
                address: pool.address,
            })
            .collect();

        debug!(reported = total, kept = pools.len(), "pool list refreshed");
        *self.snapshot.write() = Arc::new(pools);
        self.valid.store(true, Ordering::Release);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

/// Refreshes `list` every `period` until `shutdown` fires.
pub async fn run_refresher(
    list: Arc<dyn RefreshablePoolList>,
    period: Duration,
    shutdown: CancellationToken,
) {
    info!(period_secs = period.as_secs(), "pool list refresher started");
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => list.refresh().await,
        }
    }
    debug!("pool list refresher stopped");
}
