use anyhow::bail;
use common::PoolCostPair;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Source of uniform samples in `[0, 1)`.
pub trait RandomSource: Send {
    fn next_f64(&mut self) -> f64;
}

/// Adapts any `rand` generator.
pub struct RngSource<R>(pub R);

impl RngSource<StdRng> {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl<R: RngCore + Send> RandomSource for RngSource<R> {
    fn next_f64(&mut self) -> f64 {
        self.0.r#gen::<f64>()
    }
}

pub trait PoolSelectionStrategy: Send + Sync {
    /// Picks one candidate, or `None` when `pools` is empty.
    fn select<'a>(&self, pools: &'a [PoolCostPair]) -> Option<&'a PoolCostPair>;
}

/// Roulette-wheel selection weighted by inverse cost.
///
/// Costs must be positive; a zero cost is a misconfiguration of whatever
/// produced the list.
pub struct ProportionalSelection {
    random: Mutex<Box<dyn RandomSource>>,
}

impl ProportionalSelection {
    pub fn new(random: impl RandomSource + 'static) -> Self {
        Self {
            random: Mutex::new(Box::new(random)),
        }
    }
}

impl PoolSelectionStrategy for ProportionalSelection {
    fn select<'a>(&self, pools: &'a [PoolCostPair]) -> Option<&'a PoolCostPair> {
        let last = pools.last()?;
        let total: f64 = pools.iter().map(|pool| 1.0 / pool.cost).sum();
        let threshold = self.random.lock().next_f64() * total;

        let mut cumulative = 0.0;
        for pool in pools {
            cumulative += 1.0 / pool.cost;
            if cumulative >= threshold {
                return Some(pool);
            }
        }

        // Rounding left the threshold above the final sum.
        Some(last)
    }
}

/// Uniform selection that ignores cost.
pub struct RandomSelection {
    random: Mutex<Box<dyn RandomSource>>,
}

impl RandomSelection {
    pub fn new(random: impl RandomSource + 'static) -> Self {
        Self {
            random: Mutex::new(Box::new(random)),
        }
    }
}

impl PoolSelectionStrategy for RandomSelection {
    fn select<'a>(&self, pools: &'a [PoolCostPair]) -> Option<&'a PoolCostPair> {
        if pools.is_empty() {
            return None;
        }
        let sample = self.random.lock().next_f64();
        let index = ((sample * pools.len() as f64) as usize).min(pools.len() - 1);
        pools.get(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionKind {
    Proportional,
    Random,
}

impl SelectionKind {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proportional" => Ok(Self::Proportional),
            "random" => Ok(Self::Random),
            other => bail!("unknown selection strategy {other:?}, expected proportional or random"),
        }
    }

    pub fn build(self, random: impl RandomSource + 'static) -> Box<dyn PoolSelectionStrategy> {
        match self {
            Self::Proportional => Box::new(ProportionalSelection::new(random)),
            Self::Random => Box::new(RandomSelection::new(random)),
        }
    }
}
