//! Reputation engine.
//!
//! A candidate's reputation is a weighted sum of its ranks among the
//! candidate set on five metrics:
//!
//! ```text
//! score = alpha * balance_rank + beta * tx_rank + gamma * maintenance_rank
//!       + psi * upload_rank + omega * proxy_rank
//! ```
//!
//! floored at [`DEFAULT_MINIMUM_RPT`]. Balance, transaction count and
//! maintenance come from an [`RptBackend`]; upload and proxy ranks come from a
//! [`ContributionSource`].

use crate::chain::{ContributionSource, NoContribution, RptBackend, RptCoefficients, RptParameters};
use crate::error::Result;
use dposbft_types::{Address, H256};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lowest score any candidate receives.
pub const DEFAULT_MINIMUM_RPT: i64 = 10;

/// Sorted metric lists kept per `(height, candidate set)`.
const METRIC_CACHE_SIZE: usize = 10;

/// A candidate and its reputation score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rpt {
    /// Candidate address
    pub address: Address,
    /// Reputation score
    pub score: i64,
}

impl Rpt {
    /// Create a reputation entry.
    pub fn new(address: Address, score: i64) -> Self {
        Self { address, score }
    }
}

/// Reputations of a candidate set.
pub type RptList = Vec<Rpt>;

/// Computes candidate reputations.
pub trait RptService: Send + Sync {
    /// Reputation of `address` among `candidates` at `number`.
    fn rpt_of(&self, address: &Address, candidates: &[Address], number: u64) -> Result<Rpt>;

    /// Reputations of every candidate at `number`, in candidate order.
    fn calc_rpts(&self, candidates: &[Address], number: u64) -> Result<RptList> {
        candidates
            .iter()
            .map(|address| self.rpt_of(address, candidates, number))
            .collect()
    }
}

type MetricKey = (u64, H256);

struct CoefficientState {
    number: Option<u64>,
    current: RptCoefficients,
}

/// [`RptService`] backed by chain data.
pub struct RptCollector {
    backend: Arc<dyn RptBackend>,
    parameters: Option<Arc<dyn RptParameters>>,
    contributions: Arc<dyn ContributionSource>,
    coefficients: Mutex<CoefficientState>,
    balances: Mutex<LruCache<MetricKey, Vec<i64>>>,
    txs: Mutex<LruCache<MetricKey, Vec<i64>>>,
    maintenance: Mutex<LruCache<MetricKey, Vec<i64>>>,
}

impl RptCollector {
    /// Create a collector with default coefficients.
    pub fn new(backend: Arc<dyn RptBackend>) -> Self {
        let capacity = NonZeroUsize::new(METRIC_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            parameters: None,
            contributions: Arc::new(NoContribution),
            coefficients: Mutex::new(CoefficientState {
                number: None,
                current: RptCoefficients::default(),
            }),
            balances: Mutex::new(LruCache::new(capacity)),
            txs: Mutex::new(LruCache::new(capacity)),
            maintenance: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Read coefficients from a governed parameter source.
    pub fn with_parameters(mut self, parameters: Arc<dyn RptParameters>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Use a contribution source for upload and proxy ranks.
    pub fn with_contributions(mut self, contributions: Arc<dyn ContributionSource>) -> Self {
        self.contributions = contributions;
        self
    }

    /// Coefficients in force at `number`.
    ///
    /// The parameter source is consulted once per height; a failed read keeps
    /// the last known values.
    pub fn coefficients(&self, number: u64) -> RptCoefficients {
        let mut state = self.coefficients.lock();
        let Some(parameters) = &self.parameters else {
            return state.current;
        };
        if state.number == Some(number) {
            return state.current;
        }
        match parameters.coefficients_at(number) {
            Ok(c) => {
                debug!(number, ?c, "using reputation parameters from contract");
                state.current = c;
            }
            Err(e) => warn!(number, error = %e, "failed to read reputation parameters"),
        }
        state.number = Some(number);
        state.current
    }

    /// Full score of `address` among `candidates` at `number`.
    pub fn score_of(&self, address: &Address, candidates: &[Address], number: u64) -> Rpt {
        let c = self.coefficients(number);
        let key = (number, candidate_set_key(candidates));

        let balance = self.balance_rank(address, candidates, number, key);
        let txs = self.tx_rank(address, candidates, number, c.window, key);
        let maintenance = self.maintenance_rank(address, candidates, number, c.window, key);
        let upload = self.contributions.upload_rank(address, candidates, number);
        let proxy = self.contributions.proxy_rank(address, candidates, number);

        let score = c.alpha * balance
            + c.beta * txs
            + c.gamma * maintenance
            + c.psi * upload
            + c.omega * proxy;
        debug!(
            number,
            %address,
            balance,
            txs,
            maintenance,
            upload,
            proxy,
            score,
            "calculated reputation"
        );
        Rpt::new(*address, score.max(DEFAULT_MINIMUM_RPT))
    }

    fn balance_rank(&self, address: &Address, candidates: &[Address], number: u64, key: MetricKey) -> i64 {
        let metric = |a: &Address| {
            self.backend
                .balance_at(a, number)
                .map(|b| i64::try_from(b).unwrap_or(i64::MAX))
                .unwrap_or(0)
        };
        rank_with_cache(&self.balances, key, candidates, metric(address), metric)
    }

    fn tx_rank(
        &self,
        address: &Address,
        candidates: &[Address],
        number: u64,
        window: u64,
        key: MetricKey,
    ) -> i64 {
        let metric = |a: &Address| {
            let now = self.backend.nonce_at(a, number);
            let then = self.backend.nonce_at(a, number.saturating_sub(window));
            match (now, then) {
                (Ok(now), Ok(then)) => now.saturating_sub(then) as i64,
                _ => 0,
            }
        };
        rank_with_cache(&self.txs, key, candidates, metric(address), metric)
    }

    fn maintenance_rank(
        &self,
        address: &Address,
        candidates: &[Address],
        number: u64,
        window: u64,
        key: MetricKey,
    ) -> i64 {
        let metric = |a: &Address| {
            (number.saturating_sub(window)..number)
                .filter(|n| self.backend.coinbase_at(*n).as_ref() == Some(a))
                .count() as i64
        };
        rank_with_cache(&self.maintenance, key, candidates, metric(address), metric)
    }
}

impl RptService for RptCollector {
    fn rpt_of(&self, address: &Address, candidates: &[Address], number: u64) -> Result<Rpt> {
        Ok(self.score_of(address, candidates, number))
    }
}

fn candidate_set_key(candidates: &[Address]) -> H256 {
    let mut bytes = Vec::with_capacity(candidates.len() * 20);
    for c in candidates {
        bytes.extend_from_slice(c.as_bytes());
    }
    H256::keccak256(&bytes)
}

fn rank_with_cache<F>(
    cache: &Mutex<LruCache<MetricKey, Vec<i64>>>,
    key: MetricKey,
    candidates: &[Address],
    value: i64,
    metric: F,
) -> i64
where
    F: Fn(&Address) -> i64,
{
    let cached = cache.lock().get(&key).cloned();
    let sorted = match cached {
        Some(sorted) => sorted,
        None => {
            let mut values: Vec<i64> = candidates.iter().map(&metric).collect();
            values.sort_unstable_by(|a, b| b.cmp(a));
            cache.lock().put(key, values.clone());
            values
        }
    };
    rank_of(value, &sorted)
}

/// 1-based position of `value` in a descending list; one past the end when absent.
pub fn rank_of(value: i64, sorted_desc: &[i64]) -> i64 {
    sorted_desc
        .iter()
        .position(|v| *v == value)
        .unwrap_or(sorted_desc.len()) as i64
        + 1
}
