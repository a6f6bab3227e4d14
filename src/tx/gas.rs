//! Gas estimation combining live node suggestions with historical fee data
//!
//! Suggestions start from whichever is larger of the node's live value and a
//! percentile over recent fee history, get scaled by a priority factor and,
//! when enabled, buffered further by a network congestion metric.

use crate::cache::LfuHeaderCache;
use crate::chain::NodeProvider;
use crate::config::{Config, CongestionStrategy, Experiment, Priority};
use crate::error::{SleuthError, SleuthResult};

use ethers::types::{Block, BlockNumber, FeeHistory, H256, U256};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fraction of requested blocks that must be fetched for percentile or
/// congestion computations to be considered valid
const MIN_BLOCK_FRACTION: f64 = 0.8;

/// Maximum concurrent historical header fetches
const HEADER_FETCH_CONCURRENCY: usize = 4;

/// Congestion tier over the last N blocks, each mapped to a fee buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Congestion {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Congestion {
    /// Fee buffer multiplier for this tier
    pub fn buffer_factor(self) -> f64 {
        match self {
            Congestion::Low => 1.10,
            Congestion::Medium => 1.20,
            Congestion::High => 1.30,
            Congestion::VeryHigh => 1.40,
        }
    }
}

/// Classify a congestion metric in [0, 1]. Boundaries are inclusive on the
/// lower tier: exactly 0.33 is still Low.
pub fn classify_congestion(metric: f64) -> Congestion {
    if metric <= 0.33 {
        Congestion::Low
    } else if metric <= 0.66 {
        Congestion::Medium
    } else if metric <= 0.75 {
        Congestion::High
    } else {
        Congestion::VeryHigh
    }
}

/// Priority adjustment factor applied to suggested prices
fn adjustment_factor(priority: Priority) -> SleuthResult<f64> {
    match priority {
        Priority::Degen => Ok(2.0),
        Priority::Fast => Ok(1.2),
        Priority::Standard => Ok(1.0),
        Priority::Slow => Ok(0.8),
        Priority::Auto => Err(SleuthError::GasEstimation(
            "auto priority has no adjustment factor".into(),
        )),
    }
}

/// Reward percentile requested from `eth_feeHistory` for a priority tier
fn reward_percentile(priority: Priority) -> SleuthResult<f64> {
    match priority {
        Priority::Degen => Ok(100.0),
        Priority::Fast => Ok(99.0),
        Priority::Standard => Ok(50.0),
        Priority::Slow => Ok(25.0),
        Priority::Auto => Err(SleuthError::GasEstimation(
            "auto priority does not use fee history".into(),
        )),
    }
}

/// Percentile distribution over one fee series
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeePercentiles {
    pub min: f64,
    pub perc25: f64,
    pub perc50: f64,
    pub perc75: f64,
    pub perc99: f64,
    pub max: f64,
}

impl FeePercentiles {
    fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);
        Self {
            min: values[0],
            perc25: nearest_rank(&values, 25.0),
            perc50: nearest_rank(&values, 50.0),
            perc75: nearest_rank(&values, 75.0),
            perc99: nearest_rank(&values, 99.0),
            max: values[values.len() - 1],
        }
    }

    /// Pick the percentile matching a priority tier
    pub fn for_priority(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Degen => self.max,
            Priority::Fast => self.perc99,
            Priority::Standard => self.perc50,
            Priority::Slow => self.perc25,
            Priority::Auto => 0.0,
        }
    }
}

/// Nearest-rank percentile over an already sorted slice
fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

/// Snapshot of fee statistics over recent blocks, derived fresh per
/// estimation call
#[derive(Debug, Clone, Default)]
pub struct FeeStats {
    /// Percentiles over per-block base fees
    pub base_fee: FeePercentiles,
    /// Percentiles over per-block tips at the requested reward percentile
    pub tip: FeePercentiles,
    /// Percentiles over per-block effective gas prices (base fee + tip)
    pub gas_price: FeePercentiles,
    pub blocks_used: usize,
}

impl FeeStats {
    /// Build stats from a raw fee history response. Fails unless the node
    /// returned at least 80% of the requested blocks.
    pub fn from_history(history: &FeeHistory, requested_blocks: u64) -> SleuthResult<Self> {
        // base_fee_per_gas has one extra entry for the next block
        let blocks_used = history.base_fee_per_gas.len().saturating_sub(1);
        let min_blocks = (requested_blocks as f64 * MIN_BLOCK_FRACTION) as usize;
        if blocks_used < min_blocks.max(1) {
            return Err(SleuthError::GasEstimation(format!(
                "insufficient fee history: needed at least {min_blocks} blocks, got {blocks_used}"
            )));
        }

        let base_fees: Vec<f64> = history.base_fee_per_gas[..blocks_used]
            .iter()
            .map(u256_to_f64)
            .collect();
        let tips: Vec<f64> = history
            .reward
            .iter()
            .filter_map(|per_block| per_block.first())
            .map(u256_to_f64)
            .collect();
        let gas_prices: Vec<f64> = base_fees
            .iter()
            .zip(tips.iter().chain(std::iter::repeat(&0.0)))
            .map(|(b, t)| b + t)
            .collect();

        Ok(Self {
            base_fee: FeePercentiles::from_values(base_fees),
            tip: FeePercentiles::from_values(tips),
            gas_price: FeePercentiles::from_values(gas_prices),
            blocks_used,
        })
    }
}

fn u256_to_f64(value: &U256) -> f64 {
    value.min(&U256::from(u128::MAX)).as_u128() as f64
}

fn f64_to_u256(value: f64) -> U256 {
    if value <= 0.0 {
        U256::zero()
    } else {
        U256::from(value as u128)
    }
}

/// Gas-used ratio of a single block header
fn gas_used_ratio(header: &Block<H256>) -> Option<f64> {
    if header.gas_limit.is_zero() {
        return None;
    }
    Some(u256_to_f64(&header.gas_used) / u256_to_f64(&header.gas_limit))
}

/// Unweighted average gas-used ratio
pub fn simple_congestion_metric(headers: &[Block<H256>]) -> f64 {
    let ratios: Vec<f64> = headers.iter().filter_map(gas_used_ratio).collect();
    if ratios.is_empty() {
        return 0.0;
    }
    ratios.iter().sum::<f64>() / ratios.len() as f64
}

/// Logarithmically recency-weighted average, heavier weight on newer blocks
pub fn newest_first_congestion_metric(headers: &[Block<H256>]) -> f64 {
    let mut sorted: Vec<&Block<H256>> = headers.iter().collect();
    sorted.sort_by_key(|h| h.number.map(|n| n.as_u64()).unwrap_or_default());

    // lower scale factor would weigh newer blocks even more
    let scale_factor = 10.0;
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for (i, header) in sorted.iter().enumerate() {
        let Some(ratio) = gas_used_ratio(header) else {
            continue;
        };
        let distance = (sorted.len() - 1 - i) as f64;
        let weight = 1.0 / (distance + scale_factor).log10();
        weighted_sum += ratio * weight;
        total_weight += weight;
    }
    if total_weight == 0.0 {
        return 0.0;
    }
    weighted_sum / total_weight
}

/// Decimal orders of magnitude between two values: `None` when either value
/// is zero, 0 when they are within one order of each other.
pub fn magnitude_difference(first: f64, second: f64) -> Option<i32> {
    if first == 0.0 || second == 0.0 {
        return None;
    }
    let diff = first.log10() - second.log10();
    if diff < 0.0 {
        Some(diff.floor() as i32)
    } else if diff <= 1.0 {
        Some(0)
    } else {
        Some(diff.ceil() as i32)
    }
}

/// Clamp base fee and tip into the same order of magnitude when they differ
/// by more than 3 decimal orders. Part of the UNSAFE_FEE_EQUALIZER
/// experiment; never applied unless opted in.
pub fn equalize_fee_magnitudes(base_fee: f64, tip: f64) -> (f64, f64) {
    match magnitude_difference(base_fee, tip) {
        None => {
            if base_fee == 0.0 {
                (tip, tip)
            } else {
                (base_fee, base_fee)
            }
        }
        Some(diff) if diff < -3 => (tip, tip),
        Some(diff) if diff > 3 => (base_fee, base_fee),
        Some(_) => (base_fee, tip),
    }
}

/// Computes legacy and EIP-1559 fee suggestions for a priority tier
pub struct GasAdjuster {
    provider: Arc<NodeProvider>,
    header_cache: Arc<LfuHeaderCache>,
    cfg: Arc<Config>,
}

impl GasAdjuster {
    pub fn new(provider: Arc<NodeProvider>, header_cache: Arc<LfuHeaderCache>, cfg: Arc<Config>) -> Self {
        Self {
            provider,
            header_cache,
            cfg,
        }
    }

    fn attempts(&self) -> u32 {
        self.cfg.network.gas_estimation.attempt_count
    }

    /// Suggested legacy gas price for the priority tier
    pub async fn suggest_legacy_fee(&self, priority: Priority) -> SleuthResult<U256> {
        info!("Calculating suggested legacy fees");

        let provider = &self.provider;
        let suggested = with_attempts(self.attempts(), || async {
            let price = provider.gas_price().await?;
            if price.is_zero() {
                return Err(SleuthError::GasEstimation(
                    "node returned a gas price of 0, which is invalid".into(),
                ));
            }
            Ok(price)
        })
        .await?;

        if priority == Priority::Auto {
            return Ok(suggested);
        }

        // use the historical percentile when it is larger than the live value
        let mut price = u256_to_f64(&suggested);
        let blocks = self.cfg.network.gas_estimation.blocks;
        if blocks > 0 {
            match self.fee_stats(priority).await {
                Ok(stats) => {
                    let historical = stats.gas_price.for_priority(priority);
                    if historical > price {
                        debug!(historical, live = price, "Using historical gas price");
                        price = historical;
                    }
                }
                Err(e) => {
                    debug!("Skipping historical gas price data due to: {e}");
                }
            }
        }

        let mut adjusted = price * adjustment_factor(priority)?;
        adjusted = self.apply_congestion_buffer(adjusted).await?;

        let final_price = f64_to_u256(adjusted);
        info!(gas_price = %final_price, "Calculated suggested legacy fees");
        Ok(final_price)
    }

    /// Suggested EIP-1559 (fee cap, tip cap) for the priority tier
    pub async fn suggest_eip1559_fees(&self, priority: Priority) -> SleuthResult<(U256, U256)> {
        info!("Calculating suggested EIP-1559 fees");

        let blocks = self.cfg.network.gas_estimation.blocks;
        let (mut base_fee, mut tip) = if blocks > 0 && priority != Priority::Auto {
            match self.eip1559_fees_from_history(priority).await {
                Ok(fees) => fees,
                Err(e) => {
                    debug!("Falling back to current EIP-1559 fees due to: {e}");
                    self.current_eip1559_fees().await?
                }
            }
        } else {
            self.current_eip1559_fees().await?
        };

        if priority == Priority::Auto {
            info!("Auto priority selected, returning current fees without adjustment");
            return Ok((f64_to_u256(base_fee + tip), f64_to_u256(tip)));
        }

        if self.cfg.is_experiment_enabled(Experiment::UnsafeFeeEqualizer) {
            warn!(
                "UNSAFE_FEE_EQUALIZER is enabled; base fee and tip will be clamped to the same \
                 order of magnitude. This is dangerous on live networks"
            );
            (base_fee, tip) = equalize_fee_magnitudes(base_fee, tip);
        }

        if base_fee == 0.0 {
            return Err(SleuthError::GasEstimation(
                "node returned a base fee of 0, skipping gas estimation".into(),
            ));
        }
        if tip == 0.0 {
            let fallback = self.cfg.network.gas_tip_cap as f64;
            warn!(
                fallback,
                "Suggested tip is 0; unusual but not strictly invalid, using fallback value"
            );
            tip = fallback;
        }

        let factor = adjustment_factor(priority)?;
        let mut adjusted_base = base_fee * factor;
        let mut adjusted_tip = tip * factor;

        adjusted_base = self.apply_congestion_buffer(adjusted_base).await?;
        adjusted_tip = self.apply_congestion_buffer(adjusted_tip).await?;

        let fee_cap = f64_to_u256(adjusted_base + adjusted_tip);
        let tip_cap = f64_to_u256(adjusted_tip);
        info!(fee_cap = %fee_cap, tip_cap = %tip_cap, "Calculated suggested EIP-1559 fees");
        Ok((fee_cap, tip_cap))
    }

    /// Base fee and tip from fee history, each taking the larger of the live
    /// suggestion and the historical percentile for the priority
    async fn eip1559_fees_from_history(&self, priority: Priority) -> SleuthResult<(f64, f64)> {
        debug!("Fetching EIP-1559 fee history for gas estimation");

        let provider = &self.provider;
        let live_tip = with_attempts(self.attempts(), || async {
            provider.max_priority_fee().await
        })
        .await?;

        let stats = self.fee_stats(priority).await?;
        let base_fee = stats.base_fee.for_priority(priority);
        if base_fee == 0.0 {
            return Err(SleuthError::GasEstimation(
                "historical base fee is 0; insufficient or invalid fee data from the node".into(),
            ));
        }

        // the reward series was already selected by priority percentile, so
        // its median is the representative historical tip
        let historical_tip = stats.tip.perc50;
        let tip = historical_tip.max(u256_to_f64(&live_tip));
        debug!(base_fee, tip, blocks = stats.blocks_used, "Historical fee data");
        Ok((base_fee, tip))
    }

    /// Live fees only: the node's suggested tip plus the latest block's base fee
    async fn current_eip1559_fees(&self) -> SleuthResult<(f64, f64)> {
        debug!("Fetching current EIP-1559 fees");
        let provider = &self.provider;
        let (base_fee, tip) = with_attempts(self.attempts(), || async {
            let tip = provider.max_priority_fee().await?;
            let block = provider.get_latest_block().await?.ok_or_else(|| {
                SleuthError::GasEstimation("no latest block returned by node".into())
            })?;
            let base_fee = block.base_fee_per_gas.ok_or_else(|| {
                SleuthError::GasEstimation(
                    "no base fee in latest block; network may not support EIP-1559".into(),
                )
            })?;
            Ok((base_fee, tip))
        })
        .await?;

        if base_fee.is_zero() {
            return Err(SleuthError::GasEstimation(
                "node returned base fee of 0, which is invalid for EIP-1559".into(),
            ));
        }
        Ok((u256_to_f64(&base_fee), u256_to_f64(&tip)))
    }

    /// Percentile statistics over the configured number of historical blocks
    pub async fn fee_stats(&self, priority: Priority) -> SleuthResult<FeeStats> {
        let blocks = self.cfg.network.gas_estimation.blocks;
        let percentile = reward_percentile(priority)?;
        let history = self
            .provider
            .fee_history(blocks, BlockNumber::Latest, &[percentile])
            .await?;
        FeeStats::from_history(&history, blocks)
    }

    /// Multiply a price by the congestion buffer for the current network
    /// state. Failure to fetch headers skips the buffer rather than failing
    /// the estimation.
    async fn apply_congestion_buffer(&self, price: f64) -> SleuthResult<f64> {
        let blocks = self.cfg.network.gas_estimation.blocks;
        if blocks == 0 {
            return Ok(price);
        }
        match self
            .congestion_metric(blocks, self.cfg.network.gas_estimation.congestion_strategy)
            .await
        {
            Ok(metric) => {
                let tier = classify_congestion(metric);
                debug!(metric, ?tier, "Congestion adjustment");
                Ok(price * tier.buffer_factor())
            }
            Err(e @ SleuthError::BlockFetching(_)) => {
                debug!("Failed to calculate congestion metric due to: {e}. Skipping buffer");
                Ok(price)
            }
            Err(e) => Err(SleuthError::GasEstimation(e.to_string())),
        }
    }

    /// Congestion metric in [0, 1] over the last `blocks` blocks.
    ///
    /// Headers are fetched concurrently, each independently time-limited,
    /// with results served from the header cache where possible. Up to 20%
    /// of requested blocks may fail to fetch.
    pub async fn congestion_metric(
        &self,
        blocks: u64,
        strategy: CongestionStrategy,
    ) -> SleuthResult<f64> {
        let last_block = self
            .provider
            .block_number()
            .await
            .map_err(|e| SleuthError::BlockFetching(e.to_string()))?;

        let (first_block, last_block) = congestion_window(last_block, blocks);
        let fetch_timeout = Duration::from_secs((blocks / 10).clamp(3, 6));

        let headers: Vec<Block<H256>> = stream::iter((first_block..=last_block).rev())
            .map(|bn| self.header_at(bn, fetch_timeout))
            .buffer_unordered(HEADER_FETCH_CONCURRENCY)
            .filter_map(|res| async move { res })
            .collect()
            .await;

        let min_count = (blocks as f64 * MIN_BLOCK_FRACTION) as usize;
        if headers.len() < min_count {
            return Err(SleuthError::BlockFetching(format!(
                "needed at least {min_count} headers, got {} ({:.1}% success rate)",
                headers.len(),
                headers.len() as f64 / blocks as f64 * 100.0
            )));
        }

        let metric = match strategy {
            CongestionStrategy::Simple => simple_congestion_metric(&headers),
            CongestionStrategy::NewestFirst => newest_first_congestion_metric(&headers),
        };
        Ok(metric)
    }

    async fn header_at(&self, block_number: u64, fetch_timeout: Duration) -> Option<Block<H256>> {
        if let Some(cached) = self.header_cache.get(block_number).await {
            return Some(cached);
        }
        let fetched =
            tokio::time::timeout(fetch_timeout, self.provider.get_block(block_number)).await;
        match fetched {
            Ok(Ok(Some(header))) => {
                self.header_cache.set(header.clone()).await;
                Some(header)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!(block = block_number, "Failed to get header due to: {e}");
                None
            }
            Err(_) => {
                debug!(block = block_number, "Header fetch timed out");
                None
            }
        }
    }
}

/// Inclusive block range of exactly `blocks` blocks ending at `last_block`.
/// Brand-new chains may not have the full range yet, so the start is
/// clipped to block 1.
fn congestion_window(last_block: u64, blocks: u64) -> (u64, u64) {
    let first_block = last_block.saturating_sub(blocks.saturating_sub(1)).max(1);
    (first_block, last_block)
}

/// Run `f` up to `attempts` times with a fixed one second delay, returning
/// the last concrete error if all attempts fail
async fn with_attempts<T, F, Fut>(attempts: u32, f: F) -> SleuthResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = SleuthResult<T>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("Attempt {attempt}/{attempts} failed due to: {e}");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| SleuthError::Internal("no attempts were made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U64;

    fn header(number: u64, gas_used: u64, gas_limit: u64) -> Block<H256> {
        Block {
            number: Some(U64::from(number)),
            gas_used: U256::from(gas_used),
            gas_limit: U256::from(gas_limit),
            ..Default::default()
        }
    }

    #[test]
    fn test_percentiles_are_ordered() {
        let values: Vec<f64> = (0..100).rev().map(|v| v as f64 * 3.7).collect();
        let p = FeePercentiles::from_values(values);
        assert!(p.min <= p.perc25);
        assert!(p.perc25 <= p.perc50);
        assert!(p.perc50 <= p.perc75);
        assert!(p.perc75 <= p.perc99);
        assert!(p.perc99 <= p.max);
    }

    #[test]
    fn test_percentiles_single_value() {
        let p = FeePercentiles::from_values(vec![42.0]);
        assert_eq!(p.min, 42.0);
        assert_eq!(p.perc50, 42.0);
        assert_eq!(p.max, 42.0);
    }

    #[test]
    fn test_congestion_classification_boundaries() {
        assert_eq!(classify_congestion(0.0), Congestion::Low);
        assert_eq!(classify_congestion(0.33), Congestion::Low);
        assert_eq!(classify_congestion(0.34), Congestion::Medium);
        assert_eq!(classify_congestion(0.66), Congestion::Medium);
        assert_eq!(classify_congestion(0.67), Congestion::High);
        assert_eq!(classify_congestion(0.75), Congestion::High);
        assert_eq!(classify_congestion(0.76), Congestion::VeryHigh);
        assert_eq!(classify_congestion(1.0), Congestion::VeryHigh);
    }

    #[test]
    fn test_congestion_buffer_factors() {
        assert_eq!(Congestion::Low.buffer_factor(), 1.10);
        assert_eq!(Congestion::VeryHigh.buffer_factor(), 1.40);
    }

    #[test]
    fn test_simple_congestion_metric_averages() {
        let headers = vec![header(1, 50, 100), header(2, 100, 100), header(3, 0, 100)];
        let metric = simple_congestion_metric(&headers);
        assert!((metric - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_simple_metric_skips_zero_gas_limit() {
        let headers = vec![header(1, 50, 100), header(2, 10, 0)];
        assert!((simple_congestion_metric(&headers) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_newest_first_weighs_recent_blocks_more() {
        // oldest blocks empty, newest full: weighted metric must exceed the
        // unweighted mean
        let headers: Vec<_> = (1..=10)
            .map(|n| header(n, if n > 5 { 100 } else { 0 }, 100))
            .collect();
        let weighted = newest_first_congestion_metric(&headers);
        let simple = simple_congestion_metric(&headers);
        assert!(weighted > simple);
        assert!(weighted <= 1.0);
    }

    #[test]
    fn test_adjustment_factors() {
        assert_eq!(adjustment_factor(Priority::Slow).unwrap(), 0.8);
        assert_eq!(adjustment_factor(Priority::Standard).unwrap(), 1.0);
        assert_eq!(adjustment_factor(Priority::Fast).unwrap(), 1.2);
        assert_eq!(adjustment_factor(Priority::Degen).unwrap(), 2.0);
        assert!(adjustment_factor(Priority::Auto).is_err());
    }

    #[test]
    fn test_magnitude_difference() {
        assert_eq!(magnitude_difference(0.0, 10.0), None);
        assert_eq!(magnitude_difference(100.0, 100.0), Some(0));
        assert_eq!(magnitude_difference(1000.0, 100.0), Some(0));
        assert_eq!(magnitude_difference(100_000.0, 10.0), Some(4));
        assert_eq!(magnitude_difference(10.0, 100_000.0), Some(-4));
    }

    #[test]
    fn test_fee_equalizer_clamps_large_differences() {
        // tip four orders below base fee: clamped up
        let (base, tip) = equalize_fee_magnitudes(1_000_000.0, 10.0);
        assert_eq!((base, tip), (1_000_000.0, 1_000_000.0));

        // base four orders below tip: clamped up
        let (base, tip) = equalize_fee_magnitudes(10.0, 1_000_000.0);
        assert_eq!((base, tip), (1_000_000.0, 1_000_000.0));

        // within three orders: untouched
        let (base, tip) = equalize_fee_magnitudes(1_000.0, 10.0);
        assert_eq!((base, tip), (1_000.0, 10.0));

        // zero values take the other side
        assert_eq!(equalize_fee_magnitudes(0.0, 5.0), (5.0, 5.0));
        assert_eq!(equalize_fee_magnitudes(5.0, 0.0), (5.0, 5.0));
    }

    #[test]
    fn test_fee_stats_from_history() {
        let history = FeeHistory {
            base_fee_per_gas: (1..=11).map(U256::from).collect(),
            gas_used_ratio: vec![0.5; 10],
            oldest_block: U256::zero(),
            reward: (1..=10).map(|r| vec![U256::from(r * 2)]).collect(),
        };
        let stats = FeeStats::from_history(&history, 10).unwrap();
        assert_eq!(stats.blocks_used, 10);
        assert_eq!(stats.base_fee.min, 1.0);
        assert_eq!(stats.base_fee.max, 10.0);
        assert_eq!(stats.tip.max, 20.0);
        // gas price is base + tip per block
        assert_eq!(stats.gas_price.max, 30.0);
    }

    #[test]
    fn test_fee_stats_rejects_insufficient_history() {
        let history = FeeHistory {
            base_fee_per_gas: (1..=5).map(U256::from).collect(),
            gas_used_ratio: vec![0.5; 4],
            oldest_block: U256::zero(),
            reward: vec![],
        };
        let err = FeeStats::from_history(&history, 10);
        assert!(matches!(err, Err(SleuthError::GasEstimation(_))));
    }

    #[test]
    fn test_priority_percentile_selection() {
        let p = FeePercentiles {
            min: 1.0,
            perc25: 2.0,
            perc50: 3.0,
            perc75: 4.0,
            perc99: 5.0,
            max: 6.0,
        };
        assert_eq!(p.for_priority(Priority::Slow), 2.0);
        assert_eq!(p.for_priority(Priority::Standard), 3.0);
        assert_eq!(p.for_priority(Priority::Fast), 5.0);
        assert_eq!(p.for_priority(Priority::Degen), 6.0);
    }

    #[test]
    fn test_congestion_window_spans_exactly_the_requested_blocks() {
        assert_eq!(congestion_window(100, 20), (81, 100));
        assert_eq!(congestion_window(100, 1), (100, 100));
        let (first, last) = congestion_window(1_000, 50);
        assert_eq!(last - first + 1, 50);
    }

    #[test]
    fn test_congestion_window_clips_to_genesis_on_young_chains() {
        assert_eq!(congestion_window(5, 20), (1, 5));
    }
}
