//! Upstream source registry and factory
//!
//! This module provides:
//! - Central registration of all supported sources
//! - A factory function to resolve sources by slot name
//!
//! All API-specific logic must live in dedicated source modules.
//! The rest of the application must interact exclusively through
//! the `DataSource` trait.

pub mod adapter;
pub mod etherscan;
mod blocks;
mod defi;
mod erc20;
mod gas;
mod network;
mod price;

use std::sync::Arc;

use adapter::DataSource;
use etherscan::EtherscanApi;

use crate::config::Config;
use crate::error::ConfigError;

pub const PRICE_DATA: &str = "price_data";
pub const NETWORK_STATS: &str = "network_stats";
pub const RECENT_BLOCKS: &str = "recent_blocks";
pub const GAS_DATA: &str = "gas_data";
pub const DEFI_METRICS: &str = "defi_metrics";
pub const ERC20_TRANSFERS: &str = "erc20_transfers";

/// Sources enabled when `collection.sources` is not configured.
pub const DEFAULT_SOURCES: [&str; 5] = [
    PRICE_DATA,
    NETWORK_STATS,
    RECENT_BLOCKS,
    GAS_DATA,
    DEFI_METRICS,
];

/// Sources that need `apis.etherscan_key`.
pub const ETHERSCAN_SOURCES: [&str; 4] = [
    NETWORK_STATS,
    RECENT_BLOCKS,
    GAS_DATA,
    ERC20_TRANSFERS,
];

pub fn is_known(name: &str) -> bool {
    DEFAULT_SOURCES.contains(&name) || name == ERC20_TRANSFERS
}

/// Returns a source instance by slot name.
///
/// RETURNS:
/// - `Some(Arc<dyn DataSource>)` if the name is known and its
///   required configuration is present
/// - `None` otherwise
///
/// CONTRACT:
/// - `name` MUST match an entry of `collection.sources`
///
pub fn get_source(name: &str, cfg: &Config) -> Option<Arc<dyn DataSource>> {
    let apis = &cfg.apis;
    let collection = &cfg.collection;

    match name {
        PRICE_DATA => Some(Arc::new(price::PriceSource::new(&apis.coingecko_url))),
        NETWORK_STATS => Some(Arc::new(network::NetworkStatsSource::new(
            EtherscanApi::from_config(apis)?,
        ))),
        RECENT_BLOCKS => Some(Arc::new(blocks::RecentBlocksSource::new(
            EtherscanApi::from_config(apis)?,
            collection.recent_block_count,
        ))),
        GAS_DATA => Some(Arc::new(gas::GasOracleSource::new(
            EtherscanApi::from_config(apis)?,
        ))),
        DEFI_METRICS => Some(Arc::new(defi::DefiMetricsSource::new(
            &apis.defipulse_url,
            apis.defipulse_key.as_deref(),
        ))),
        ERC20_TRANSFERS => Some(Arc::new(erc20::Erc20TransferSource::new(
            EtherscanApi::from_config(apis)?,
            cfg.erc20_contracts.clone(),
            collection.transfer_lookback_blocks,
        ))),
        _ => None,
    }
}

/// Resolves every enabled source, in configured order.
///
/// Fails on the first name that cannot be built; `Config::validate`
/// normally catches these earlier.
pub fn build_sources(cfg: &Config) -> Result<Vec<Arc<dyn DataSource>>, ConfigError> {
    cfg.collection
        .sources
        .iter()
        .map(|name| {
            get_source(name, cfg).ok_or_else(|| ConfigError::Invalid {
                key: "collection.sources",
                reason: format!("source '{}' is unknown or missing its API key", name),
            })
        })
        .collect()
}
