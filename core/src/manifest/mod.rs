use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::decode::EventAbi;
use crate::filter::{ChildAddressLocation, Factory, Filter};

/// Already-parsed configuration for one chain. Config loading itself lives
/// outside the core; this is the shape the engines consume.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// One or more JSON-RPC endpoints, load-balanced by the dispatcher.
    pub rpc_urls: Vec<String>,
    /// Optional websocket endpoint for new-head subscriptions.
    pub ws_url: Option<String>,
    /// Head polling cadence when no websocket is configured or it degrades.
    pub polling_interval: Duration,
    /// Blocks behind the tip treated as immutable.
    pub finality_block_count: u64,
    /// Disables the persisted handler RPC cache for this chain.
    pub disable_cache: bool,
}

impl ChainConfig {
    pub fn new(chain_id: u64, rpc_urls: Vec<String>) -> Self {
        ChainConfig {
            chain_id,
            rpc_urls,
            ws_url: None,
            polling_interval: Duration::from_secs(2),
            finality_block_count: 10,
            disable_cache: false,
        }
    }
}

/// How events from multiple chains are interleaved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainOrdering {
    /// One global stream in checkpoint order across chains.
    #[default]
    #[serde(rename = "omnichain")]
    Omnichain,
    /// Each chain's stream delivered independently, in per-chain order.
    #[serde(rename = "multichain")]
    Multichain,
}

/// Binds one filter to a user-visible name and, for contracts, the ABI event
/// descriptors used to decode matched logs.
#[derive(Debug, Clone)]
pub struct Source {
    pub name: String,
    pub filter: Filter,
    pub abi_events: Vec<EventAbi>,
}

impl Source {
    pub fn new(name: impl Into<String>, filter: Filter) -> Self {
        Source { name: name.into(), filter, abi_events: Vec::new() }
    }

    pub fn with_abi_events(mut self, abi_events: Vec<EventAbi>) -> Self {
        self.abi_events = abi_events;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub chains: Vec<ChainConfig>,
    pub sources: Vec<Source>,
    pub factories: Vec<Factory>,
    pub ordering: ChainOrdering,
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("no chains configured")]
    NoChains,

    #[error("chain {0} has no rpc endpoints")]
    NoRpcEndpoints(u64),

    #[error("source '{0}' references unknown chain {1}")]
    UnknownChain(String, u64),

    #[error("source '{0}': transaction filters cannot match a to-address on this chain unless it is a factory")]
    TransactionToAddressUnsupported(String),

    #[error("source '{0}': block filter interval must be nonzero")]
    ZeroBlockInterval(String),

    #[error("factory '{0}': data offset {1} is not 32-byte aligned")]
    MisalignedFactoryOffset(String, usize),

    #[error("source '{0}' references unknown factory '{1}'")]
    UnknownFactory(String, String),
}

impl Manifest {
    /// Structural validation of the parsed configuration. Rejections here are
    /// things no amount of syncing can make work.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.chains.is_empty() {
            return Err(ManifestError::NoChains);
        }
        for chain in &self.chains {
            if chain.rpc_urls.is_empty() {
                return Err(ManifestError::NoRpcEndpoints(chain.chain_id));
            }
        }

        for factory in &self.factories {
            if let ChildAddressLocation::Offset(offset) = factory.child_address_location {
                if offset % 32 != 0 {
                    return Err(ManifestError::MisalignedFactoryOffset(
                        factory.id.clone(),
                        offset,
                    ));
                }
            }
        }

        for source in &self.sources {
            let chain_id = source.filter.chain_id();
            if !self.chains.iter().any(|c| c.chain_id == chain_id) {
                return Err(ManifestError::UnknownChain(source.name.clone(), chain_id));
            }

            if let Filter::Transaction(tx_filter) = &source.filter {
                if tx_filter.to_address_is_plain() {
                    return Err(ManifestError::TransactionToAddressUnsupported(
                        source.name.clone(),
                    ));
                }
            }

            if let Filter::Block(block_filter) = &source.filter {
                if block_filter.interval == 0 {
                    return Err(ManifestError::ZeroBlockInterval(source.name.clone()));
                }
            }

            for factory_id in source.filter.referenced_factories() {
                if !self.factories.iter().any(|f| f.id == factory_id) {
                    return Err(ManifestError::UnknownFactory(
                        source.name.clone(),
                        factory_id.to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn sources_for_chain(&self, chain_id: u64) -> Vec<&Source> {
        self.sources.iter().filter(|s| s.filter.chain_id() == chain_id).collect()
    }

    pub fn factories_for_chain(&self, chain_id: u64) -> Vec<&Factory> {
        self.factories.iter().filter(|f| f.chain_id == chain_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{BlockFilter, TransactionFilter};
    use starknet_types_core::felt::Felt;

    fn base_manifest() -> Manifest {
        Manifest {
            chains: vec![ChainConfig::new(1, vec!["http://localhost:5050".to_string()])],
            sources: vec![],
            factories: vec![],
            ordering: ChainOrdering::Omnichain,
        }
    }

    #[test]
    fn test_rejects_plain_to_address_transaction_filter() {
        let mut manifest = base_manifest();
        let mut filter = TransactionFilter::new(1);
        filter.to_address = Some(vec![Felt::from(5u64)]);
        manifest.sources.push(Source::new("bad", Filter::Transaction(filter)));

        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::TransactionToAddressUnsupported(_))
        ));
    }

    #[test]
    fn test_rejects_zero_interval_block_filter() {
        let mut manifest = base_manifest();
        let filter = BlockFilter { chain_id: 1, from_block: None, to_block: None, interval: 0, offset: 0 };
        manifest.sources.push(Source::new("blocks", Filter::Block(filter)));

        assert!(matches!(manifest.validate(), Err(ManifestError::ZeroBlockInterval(_))));
    }
}
