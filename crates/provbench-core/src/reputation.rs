//! Reputation snapshot: how a provider's pricing compares to the network.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ProviderId;

/// Historical pricing comparison of one provider against a reference price.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceComparison {
    /// Whether the provider charges more than the reference.
    pub is_overpriced: bool,

    /// How many times more expensive than the reference, if overpriced.
    pub times_more_expensive: Option<f64>,

    /// How many times cheaper than the reference, if cheaper.
    pub times_cheaper: Option<f64>,
}

impl PriceComparison {
    /// Returns true when the provider is known to be cheaper than the reference.
    pub fn is_cheaper(&self) -> bool {
        self.times_cheaper.is_some_and(|factor| factor > 0.0)
    }

    /// Returns true when the provider is overpriced by more than `margin`
    /// (e.g. `0.2` for 20%). An overpriced provider without a known factor
    /// counts as beyond any margin.
    pub fn overpriced_beyond(&self, margin: f64) -> bool {
        self.is_overpriced
            && self
                .times_more_expensive
                .map_or(true, |factor| factor > 1.0 + margin)
    }
}

/// Per-runtime comparisons published for a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeComparisons {
    /// Comparison for the VM runtime.
    pub vm: Option<PriceComparison>,
}

/// Reputation input for one provider, as published by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Provider node id.
    #[serde(rename = "node_id")]
    pub provider_id: ProviderId,

    /// Pricing comparisons by runtime.
    #[serde(default)]
    pub runtimes: RuntimeComparisons,
}

/// Read-only reputation snapshot indexed by provider, fetched once per run.
#[derive(Debug, Clone, Default)]
pub struct ReputationIndex {
    records: HashMap<ProviderId, PriceComparison>,
}

impl ReputationIndex {
    /// Build an index from backend records. Records without VM data are skipped.
    pub fn from_records(records: impl IntoIterator<Item = ProviderRecord>) -> Self {
        let records = records
            .into_iter()
            .filter_map(|r| r.runtimes.vm.map(|vm| (r.provider_id, vm)))
            .collect();
        Self { records }
    }

    /// Pricing comparison for a provider, if the snapshot has one.
    pub fn get(&self, provider_id: &ProviderId) -> Option<&PriceComparison> {
        self.records.get(provider_id)
    }

    /// Number of providers in the snapshot.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overpriced_margin() {
        let within = PriceComparison {
            is_overpriced: true,
            times_more_expensive: Some(1.2),
            times_cheaper: None,
        };
        let beyond = PriceComparison {
            times_more_expensive: Some(1.21),
            ..within
        };
        let unknown = PriceComparison {
            times_more_expensive: None,
            ..within
        };

        assert!(!within.overpriced_beyond(0.2));
        assert!(beyond.overpriced_beyond(0.2));
        assert!(unknown.overpriced_beyond(0.2));
    }

    #[test]
    fn test_index_from_backend_json() {
        let raw = r#"[
            {"node_id": "0xa", "runtimes": {"vm": {"is_overpriced": false, "times_more_expensive": null, "times_cheaper": 1.5}}},
            {"node_id": "0xb", "runtimes": {}}
        ]"#;
        let records: Vec<ProviderRecord> = serde_json::from_str(raw).unwrap();
        let index = ReputationIndex::from_records(records);

        assert_eq!(index.len(), 1);
        assert!(index.get(&ProviderId::new("0xa")).unwrap().is_cheaper());
        assert!(index.get(&ProviderId::new("0xb")).is_none());
    }
}
