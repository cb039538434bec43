//! Provider and operator blacklist snapshot.

use std::collections::HashSet;

use crate::ProviderId;

/// Blacklisted providers and operator wallets, loaded once at run start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    providers: HashSet<ProviderId>,
    operators: HashSet<String>,
}

impl Blacklist {
    /// Create a blacklist from provider ids and operator addresses.
    pub fn new(
        providers: impl IntoIterator<Item = ProviderId>,
        operators: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            providers: providers.into_iter().collect(),
            // Wallet addresses are compared case-insensitively.
            operators: operators
                .into_iter()
                .map(|op| op.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Returns true if the provider id is blacklisted.
    pub fn contains_provider(&self, provider_id: &ProviderId) -> bool {
        self.providers.contains(provider_id)
    }

    /// Returns true if the operator wallet is blacklisted.
    pub fn contains_operator(&self, address: &str) -> bool {
        self.operators.contains(&address.to_ascii_lowercase())
    }

    /// Number of blacklisted providers.
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Number of blacklisted operators.
    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_match_ignores_case() {
        let bl = Blacklist::new([], ["0xABCdef".to_string()]);
        assert!(bl.contains_operator("0xabcDEF"));
        assert!(!bl.contains_operator("0x123"));
    }

    #[test]
    fn test_provider_match() {
        let bl = Blacklist::new([ProviderId::new("0xbad")], []);
        assert!(bl.contains_provider(&ProviderId::new("0xbad")));
        assert_eq!(bl.provider_count(), 1);
        assert_eq!(bl.operator_count(), 0);
    }
}
