//! Tracked accounts and token contracts.
//!
//! Both registries are cheap to clone and clones share state, so the
//! multi-chain indexer and every chain group see additions and removals at once.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

use crate::types::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub address: Address,
    /// Others can send funds here without the account's own transaction, so
    /// a constant nonce does not prove inactivity.
    #[serde(default)]
    pub externally_fundable: bool,
}

impl TrackedAccount {
    #[must_use]
    pub fn new(address: Address, externally_fundable: bool) -> Self {
        Self { address, externally_fundable }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    accounts: Arc<RwLock<Vec<TrackedAccount>>>,
}

impl AccountRegistry {
    #[must_use]
    pub fn new(accounts: impl IntoIterator<Item = TrackedAccount>) -> Self {
        let registry = Self::default();
        for account in accounts {
            registry.add(account);
        }
        registry
    }

    /// Adds or updates an account. Returns `true` if it was not tracked before.
    pub fn add(&self, account: TrackedAccount) -> bool {
        let mut accounts = self.accounts.write();
        if let Some(existing) = accounts.iter_mut().find(|a| a.address == account.address) {
            *existing = account;
            return false;
        }
        accounts.push(account);
        true
    }

    pub fn remove(&self, address: &Address) -> bool {
        let mut accounts = self.accounts.write();
        let before = accounts.len();
        accounts.retain(|a| a.address != *address);
        accounts.len() != before
    }

    #[must_use]
    pub fn get(&self, address: &Address) -> Option<TrackedAccount> {
        self.accounts.read().iter().find(|a| a.address == *address).copied()
    }

    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    /// Snapshot in registration order.
    #[must_use]
    pub fn accounts(&self) -> Vec<TrackedAccount> {
        self.accounts.read().clone()
    }

    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        self.accounts.read().iter().map(|a| a.address).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }
}

/// Token contracts tracked per chain.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: Arc<RwLock<HashMap<u64, Vec<Address>>>>,
}

impl TokenRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the token list of a chain; duplicates are dropped.
    pub fn set_tokens(&self, chain_id: u64, tokens: impl IntoIterator<Item = Address>) {
        let mut list: Vec<Address> = Vec::new();
        for token in tokens {
            if !list.contains(&token) {
                list.push(token);
            }
        }
        self.tokens.write().insert(chain_id, list);
    }

    /// `None` when the chain has no registry entry at all, which is a
    /// configuration error. An empty list is valid.
    #[must_use]
    pub fn tokens(&self, chain_id: u64) -> Option<Vec<Address>> {
        self.tokens.read().get(&chain_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_updates_flag_in_place() {
        let registry = AccountRegistry::new([TrackedAccount::new(Address([1; 20]), false)]);
        assert!(!registry.add(TrackedAccount::new(Address([1; 20]), true)));
        assert!(registry.add(TrackedAccount::new(Address([2; 20]), false)));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&Address([1; 20])).unwrap().externally_fundable);
        assert_eq!(registry.addresses(), vec![Address([1; 20]), Address([2; 20])]);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = AccountRegistry::default();
        let clone = registry.clone();
        clone.add(TrackedAccount::new(Address([3; 20]), false));
        assert!(registry.contains(&Address([3; 20])));
        assert!(registry.remove(&Address([3; 20])));
        assert!(clone.is_empty());
    }

    #[test]
    fn test_token_registry_distinguishes_missing_and_empty() {
        let tokens = TokenRegistry::new();
        assert_eq!(tokens.tokens(1), None);
        tokens.set_tokens(1, []);
        assert_eq!(tokens.tokens(1), Some(Vec::new()));
        tokens.set_tokens(10, [Address([9; 20]), Address([9; 20])]);
        assert_eq!(tokens.tokens(10).unwrap().len(), 1);
    }
}
