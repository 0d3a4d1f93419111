//! Principal lookup by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Name of the built-in system account.
pub const SYSTEM_ACCOUNT: &str = "SYSTEM";
/// Name of the system account's default group.
pub const SYSTEM_GROUP: &str = "dba";

/// A user account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account name.
    pub name: String,
    /// Primary group name.
    pub default_group: String,
}

impl Account {
    /// Create an account with the given primary group.
    pub fn new(name: impl Into<String>, default_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_group: default_group.into(),
        }
    }
}

/// A group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name.
    pub name: String,
}

/// Resolves accounts and groups by name.
pub trait SecurityManager: Send + Sync {
    /// Look up an account; `None` if the name does not resolve.
    fn account(&self, name: &str) -> Option<Account>;
    /// Look up a group; `None` if the name does not resolve.
    fn group(&self, name: &str) -> Option<Group>;
    /// The privileged subject used by replication sessions.
    fn system_subject(&self) -> Account;
}

/// In-memory principal registry. Always knows the system account and group.
#[derive(Debug)]
pub struct MemorySecurity {
    accounts: RwLock<HashMap<String, Account>>,
    groups: RwLock<HashMap<String, Group>>,
}

impl MemorySecurity {
    /// Create a registry holding only the system principal.
    pub fn new() -> Self {
        let security = Self {
            accounts: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
        };
        security.add_group(SYSTEM_GROUP);
        security.add_account(SYSTEM_ACCOUNT, SYSTEM_GROUP);
        security
    }

    /// Register an account (and its primary group if unknown).
    pub fn add_account(&self, name: &str, default_group: &str) {
        self.add_group(default_group);
        self.accounts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Account::new(name, default_group));
    }

    /// Register a group.
    pub fn add_group(&self, name: &str) {
        self.groups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| Group {
                name: name.to_string(),
            });
    }
}

impl Default for MemorySecurity {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityManager for MemorySecurity {
    fn account(&self, name: &str) -> Option<Account> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn group(&self, name: &str) -> Option<Group> {
        self.groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn system_subject(&self) -> Account {
        Account::new(SYSTEM_ACCOUNT, SYSTEM_GROUP)
    }
}
