//! Player accounts and their characters.
//!
//! Authentication lives elsewhere; an account here is only a name, an access
//! level and the serials of the mobiles it plays. Records are stored as a
//! bincode blob inside the accounts segment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::world::serial::Serial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    Player,
    Counselor,
    GameMaster,
    Administrator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub access: AccessLevel,
    pub characters: Vec<Serial>,
    /// Creation time, unix seconds.
    pub created: i64,
}

impl Account {
    pub fn new(name: impl Into<String>, created: i64) -> Self {
        Self {
            name: name.into(),
            access: AccessLevel::Player,
            characters: Vec::new(),
            created,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountBook {
    accounts: BTreeMap<String, Account>,
}

impl AccountBook {
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Add `account`. Names are unique; an existing name is left alone.
    pub fn insert(&mut self, account: Account) -> bool {
        if self.accounts.contains_key(&account.name) {
            return false;
        }
        self.accounts.insert(account.name.clone(), account);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Account> {
        self.accounts.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Account> {
        self.accounts.remove(name)
    }

    /// Accounts in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Attach a character to an account. A serial belongs to at most one account.
    pub fn add_character(&mut self, name: &str, serial: Serial) -> bool {
        if self.owner_of(serial).is_some() {
            return false;
        }
        match self.accounts.get_mut(name) {
            Some(account) => {
                account.characters.push(serial);
                true
            }
            None => false,
        }
    }

    pub fn owner_of(&self, serial: Serial) -> Option<&Account> {
        self.accounts
            .values()
            .find(|account| account.characters.contains(&serial))
    }

    /// Drop `serial` from whichever account lists it.
    pub fn forget_character(&mut self, serial: Serial) {
        for account in self.accounts.values_mut() {
            account.characters.retain(|c| *c != serial);
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let records: Vec<&Account> = self.accounts.values().collect();
        bincode::serialize(&records)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        let records: Vec<Account> = bincode::deserialize(bytes)?;
        let mut book = AccountBook::default();
        for account in records {
            book.insert(account);
        }
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_characters_exclusive() {
        let mut book = AccountBook::default();
        assert!(book.insert(Account::new("alice", 1_700_000_000)));
        assert!(!book.insert(Account::new("alice", 0)));
        assert!(book.insert(Account::new("bob", 0)));
        assert!(book.add_character("alice", Serial::new(5)));
        assert!(!book.add_character("bob", Serial::new(5)));
        assert_eq!(book.owner_of(Serial::new(5)).map(|a| a.name.as_str()), Some("alice"));
        book.forget_character(Serial::new(5));
        assert!(book.owner_of(Serial::new(5)).is_none());
    }

    #[test]
    fn bincode_blob_round_trips() {
        let mut book = AccountBook::default();
        let mut admin = Account::new("root", 42);
        admin.access = AccessLevel::Administrator;
        admin.characters.push(Serial::new(9));
        book.insert(admin);
        let bytes = book.encode().expect("encode");
        assert_eq!(AccountBook::decode(&bytes).expect("decode"), book);
    }
}
