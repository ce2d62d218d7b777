//! Keyed stores of live transactions.
//!
//! The endpoint owns one store of client and one of server transaction
//! handles. A transaction is present while and only while it is alive;
//! the terminal transition removes it, and a terminating transaction may
//! re-enter the store through [`TransactionStore::remove`] while a
//! snapshot from [`TransactionStore::snapshot`] is being walked.

use super::key::TransactionKey;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct TransactionStore<T: Clone> {
    inner: Mutex<HashMap<TransactionKey, T>>,
}

impl<T: Clone> TransactionStore<T> {
    pub fn new() -> Self {
        TransactionStore {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert unless the key is already present. Returns whether the entry
    /// was inserted.
    pub fn put(&self, key: TransactionKey, tx: T) -> bool {
        let mut map = self.inner.lock().unwrap();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, tx);
        true
    }

    /// Insert, or hand back the occupant. The winner is decided under a
    /// single lock so two arrivals with the same key cannot both create.
    pub fn put_or_get(&self, key: TransactionKey, tx: T) -> (T, bool) {
        let mut map = self.inner.lock().unwrap();
        match map.get(&key) {
            Some(existing) => (existing.clone(), false),
            None => {
                map.insert(key, tx.clone());
                (tx, true)
            }
        }
    }

    pub fn get(&self, key: &TransactionKey) -> Option<T> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    /// Drop the entry, reporting whether it existed.
    pub fn remove(&self, key: &TransactionKey) -> bool {
        self.inner.lock().unwrap().remove(key).is_some()
    }

    /// A copy of every live handle, taken under the lock and walked
    /// outside it.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for TransactionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::key::TransactionRole;

    fn key(branch: &str) -> TransactionKey {
        let req = rsip::Request {
            method: rsip::Method::Options,
            uri: rsip::Uri::try_from("sip:bob@example.com").unwrap(),
            version: rsip::Version::V2,
            headers: vec![
                rsip::Header::Via(format!("SIP/2.0/UDP 127.0.0.1:5060;branch={}", branch).into()),
                rsip::Header::CSeq("1 OPTIONS".into()),
            ]
            .into(),
            body: Default::default(),
        };
        TransactionKey::from_request(&req, TransactionRole::Client).unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let store = TransactionStore::new();
        let k = key("z9hG4bKone");

        assert!(store.put(k.clone(), 1u32));
        // Duplicate insert is a no-op.
        assert!(!store.put(k.clone(), 2u32));
        assert_eq!(store.get(&k), Some(1));

        assert!(store.remove(&k));
        assert!(!store.remove(&k));
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_or_get_keeps_occupant() {
        let store = TransactionStore::new();
        let k = key("z9hG4bKtwo");

        let (winner, inserted) = store.put_or_get(k.clone(), 7u32);
        assert!(inserted);
        assert_eq!(winner, 7);

        let (occupant, inserted) = store.put_or_get(k.clone(), 8u32);
        assert!(!inserted);
        assert_eq!(occupant, 7);
        assert_eq!(store.len(), 1);
    }
}
