//! Encryption key store.
//!
//! Keys may be registered after the containers that need them are mounted.
//! Interested parties learn about late registrations either through a
//! channel ([`KeyStore::subscribe`]) or a callback
//! ([`KeyStore::on_key_registered`]).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::crypto::AesKey;
use crate::types::KeyGuid;

type KeyCallback = Box<dyn Fn(KeyGuid) + Send + Sync>;

#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<KeyGuid, AesKey>>,
    subscribers: Mutex<Vec<Sender<KeyGuid>>>,
    callbacks: Mutex<Vec<KeyCallback>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the key for `guid` and notifies listeners.
    pub fn register(&self, guid: KeyGuid, key: AesKey) {
        {
            let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
            keys.insert(guid, key);
        }
        log::debug!("Registered encryption key {}", guid);

        {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subscribers.retain(|tx| tx.send(guid).is_ok());
        }
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(guid);
        }
    }

    pub fn get(&self, guid: &KeyGuid) -> Option<AesKey> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).get(guid).copied()
    }

    pub fn contains(&self, guid: &KeyGuid) -> bool {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).contains_key(guid)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a receiver that yields the GUID of every key registered from
    /// now on. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<KeyGuid> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// Runs `callback` after every future registration, on the registering
    /// thread.
    pub fn on_key_registered(&self, callback: impl Fn(KeyGuid) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).push(Box::new(callback));
    }
}
