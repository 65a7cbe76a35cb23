use std::hash::Hash;

use dashmap::DashMap;

/// Remembers until which tick a key is cooling down.
pub struct CooldownBook<K: Eq + Hash> {
    until: DashMap<K, u64>,
}

impl<K: Eq + Hash> Default for CooldownBook<K> {
    fn default() -> Self {
        Self {
            until: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> CooldownBook<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, key: K, now: u64, ticks: u64) {
        if ticks == 0 {
            self.until.remove(&key);
            return;
        }
        self.until.insert(key, now.saturating_add(ticks));
    }

    /// Ticks left on the cooldown, `None` once it has elapsed.
    pub fn remaining(&self, key: &K, now: u64) -> Option<u64> {
        let until = *self.until.get(key)?;
        if now < until {
            Some(until - now)
        } else {
            self.until.remove_if(key, |_, u| *u <= now);
            None
        }
    }

    pub fn is_active(&self, key: &K, now: u64) -> bool {
        self.remaining(key, now).is_some()
    }

    pub fn clear(&self, key: &K) {
        self.until.remove(key);
    }

    /// Drops every elapsed entry.
    pub fn purge(&self, now: u64) -> usize {
        let before = self.until.len();
        self.until.retain(|_, until| *until > now);
        before.saturating_sub(self.until.len())
    }

    pub fn len(&self) -> usize {
        self.until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.until.is_empty()
    }
}

/// Order-independent key for a pair of ids.
pub fn unordered_pair<T: Ord + Copy>(a: T, b: T) -> (T, T) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
