//! Weak-value uniqueness registry.
//!
//! A [`Registrar`] enforces "at most one live value per key". It never keeps a
//! value alive: entries hold `Weak` handles, and a value that has lost every
//! strong owner stops counting immediately. Dead entries are purged lazily by
//! the queries that observe them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub struct Registrar<K, V: ?Sized> {
    entries: Mutex<HashMap<K, Weak<V>>>,
}

impl<K, V: ?Sized> Default for Registrar<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Registrar<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    pub fn new() -> Self {
        Self::default()
    }

    // Strong handles are never created or dropped while this guard is held:
    // dropping a value may re-enter `de_register`.
    fn entries(&self) -> MutexGuard<'_, HashMap<K, Weak<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `key` for `value`.
    ///
    /// Returns `false` when a different live value already holds the key.
    /// Registering the value that already holds the key is a no-op returning `true`.
    pub fn register(&self, key: K, value: &Arc<V>) -> bool {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&key) {
            if existing.strong_count() > 0 {
                return std::ptr::addr_eq(existing.as_ptr(), Arc::as_ptr(value));
            }
        }
        entries.insert(key, Arc::downgrade(value));
        true
    }

    pub fn is_registered(&self, key: &K) -> bool {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(existing) if existing.strong_count() > 0 => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Number of live registrations.
    pub fn count(&self) -> usize {
        let mut entries = self.entries();
        entries.retain(|_, value| value.strong_count() > 0);
        entries.len()
    }

    /// Removes the entry for `key` if its value is already dead.
    ///
    /// A live registration under the same key is left untouched.
    pub fn de_register(&self, key: &K) {
        let mut entries = self.entries();
        if entries
            .get(key)
            .is_some_and(|existing| existing.strong_count() == 0)
        {
            entries.remove(key);
        }
    }

    /// Gives up `key` if it is held by `value` itself.
    ///
    /// Used to roll back a claim that turned out to be unusable while the
    /// value is still alive.
    pub fn release(&self, key: &K, value: &Arc<V>) {
        let mut entries = self.entries();
        if entries
            .get(key)
            .is_some_and(|existing| std::ptr::addr_eq(existing.as_ptr(), Arc::as_ptr(value)))
        {
            entries.remove(key);
        }
    }

    /// Live value registered under `key`, if any.
    pub fn value(&self, key: &K) -> Option<Arc<V>> {
        let weak = self.entries().get(key).cloned();
        weak.and_then(|weak| weak.upgrade())
    }
}

impl<K, V: ?Sized> std::fmt::Debug for Registrar<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().map(|entries| entries.len()).unwrap_or(0);
        f.debug_struct("Registrar").field("entries", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::thread;

    #[test]
    fn test_register_rejects_second_live_value() {
        let registrar = Registrar::<String, String>::new();
        let first = Arc::new("first".to_string());
        let second = Arc::new("second".to_string());

        assert!(registrar.register("key".to_string(), &first));
        assert!(registrar.register("key".to_string(), &first));
        assert!(!registrar.register("key".to_string(), &second));
        assert_eq!(registrar.count(), 1);
        assert_eq!(registrar.value(&"key".to_string()).as_deref(), Some(&"first".to_string()));
    }

    #[test]
    fn test_dead_values_stop_counting_without_de_register() {
        let registrar = Registrar::<u32, String>::new();
        let value = Arc::new("v".to_string());
        assert!(registrar.register(1, &value));
        assert!(registrar.is_registered(&1));

        drop(value);
        assert!(!registrar.is_registered(&1));
        assert_eq!(registrar.count(), 0);

        let replacement = Arc::new("w".to_string());
        assert!(registrar.register(1, &replacement));
        assert_eq!(registrar.count(), 1);
    }

    #[test]
    fn test_de_register_keeps_newer_live_value() {
        let registrar = Registrar::<u32, String>::new();
        let stale = Arc::new("stale".to_string());
        registrar.register(7, &stale);
        drop(stale);

        let live = Arc::new("live".to_string());
        assert!(registrar.register(7, &live));

        registrar.de_register(&7);
        assert!(registrar.is_registered(&7));

        drop(live);
        registrar.de_register(&7);
        assert_eq!(registrar.count(), 0);
    }

    #[test]
    fn test_release_only_drops_own_claim() {
        let registrar = Registrar::<u32, String>::new();
        let holder = Arc::new("holder".to_string());
        let other = Arc::new("other".to_string());
        assert!(registrar.register(3, &holder));

        registrar.release(&3, &other);
        assert!(registrar.is_registered(&3));

        registrar.release(&3, &holder);
        assert!(!registrar.is_registered(&3));
        assert!(registrar.register(3, &other));
    }

    #[test]
    fn test_unsized_values() {
        let registrar = Registrar::<&'static str, dyn Any + Send + Sync>::new();
        let value: Arc<dyn Any + Send + Sync> = Arc::new(5_u64);
        assert!(registrar.register("n", &value));

        let found = registrar.value(&"n").expect("registered value");
        assert_eq!(found.downcast_ref::<u64>(), Some(&5));
    }

    #[test]
    fn test_concurrent_register_single_winner() {
        let registrar = Arc::new(Registrar::<u32, u32>::new());
        let values: Vec<Arc<u32>> = (0..8).map(Arc::new).collect();

        let handles: Vec<_> = values
            .iter()
            .cloned()
            .map(|value| {
                let registrar = Arc::clone(&registrar);
                thread::spawn(move || registrar.register(0, &value))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registrar.count(), 1);
    }
}
