// Connected-peer bookkeeping
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell peers apart in logs.
        let text = self.0.simple().to_string();
        f.write_str(&text[..8])
    }
}

/// Copy-on-write peer map. Writers replace the whole map; readers take an
/// immutable snapshot, so iteration never sees a half-applied change.
pub struct PeerSet<V> {
    current: Arc<RwLock<Arc<HashMap<PeerId, V>>>>,
}

impl<V> Clone for PeerSet<V> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<V> Default for PeerSet<V> {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
        }
    }
}

impl<V: Clone> PeerSet<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<HashMap<PeerId, V>> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn insert(&self, id: PeerId, value: V) {
        self.update(|map| {
            map.insert(id, value);
        });
    }

    pub fn remove(&self, id: &PeerId) -> Option<V> {
        let mut removed = None;
        self.update(|map| removed = map.remove(id));
        removed
    }

    pub fn get(&self, id: &PeerId) -> Option<V> {
        self.snapshot().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn update(&self, change: impl FnOnce(&mut HashMap<PeerId, V>)) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = HashMap::clone(&guard);
        change(&mut next);
        *guard = Arc::new(next);
    }
}

impl<V: Clone> fmt::Debug for PeerSet<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSet").field("len", &self.len()).finish()
    }
}
