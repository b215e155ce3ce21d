/*!
 * Entity registry for BlueFlow.
 *
 * An [`EntityRegistry`] keeps an ordered, duplicate-free list of running
 * child machines together with their last known state. Each entry has a
 * forwarder task that folds the child's state stream into the aggregate,
 * which is re-published to the registry's own subscribers.
 */
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use blueflow_core::config::EngineConfig;
use blueflow_core::state::{StatePublisher, StateStream};

/// A running machine that can live in an [`EntityRegistry`]
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    /// Stable protocol-level identifier
    type Id: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Published state
    type State: Clone + Debug + PartialEq + Send + Sync + 'static;

    /// The entity's identifier
    fn entity_id(&self) -> Self::Id;

    /// The entity's current state
    fn state(&self) -> Self::State;

    /// Subscribe to the entity's state changes
    fn subscribe(&self) -> StateStream<Self::State>;
}

/// One registry entry: the last known state and a handle to the machine
#[derive(Debug, Clone)]
pub struct RegistryEntry<M: Entity> {
    /// Entity identifier
    pub id: M::Id,
    /// Last known state
    pub state: M::State,
    /// Handle to the running machine
    pub machine: M,
}

impl<M: Entity + PartialEq> PartialEq for RegistryEntry<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.state == other.state && self.machine == other.machine
    }
}

struct Slot<M: Entity> {
    entry: RegistryEntry<M>,
    generation: u64,
    forwarder: Option<JoinHandle<()>>,
}

struct Inner<M: Entity> {
    slots: Vec<Slot<M>>,
    next_generation: u64,
    publisher: StatePublisher<Vec<RegistryEntry<M>>>,
}

impl<M: Entity> Inner<M> {
    fn snapshot(&self) -> Vec<RegistryEntry<M>> {
        self.slots.iter().map(|slot| slot.entry.clone()).collect()
    }

    fn publish(&self) {
        self.publisher.publish(self.snapshot());
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Insert or replace in place, returning the slot's generation
    fn upsert(&mut self, machine: M) -> u64 {
        let generation = self.generation();
        let id = machine.entity_id();
        let entry = RegistryEntry {
            id: id.clone(),
            state: machine.state(),
            machine,
        };

        match self.slots.iter_mut().find(|slot| slot.entry.id == id) {
            Some(slot) => {
                debug!("Replacing registry entry {:?}", id);
                if let Some(forwarder) = slot.forwarder.take() {
                    forwarder.abort();
                }
                slot.entry = entry;
                slot.generation = generation;
            }
            None => {
                debug!("Appending registry entry {:?}", id);
                self.slots.push(Slot {
                    entry,
                    generation,
                    forwarder: None,
                });
            }
        }

        generation
    }

    fn fold(&mut self, id: &M::Id, generation: u64, state: M::State) {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.entry.id == *id && slot.generation == generation)
        else {
            trace!("Dropping update for replaced registry entry {:?}", id);
            return;
        };

        if slot.entry.state != state {
            slot.entry.state = state;
            self.publish();
        }
    }

    fn abort_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(forwarder) = slot.forwarder.take() {
                forwarder.abort();
            }
        }
    }
}

impl<M: Entity> Drop for Inner<M> {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Ordered, duplicate-free collection of running child machines
pub struct EntityRegistry<M: Entity> {
    inner: Arc<Mutex<Inner<M>>>,
    publisher: StatePublisher<Vec<RegistryEntry<M>>>,
}

impl<M: Entity> Clone for EntityRegistry<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

impl<M: Entity> Debug for EntityRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<M::Id> = self.lock().slots.iter().map(|s| s.entry.id.clone()).collect();
        f.debug_struct("EntityRegistry").field("ids", &ids).finish()
    }
}

impl<M: Entity> Default for EntityRegistry<M> {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl<M: Entity> EntityRegistry<M> {
    /// Create an empty registry
    pub fn new(config: EngineConfig) -> Self {
        let publisher = StatePublisher::with_capacity(Vec::new(), config.state_channel_capacity);
        let inner = Inner {
            slots: Vec::new(),
            next_generation: 0,
            publisher: publisher.clone(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            publisher,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a machine, or replace the entry with the same id in place
    ///
    /// Must be called from within a Tokio runtime.
    pub fn append(&self, machine: M) {
        let mut inner = self.lock();
        self.insert(&mut inner, machine);
        inner.publish();
    }

    /// Replace every entry with `machines`, keeping their order
    ///
    /// A later machine with an id already in the list replaces the earlier
    /// one in place. Must be called from within a Tokio runtime.
    pub fn replace_all<I>(&self, machines: I)
    where
        I: IntoIterator<Item = M>,
    {
        let mut inner = self.lock();
        inner.abort_all();
        inner.slots.clear();
        for machine in machines {
            self.insert(&mut inner, machine);
        }
        debug!("Registry replaced with {} entries", inner.slots.len());
        inner.publish();
    }

    fn insert(&self, inner: &mut Inner<M>, machine: M) {
        let id = machine.entity_id();
        let stream = machine.subscribe();
        let generation = inner.upsert(machine);
        let forwarder = tokio::spawn(forward(
            Arc::downgrade(&self.inner),
            id.clone(),
            generation,
            stream,
        ));
        if let Some(slot) = inner.slots.iter_mut().find(|slot| slot.entry.id == id) {
            slot.forwarder = Some(forwarder);
        }
    }

    /// Look up a machine by id
    pub fn get(&self, id: &M::Id) -> Option<M> {
        self.lock()
            .slots
            .iter()
            .find(|slot| slot.entry.id == *id)
            .map(|slot| slot.entry.machine.clone())
    }

    /// The current ordered entries
    pub fn snapshot(&self) -> Vec<RegistryEntry<M>> {
        self.publisher.current()
    }

    /// Handles to every machine, in insertion order
    pub fn machines(&self) -> Vec<M> {
        self.lock()
            .slots
            .iter()
            .map(|slot| slot.entry.machine.clone())
            .collect()
    }

    /// Subscribe to aggregate changes, starting with the current entries
    pub fn subscribe(&self) -> StateStream<Vec<RegistryEntry<M>>> {
        self.publisher.subscribe()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn forward<M: Entity>(
    inner: Weak<Mutex<Inner<M>>>,
    id: M::Id,
    generation: u64,
    mut stream: StateStream<M::State>,
) {
    while let Some(state) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.fold(&id, generation, state);
    }
    trace!("Registry forwarder for {:?} finished", id);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone)]
    struct Counter {
        id: u32,
        state: StatePublisher<u32>,
    }

    impl Counter {
        fn new(id: u32, value: u32) -> Self {
            Self {
                id,
                state: StatePublisher::new(value),
            }
        }

        fn set(&self, value: u32) {
            self.state.publish(value);
        }
    }

    impl Entity for Counter {
        type Id = u32;
        type State = u32;

        fn entity_id(&self) -> u32 {
            self.id
        }

        fn state(&self) -> u32 {
            self.state.current()
        }

        fn subscribe(&self) -> StateStream<u32> {
            self.state.subscribe()
        }
    }

    fn pairs(entries: &[RegistryEntry<Counter>]) -> Vec<(u32, u32)> {
        entries.iter().map(|e| (e.id, e.state)).collect()
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let registry = EntityRegistry::default();
        registry.append(Counter::new(3, 0));
        registry.append(Counter::new(1, 0));
        registry.append(Counter::new(2, 0));

        assert_eq!(registry.len(), 3);
        assert_eq!(pairs(&registry.snapshot()), vec![(3, 0), (1, 0), (2, 0)]);
    }

    #[test_log::test(tokio::test)]
    async fn test_child_updates_are_folded() {
        let registry = EntityRegistry::default();
        let first = Counter::new(1, 0);
        let second = Counter::new(2, 0);
        registry.append(first.clone());
        registry.append(second.clone());

        let mut stream = registry.subscribe();
        second.set(7);
        first.set(5);

        let entries = stream
            .wait_for_timeout(WAIT, |entries| pairs(entries) == vec![(1, 5), (2, 7)])
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_append_replaces_in_place() {
        let registry = EntityRegistry::default();
        let old = Counter::new(1, 10);
        registry.append(old.clone());
        registry.append(Counter::new(2, 0));

        let new = Counter::new(1, 20);
        registry.append(new.clone());
        assert_eq!(pairs(&registry.snapshot()), vec![(1, 20), (2, 0)]);

        // The replaced machine's updates no longer reach the registry
        old.set(99);
        new.set(21);

        let mut stream = registry.subscribe();
        let entries = stream
            .wait_for_timeout(WAIT, |entries| pairs(entries)[0] == (1, 21))
            .await
            .unwrap();
        assert_eq!(pairs(&entries), vec![(1, 21), (2, 0)]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pairs(&registry.snapshot()), vec![(1, 21), (2, 0)]);
    }

    #[tokio::test]
    async fn test_replace_all() {
        let registry = EntityRegistry::default();
        let stale = Counter::new(1, 0);
        registry.append(stale.clone());

        registry.replace_all(vec![
            Counter::new(4, 1),
            Counter::new(5, 2),
            Counter::new(4, 3),
        ]);
        assert_eq!(pairs(&registry.snapshot()), vec![(4, 3), (5, 2)]);
        assert!(registry.get(&1).is_none());

        stale.set(50);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pairs(&registry.snapshot()), vec![(4, 3), (5, 2)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_updates_keep_order_and_ids_unique() {
        let registry = EntityRegistry::default();
        let counters: Vec<Counter> = (0..8).map(|id| Counter::new(id, 0)).collect();
        for counter in &counters {
            registry.append(counter.clone());
        }

        let mut tasks = Vec::new();
        for counter in counters.clone() {
            tasks.push(tokio::spawn(async move {
                for value in 1..=50 {
                    counter.set(value);
                    tokio::task::yield_now().await;
                }
            }));
        }
        // Re-appending an existing id mid-flight must not duplicate it
        registry.append(counters[3].clone());
        for task in tasks {
            task.await.unwrap();
        }

        let mut stream = registry.subscribe();
        let entries = stream
            .wait_for_timeout(WAIT, |entries| entries.iter().all(|e| e.state == 50))
            .await
            .unwrap();
        let ids: Vec<u32> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_get_and_empty() {
        let registry: EntityRegistry<Counter> = EntityRegistry::default();
        assert!(registry.is_empty());

        registry.append(Counter::new(9, 4));
        let machine = registry.get(&9).unwrap();
        assert_eq!(machine.state(), 4);
        assert_eq!(registry.machines().len(), 1);
    }
}
