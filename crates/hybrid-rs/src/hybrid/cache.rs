//! Per-function memo of placed, partitioned and compiled functions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::spec::BackendResult;
use crate::graph::{Function, FunctionId};
use crate::partition::{BoundaryMap, Partition, Port, SubFunction};

/// Compiled form of one source function.
///
/// Built once, on first compile, and immutable afterwards.
#[derive(Debug)]
pub struct FunctionInstance {
    function: Function,
    sub_functions: Vec<SubFunction>,
    boundary_map: BoundaryMap,
    release_after: Vec<Vec<Port>>,
}

impl FunctionInstance {
    pub(crate) fn new(function: Function, partition: Partition) -> Self {
        let Partition {
            sub_functions,
            boundary_map,
        } = partition;
        let release_after = release_schedule(sub_functions.len(), &boundary_map);
        Self {
            function,
            sub_functions,
            boundary_map,
            release_after,
        }
    }

    /// The placed clone the partition was computed from.
    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn sub_functions(&self) -> &[SubFunction] {
        &self.sub_functions
    }

    pub fn boundary_map(&self) -> &BoundaryMap {
        &self.boundary_map
    }

    /// Boundary results that are no longer needed once sub-function `index` has run.
    pub fn release_after(&self, index: usize) -> &[Port] {
        self.release_after
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Each supplier port is released after its highest-numbered consumer.
fn release_schedule(count: usize, boundary_map: &BoundaryMap) -> Vec<Vec<Port>> {
    let mut last_use: HashMap<Port, usize> = HashMap::new();
    for (consumer, supplier) in boundary_map {
        let entry = last_use.entry(*supplier).or_insert(consumer.sub_function);
        *entry = (*entry).max(consumer.sub_function);
    }
    let mut schedule = vec![Vec::new(); count];
    for (supplier, last) in last_use {
        if let Some(slot) = schedule.get_mut(last) {
            slot.push(supplier);
        }
    }
    for ports in &mut schedule {
        ports.sort_unstable();
    }
    schedule
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Successful builds. Equals the number of partitions kept.
    pub builds: u64,
    pub entries: usize,
}

type CacheSlot = Arc<Mutex<Option<Arc<FunctionInstance>>>>;

/// Maps source function identity to its [`FunctionInstance`].
///
/// The map lock only guards slot lookup; building happens under the slot's own lock, so
/// concurrent compiles of one function build at most once while other functions proceed.
/// A failed build drops its slot and a later compile retries. The map lock may be taken
/// while a slot lock is held, never the other way round.
#[derive(Debug, Default)]
pub struct CompilationCache {
    entries: Mutex<HashMap<FunctionId, CacheSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
}

impl CompilationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: FunctionId) -> Option<Arc<FunctionInstance>> {
        let slot = self
            .entries
            .lock()
            .expect("compilation cache poisoned")
            .get(&id)
            .cloned()?;
        let guard = slot.lock().expect("compilation cache slot poisoned");
        guard.clone()
    }

    pub fn get_or_build<F>(&self, id: FunctionId, build: F) -> BackendResult<Arc<FunctionInstance>>
    where
        F: FnOnce() -> BackendResult<FunctionInstance>,
    {
        loop {
            let slot = {
                let mut guard = self.entries.lock().expect("compilation cache poisoned");
                guard
                    .entry(id)
                    .or_insert_with(|| Arc::new(Mutex::new(None)))
                    .clone()
            };

            let mut guard = slot.lock().expect("compilation cache slot poisoned");
            if let Some(existing) = guard.as_ref() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(existing));
            }
            // Dropped by a failed build while we waited.
            if !self.is_current(id, &slot) {
                continue;
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            return match build() {
                Ok(instance) => {
                    let instance = Arc::new(instance);
                    self.builds.fetch_add(1, Ordering::Relaxed);
                    *guard = Some(Arc::clone(&instance));
                    Ok(instance)
                }
                Err(err) => {
                    let mut entries = self.entries.lock().expect("compilation cache poisoned");
                    if entries.get(&id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                        entries.remove(&id);
                    }
                    Err(err)
                }
            };
        }
    }

    fn is_current(&self, id: FunctionId, slot: &CacheSlot) -> bool {
        self.entries
            .lock()
            .expect("compilation cache poisoned")
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Reads counters only, so it never waits on an in-flight build.
    pub fn stats(&self) -> CacheStats {
        let builds = self.builds.load(Ordering::Relaxed);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds,
            // Built instances are never evicted.
            entries: builds as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::backend::spec::{BackendError, DType, TensorSpec};
    use crate::graph::FunctionBuilder;
    use crate::partition::partition;
    use crate::placement::{assign_placement, FixedPlacement};

    fn echo_instance() -> FunctionInstance {
        let mut builder = FunctionBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(DType::F32, [2]));
        builder.add_result(x).unwrap();
        let mut function = builder.finish("echo").unwrap();
        assign_placement(&mut function, &FixedPlacement::new("cpu"));
        let partition = partition(&function).unwrap();
        FunctionInstance::new(function, partition)
    }

    #[test]
    fn failed_build_drops_its_slot() {
        let cache = CompilationCache::new();
        let id = FunctionId::next();
        let err = cache
            .get_or_build(id, || Err(BackendError::execution("boom")))
            .unwrap_err();
        assert!(matches!(err, BackendError::Execution { .. }));
        assert!(cache.entries.lock().unwrap().is_empty());
        assert!(cache.get(id).is_none());

        cache.get_or_build(id, || Ok(echo_instance())).unwrap();
        cache.get_or_build(id, || unreachable!()).unwrap();
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 2,
                builds: 1,
                entries: 1,
            }
        );
        assert_eq!(cache.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn stats_do_not_wait_for_an_in_flight_build() {
        let cache = CompilationCache::new();
        let id = FunctionId::next();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|scope| {
            let builder = scope.spawn(|| {
                cache.get_or_build(id, move || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(echo_instance())
                })
            });

            started_rx.recv().unwrap();
            let during = cache.stats();
            assert_eq!(during.misses, 1);
            assert_eq!(during.entries, 0);

            release_tx.send(()).unwrap();
            assert!(builder.join().unwrap().is_ok());
        });
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn release_happens_after_last_consumer() {
        let mut map = BoundaryMap::new();
        map.insert(Port::new(1, 0), Port::new(0, 1));
        map.insert(Port::new(3, 0), Port::new(0, 1));
        map.insert(Port::new(2, 0), Port::new(1, 0));
        let schedule = release_schedule(4, &map);
        assert_eq!(
            schedule,
            vec![vec![], vec![], vec![Port::new(1, 0)], vec![Port::new(0, 1)]]
        );
    }
}
