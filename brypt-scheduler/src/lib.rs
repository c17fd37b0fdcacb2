//! Cooperative, single-threaded execution of delegates.
//!
//! A [`Registrar`] owns an ordered list of [`Delegate`]s. Each cycle,
//! `run_once` walks the list in topological order and invokes every delegate
//! whose host reports readiness, provided its declared dependencies have
//! already executed this cycle. There is no real-time notion of "topological
//! order" beyond registration order plus a dependency check — delegates with
//! no dependency on each other simply run in the order they were registered.

use std::any::TypeId;
use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// The host behind a scheduled [`Delegate`]: something that can report whether it
/// currently has work, and execute a bounded slice of it.
pub trait DelegateHost: Send + Sync {
    /// Owner-type tag used by dependents to order against this delegate.
    fn owner(&self) -> TypeId;

    /// True iff calling `execute` would do useful work this cycle.
    fn ready(&self) -> bool;

    /// Runs one bounded unit of work and reports how many tasks it completed.
    fn execute(&self) -> usize;
}

struct Delegate {
    host: Box<dyn DelegateHost>,
    depends_on: HashSet<TypeId>,
}

/// Owns the ordered delegate list and drives cooperative execution cycles.
pub struct Registrar {
    delegates: Mutex<Vec<Delegate>>,
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}

impl Registrar {
    pub fn new() -> Self {
        Self {
            delegates: Mutex::new(Vec::new()),
        }
    }

    /// Registers a delegate with no declared dependencies. Returns a builder so the
    /// caller can chain `.depends_on::<T>()` before the delegate takes effect.
    pub fn register(&self, host: Box<dyn DelegateHost>) -> DependencyBuilder<'_> {
        DependencyBuilder {
            registrar: self,
            host: Some(host),
            depends_on: HashSet::new(),
        }
    }

    fn finish_register(&self, host: Box<dyn DelegateHost>, depends_on: HashSet<TypeId>) {
        self.delegates.lock().push(Delegate { host, depends_on });
    }

    /// Removes every delegate with the given owner tag (`Scheduler::Delegate::Delist`).
    pub fn delist(&self, owner: TypeId) {
        self.delegates.lock().retain(|delegate| delegate.host.owner() != owner);
    }

    /// Walks delegates in registration order, skipping any whose dependencies have not
    /// yet run this cycle. Returns the total task count completed this cycle.
    pub fn run_once(&self) -> usize {
        let delegates = self.delegates.lock();
        let mut completed_owners = HashSet::new();
        let mut total = 0;

        for delegate in delegates.iter() {
            let deps_satisfied = delegate
                .depends_on
                .iter()
                .all(|dependency| completed_owners.contains(dependency) || !Self::has_owner(&delegates, *dependency));

            if !deps_satisfied {
                debug!("delegate skipped this cycle: unmet dependency");
                continue;
            }

            if delegate.host.ready() {
                let count = delegate.host.execute();
                total += count;
            }
            completed_owners.insert(delegate.host.owner());
        }

        total
    }

    fn has_owner(delegates: &[Delegate], owner: TypeId) -> bool {
        delegates.iter().any(|delegate| delegate.host.owner() == owner)
    }

    /// Repeats `run_once` until a cycle reports zero completed tasks.
    pub fn run(&self) -> usize {
        let mut total = 0;
        loop {
            let completed = self.run_once();
            if completed == 0 {
                break;
            }
            total += completed;
        }
        total
    }

    pub fn len(&self) -> usize {
        self.delegates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct DependencyBuilder<'a> {
    registrar: &'a Registrar,
    host: Option<Box<dyn DelegateHost>>,
    depends_on: HashSet<TypeId>,
}

impl<'a> DependencyBuilder<'a> {
    pub fn depends_on(mut self, owner: TypeId) -> Self {
        if !self.depends_on.insert(owner) {
            warn!("duplicate dependency registered for delegate");
        }
        self
    }

    /// Finalizes registration. Dropping the builder without calling this is a no-op.
    pub fn finish(mut self) {
        let host = self.host.take().expect("finish called at most once");
        self.registrar.finish_register(host, std::mem::take(&mut self.depends_on));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        remaining: AtomicUsize,
        marker: TypeId,
    }

    impl DelegateHost for Arc<Counter> {
        fn owner(&self) -> TypeId {
            self.marker
        }

        fn ready(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) > 0
        }

        fn execute(&self) -> usize {
            let remaining = self.remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                return 0;
            }
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            1
        }
    }

    struct MarkerA;
    struct MarkerB;

    #[test]
    fn run_once_invokes_only_ready_delegates() {
        let registrar = Registrar::new();
        let counter = Arc::new(Counter {
            remaining: AtomicUsize::new(2),
            marker: TypeId::of::<MarkerA>(),
        });
        registrar.register(Box::new(counter.clone())).finish();

        assert_eq!(registrar.run_once(), 1);
        assert_eq!(registrar.run_once(), 1);
        assert_eq!(registrar.run_once(), 0);
    }

    #[test]
    fn run_drains_until_no_delegate_reports_work() {
        let registrar = Registrar::new();
        let counter = Arc::new(Counter {
            remaining: AtomicUsize::new(5),
            marker: TypeId::of::<MarkerA>(),
        });
        registrar.register(Box::new(counter.clone())).finish();
        assert_eq!(registrar.run(), 5);
        assert_eq!(registrar.run(), 0);
    }

    #[test]
    fn delegate_with_unmet_dependency_is_skipped() {
        let registrar = Registrar::new();
        let dependent = Arc::new(Counter {
            remaining: AtomicUsize::new(1),
            marker: TypeId::of::<MarkerA>(),
        });
        registrar
            .register(Box::new(dependent.clone()))
            .depends_on(TypeId::of::<MarkerB>())
            .finish();

        // MarkerB has no registered delegate at all, so the dependency is vacuously
        // satisfied and the delegate still runs.
        assert_eq!(registrar.run_once(), 1);
    }

    #[test]
    fn delist_removes_all_delegates_for_an_owner() {
        let registrar = Registrar::new();
        let counter = Arc::new(Counter {
            remaining: AtomicUsize::new(3),
            marker: TypeId::of::<MarkerA>(),
        });
        registrar.register(Box::new(counter.clone())).finish();
        assert_eq!(registrar.len(), 1);
        registrar.delist(TypeId::of::<MarkerA>());
        assert!(registrar.is_empty());
    }
}
