//! Per-bottle arbitration between mutating operations and launches.
//!
//! A bottle is idle, being mutated by exactly one operation, or running `n` launched programs.
//! Mutations need the bottle idle. Launches only need it not to be mutating. Nothing waits:
//! a request that cannot be granted is refused on the spot.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use log::trace;
use parking_lot::Mutex;
use crate::bottle::BottleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Mutating,
    Launching(NonZeroUsize),
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// Another mutating operation holds the bottle.
    Mutating,
    /// This many launched programs are still running.
    Launching(usize),
}

#[derive(Debug, Default, Clone)]
pub struct OperationCoordinator {
    bottles: Arc<Mutex<HashMap<BottleId, Activity>>>,
}

impl OperationCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive hold of `id` for a create, delete or configure.
    pub fn begin_mutation(&self, id: BottleId) -> Result<MutationGuard, Contention> {
        let mut bottles = self.bottles.lock();
        match bottles.get(&id) {
            Some(Activity::Mutating) => Err(Contention::Mutating),
            Some(Activity::Launching(n)) => Err(Contention::Launching(n.get())),
            None => {
                bottles.insert(id, Activity::Mutating);
                trace!("{id}: mutating");
                Ok(MutationGuard { bottles: Arc::clone(&self.bottles), id })
            }
        }
    }

    /// Register one more running program in `id`.
    pub fn begin_launch(&self, id: BottleId) -> Result<LaunchPermit, Contention> {
        let mut bottles = self.bottles.lock();
        let next = match bottles.get(&id) {
            Some(Activity::Mutating) => return Err(Contention::Mutating),
            Some(Activity::Launching(n)) => n.saturating_add(1),
            None => NonZeroUsize::MIN,
        };

        bottles.insert(id, Activity::Launching(next));
        trace!("{id}: {next} launch(es)");
        Ok(LaunchPermit { bottles: Arc::clone(&self.bottles), id })
    }

    /// Number of programs currently running in `id`.
    #[must_use]
    pub fn active_launches(&self, id: BottleId) -> usize {
        match self.bottles.lock().get(&id) {
            Some(Activity::Launching(n)) => n.get(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self, id: BottleId) -> bool {
        !self.bottles.lock().contains_key(&id)
    }
}

/// Exclusive hold on a bottle. Released on drop.
#[derive(Debug)]
#[must_use]
pub struct MutationGuard {
    bottles: Arc<Mutex<HashMap<BottleId, Activity>>>,
    id: BottleId,
}

impl MutationGuard {
    #[must_use]
    pub fn id(&self) -> BottleId {
        self.id
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        self.bottles.lock().remove(&self.id);
        trace!("{}: idle", self.id);
    }
}

/// Shared hold on a bottle for one running program. Released on drop.
#[derive(Debug)]
#[must_use]
pub struct LaunchPermit {
    bottles: Arc<Mutex<HashMap<BottleId, Activity>>>,
    id: BottleId,
}

impl Drop for LaunchPermit {
    fn drop(&mut self) {
        let mut bottles = self.bottles.lock();
        if let Some(Activity::Launching(n)) = bottles.get(&self.id).copied() {
            match NonZeroUsize::new(n.get() - 1) {
                Some(rest) => {
                    bottles.insert(self.id, Activity::Launching(rest));
                }
                None => {
                    bottles.remove(&self.id);
                    trace!("{}: idle", self.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mutations_are_exclusive() {
        let coordinator = OperationCoordinator::new();
        let id = BottleId::new();

        let guard = coordinator.begin_mutation(id).unwrap();
        assert_eq!(coordinator.begin_mutation(id).unwrap_err(), Contention::Mutating);
        assert_eq!(coordinator.begin_launch(id).unwrap_err(), Contention::Mutating);

        drop(guard);
        assert!(coordinator.is_idle(id));
        assert!(coordinator.begin_mutation(id).is_ok());
    }

    #[test]
    fn launches_share_and_block_mutations() {
        let coordinator = OperationCoordinator::new();
        let id = BottleId::new();

        let first = coordinator.begin_launch(id).unwrap();
        let second = coordinator.begin_launch(id).unwrap();
        assert_eq!(coordinator.active_launches(id), 2);
        assert_eq!(coordinator.begin_mutation(id).unwrap_err(), Contention::Launching(2));

        drop(first);
        assert_eq!(coordinator.begin_mutation(id).unwrap_err(), Contention::Launching(1));
        drop(second);
        assert!(coordinator.is_idle(id));
        assert!(coordinator.begin_mutation(id).is_ok());
    }

    #[test]
    fn bottles_are_independent() {
        let coordinator = OperationCoordinator::new();
        let (a, b) = (BottleId::new(), BottleId::new());

        let _launch = coordinator.begin_launch(a).unwrap();
        let _mutation = coordinator.begin_mutation(b).unwrap();
        assert_eq!(coordinator.active_launches(a), 1);
        assert_eq!(coordinator.active_launches(b), 0);
    }

    #[test]
    fn concurrent_launch_permits_balance_out() {
        let coordinator = OperationCoordinator::new();
        let id = BottleId::new();

        let handles = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _permit = coordinator.begin_launch(id).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(coordinator.is_idle(id));
    }
}
