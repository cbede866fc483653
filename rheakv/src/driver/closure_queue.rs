use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::types::KvClosure;

/// Index-keyed holding pen for closures attached to locally-proposed entries (§4.1
/// step 3). Entries applied on a node that isn't where the task originated simply
/// have no closure here; the driver treats that as the normal case, not an error.
#[derive(Default)]
pub struct ClosureQueue {
    inner: Mutex<BTreeMap<u64, Box<dyn KvClosure>>>,
}

impl ClosureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, index: u64, closure: Box<dyn KvClosure>) {
        self.inner
            .lock()
            .expect("closure queue poisoned")
            .insert(index, closure);
    }

    /// Remove and return every closure with index in `(after_exclusive, upto_inclusive]`,
    /// in ascending index order (§4.1 step 3).
    pub fn drain_through(
        &self,
        after_exclusive: u64,
        upto_inclusive: u64,
    ) -> Vec<(u64, Box<dyn KvClosure>)> {
        let mut inner = self.inner.lock().expect("closure queue poisoned");
        let keys: Vec<u64> = inner
            .range((Bound::Excluded(after_exclusive), Bound::Included(upto_inclusive)))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .map(|k| {
                let closure = inner.remove(&k).expect("closure present for drained key");
                (k, closure)
            })
            .collect()
    }

    /// Fails every still-pending closure with `status` (used when the state machine
    /// latches into an error and will never apply again).
    pub fn fail_all(&self, status: crate::errors::Status) {
        let mut inner = self.inner.lock().expect("closure queue poisoned");
        for (_, closure) in std::mem::take(&mut *inner) {
            closure.complete(crate::types::ClosureOutcome::failure(status.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("closure queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
