// EMS NOTIFIER CHAINS
// PRIORITY-ORDERED OBSERVER LISTS. HIGHER PRIORITY RUNS FIRST, EQUAL
// PRIORITIES RUN IN REGISTRATION ORDER. CALLBACKS RUN WITHOUT THE CHAIN LOCK
// HELD SO THEY MAY REGISTER, UNREGISTER OR RE-ENTER OTHER CHAINS.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Decision {
    // NOTHING TO SAY
    Done,
    Ok,
    // HANDLED, SKIP THE REST OF THE CHAIN
    Stop,
    // FAILED, SKIP THE REST OF THE CHAIN
    Bad,
}

impl Decision {
    fn stops(self) -> bool {
        matches!(self, Decision::Stop | Decision::Bad)
    }
}

pub type NotifierId = u64;

type Callback<E> = Arc<dyn Fn(&E) -> Decision + Send + Sync>;

struct Entry<E> {
    id: NotifierId,
    priority: i32,
    callback: Callback<E>,
}

pub struct NotifierChain<E> {
    entries: Mutex<Vec<Entry<E>>>,
    next_id: AtomicU64,
}

impl<E> NotifierChain<E> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub fn register<F>(&self, priority: i32, callback: F) -> NotifierId
    where
        F: Fn(&E) -> Decision + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pos = entries.iter().position(|e| e.priority < priority).unwrap_or(entries.len());
        entries.insert(pos, Entry { id, priority, callback: Arc::new(callback) });
        id
    }

    pub fn unregister(&self, id: NotifierId) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // RETURNS THE LAST DECISION, Done FOR AN EMPTY CHAIN
    pub fn call(&self, event: &E) -> Decision {
        let callbacks: Vec<Callback<E>> = match self.entries.lock() {
            Ok(e) => e.iter().map(|e| e.callback.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|e| e.callback.clone()).collect(),
        };

        let mut ret = Decision::Done;
        for cb in callbacks {
            ret = cb(event);
            if ret.stops() {
                break;
            }
        }
        ret
    }
}

impl<E> Default for NotifierChain<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_then_registration_order() {
        let chain: NotifierChain<u32> = NotifierChain::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (prio, tag) in [(0, "a"), (10, "b"), (0, "c"), (i32::MIN, "d"), (i32::MAX, "e")] {
            let seen = seen.clone();
            chain.register(prio, move |_| {
                seen.lock().unwrap().push(tag);
                Decision::Ok
            });
        }
        assert_eq!(chain.call(&0), Decision::Ok);
        assert_eq!(*seen.lock().unwrap(), vec!["e", "b", "a", "c", "d"]);
    }

    #[test]
    fn bad_stops_the_chain() {
        let chain: NotifierChain<u32> = NotifierChain::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        chain.register(1, |v| if *v == 7 { Decision::Bad } else { Decision::Ok });
        chain.register(0, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
            Decision::Ok
        });
        assert_eq!(chain.call(&7), Decision::Bad);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(chain.call(&1), Decision::Ok);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unregister_and_reentry() {
        let chain: Arc<NotifierChain<u32>> = Arc::new(NotifierChain::new());
        let inner = chain.clone();
        let id = chain.register(0, move |_| {
            // RE-ENTERING THE SAME CHAIN MUST NOT DEADLOCK
            inner.len();
            Decision::Ok
        });
        assert_eq!(chain.call(&0), Decision::Ok);
        assert!(chain.unregister(id));
        assert!(!chain.unregister(id));
        assert_eq!(chain.call(&0), Decision::Done);
    }
}
