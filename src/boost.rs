// EMS BOOST
// PRIORITY REQUEST LISTS. A REQUESTER IS IDENTIFIED BY A KEY; UPDATING AN
// EXISTING KEY REPLACES ITS PRIORITY AND THE LIST ANSWERS WITH THE HIGHEST
// PRIORITY HELD BY ANY REQUESTER.
//
// GLOBAL BOOST: SYSTEM-WIDE, ALWAYS ON DURING THE BOOT WINDOW.
// KPP (KERNEL PREFER-PERF): ONE LIST PER CGROUP, ON WHEN ITS MAX IS POSITIVE.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use log::debug;

#[derive(Debug, Default)]
pub struct PriorityList {
    by_key: HashMap<u64, i32>,
    // PRIORITY -> NUMBER OF KEYS HOLDING IT
    prios: BTreeMap<i32, usize>,
}

impl PriorityList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, key: u64, prio: i32) {
        if let Some(old) = self.by_key.insert(key, prio) {
            self.drop_prio(old);
        }
        *self.prios.entry(prio).or_insert(0) += 1;
    }

    pub fn remove(&mut self, key: u64) -> bool {
        match self.by_key.remove(&key) {
            Some(old) => {
                self.drop_prio(old);
                true
            }
            None => false,
        }
    }

    fn drop_prio(&mut self, prio: i32) {
        if let Some(n) = self.prios.get_mut(&prio) {
            *n -= 1;
            if *n == 0 {
                self.prios.remove(&prio);
            }
        }
    }

    // 0 WHEN EMPTY
    pub fn max(&self) -> i32 {
        self.prios.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

fn lock(m: &Mutex<PriorityList>) -> MutexGuard<'_, PriorityList> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// --- GLOBAL BOOST ---

pub struct GlobalBoost {
    boot_until_ns: u64,
    list: Mutex<PriorityList>,
}

impl GlobalBoost {
    pub fn new(boot_until_ns: u64) -> Self {
        Self { boot_until_ns, list: Mutex::new(PriorityList::new()) }
    }

    pub fn request(&self, key: u64, prio: i32) {
        let mut l = lock(&self.list);
        l.update(key, prio);
        debug!("gb: key={} prio={} max={}", key, prio, l.max());
    }

    pub fn release(&self, key: u64) -> bool {
        lock(&self.list).remove(key)
    }

    pub fn max(&self) -> i32 {
        lock(&self.list).max()
    }

    pub fn active(&self, now: u64) -> bool {
        now < self.boot_until_ns || self.max() > 0
    }
}

// --- KERNEL PREFER-PERF ---

pub struct Kpp {
    lists: Vec<Mutex<PriorityList>>,
}

impl Kpp {
    pub fn new(nr_groups: usize) -> Self {
        Self { lists: (0..nr_groups.max(1)).map(|_| Mutex::new(PriorityList::new())).collect() }
    }

    // UNKNOWN CGROUPS ARE IGNORED
    pub fn request(&self, cgroup: usize, key: u64, prio: i32) {
        match self.lists.get(cgroup) {
            Some(l) => lock(l).update(key, prio),
            None => debug!("kpp: no cgroup {}", cgroup),
        }
    }

    pub fn release(&self, cgroup: usize, key: u64) -> bool {
        self.lists.get(cgroup).map(|l| lock(l).remove(key)).unwrap_or(false)
    }

    pub fn prefer_perf(&self, cgroup: usize) -> bool {
        self.lists.get(cgroup).map(|l| lock(l).max() > 0).unwrap_or(false)
    }

    // SNAPSHOT FOR ONE DECISION PASS
    pub fn active_groups(&self) -> Vec<bool> {
        self.lists.iter().map(|l| lock(l).max() > 0).collect()
    }
}
