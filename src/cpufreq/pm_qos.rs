// PM QOS
// PER-CLASS REQUEST SETS. A MIN CLASS RESOLVES TO ITS LARGEST REQUEST, A MAX
// CLASS TO ITS SMALLEST; AN EMPTY CLASS RESOLVES TO ITS DEFAULT. OBSERVERS
// OF A CLASS ARE CALLED, AFTER THE CLASS LOCK IS DROPPED, WHENEVER THE
// RESOLVED VALUE CHANGES.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, bail, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::notifier::{Decision, NotifierChain, NotifierId};

pub const PM_QOS_DEFAULT_MIN: u64 = 0;
pub const PM_QOS_DEFAULT_MAX: u64 = i32::MAX as u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum QosKind {
    Min,
    Max,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QosEvent {
    pub class: usize,
    pub value: u64,
}

// HANDLE TO ONE ACTIVE REQUEST
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct QosRequest {
    pub class: usize,
    id: u64,
}

struct Requests {
    by_id: HashMap<u64, u64>,
    // VALUE -> NUMBER OF REQUESTS AT IT
    values: BTreeMap<u64, usize>,
    target: u64,
}

impl Requests {
    fn insert(&mut self, id: u64, value: u64) {
        if let Some(old) = self.by_id.insert(id, value) {
            self.drop_value(old);
        }
        *self.values.entry(value).or_insert(0) += 1;
    }

    fn remove(&mut self, id: u64) -> bool {
        match self.by_id.remove(&id) {
            Some(old) => {
                self.drop_value(old);
                true
            }
            None => false,
        }
    }

    fn drop_value(&mut self, value: u64) {
        if let Some(n) = self.values.get_mut(&value) {
            *n -= 1;
            if *n == 0 {
                self.values.remove(&value);
            }
        }
    }
}

struct QosClass {
    kind: QosKind,
    default_value: u64,
    requests: Mutex<Requests>,
    notifiers: NotifierChain<QosEvent>,
}

impl QosClass {
    fn aggregate(&self, reqs: &Requests) -> u64 {
        let v = match self.kind {
            QosKind::Min => reqs.values.keys().next_back(),
            QosKind::Max => reqs.values.keys().next(),
        };
        v.copied().unwrap_or(self.default_value)
    }
}

pub struct PmQos {
    classes: RwLock<HashMap<usize, Arc<QosClass>>>,
    next_id: AtomicU64,
}

impl PmQos {
    pub fn new() -> Self {
        Self { classes: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    // IDEMPOTENT FOR AN EXISTING CLASS OF THE SAME KIND
    pub fn add_class(&self, class: usize, kind: QosKind) -> Result<()> {
        let mut classes = self.classes.write().map_err(|_| anyhow!("pm_qos lock poisoned"))?;
        if let Some(c) = classes.get(&class) {
            if c.kind != kind {
                bail!("pm_qos class {} already registered as {:?}", class, c.kind);
            }
            return Ok(());
        }
        let default_value = match kind {
            QosKind::Min => PM_QOS_DEFAULT_MIN,
            QosKind::Max => PM_QOS_DEFAULT_MAX,
        };
        classes.insert(class, Arc::new(QosClass {
            kind,
            default_value,
            requests: Mutex::new(Requests {
                by_id: HashMap::new(),
                values: BTreeMap::new(),
                target: default_value,
            }),
            notifiers: NotifierChain::new(),
        }));
        Ok(())
    }

    fn class(&self, class: usize) -> Result<Arc<QosClass>> {
        let classes = self.classes.read().map_err(|_| anyhow!("pm_qos lock poisoned"))?;
        classes.get(&class).cloned().ok_or_else(|| anyhow!("no pm_qos class {}", class))
    }

    pub fn value(&self, class: usize) -> Option<u64> {
        let c = self.class(class).ok()?;
        let target = c.requests.lock().ok()?.target;
        Some(target)
    }

    pub fn add_notifier<F>(&self, class: usize, priority: i32, callback: F) -> Result<NotifierId>
    where
        F: Fn(&QosEvent) -> Decision + Send + Sync + 'static,
    {
        Ok(self.class(class)?.notifiers.register(priority, callback))
    }

    pub fn remove_notifier(&self, class: usize, id: NotifierId) -> bool {
        self.class(class).map(|c| c.notifiers.unregister(id)).unwrap_or(false)
    }

    pub fn add_request(&self, class: usize, value: u64) -> Result<QosRequest> {
        let req = QosRequest { class, id: self.next_id.fetch_add(1, Ordering::Relaxed) };
        self.apply(class, |r| r.insert(req.id, value))?;
        Ok(req)
    }

    pub fn update_request(&self, req: &QosRequest, value: u64) -> Result<()> {
        self.apply(req.class, |r| r.insert(req.id, value))
    }

    pub fn remove_request(&self, req: QosRequest) -> Result<()> {
        let mut found = false;
        self.apply(req.class, |r| found = r.remove(req.id))?;
        if !found {
            bail!("pm_qos request {} not active in class {}", req.id, req.class);
        }
        Ok(())
    }

    // MUTATE, RE-AGGREGATE, THEN NOTIFY WITHOUT ANY PM QOS LOCK HELD
    fn apply(&self, class: usize, f: impl FnOnce(&mut Requests)) -> Result<()> {
        let c = self.class(class)?;
        let changed = {
            let mut reqs = c.requests.lock().map_err(|_| anyhow!("pm_qos lock poisoned"))?;
            f(&mut reqs);
            let target = c.aggregate(&reqs);
            if target == reqs.target {
                None
            } else {
                reqs.target = target;
                Some(target)
            }
        };

        if let Some(value) = changed {
            debug!("pm_qos class {} -> {}", class, value);
            c.notifiers.call(&QosEvent { class, value });
        }
        Ok(())
    }
}

impl Default for PmQos {
    fn default() -> Self {
        Self::new()
    }
}
