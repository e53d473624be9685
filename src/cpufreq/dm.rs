// DVFS MANAGER
// CROSS-DOMAIN FREQUENCY CONSTRAINTS. A MASTER DOMAIN'S FREQUENCY IMPOSES A
// FLOOR (MIN) OR A CEILING (MAX) ON A SLAVE DOMAIN THROUGH A LOOKUP TABLE.
// A MANAGED DOMAIN SENDS EVERY TARGET REQUEST THROUGH policy_update, WHICH
// RECOMPUTES THE BOUNDS DOWN THE CONSTRAINT CHAIN AND LOOPS BACK INTO EACH
// DOMAIN'S SCALER. ONE GLOBAL LOCK SERIALIZES ALL OF IT.
//
// LOCK ORDER: MANAGER -> DOMAIN. SCALERS MUST NOT CALL BACK INTO THE MANAGER.

use std::collections::BTreeMap;
use std::sync::{Mutex, Weak};

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::table::Relation;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ConstraintKind {
    Min,
    Max,
}

// THE DRIVER SIDE OF A MANAGED DOMAIN
pub trait DmScaler: Send + Sync {
    fn dm_scale(&self, dm_type: usize, freq: u64, relation: Relation) -> Result<()>;
}

struct DmData {
    policy_min: u64,
    policy_max: u64,
    // LAST FREQUENCY THE DOMAIN ITSELF ASKED FOR
    gov_min: u64,
    // EFFECTIVE BOUNDS AFTER CONSTRAINTS
    min: u64,
    max: u64,
    target: u64,
    cur: u64,
    scaler: Option<Weak<dyn DmScaler>>,
}

struct Constraint {
    master: usize,
    slave: usize,
    kind: ConstraintKind,
    // (MASTER LEVEL, CONSTRAINT FREQ), MASTER LEVEL DESCENDING
    table: Vec<(u64, u64)>,
    // BOUND CURRENTLY IMPOSED ON THE SLAVE
    value: u64,
}

impl Constraint {
    fn evaluate(&mut self, master_freq: u64) {
        let row = match self.kind {
            // LOWEST MASTER LEVEL AT OR ABOVE master_freq
            ConstraintKind::Min => self.table.iter().rev().find(|&&(m, _)| master_freq <= m),
            // HIGHEST MASTER LEVEL AT OR BELOW master_freq
            ConstraintKind::Max => self.table.iter().find(|&&(m, _)| master_freq >= m),
        };
        if let Some(&(_, c)) = row {
            self.value = c;
        }
    }
}

// EXPAND SPARSE (MASTER FREQ, CONSTRAINT FREQ) ROWS, MASTER FREQ DESCENDING,
// INTO ONE ROW PER MASTER LEVEL. A LEVEL TAKES THE ROW WITH THE SMALLEST
// MASTER FREQ STILL AT OR ABOVE IT; LEVELS ABOVE EVERY ROW GET NO ENTRY.
pub fn build_constraint_table(levels: &[u64], rows: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut table = Vec::with_capacity(levels.len());
    for &freq in levels {
        let mut c = None;
        for &(master, constraint) in rows {
            if freq <= master {
                c = Some(constraint);
            }
            if freq >= master {
                break;
            }
        }
        if let Some(c) = c {
            table.push((freq, c));
        }
    }
    table.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    table
}

#[derive(Default)]
struct Inner {
    data: BTreeMap<usize, DmData>,
    constraints: Vec<Constraint>,
}

impl Inner {
    fn get_mut(&mut self, dm_type: usize) -> Result<&mut DmData> {
        self.data.get_mut(&dm_type).ok_or_else(|| anyhow!("dm type {} not registered", dm_type))
    }

    // POLICY BOUNDS TIGHTENED BY EVERY CONSTRAINT AIMED AT dm_type
    fn refresh_bounds(&mut self, dm_type: usize) {
        let mut floor = 0;
        let mut ceiling = u64::MAX;
        for c in self.constraints.iter().filter(|c| c.slave == dm_type) {
            match c.kind {
                ConstraintKind::Min => floor = floor.max(c.value),
                ConstraintKind::Max => ceiling = ceiling.min(c.value),
            }
        }
        if let Some(d) = self.data.get_mut(&dm_type) {
            d.min = d.policy_min.max(floor).max(d.gov_min);
            d.max = d.policy_max.min(ceiling);
        }
    }

    // RE-EVALUATE EVERY CONSTRAINT MASTERED BY `master`, THEN WALK DOWN
    fn propagate(&mut self, master: usize, order: &mut Vec<usize>) {
        let (min, max) = match self.data.get(&master) {
            Some(d) => (d.min, d.max),
            None => return,
        };

        let mut slaves = Vec::new();
        for c in self.constraints.iter_mut().filter(|c| c.master == master) {
            c.evaluate(match c.kind {
                ConstraintKind::Min => min,
                ConstraintKind::Max => max,
            });
            if !slaves.contains(&c.slave) {
                slaves.push(c.slave);
            }
        }

        for slave in slaves {
            self.refresh_bounds(slave);
            if let Some(d) = self.data.get_mut(&slave) {
                d.target = d.min.min(d.max);
            }
            if !order.contains(&slave) {
                order.push(slave);
            }
            self.propagate(slave, order);
        }
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        if from == to {
            return true;
        }
        self.constraints.iter()
            .filter(|c| c.master == from)
            .any(|c| self.reaches(c.slave, to))
    }
}

pub struct DvfsManager {
    inner: Mutex<Inner>,
}

impl DvfsManager {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("dvfs manager lock poisoned"))
    }

    pub fn register(&self, dm_type: usize, min: u64, max: u64, cur: u64) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.data.contains_key(&dm_type) {
            bail!("dm type {} already registered", dm_type);
        }
        inner.data.insert(dm_type, DmData {
            policy_min: min,
            policy_max: max,
            gov_min: min,
            min,
            max,
            target: cur,
            cur,
            scaler: None,
        });
        debug!("dm: type {} registered [{}, {}] cur {}", dm_type, min, max, cur);
        Ok(())
    }

    // master_levels: THE MASTER DOMAIN'S VALID FREQUENCIES, DESCENDING
    pub fn add_constraint(&self, master: usize, slave: usize, kind: ConstraintKind,
                          master_levels: &[u64], rows: &[(u64, u64)]) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.data.contains_key(&master) || !inner.data.contains_key(&slave) {
            bail!("dm constraint {} -> {}: unregistered dm type", master, slave);
        }
        if inner.reaches(slave, master) {
            bail!("dm constraint {} -> {} closes a cycle", master, slave);
        }
        let table = build_constraint_table(master_levels, rows);
        if table.is_empty() {
            bail!("dm constraint {} -> {}: no master level covered", master, slave);
        }

        let value = match kind {
            ConstraintKind::Min => 0,
            ConstraintKind::Max => u64::MAX,
        };
        inner.constraints.push(Constraint { master, slave, kind, table, value });
        debug!("dm: {:?} constraint {} -> {}", kind, master, slave);
        Ok(())
    }

    pub fn register_scaler(&self, dm_type: usize, scaler: Weak<dyn DmScaler>) -> Result<()> {
        let mut inner = self.lock()?;
        let d = inner.get_mut(dm_type)?;
        if d.scaler.is_none() {
            d.scaler = Some(scaler);
        }
        Ok(())
    }

    // EFFECTIVE (MIN, MAX) OF A MANAGED DOMAIN
    pub fn bounds(&self, dm_type: usize) -> Option<(u64, u64)> {
        let inner = self.inner.lock().ok()?;
        inner.data.get(&dm_type).map(|d| (d.min, d.max))
    }

    pub fn cur_freq(&self, dm_type: usize) -> Option<u64> {
        let inner = self.inner.lock().ok()?;
        inner.data.get(&dm_type).map(|d| d.cur)
    }

    // NEW POLICY BOUNDS AND TARGET FOR dm_type. SLAVES ARE SCALED BEFORE
    // THE MASTER ON THE WAY UP AND AFTER IT ON THE WAY DOWN. RETURNS THE
    // FREQUENCY HANDED TO THE MASTER'S SCALER.
    pub fn policy_update(&self, dm_type: usize, min: u64, max: u64, target: u64) -> Result<u64> {
        let mut inner = self.lock()?;

        let (cur, old_min) = {
            let d = inner.get_mut(dm_type)?;
            d.policy_min = min.min(max);
            d.policy_max = max;
            d.gov_min = target.min(max);
            (d.cur, d.min)
        };
        inner.refresh_bounds(dm_type);

        let (freq, new_min, relation) = {
            let d = inner.get_mut(dm_type)?;
            let mut relation = Relation::L;
            let mut freq = target.max(d.min);
            if freq >= d.max {
                freq = d.max;
                relation = Relation::H;
            }
            d.target = freq;
            (freq, d.min, relation)
        };

        let mut order = vec![dm_type];
        inner.propagate(dm_type, &mut order);

        let up = freq > cur || (freq == cur && new_min > old_min);
        if up {
            order.reverse();
        }

        let mut ret = Ok(freq);
        for t in order {
            let (target, scaler) = match inner.data.get(&t) {
                Some(d) => (d.target, d.scaler.as_ref().and_then(|s| s.upgrade())),
                None => continue,
            };
            let scaler = match scaler {
                Some(s) => s,
                None => continue,
            };
            match scaler.dm_scale(t, target, relation) {
                Ok(()) => {
                    if let Some(d) = inner.data.get_mut(&t) {
                        d.cur = target;
                    }
                }
                Err(e) => {
                    warn!("dm: type {} failed to scale to {}: {:#}", t, target, e);
                    if t == dm_type {
                        ret = Err(e);
                    }
                }
            }
        }
        ret
    }
}

impl Default for DvfsManager {
    fn default() -> Self {
        Self::new()
    }
}
