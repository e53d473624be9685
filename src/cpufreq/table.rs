// FREQUENCY TABLE
// VALID LEVELS OF ONE DOMAIN, KHZ. LEVELS OUTSIDE [min, max] AT INIT ARE
// INVALID AND NEVER CHOSEN.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Relation {
    // LOWEST LEVEL AT OR ABOVE TARGET
    L,
    // HIGHEST LEVEL AT OR BELOW TARGET
    H,
}

#[derive(Clone, Debug, Default)]
pub struct FreqTable {
    // DESCENDING
    freqs: Vec<u64>,
}

impl FreqTable {
    pub fn new(levels: &[u64], min: u64, max: u64) -> Self {
        let mut freqs: Vec<u64> = levels.iter().copied()
            .filter(|&f| f >= min && f <= max)
            .collect();
        freqs.sort_unstable_by(|a, b| b.cmp(a));
        freqs.dedup();
        Self { freqs }
    }

    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.freqs.len()
    }

    pub fn max(&self) -> Option<u64> {
        self.freqs.first().copied()
    }

    pub fn min(&self) -> Option<u64> {
        self.freqs.last().copied()
    }

    pub fn contains(&self, freq: u64) -> bool {
        self.freqs.contains(&freq)
    }

    // DESCENDING
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.freqs.iter().copied()
    }

    // CLAMP TO [lo, hi] THEN PICK A LEVEL PER `relation`. WHEN NO LEVEL
    // SATISFIES THE RELATION INSIDE THE BOUNDS, THE NEAREST ONE INSIDE THEM
    // WINS. NONE ONLY WHEN NO LEVEL LIES IN [lo, hi].
    pub fn resolve(&self, target: u64, relation: Relation, lo: u64, hi: u64) -> Option<u64> {
        let target = target.max(lo).min(hi);
        let inside = self.freqs.iter().copied().filter(|&f| f >= lo && f <= hi);
        match relation {
            Relation::L => {
                let mut best_above = None;
                let mut best_below = None;
                for f in inside {
                    if f >= target {
                        best_above = Some(f);
                    } else if best_below.is_none() {
                        best_below = Some(f);
                    }
                }
                best_above.or(best_below)
            }
            Relation::H => {
                let mut best_below = None;
                let mut best_above = None;
                for f in inside {
                    if f <= target {
                        if best_below.is_none() {
                            best_below = Some(f);
                        }
                    } else {
                        best_above = Some(f);
                    }
                }
                best_below.or(best_above)
            }
        }
    }
}
