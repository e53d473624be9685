// EMS TOPOLOGY
// CPU MASKS, COREGROUPS, CPULIST PARSING.
// A COREGROUP IS THE SET OF CPUS SHARING ONE FREQUENCY DOMAIN.

use std::fmt;

use anyhow::{bail, Result};
use regex::Regex;

pub const MAX_CPUS: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    // FIRST `n` CPUS
    pub fn first_n(n: usize) -> Self {
        if n >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    pub fn single(cpu: usize) -> Self {
        let mut m = Self::empty();
        m.set(cpu);
        m
    }

    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        let mut m = Self::empty();
        for cpu in cpus {
            m.set(cpu);
        }
        m
    }

    // PARSE A KERNEL-STYLE CPULIST: "0-3,6,8-9"
    pub fn parse(list: &str) -> Result<Self> {
        let re = Regex::new(r"^\s*(\d+)(?:\s*-\s*(\d+))?\s*$")?;
        let mut mask = Self::empty();
        let list = list.trim();
        if list.is_empty() {
            return Ok(mask);
        }
        for part in list.split(',') {
            let caps = match re.captures(part) {
                Some(c) => c,
                None => bail!("invalid cpulist element {:?} in {:?}", part, list),
            };
            let lo: usize = caps[1].parse()?;
            let hi: usize = match caps.get(2) {
                Some(m) => m.as_str().parse()?,
                None => lo,
            };
            if lo > hi {
                bail!("descending cpu range {}-{} in {:?}", lo, hi, list);
            }
            if hi >= MAX_CPUS {
                bail!("cpu {} exceeds the {} cpu limit", hi, MAX_CPUS);
            }
            for cpu in lo..=hi {
                mask.set(cpu);
            }
        }
        Ok(mask)
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 |= 1u64 << cpu;
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 &= !(1u64 << cpu);
        }
    }

    pub fn test(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn weight(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn and(&self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    pub fn or(&self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 | other.0)
    }

    pub fn andnot(&self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & !other.0)
    }

    pub fn intersects(&self, other: CpuMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(&self) -> CpuIter {
        CpuIter(self.0)
    }
}

pub struct CpuIter(u64);

impl Iterator for CpuIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(cpu)
    }
}

// PRINT BACK AS A CPULIST
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.iter().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek() == Some(&(hi + 1)) {
                hi += 1;
                iter.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if lo == hi {
                write!(f, "{}", lo)?;
            } else {
                write!(f, "{}-{}", lo, hi)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({})", self)
    }
}

#[derive(Clone, Debug)]
pub struct Topology {
    nr_cpus: usize,
    coregroups: Vec<CpuMask>,
    cpu_to_group: Vec<usize>,
}

impl Topology {
    // COREGROUPS MUST BE DISJOINT AND COVER 0..nr_cpus
    pub fn new(nr_cpus: usize, mut coregroups: Vec<CpuMask>) -> Result<Self> {
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            bail!("nr_cpus {} out of range 1..={}", nr_cpus, MAX_CPUS);
        }
        coregroups.retain(|m| !m.is_empty());
        coregroups.sort_by_key(|m| m.first());

        let mut cpu_to_group = vec![usize::MAX; nr_cpus];
        for (idx, mask) in coregroups.iter().enumerate() {
            for cpu in mask.iter() {
                if cpu >= nr_cpus {
                    bail!("coregroup {} names cpu {} beyond nr_cpus {}", mask, cpu, nr_cpus);
                }
                if cpu_to_group[cpu] != usize::MAX {
                    bail!("cpu {} belongs to more than one coregroup", cpu);
                }
                cpu_to_group[cpu] = idx;
            }
        }
        if let Some(cpu) = cpu_to_group.iter().position(|&g| g == usize::MAX) {
            bail!("cpu {} is not covered by any coregroup", cpu);
        }

        Ok(Self { nr_cpus, coregroups, cpu_to_group })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn all_cpus(&self) -> CpuMask {
        CpuMask::first_n(self.nr_cpus)
    }

    pub fn nr_coregroups(&self) -> usize {
        self.coregroups.len()
    }

    pub fn coregroups(&self) -> &[CpuMask] {
        &self.coregroups
    }

    pub fn coregroup(&self, idx: usize) -> CpuMask {
        self.coregroups.get(idx).copied().unwrap_or_default()
    }

    pub fn group_of(&self, cpu: usize) -> usize {
        self.cpu_to_group.get(cpu).copied().unwrap_or(0)
    }

    pub fn coregroup_of(&self, cpu: usize) -> CpuMask {
        self.coregroup(self.group_of(cpu))
    }

    pub fn is_first_of_group(&self, cpu: usize) -> bool {
        self.coregroup_of(cpu).first() == Some(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cpulist() {
        let m = CpuMask::parse("0-3,6, 8-9").unwrap();
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 6, 8, 9]);
        assert_eq!(m.to_string(), "0-3,6,8-9");
        assert!(CpuMask::parse("").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CpuMask::parse("0-").is_err());
        assert!(CpuMask::parse("3-1").is_err());
        assert!(CpuMask::parse("a").is_err());
        assert!(CpuMask::parse("64").is_err());
    }

    #[test]
    fn mask_ops() {
        let a = CpuMask::parse("0-3").unwrap();
        let b = CpuMask::parse("2-5").unwrap();
        assert_eq!(a.and(b).to_string(), "2-3");
        assert_eq!(a.or(b).to_string(), "0-5");
        assert_eq!(a.andnot(b).to_string(), "0-1");
        assert_eq!(b.first(), Some(2));
        assert_eq!(b.weight(), 4);
    }

    #[test]
    fn topology_groups() {
        let topo = Topology::new(
            8,
            vec![CpuMask::parse("4-7").unwrap(), CpuMask::parse("0-3").unwrap()],
        )
        .unwrap();
        // SORTED BY FIRST CPU
        assert_eq!(topo.coregroup(0).to_string(), "0-3");
        assert_eq!(topo.group_of(5), 1);
        assert!(topo.is_first_of_group(4));
        assert!(!topo.is_first_of_group(5));
    }

    #[test]
    fn topology_rejects_overlap_and_holes() {
        assert!(Topology::new(4, vec![CpuMask::parse("0-2").unwrap(), CpuMask::parse("2-3").unwrap()]).is_err());
        assert!(Topology::new(4, vec![CpuMask::parse("0-2").unwrap()]).is_err());
    }
}
