//! Fixed-capacity CPU sets and the two kernel text encodings of them.
//!
//! The kernel exports CPU sets either as a *cpumap* (`ffff,ffffffff`: 32-bit
//! hex groups, most significant group first) or as a *cpulist* (`0-47`).
//! NUMA node directories carry both; the enumerator reads the cpumap.

use std::fmt::{self, Write as _};

use crate::error::{Result, TopologyError};

/// Highest number of CPUs a mask can describe.
pub const NR_CPUS: usize = 4096;

const GROUP_BITS: usize = 32;
const GROUPS: usize = NR_CPUS / GROUP_BITS;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask {
    // groups[0] holds cpus 0..32
    groups: [u32; GROUPS],
}

impl CpuMask {
    pub const EMPTY: CpuMask = CpuMask { groups: [0; GROUPS] };
    pub const ALL: CpuMask = CpuMask { groups: [u32::MAX; GROUPS] };

    /// Parse a kernel cpumap such as `0000ff00` or `ffff,ffffffff`.
    ///
    /// Surrounding whitespace is ignored and an empty string is the empty
    /// set. Groups that would land beyond [`NR_CPUS`] must be zero.
    pub fn parse_cpumap(text: &str) -> Result<CpuMask> {
        let text = text.trim();
        let mut mask = CpuMask::EMPTY;
        if text.is_empty() {
            return Ok(mask);
        }
        let invalid = || TopologyError::InvalidCpumap(text.to_string());
        for (idx, chunk) in text.rsplit(',').enumerate() {
            if chunk.is_empty() || !chunk.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            let value = u32::from_str_radix(chunk, 16).map_err(|_| invalid())?;
            match mask.groups.get_mut(idx) {
                Some(group) => *group = value,
                None if value == 0 => {}
                None => return Err(TopologyError::CpumapOverflow),
            }
        }
        Ok(mask)
    }

    /// Like [`CpuMask::parse_cpumap`], but any malformed input is the empty set.
    pub fn from_cpumap_lossy(text: &str) -> CpuMask {
        Self::parse_cpumap(text).unwrap_or(CpuMask::EMPTY)
    }

    /// Render in cpumap form with leading zero groups dropped.
    pub fn to_cpumap(&self) -> String {
        self.to_string()
    }

    /// Parse a kernel cpulist such as `0-3,8,10-11`. Unparsable parts are skipped.
    pub fn parse_cpulist(text: &str) -> CpuMask {
        let mut mask = CpuMask::EMPTY;
        for part in text.trim().split(',') {
            if let Some((a, b)) = part.split_once('-') {
                if let (Ok(a), Ok(b)) = (a.trim().parse::<usize>(), b.trim().parse::<usize>()) {
                    for cpu in a.min(b)..=a.max(b).min(NR_CPUS - 1) {
                        mask.set(cpu);
                    }
                }
            } else if let Ok(cpu) = part.trim().parse::<usize>() {
                mask.set(cpu);
            }
        }
        mask
    }

    /// Render as a cpulist, collapsing consecutive cpus into ranges.
    pub fn to_cpulist(&self) -> String {
        let mut out = String::new();
        let mut run: Option<(usize, usize)> = None;
        for cpu in self.iter() {
            run = match run {
                Some((first, last)) if cpu == last + 1 => Some((first, cpu)),
                Some(done) => {
                    push_range(&mut out, done);
                    Some((cpu, cpu))
                }
                None => Some((cpu, cpu)),
            };
        }
        if let Some(done) = run {
            push_range(&mut out, done);
        }
        out
    }

    /// Add `cpu` to the set. Cpus at or above [`NR_CPUS`] are ignored.
    pub fn set(&mut self, cpu: usize) {
        if let Some(group) = self.groups.get_mut(cpu / GROUP_BITS) {
            *group |= 1u32 << (cpu % GROUP_BITS);
        }
    }

    #[must_use]
    pub fn contains(&self, cpu: usize) -> bool {
        self.groups
            .get(cpu / GROUP_BITS)
            .is_some_and(|&group| group & (1u32 << (cpu % GROUP_BITS)) != 0)
    }

    /// Number of cpus in the set.
    #[must_use]
    pub fn weight(&self) -> usize {
        self.groups.iter().map(|g| g.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| *g == 0)
    }

    /// Cpus in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.iter().enumerate().flat_map(|(idx, &group)| {
            (0..GROUP_BITS)
                .filter(move |&bit| group & (1u32 << bit) != 0)
                .map(move |bit| idx * GROUP_BITS + bit)
        })
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        CpuMask::EMPTY
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for group in self.groups.iter().rev().skip_while(|g| **g == 0) {
            if first {
                write!(f, "{group:x}")?;
                first = false;
            } else {
                write!(f, ",{group:08x}")?;
            }
        }
        if first {
            f.write_char('0')?;
        }
        Ok(())
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({})", self.to_cpulist())
    }
}

fn push_range(out: &mut String, (first, last): (usize, usize)) {
    if !out.is_empty() {
        out.push(',');
    }
    if first == last {
        let _ = write!(out, "{first}");
    } else {
        let _ = write!(out, "{first}-{last}");
    }
}
