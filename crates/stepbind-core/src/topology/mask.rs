//! Fixed-capacity index sets over CPUs (and NUMA nodes with the `numa`
//! feature), with the kernel cpulist text format (`"0-3,8"`) used by cpuset
//! control files.

use std::fmt;

const WORD_BITS: usize = 64;

/// A fixed-capacity set of CPU indices.
///
/// Capacity is fixed at construction (the node CPU count); all operations
/// are total - out-of-range indices are ignored by `set`/`clear` and test
/// as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuMask {
    capacity: usize,
    words: Vec<u64>,
}

impl CpuMask {
    /// Creates an empty mask with room for `capacity` CPU indices.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            words: vec![0; capacity.div_ceil(WORD_BITS)],
        }
    }

    /// Creates a mask with every index in `[0, capacity)` set.
    #[must_use]
    pub fn full(capacity: usize) -> Self {
        let mut mask = Self::new(capacity);
        for cpu in 0..capacity {
            mask.set(cpu);
        }
        mask
    }

    /// Parses a kernel cpulist string (e.g. `"0-3,8"`). Indices at or past
    /// `capacity` are dropped; an empty string yields an empty mask.
    #[must_use]
    pub fn from_cpulist(s: &str, capacity: usize) -> Self {
        let mut mask = Self::new(capacity);
        for cpu in parse_cpulist(s) {
            mask.set(cpu);
        }
        mask
    }

    /// Returns the mask capacity (node CPU count).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets `cpu` if it is within capacity.
    pub fn set(&mut self, cpu: usize) {
        if cpu < self.capacity {
            self.words[cpu / WORD_BITS] |= 1 << (cpu % WORD_BITS);
        }
    }

    /// Clears `cpu` if it is within capacity.
    pub fn clear(&mut self, cpu: usize) {
        if cpu < self.capacity {
            self.words[cpu / WORD_BITS] &= !(1 << (cpu % WORD_BITS));
        }
    }

    /// Returns true if `cpu` is in the set.
    #[must_use]
    pub fn test(&self, cpu: usize) -> bool {
        cpu < self.capacity && self.words[cpu / WORD_BITS] & (1 << (cpu % WORD_BITS)) != 0
    }

    /// Returns the union of the two masks (capacity of `self`).
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (w, o) in out.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
        out.trim_tail();
        out
    }

    /// Returns the intersection of the two masks (capacity of `self`).
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (i, w) in out.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
        out
    }

    /// Returns the complement within `[0, capacity)`.
    #[must_use]
    pub fn complement(&self) -> Self {
        let mut out = self.clone();
        for w in &mut out.words {
            *w = !*w;
        }
        out.trim_tail();
        out
    }

    /// Returns the number of set indices.
    #[must_use]
    pub fn popcount(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if no index is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterates over the set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity).filter(move |cpu| self.test(*cpu))
    }

    /// Formats the mask as a kernel cpulist string.
    #[must_use]
    pub fn to_cpulist(&self) -> String {
        format_cpulist(self.iter())
    }

    /// Clears bits at or past capacity in the last word.
    fn trim_tail(&mut self) {
        let tail = self.capacity % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_cpulist())
    }
}

/// A fixed-capacity set of NUMA node indices.
///
/// Same representation and text format as [`CpuMask`], kept as a distinct
/// type so CPU and memory-node sets cannot be mixed up.
#[cfg(feature = "numa")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemNodeSet {
    capacity: usize,
    words: Vec<u64>,
}

#[cfg(feature = "numa")]
impl MemNodeSet {
    /// Creates an empty set with room for `capacity` node indices.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            words: vec![0; capacity.div_ceil(WORD_BITS)],
        }
    }

    /// Parses a kernel nodelist string (same syntax as a cpulist).
    #[must_use]
    pub fn from_nodelist(s: &str, capacity: usize) -> Self {
        let mut set = Self::new(capacity);
        for node in parse_cpulist(s) {
            set.set(node);
        }
        set
    }

    /// Sets `node` if it is within capacity.
    pub fn set(&mut self, node: usize) {
        if node < self.capacity {
            self.words[node / WORD_BITS] |= 1 << (node % WORD_BITS);
        }
    }

    /// Returns true if `node` is in the set.
    #[must_use]
    pub fn test(&self, node: usize) -> bool {
        node < self.capacity && self.words[node / WORD_BITS] & (1 << (node % WORD_BITS)) != 0
    }

    /// Returns the number of set nodes.
    #[must_use]
    pub fn popcount(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if no node is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterates over the set nodes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity).filter(move |node| self.test(*node))
    }

    /// Formats the set as a kernel nodelist string.
    #[must_use]
    pub fn to_nodelist(&self) -> String {
        format_cpulist(self.iter())
    }

    /// Raw words for the `set_mempolicy` nodemask argument.
    #[must_use]
    pub(crate) fn words(&self) -> &[u64] {
        &self.words
    }
}

/// Parses a CPU list string like `"0-7,16-23"`. Malformed parts are skipped.
pub(crate) fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();

    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }

    cpus
}

/// Formats ascending indices as a cpulist, collapsing runs into ranges.
fn format_cpulist(iter: impl Iterator<Item = usize>) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let mut run: Option<(usize, usize)> = None;

    let mut flush = |out: &mut String, (start, end): (usize, usize)| {
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            let _ = write!(out, "{start}");
        } else {
            let _ = write!(out, "{start}-{end}");
        }
    };

    for idx in iter {
        match run {
            Some((start, end)) if idx == end + 1 => run = Some((start, idx)),
            Some(r) => {
                flush(&mut out, r);
                run = Some((idx, idx));
            }
            None => run = Some((idx, idx)),
        }
    }
    if let Some(r) = run {
        flush(&mut out, r);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_test_clear() {
        let mut mask = CpuMask::new(8);
        assert!(mask.is_empty());
        mask.set(1);
        mask.set(7);
        assert!(mask.test(1));
        assert!(mask.test(7));
        assert!(!mask.test(0));
        mask.clear(1);
        assert!(!mask.test(1));
        assert_eq!(mask.popcount(), 1);
    }

    #[test]
    fn test_out_of_range_is_total() {
        let mut mask = CpuMask::new(4);
        mask.set(100);
        assert!(!mask.test(100));
        assert!(mask.is_empty());
    }

    #[test]
    fn test_full_and_complement() {
        let full = CpuMask::full(6);
        assert_eq!(full.popcount(), 6);
        assert!(full.complement().is_empty());

        let mut mask = CpuMask::new(6);
        mask.set(0);
        mask.set(5);
        let comp = mask.complement();
        assert_eq!(comp.popcount(), 4);
        assert!(!comp.test(0));
        assert!(comp.test(3));
    }

    #[test]
    fn test_union_intersect() {
        let mut a = CpuMask::new(8);
        a.set(1);
        a.set(2);
        let mut b = CpuMask::new(8);
        b.set(2);
        b.set(3);

        let u = a.union(&b);
        assert_eq!(u.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let i = a.intersect(&b);
        assert_eq!(i.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_cpulist_round_trip() {
        for list in ["", "0", "1-2", "0-3,8", "1,3,5-9,63"] {
            let mask = CpuMask::from_cpulist(list, 64);
            assert_eq!(mask.to_cpulist(), list);
        }
    }

    #[test]
    fn test_cpulist_round_trip_all_popcounts() {
        // Capacities straddling the word boundary must round-trip too.
        for n in 1..=70 {
            let mut mask = CpuMask::new(n);
            for cpu in (0..n).step_by(3) {
                mask.set(cpu);
            }
            let parsed = CpuMask::from_cpulist(&mask.to_cpulist(), n);
            assert_eq!(parsed, mask, "round trip failed for capacity {n}");
        }
    }

    #[test]
    fn test_cpulist_drops_out_of_range() {
        let mask = CpuMask::from_cpulist("0-15", 4);
        assert_eq!(mask.popcount(), 4);
    }

    #[test]
    fn test_display_matches_cpulist() {
        let mask = CpuMask::from_cpulist("1-2", 4);
        assert_eq!(format!("{mask}"), "1-2");
    }

    #[cfg(feature = "numa")]
    #[test]
    fn test_mem_node_set() {
        let mut nodes = MemNodeSet::new(4);
        nodes.set(0);
        nodes.set(2);
        assert_eq!(nodes.to_nodelist(), "0,2");
        assert_eq!(nodes.popcount(), 2);
        let parsed = MemNodeSet::from_nodelist("0,2", 4);
        assert_eq!(parsed, nodes);
    }
}
