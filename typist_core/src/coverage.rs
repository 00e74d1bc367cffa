/// Number of addressable slots in a coverage map. Must stay a power of two.
pub const MAP_SIZE: usize = 1 << 16;

/// The feedback signal produced by a single execution of the target.
///
/// A freshly constructed observation has every slot zeroed, `is_crash` cleared
/// and `is_new` unset. Executors fill slots in; only a `Scheduler` decides
/// `is_new`.
#[derive(Clone, PartialEq, Eq)]
pub struct CoverageObservation {
    map: Box<[u8]>,
    /// The target terminated abnormally.
    pub is_crash: bool,
    /// `None` until the observation has been classified against global coverage.
    pub is_new: Option<bool>,
}

impl CoverageObservation {
    pub fn new() -> Self {
        Self {
            map: vec![0u8; MAP_SIZE].into_boxed_slice(),
            is_crash: false,
            is_new: None,
        }
    }

    /// Marks `index` as triggered. Indices wrap around the map size.
    pub fn mark_slot(&mut self, index: usize) {
        self.map[index & (MAP_SIZE - 1)] = 1;
    }

    pub fn mark_crash(&mut self) {
        self.is_crash = true;
    }

    pub fn slot(&self, index: usize) -> u8 {
        self.map[index & (MAP_SIZE - 1)]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }

    /// Number of slots holding a nonzero value.
    pub fn hit_count(&self) -> usize {
        self.map.iter().filter(|slot| **slot != 0).count()
    }
}

impl Default for CoverageObservation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CoverageObservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageObservation")
            .field("hit_slots", &self.hit_count())
            .field("is_crash", &self.is_crash)
            .field("is_new", &self.is_new)
            .finish()
    }
}

/// Running union of all coverage seen so far, stored inverted: a set bit means
/// the corresponding slot bit has never been triggered.
///
/// The map starts fully virgin (`0xFF` everywhere) and bits only ever move from
/// virgin to seen.
pub struct VirginMap {
    bits: Box<[u8]>,
}

impl VirginMap {
    pub fn new() -> Self {
        Self {
            bits: vec![0xFFu8; MAP_SIZE].into_boxed_slice(),
        }
    }

    /// Returns true if `observation` triggers any bit still marked virgin.
    /// Does not modify the map.
    pub fn has_new_bits(&self, observation: &CoverageObservation) -> bool {
        observation
            .as_bytes()
            .iter()
            .zip(self.bits.iter())
            .any(|(seen, virgin)| seen & virgin != 0)
    }

    /// Clears every virgin bit triggered by `observation`. Returns true if at
    /// least one bit was cleared.
    pub fn merge(&mut self, observation: &CoverageObservation) -> bool {
        let mut found_new = false;
        for (virgin, seen) in self.bits.iter_mut().zip(observation.as_bytes()) {
            let new_bits = seen & *virgin;
            if new_bits != 0 {
                *virgin &= !new_bits;
                found_new = true;
            }
        }
        found_new
    }

    /// Popcount of bits that have never been triggered.
    pub fn unseen_bits(&self) -> u64 {
        self.bits.iter().map(|byte| u64::from(byte.count_ones())).sum()
    }
}

impl Default for VirginMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirginMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirginMap")
            .field("unseen_bits", &self.unseen_bits())
            .finish()
    }
}
