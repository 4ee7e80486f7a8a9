use crate::utils::align_up;

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// The local-memory budget a set of co-resident buffers must satisfy.
///
/// `reserved` is fragmentation headroom. It shrinks the usable capacity only when a
/// caller asks for it, which the search does in prefetch mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(default)]
pub struct MemoryBudget {
    pub capacity: u64,
    pub alignment: u64,
    pub reserved: u64,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        MemoryBudget {
            capacity: 1024 * 1024,
            alignment: 64,
            reserved: 0,
        }
    }
}

impl MemoryBudget {
    pub fn new(capacity: u64, alignment: u64) -> Self {
        MemoryBudget {
            capacity,
            alignment,
            reserved: 0,
        }
    }

    pub fn with_reserved(self, reserved: u64) -> Self {
        MemoryBudget { reserved, ..self }
    }

    /// Capacity left to buffers.
    pub fn effective_capacity(&self, reserve_fragmentation: bool) -> u64 {
        if reserve_fragmentation {
            self.capacity.saturating_sub(self.reserved)
        } else {
            self.capacity
        }
    }
}

impl Display for MemoryBudget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}B (align {}B", self.capacity, self.alignment)?;
        if self.reserved != 0 {
            write!(f, ", reserve {}B", self.reserved)?;
        }
        write!(f, ")")
    }
}

/// Sum of the alignment-rounded buffer sizes.
pub fn aligned_requirement(buffers: &[u64], budget: &MemoryBudget) -> u64 {
    buffers.iter().map(|&b| align_up(b, budget.alignment)).sum()
}

/// Whether `buffers` can co-reside in local memory.
pub fn fits(buffers: &[u64], budget: &MemoryBudget, reserve_fragmentation: bool) -> bool {
    aligned_requirement(buffers, budget) <= budget.effective_capacity(reserve_fragmentation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_alignment_is_applied_per_buffer() {
        let budget = MemoryBudget::new(256, 64);
        // 65 + 65 rounds to 128 + 128.
        assert!(fits(&[65, 65], &budget, false));
        assert!(!fits(&[65, 65, 1], &budget, false));
        assert_eq!(aligned_requirement(&[1, 64, 65], &budget), 64 + 64 + 128);
    }

    #[test]
    fn test_reserved_only_applies_on_request() {
        let budget = MemoryBudget::new(256, 1).with_reserved(56);
        assert!(fits(&[256], &budget, false));
        assert!(!fits(&[256], &budget, true));
        assert!(fits(&[200], &budget, true));
    }

    #[test]
    fn test_reserved_larger_than_capacity_fits_nothing_nonempty() {
        let budget = MemoryBudget::new(16, 1).with_reserved(32);
        assert!(fits(&[], &budget, true));
        assert!(!fits(&[1], &budget, true));
    }

    proptest! {
        #[test]
        fn test_fits_is_monotonic_in_buffer_sizes(
            budget in any::<MemoryBudget>()
                .prop_filter("overflow", |b| b.alignment < 1 << 20),
            buffers in prop::collection::vec(0u64..10_000, 0..6),
            shrink in 0usize..6
        ) {
            let mut smaller = buffers.clone();
            if let Some(b) = smaller.get_mut(shrink) {
                *b /= 2;
            }
            if fits(&buffers, &budget, true) {
                prop_assert!(fits(&smaller, &budget, true));
            }
        }
    }
}
