use gekko::Address;
use indexmap::IndexSet;

use crate::blocks::BlockId;
use crate::blocks::table::Table as BaseTable;

const MAP_TBL_L0_BITS: usize = 12;
const MAP_TBL_L0_COUNT: usize = 1 << MAP_TBL_L0_BITS;
const MAP_TBL_L0_MASK: usize = MAP_TBL_L0_COUNT - 1;
const MAP_TBL_L1_BITS: usize = 8;
const MAP_TBL_L1_COUNT: usize = 1 << MAP_TBL_L1_BITS;
const MAP_TBL_L1_MASK: usize = MAP_TBL_L1_COUNT - 1;
const MAP_TBL_L2_BITS: usize = 10;
const MAP_TBL_L2_COUNT: usize = 1 << MAP_TBL_L2_BITS;
const MAP_TBL_L2_MASK: usize = MAP_TBL_L2_COUNT - 1;

/// Length in bytes of a dependency page.
pub const PAGE_LEN: u32 = 1 << 12;
const DEPS_TBL_L0_BITS: usize = 12;
const DEPS_TBL_L0_COUNT: usize = 1 << DEPS_TBL_L0_BITS;
const DEPS_TBL_L0_MASK: usize = DEPS_TBL_L0_COUNT - 1;
const DEPS_TBL_L1_BITS: usize = 8;
const DEPS_TBL_L1_COUNT: usize = 1 << DEPS_TBL_L1_BITS;
const DEPS_TBL_L1_MASK: usize = DEPS_TBL_L1_COUNT - 1;

#[inline(always)]
fn addr_to_mapping_idx(addr: Address) -> (usize, usize, usize) {
    let base = (addr.value() >> 2) as usize;
    (
        base >> (30 - MAP_TBL_L0_BITS) & MAP_TBL_L0_MASK,
        (base >> (30 - MAP_TBL_L0_BITS - MAP_TBL_L1_BITS)) & MAP_TBL_L1_MASK,
        (base >> (30 - MAP_TBL_L0_BITS - MAP_TBL_L1_BITS - MAP_TBL_L2_BITS)) & MAP_TBL_L2_MASK,
    )
}

#[inline(always)]
fn page_to_deps_idx(page: u32) -> (usize, usize) {
    let page = page as usize;
    (
        page >> (20 - DEPS_TBL_L0_BITS) & DEPS_TBL_L0_MASK,
        (page >> (20 - DEPS_TBL_L0_BITS - DEPS_TBL_L1_BITS)) & DEPS_TBL_L1_MASK,
    )
}

/// Pages covered by the `len` bytes starting at `start`. `len` must not be zero.
#[inline(always)]
pub fn pages(start: Address, len: u32) -> std::ops::RangeInclusive<u32> {
    let last = start.value().saturating_add(len - 1);
    start.value() / PAGE_LEN..=last / PAGE_LEN
}

/// A block mapped at some entry address.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub id: BlockId,
    /// Length in bytes of the guest code the block was compiled from.
    pub length: u32,
}

impl Mapping {
    /// Whether the code of a block mapped at `addr` intersects the `len` bytes at `start`.
    pub fn overlaps(&self, addr: Address, start: Address, len: u32) -> bool {
        let block_end = addr.value() as u64 + self.length as u64;
        let end = start.value() as u64 + len as u64;
        (addr.value() as u64) < end && (start.value() as u64) < block_end
    }
}

/// Maps entry addresses to blocks.
#[derive(Default)]
pub struct Table(
    BaseTable<BaseTable<BaseTable<Mapping, MAP_TBL_L2_COUNT>, MAP_TBL_L1_COUNT>, MAP_TBL_L0_COUNT>,
);

impl Table {
    pub fn insert(&mut self, addr: Address, mapping: Mapping) {
        let (idx0, idx1, idx2) = addr_to_mapping_idx(addr);
        let level1 = self.0.get_or_default(idx0);
        let level2 = level1.get_or_default(idx1);
        level2.insert(idx2, mapping);
    }

    pub fn remove(&mut self, addr: Address) -> Option<Mapping> {
        let (idx0, idx1, idx2) = addr_to_mapping_idx(addr);
        let level1 = self.0.get_mut(idx0)?;
        let level2 = level1.get_mut(idx1)?;
        level2.remove(idx2)
    }

    pub fn get(&self, addr: Address) -> Option<&Mapping> {
        let (idx0, idx1, idx2) = addr_to_mapping_idx(addr);
        let level1 = self.0.get(idx0)?;
        let level2 = level1.get(idx1)?;
        level2.get(idx2)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Maps guest pages to the entry addresses of the blocks whose code intersects them.
#[derive(Default)]
pub struct DepsTable(BaseTable<BaseTable<IndexSet<Address>, DEPS_TBL_L1_COUNT>, DEPS_TBL_L0_COUNT>);

impl DepsTable {
    /// Marks the block at `addr` as dependent on the pages covering its `len` bytes of code.
    pub fn mark(&mut self, addr: Address, len: u32) {
        for page in pages(addr, len) {
            let (idx0, idx1) = page_to_deps_idx(page);
            let level1 = self.0.get_or_default(idx0);
            let deps = level1.get_or_default(idx1);
            deps.insert(addr);
        }
    }

    /// Unmarks the block at `addr` as dependent on the pages covering its `len` bytes of code.
    pub fn unmark(&mut self, addr: Address, len: u32) {
        for page in pages(addr, len) {
            let (idx0, idx1) = page_to_deps_idx(page);
            let Some(level1) = self.0.get_mut(idx0) else {
                continue;
            };

            if let Some(deps) = level1.get_mut(idx1) {
                deps.swap_remove(&addr);
            }
        }
    }

    /// Returns the blocks dependent on the given page.
    pub fn get(&self, page: u32) -> Option<&IndexSet<Address>> {
        let (idx0, idx1) = page_to_deps_idx(page);
        let level1 = self.0.get(idx0)?;
        level1.get(idx1)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span() {
        assert_eq!(pages(Address(0x0FFC), 4), 0..=0);
        assert_eq!(pages(Address(0x0FFC), 8), 0..=1);
        assert_eq!(pages(Address(0xFFFF_FFFC), 16), 0xFFFFF..=0xFFFFF);
    }

    #[test]
    fn overlap() {
        let mapping = Mapping {
            id: BlockId(0),
            length: 16,
        };

        assert!(mapping.overlaps(Address(0x100), Address(0x10C), 4));
        assert!(mapping.overlaps(Address(0x100), Address(0xF0), 0x11));
        assert!(!mapping.overlaps(Address(0x100), Address(0x110), 4));
        assert!(!mapping.overlaps(Address(0x100), Address(0xF0), 0x10));
    }

    #[test]
    fn deps_across_pages() {
        let mut deps = DepsTable::default();
        deps.mark(Address(0x1FF8), 16);

        assert!(deps.get(1).is_some_and(|d| d.contains(&Address(0x1FF8))));
        assert!(deps.get(2).is_some_and(|d| d.contains(&Address(0x1FF8))));

        deps.unmark(Address(0x1FF8), 16);
        assert!(deps.get(1).is_some_and(|d| d.is_empty()));
        assert!(deps.get(2).is_some_and(|d| d.is_empty()));
    }
}
