mod mapping;
mod table;

use gekko::Address;
use indexmap::IndexSet;
use ppcjit::Block;

use crate::blocks::mapping::Mapping;

/// Identifier for a block in a [`Blocks`] storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(usize);

/// A structure which keeps tracks of compiled [`Block`]s, keyed by their entry address.
#[derive(Default)]
pub struct Blocks {
    storage: Vec<Option<Block>>,
    free: Vec<BlockId>,
    mappings: mapping::Table,
    deps: mapping::DepsTable,
    temp_deps: IndexSet<Address>,
}

impl Blocks {
    /// Inserts a block into the storage and maps it to the given address.
    pub fn insert(&mut self, addr: Address, block: Block) {
        let length = block.meta().seq.byte_len();
        if let Some(old) = self.mappings.get(addr).copied() {
            self.remove(addr, old);
        }

        let id = match self.free.pop() {
            Some(id) => {
                self.storage[id.0] = Some(block);
                id
            }
            None => {
                self.storage.push(Some(block));
                BlockId(self.storage.len() - 1)
            }
        };

        self.mappings.insert(addr, Mapping { id, length });
        self.deps.mark(addr, length);
    }

    fn remove(&mut self, addr: Address, mapping: Mapping) {
        self.mappings.remove(addr);
        self.deps.unmark(addr, mapping.length);

        self.storage[mapping.id.0] = None;
        self.free.push(mapping.id);
    }

    /// Returns the block mapped to `addr`.
    #[inline(always)]
    pub fn get(&self, addr: Address) -> Option<&Block> {
        let mapping = self.mappings.get(addr)?;
        self.storage[mapping.id.0].as_ref()
    }

    /// Amount of live blocks.
    pub fn len(&self) -> usize {
        self.storage.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any block was compiled from code intersecting the `len` bytes at `start`.
    pub fn contains_code(&self, start: Address, len: u32) -> bool {
        if len == 0 {
            return false;
        }

        mapping::pages(start, len).any(|page| {
            self.deps.get(page).is_some_and(|deps| {
                deps.iter().any(|dep| {
                    self.mappings
                        .get(*dep)
                        .is_some_and(|m| m.overlaps(*dep, start, len))
                })
            })
        })
    }

    /// Invalidates every block whose code intersects the `len` bytes at `start`. Returns how many
    /// blocks were invalidated.
    pub fn invalidate_range(&mut self, start: Address, len: u32) -> usize {
        if len == 0 {
            return 0;
        }

        let mut temp_deps = std::mem::take(&mut self.temp_deps);
        for page in mapping::pages(start, len) {
            if let Some(deps) = self.deps.get(page) {
                temp_deps.extend(deps.iter().copied());
            }
        }

        let mut invalidated = 0;
        for dep in temp_deps.iter().copied() {
            let Some(mapping) = self.mappings.get(dep).copied() else {
                tracing::error!("block {dep} is listed as dependent on a page but is not mapped");
                continue;
            };

            if mapping.overlaps(dep, start, len) {
                tracing::debug!(addr = ?dep, length = mapping.length, "invalidating block");
                self.remove(dep, mapping);
                invalidated += 1;
            }
        }

        temp_deps.clear();
        self.temp_deps = temp_deps;

        invalidated
    }

    /// Drops every block.
    pub fn clear(&mut self) {
        self.storage.clear();
        self.free.clear();
        self.mappings.clear();
        self.deps.clear();
    }
}
