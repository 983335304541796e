//! Register cache used while building a block.
//!
//! The cache models a fixed number of host registers ("slots"). Guest registers are bound to
//! slots on demand, loaded from the canonical register file when read and written back when
//! spilled or flushed. Values are opaque to the cache: while building a block they are cranelift
//! SSA values, and the backing emits the loads and stores.
//!
//! Allocation is first-fit among free slots. When every slot is taken, the least recently used
//! unlocked binding is spilled. Bindings made for the instruction being emitted are locked until
//! [`RegCache::unlock_all`], so they can't be spilled under the feet of the handler using them.

/// Storage the cache fills from and spills to.
pub trait Backing<K> {
    type Value: Copy;

    /// Loads the current value of `key`.
    fn load(&mut self, key: K) -> Self::Value;
    /// Stores `value` into `key`.
    fn store(&mut self, key: K, value: Self::Value);
}

/// A host register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostReg(pub u8);

impl HostReg {
    #[inline(always)]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry<K, V> {
    key: K,
    value: V,
    dirty: bool,
    locked: bool,
    /// Last time this binding was touched.
    stamp: u64,
    /// The other half of a pair, if this binding is part of one.
    partner: Option<HostReg>,
}

/// A register cache with a fixed amount of slots.
#[derive(Debug, Clone)]
pub struct RegCache<K, V> {
    slots: Vec<Option<Entry<K, V>>>,
    clock: u64,
}

impl<K, V> RegCache<K, V>
where
    K: Copy + PartialEq,
    V: Copy,
{
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= u8::MAX as usize);
        Self {
            slots: vec![None; capacity],
            clock: 0,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// How many slots are bound.
    pub fn bound(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// The slot `key` is bound to, if any.
    pub fn lookup(&self, key: K) -> Option<HostReg> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.key == key))
            .map(|i| HostReg(i as u8))
    }

    /// The value held by `host`, if it is bound.
    pub fn value(&self, host: HostReg) -> Option<V> {
        self.entry(host).map(|e| e.value)
    }

    /// Whether `host` is bound and dirty.
    pub fn is_dirty(&self, host: HostReg) -> bool {
        self.entry(host).is_some_and(|e| e.dirty)
    }

    /// Whether `host` is bound and locked.
    pub fn is_locked(&self, host: HostReg) -> bool {
        self.entry(host).is_some_and(|e| e.locked)
    }

    /// The other half of the pair `host` belongs to.
    pub fn partner(&self, host: HostReg) -> Option<HostReg> {
        self.entry(host).and_then(|e| e.partner)
    }

    fn entry(&self, host: HostReg) -> Option<&Entry<K, V>> {
        self.slots.get(host.index()).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, host: HostReg) -> Option<&mut Entry<K, V>> {
        self.slots.get_mut(host.index()).and_then(Option::as_mut)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Marks `host` as used by the current instruction.
    fn touch(&mut self, host: HostReg) {
        let stamp = self.tick();
        if let Some(entry) = self.entry_mut(host) {
            entry.stamp = stamp;
            entry.locked = true;
        }
    }

    fn is_evictable(&self, index: usize) -> bool {
        let Some(entry) = &self.slots[index] else {
            return false;
        };

        !entry.locked && entry.partner.is_none_or(|p| !self.is_locked(p))
    }

    /// The least recently used slot that can be spilled.
    fn victim(&self) -> Option<usize> {
        (0..self.slots.len())
            .filter(|&i| self.is_evictable(i))
            .min_by_key(|&i| self.slots[i].as_ref().map_or(u64::MAX, |e| e.stamp))
    }

    /// Unbinds `host`, writing it back if dirty. Pairs are spilled together.
    fn spill<B>(&mut self, backing: &mut B, host: HostReg)
    where
        B: Backing<K, Value = V>,
    {
        let Some(entry) = self.slots[host.index()].take() else {
            return;
        };

        if entry.dirty {
            backing.store(entry.key, entry.value);
        }

        if let Some(partner) = entry.partner
            && let Some(other) = self.slots[partner.index()].take()
            && other.dirty
        {
            backing.store(other.key, other.value);
        }
    }

    /// Finds a slot for a new binding, spilling if needed.
    fn allocate<B>(&mut self, backing: &mut B) -> HostReg
    where
        B: Backing<K, Value = V>,
    {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return HostReg(free as u8);
        }

        let Some(victim) = self.victim() else {
            // handlers declare their demand and are bound to the fallback if it exceeds the
            // capacity, so this is a bug in a handler's declaration
            unreachable!("register demand exceeds cache capacity");
        };

        let host = HostReg(victim as u8);
        self.spill(backing, host);
        host
    }

    fn insert(&mut self, host: HostReg, key: K, value: V, dirty: bool) {
        let stamp = self.tick();
        self.slots[host.index()] = Some(Entry {
            key,
            value,
            dirty,
            locked: true,
            stamp,
            partner: None,
        });
    }

    /// Binds `key` for reading, loading it if it isn't resident.
    pub fn bind_read<B>(&mut self, backing: &mut B, key: K) -> (HostReg, V)
    where
        B: Backing<K, Value = V>,
    {
        if let Some(host) = self.lookup(key)
            && let Some(value) = self.value(host)
        {
            self.touch(host);
            return (host, value);
        }

        let host = self.allocate(backing);
        let value = backing.load(key);
        self.insert(host, key, value, false);

        (host, value)
    }

    /// Binds `key` for writing: the slot now holds `value` and is dirty. The previous value is
    /// never loaded.
    pub fn bind_write<B>(&mut self, backing: &mut B, key: K, value: V) -> HostReg
    where
        B: Backing<K, Value = V>,
    {
        if let Some(host) = self.lookup(key) {
            self.touch(host);
            if let Some(entry) = self.entry_mut(host) {
                entry.value = value;
                entry.dirty = true;
            }

            return host;
        }

        let host = self.allocate(backing);
        self.insert(host, key, value, true);
        host
    }

    fn link(&mut self, lo: HostReg, hi: HostReg) {
        if let Some(entry) = self.entry_mut(lo) {
            entry.partner = Some(hi);
        }

        if let Some(entry) = self.entry_mut(hi) {
            entry.partner = Some(lo);
        }
    }

    /// Binds both halves of a pair for reading, guaranteeing they are resident together.
    pub fn bind_pair<B>(&mut self, backing: &mut B, keys: [K; 2]) -> [(HostReg, V); 2]
    where
        B: Backing<K, Value = V>,
    {
        let lo = self.bind_read(backing, keys[0]);
        let hi = self.bind_read(backing, keys[1]);
        self.link(lo.0, hi.0);

        [lo, hi]
    }

    /// Binds both halves of a pair for writing.
    pub fn bind_pair_write<B>(&mut self, backing: &mut B, keys: [K; 2], values: [V; 2]) -> [HostReg; 2]
    where
        B: Backing<K, Value = V>,
    {
        let lo = self.bind_write(backing, keys[0], values[0]);
        let hi = self.bind_write(backing, keys[1], values[1]);
        self.link(lo, hi);

        [lo, hi]
    }

    /// Releases a slot reserved by the current instruction.
    pub fn unlock(&mut self, host: HostReg) {
        if let Some(entry) = self.entry_mut(host) {
            entry.locked = false;
        }
    }

    /// Releases both halves of a pair.
    pub fn unlock_pair(&mut self, hosts: [HostReg; 2]) {
        self.unlock(hosts[0]);
        self.unlock(hosts[1]);
    }

    /// Releases every slot. Called once an instruction has been emitted.
    pub fn unlock_all(&mut self) {
        for entry in self.slots.iter_mut().flatten() {
            entry.locked = false;
        }
    }

    /// Writes `key` back if it's dirty and unbinds it. Used before code that accesses the
    /// register through the register file.
    pub fn evict<B>(&mut self, backing: &mut B, key: K)
    where
        B: Backing<K, Value = V>,
    {
        if let Some(host) = self.lookup(key) {
            self.spill(backing, host);
        }
    }

    /// Writes every dirty binding back without changing the cache state. Used on side exits,
    /// where the main path keeps using the cached values.
    pub fn write_back<B>(&self, backing: &mut B)
    where
        B: Backing<K, Value = V>,
    {
        for entry in self.slots.iter().flatten().filter(|e| e.dirty) {
            backing.store(entry.key, entry.value);
        }
    }

    /// Writes every dirty binding back and clears all bindings.
    pub fn flush_all<B>(&mut self, backing: &mut B)
    where
        B: Backing<K, Value = V>,
    {
        self.write_back(backing);
        self.clear();
    }

    /// Drops every binding without writing anything back.
    pub fn clear(&mut self) {
        self.slots.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Load(u8),
        Store(u8, u32),
    }

    #[derive(Default)]
    struct Regs {
        values: FxHashMap<u8, u32>,
        log: Vec<Op>,
    }

    impl Backing<u8> for Regs {
        type Value = u32;

        fn load(&mut self, key: u8) -> u32 {
            self.log.push(Op::Load(key));
            self.values.get(&key).copied().unwrap_or(0)
        }

        fn store(&mut self, key: u8, value: u32) {
            self.log.push(Op::Store(key, value));
            self.values.insert(key, value);
        }
    }

    #[test]
    fn flush_preserves_values() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(4);

        for (reg, value) in [(1, 0xDEAD), (2, 0xBEEF), (7, 0)] {
            cache.bind_write(&mut regs, reg, value);
        }

        cache.flush_all(&mut regs);
        assert_eq!(cache.bound(), 0);

        for (reg, value) in [(1, 0xDEAD), (2, 0xBEEF), (7, 0)] {
            assert_eq!(cache.bind_read(&mut regs, reg).1, value);
        }
    }

    #[test]
    fn resident_reads_do_not_load() {
        let mut regs = Regs::default();
        regs.values.insert(3, 42);

        let mut cache = RegCache::new(2);
        let (a, value) = cache.bind_read(&mut regs, 3);
        let (b, _) = cache.bind_read(&mut regs, 3);

        assert_eq!(a, b);
        assert_eq!(value, 42);
        assert_eq!(regs.log, [Op::Load(3)]);
        assert!(!cache.is_dirty(a));
    }

    #[test]
    fn allocation_is_first_fit() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(4);

        let r0 = cache.bind_write(&mut regs, 10, 0);
        let r1 = cache.bind_write(&mut regs, 11, 0);
        let r2 = cache.bind_write(&mut regs, 12, 0);
        assert_eq!([r0, r1, r2], [HostReg(0), HostReg(1), HostReg(2)]);

        cache.evict(&mut regs, 11);
        assert_eq!(cache.bind_read(&mut regs, 13).0, HostReg(1));
    }

    #[test]
    fn spills_least_recently_used() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(3);

        cache.bind_write(&mut regs, 1, 100);
        cache.bind_write(&mut regs, 2, 200);
        cache.bind_read(&mut regs, 3);
        cache.unlock_all();

        // 1 is used again, making 2 the least recently used
        cache.bind_read(&mut regs, 1);
        cache.unlock_all();

        regs.log.clear();
        let host = cache.bind_read(&mut regs, 4).0;

        assert_eq!(host, HostReg(1));
        assert_eq!(regs.log, [Op::Store(2, 200), Op::Load(4)]);
        assert_eq!(cache.lookup(2), None);
        assert_eq!(regs.values[&2], 200);
    }

    #[test]
    fn clean_spills_do_not_store() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(1);

        cache.bind_read(&mut regs, 1);
        cache.unlock_all();
        cache.bind_read(&mut regs, 2);

        assert_eq!(regs.log, [Op::Load(1), Op::Load(2)]);
    }

    #[test]
    fn locked_entries_are_not_spilled() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(2);

        let older = cache.bind_write(&mut regs, 1, 1);
        let newer = cache.bind_write(&mut regs, 2, 2);
        cache.unlock(newer);

        // 1 is the least recently used binding, but it's still locked
        let host = cache.bind_read(&mut regs, 3).0;

        assert_eq!(host, newer);
        assert_eq!(cache.lookup(1), Some(older));
        assert_eq!(regs.values[&2], 2);
    }

    #[test]
    fn pairs_spill_together() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(3);

        let [lo, hi] = cache.bind_pair_write(&mut regs, [20, 21], [5, 6]);
        assert_eq!(cache.partner(lo), Some(hi));
        cache.unlock_pair([lo, hi]);
        assert!(!cache.is_locked(lo) && !cache.is_locked(hi));

        cache.bind_read(&mut regs, 1);
        cache.unlock_all();

        // the pair is the least recently used binding, both halves go
        regs.log.clear();
        cache.bind_read(&mut regs, 2);
        cache.bind_read(&mut regs, 3);

        assert_eq!(cache.lookup(20), None);
        assert_eq!(cache.lookup(21), None);
        assert_eq!(regs.log[..2], [Op::Store(20, 5), Op::Store(21, 6)]);
    }

    #[test]
    fn pair_with_locked_half_is_not_spilled() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(3);

        cache.bind_pair(&mut regs, [20, 21]);
        cache.unlock_all();
        cache.bind_read(&mut regs, 1);
        cache.unlock_all();

        // only the low half is needed by this instruction
        cache.bind_read(&mut regs, 20);
        cache.bind_read(&mut regs, 2);

        assert!(cache.lookup(20).is_some());
        assert!(cache.lookup(21).is_some());
        assert_eq!(cache.lookup(1), None);
    }

    #[test]
    fn write_back_keeps_bindings() {
        let mut regs = Regs::default();
        let mut cache = RegCache::new(2);

        let host = cache.bind_write(&mut regs, 9, 99);
        cache.write_back(&mut regs);

        assert_eq!(regs.values[&9], 99);
        assert_eq!(cache.value(host), Some(99));
        assert!(cache.is_dirty(host));
    }
}
