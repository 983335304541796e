/// A lazily populated table of `LEN` optional entries. Nested tables form the levels of a sparse
/// radix tree over guest addresses.
#[derive(Debug, Clone)]
pub struct Table<T, const LEN: usize> {
    entries: Box<[Option<T>]>,
}

impl<T, const LEN: usize> Default for Table<T, LEN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const LEN: usize> Table<T, LEN> {
    pub fn new() -> Self {
        let entries = std::iter::repeat_with(|| None).take(LEN).collect();
        Self { entries }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries[index].as_ref()
    }

    #[inline(always)]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries[index].as_mut()
    }

    #[inline(always)]
    pub fn insert(&mut self, index: usize, value: T) -> &mut T {
        self.entries[index].insert(value)
    }

    #[inline(always)]
    pub fn remove(&mut self, index: usize) -> Option<T> {
        self.entries[index].take()
    }

    #[inline(always)]
    pub fn get_or_default(&mut self, index: usize) -> &mut T
    where
        T: Default,
    {
        self.entries[index].get_or_insert_with(T::default)
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.entries.fill_with(|| None);
    }
}
