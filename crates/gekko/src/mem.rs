//! Guest memory interface.

use crate::Address;

/// A primitive which can be read from and written to guest memory. Guest memory is big endian.
pub trait Primitive: Copy + Default + std::fmt::Debug + 'static {
    /// Size of this primitive in bytes.
    const SIZE: usize;

    /// Reads this primitive from the start of `bytes`, which must be at least [`Self::SIZE`] long.
    fn read_be_bytes(bytes: &[u8]) -> Self;

    /// Writes this primitive to the start of `bytes`, which must be at least [`Self::SIZE`] long.
    fn write_be_bytes(self, bytes: &mut [u8]);
}

macro_rules! impl_primitive {
    ($($ty:ty),*) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = size_of::<$ty>();

                #[inline(always)]
                fn read_be_bytes(bytes: &[u8]) -> Self {
                    let mut buf = [0; size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..size_of::<$ty>()]);
                    <$ty>::from_be_bytes(buf)
                }

                #[inline(always)]
                fn write_be_bytes(self, bytes: &mut [u8]) {
                    bytes[..size_of::<$ty>()].copy_from_slice(&self.to_be_bytes());
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64, i8, i16, i32, i64);

/// Guest memory, as seen by the CPU.
///
/// Accesses which fail (unmapped addresses, protection) return `None`/`false`, which the CPU turns
/// into a data storage exception.
pub trait Memory {
    /// Reads a primitive from the given address.
    fn read<P: Primitive>(&mut self, addr: Address) -> Option<P>;

    /// Writes a primitive to the given address. Returns whether the write succeeded.
    fn write<P: Primitive>(&mut self, addr: Address, value: P) -> bool;
}

/// A flat RAM mapped at a base address.
#[derive(Debug, Clone)]
pub struct Ram {
    base: Address,
    data: Box<[u8]>,
}

impl Ram {
    /// Creates a zeroed RAM of `len` bytes mapped at `base`.
    pub fn new(base: Address, len: usize) -> Self {
        Self {
            base,
            data: vec![0; len].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    fn offset<P: Primitive>(&self, addr: Address) -> Option<usize> {
        let offset = addr.value().checked_sub(self.base.value())? as usize;
        (offset + P::SIZE <= self.data.len()).then_some(offset)
    }

    /// Copies `bytes` into RAM starting at `addr`. Returns whether the range was mapped.
    pub fn load(&mut self, addr: Address, bytes: &[u8]) -> bool {
        let Some(offset) = addr.value().checked_sub(self.base.value()) else {
            return false;
        };

        let offset = offset as usize;
        let Some(dst) = self.data.get_mut(offset..offset + bytes.len()) else {
            return false;
        };

        dst.copy_from_slice(bytes);
        true
    }
}

impl Memory for Ram {
    #[inline(always)]
    fn read<P: Primitive>(&mut self, addr: Address) -> Option<P> {
        let offset = self.offset::<P>(addr)?;
        Some(P::read_be_bytes(&self.data[offset..]))
    }

    #[inline(always)]
    fn write<P: Primitive>(&mut self, addr: Address, value: P) -> bool {
        let Some(offset) = self.offset::<P>(addr) else {
            return false;
        };

        value.write_be_bytes(&mut self.data[offset..]);
        true
    }
}
