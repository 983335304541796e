use std::ops::Deref;

use gekko::disasm::{Ins, ParsedIns};

/// A sequence of PowerPC instructions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Sequence(pub Vec<Ins>);

impl Sequence {
    /// Size in bytes of the guest code this sequence was fetched from.
    pub fn byte_len(&self) -> u32 {
        4 * self.0.len() as u32
    }
}

impl Deref for Sequence {
    type Target = [Ins];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parsed = ParsedIns::new();
        for ins in &self.0 {
            ins.parse_basic(&mut parsed);
            writeln!(f, "{parsed}")?;
        }

        Ok(())
    }
}
