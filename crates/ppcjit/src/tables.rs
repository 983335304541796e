//! Opcode dispatch tables.
//!
//! Every slot of every table is bound to a [`Handler`] when the tables are built: opcodes without
//! a native emitter are bound to [`Handler::Fallback`], so dispatching never fails.
use std::fmt::Write;
use std::sync::OnceLock;

use gekko::InsExt;
use gekko::disasm::Ins;

use crate::Capacity;
use crate::builder::{BlockBuilder, InstructionInfo};

/// A function emitting host code for an instruction.
pub type EmitFn = fn(&mut BlockBuilder<'_>, Ins) -> InstructionInfo;

/// How many register cache slots a handler keeps bound at the same time, at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Demand {
    /// Integer slots (GPRs, CR, XER, LR, CTR).
    pub int: u8,
    /// Float slots, one per FPR lane.
    pub float: u8,
}

impl Demand {
    pub const fn fits(self, capacity: Capacity) -> bool {
        self.int <= capacity.int && self.float <= capacity.float
    }
}

/// What to do with an instruction.
#[derive(Clone, Copy)]
pub enum Handler {
    /// Emit host code with `emit`.
    Native {
        name: &'static str,
        emit: EmitFn,
        demand: Demand,
    },
    /// Hand the instruction to the interpreter.
    Fallback,
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Native { name, .. } => name,
            Self::Fallback => "fallback",
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native { .. })
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native { name, demand, .. } => f
                .debug_struct("Native")
                .field("name", name)
                .field("demand", demand)
                .finish(),
            Self::Fallback => f.write_str("Fallback"),
        }
    }
}

/// A secondary table, selected by a primary opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nested {
    /// Paired singles, indexed by the 10-bit extended opcode.
    Table4,
    /// Branches to LR/CTR and CR logic, indexed by the 10-bit extended opcode.
    Table19,
    /// Integer X-form instructions, indexed by the 10-bit extended opcode.
    Table31,
    /// Single precision arithmetic, indexed by the 5-bit extended opcode.
    Table59,
    /// Double precision and FPSCR instructions, indexed by the 10-bit extended opcode.
    Table63,
}

impl Nested {
    pub const ALL: [Self; 5] = [
        Self::Table4,
        Self::Table19,
        Self::Table31,
        Self::Table59,
        Self::Table63,
    ];

    pub const fn primary(self) -> u8 {
        match self {
            Self::Table4 => 4,
            Self::Table19 => 19,
            Self::Table31 => 31,
            Self::Table59 => 59,
            Self::Table63 => 63,
        }
    }

    pub const fn len(self) -> usize {
        match self {
            Self::Table59 => 32,
            _ => 1024,
        }
    }

    /// Index of `ins` in this table.
    fn index(self, ins: Ins) -> usize {
        match self {
            Self::Table59 => ins.subop5() as usize,
            _ => ins.subop10() as usize,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Handler(Handler),
    Nested(Nested),
}

/// The dispatch tables.
#[derive(Debug, Clone)]
pub struct Tables {
    capacity: Capacity,
    primary: [Slot; 64],
    secondary: [Box<[Handler]>; 5],
}

const FLOAT: Demand = Demand { int: 1, float: 5 };
const FLOAT_UNARY: Demand = Demand { int: 1, float: 3 };
const FLOAT_CMP: Demand = Demand { int: 1, float: 2 };
const FPSCR: Demand = Demand { int: 1, float: 1 };
const PAIRED: Demand = Demand { int: 1, float: 8 };
const PAIRED_MOVE: Demand = Demand { int: 1, float: 4 };
const FLOAT_MEM: Demand = Demand { int: 2, float: 2 };
const BRANCH: Demand = Demand { int: 3, float: 0 };
const INTEGER: Demand = Demand { int: 4, float: 0 };

/// A-form arithmetic opcodes shared by tables 4, 59 and 63.
const ARITH: [(u8, &str, &str, &str); 10] = [
    (18, "ps_div", "fdivs", "fdiv"),
    (20, "ps_sub", "fsubs", "fsub"),
    (21, "ps_add", "fadds", "fadd"),
    (24, "ps_res", "fres", ""),
    (25, "ps_mul", "fmuls", "fmul"),
    (26, "ps_rsqrte", "", "frsqrte"),
    (28, "ps_msub", "fmsubs", "fmsub"),
    (29, "ps_madd", "fmadds", "fmadd"),
    (30, "ps_nmsub", "fnmsubs", "fnmsub"),
    (31, "ps_nmadd", "fnmadds", "fnmadd"),
];

impl Tables {
    /// Builds the tables. Handlers whose demand doesn't fit `capacity` are bound to the fallback.
    pub fn new(capacity: Capacity) -> Self {
        let mut primary = [Slot::Handler(Handler::Fallback); 64];
        for nested in Nested::ALL {
            primary[nested.primary() as usize] = Slot::Nested(nested);
        }

        let mut tables = Self {
            capacity,
            primary,
            secondary: Nested::ALL.map(|n| vec![Handler::Fallback; n.len()].into_boxed_slice()),
        };

        tables.bind_primary();
        tables.bind_paired();
        tables.bind_float();
        tables.bind_control();

        tables
    }

    fn handler(&self, name: &'static str, emit: EmitFn, demand: Demand) -> Handler {
        if demand.fits(self.capacity) {
            Handler::Native { name, emit, demand }
        } else {
            tracing::debug!(
                "{name} needs {demand:?} but the register cache has {:?}, binding it to the fallback",
                self.capacity
            );
            Handler::Fallback
        }
    }

    fn set_primary(&mut self, opcode: u8, name: &'static str, emit: EmitFn, demand: Demand) {
        let handler = self.handler(name, emit, demand);
        self.primary[opcode as usize] = Slot::Handler(handler);
    }

    fn set(&mut self, table: Nested, index: u16, name: &'static str, emit: EmitFn, demand: Demand) {
        let handler = self.handler(name, emit, demand);
        self.secondary[table as usize][index as usize] = handler;
    }

    /// Binds an A-form opcode, which only uses the low 5 bits of the extended opcode field. Every
    /// slot aliasing it is bound.
    fn set_a_form(&mut self, table: Nested, subop5: u8, name: &'static str, emit: EmitFn, demand: Demand) {
        let handler = self.handler(name, emit, demand);
        if table == Nested::Table59 {
            self.secondary[table as usize][subop5 as usize] = handler;
            return;
        }

        for hi in 0..32 {
            self.secondary[table as usize][(hi << 5) | subop5 as usize] = handler;
        }
    }

    fn bind_primary(&mut self) {
        self.set_primary(14, "addi", BlockBuilder::addi, INTEGER);
        self.set_primary(15, "addis", BlockBuilder::addis, INTEGER);
        self.set_primary(24, "ori", BlockBuilder::ori, INTEGER);
        self.set_primary(25, "oris", BlockBuilder::oris, INTEGER);
        self.set_primary(10, "cmpli", BlockBuilder::cmpli, INTEGER);
        self.set_primary(11, "cmpi", BlockBuilder::cmpi, INTEGER);

        self.set_primary(16, "bc", BlockBuilder::bc, BRANCH);
        self.set_primary(17, "sc", BlockBuilder::sc, BRANCH);
        self.set_primary(18, "b", BlockBuilder::b, BRANCH);

        self.set_primary(48, "lfs", BlockBuilder::lfs, FLOAT_MEM);
        self.set_primary(49, "lfsu", BlockBuilder::lfsu, FLOAT_MEM);
        self.set_primary(50, "lfd", BlockBuilder::lfd, FLOAT_MEM);
        self.set_primary(51, "lfdu", BlockBuilder::lfdu, FLOAT_MEM);
        self.set_primary(52, "stfs", BlockBuilder::stfs, FLOAT_MEM);
        self.set_primary(53, "stfsu", BlockBuilder::stfsu, FLOAT_MEM);
        self.set_primary(54, "stfd", BlockBuilder::stfd, FLOAT_MEM);
        self.set_primary(55, "stfdu", BlockBuilder::stfdu, FLOAT_MEM);
    }

    fn bind_paired(&mut self) {
        use Nested::Table4;

        for (subop5, name, _, _) in ARITH {
            self.set_a_form(Table4, subop5, name, BlockBuilder::ps_arith, PAIRED);
        }

        self.set_a_form(Table4, 10, "ps_sum0", BlockBuilder::ps_sum0, PAIRED);
        self.set_a_form(Table4, 11, "ps_sum1", BlockBuilder::ps_sum1, PAIRED);
        self.set_a_form(Table4, 12, "ps_muls0", BlockBuilder::ps_muls0, PAIRED);
        self.set_a_form(Table4, 13, "ps_muls1", BlockBuilder::ps_muls1, PAIRED);
        self.set_a_form(Table4, 14, "ps_madds0", BlockBuilder::ps_madds0, PAIRED);
        self.set_a_form(Table4, 15, "ps_madds1", BlockBuilder::ps_madds1, PAIRED);
        self.set_a_form(Table4, 23, "ps_sel", BlockBuilder::ps_sel, PAIRED);

        self.set(Table4, 0, "ps_cmpu0", BlockBuilder::ps_cmpu0, FLOAT_CMP);
        self.set(Table4, 32, "ps_cmpo0", BlockBuilder::ps_cmpo0, FLOAT_CMP);
        self.set(Table4, 64, "ps_cmpu1", BlockBuilder::ps_cmpu1, FLOAT_CMP);
        self.set(Table4, 96, "ps_cmpo1", BlockBuilder::ps_cmpo1, FLOAT_CMP);

        self.set(Table4, 40, "ps_neg", BlockBuilder::ps_move, PAIRED_MOVE);
        self.set(Table4, 72, "ps_mr", BlockBuilder::ps_move, PAIRED_MOVE);
        self.set(Table4, 136, "ps_nabs", BlockBuilder::ps_move, PAIRED_MOVE);
        self.set(Table4, 264, "ps_abs", BlockBuilder::ps_move, PAIRED_MOVE);

        self.set(Table4, 528, "ps_merge00", BlockBuilder::ps_merge, PAIRED_MOVE);
        self.set(Table4, 560, "ps_merge01", BlockBuilder::ps_merge, PAIRED_MOVE);
        self.set(Table4, 592, "ps_merge10", BlockBuilder::ps_merge, PAIRED_MOVE);
        self.set(Table4, 624, "ps_merge11", BlockBuilder::ps_merge, PAIRED_MOVE);
    }

    fn bind_float(&mut self) {
        use Nested::{Table59, Table63};

        for (subop5, _, single, double) in ARITH {
            if !single.is_empty() {
                self.set_a_form(Table59, subop5, single, BlockBuilder::float_arith, FLOAT);
            }

            if !double.is_empty() {
                self.set_a_form(Table63, subop5, double, BlockBuilder::float_arith, FLOAT);
            }
        }

        self.set_a_form(Table63, 23, "fsel", BlockBuilder::fsel, FLOAT);

        self.set(Table63, 0, "fcmpu", BlockBuilder::fcmpu, FLOAT_CMP);
        self.set(Table63, 32, "fcmpo", BlockBuilder::fcmpo, FLOAT_CMP);
        self.set(Table63, 12, "frsp", BlockBuilder::frsp, FLOAT_UNARY);
        self.set(Table63, 14, "fctiw", BlockBuilder::fctiw, FLOAT_UNARY);
        self.set(Table63, 15, "fctiwz", BlockBuilder::fctiwz, FLOAT_UNARY);
        self.set(Table63, 40, "fneg", BlockBuilder::float_move, FLOAT_UNARY);
        self.set(Table63, 72, "fmr", BlockBuilder::float_move, FLOAT_UNARY);
        self.set(Table63, 136, "fnabs", BlockBuilder::float_move, FLOAT_UNARY);
        self.set(Table63, 264, "fabs", BlockBuilder::float_move, FLOAT_UNARY);

        self.set(Table63, 38, "mtfsb1", BlockBuilder::mtfsb1, FPSCR);
        self.set(Table63, 70, "mtfsb0", BlockBuilder::mtfsb0, FPSCR);
        self.set(Table63, 64, "mcrfs", BlockBuilder::mcrfs, FPSCR);
        self.set(Table63, 134, "mtfsfi", BlockBuilder::mtfsfi, FPSCR);
        self.set(Table63, 583, "mffs", BlockBuilder::mffs, FPSCR);
        self.set(Table63, 711, "mtfsf", BlockBuilder::mtfsf, FPSCR);
    }

    fn bind_control(&mut self) {
        use Nested::{Table19, Table31};

        self.set(Table19, 16, "bclr", BlockBuilder::bclr, BRANCH);
        self.set(Table19, 528, "bcctr", BlockBuilder::bcctr, BRANCH);

        self.set(Table31, 0, "cmp", BlockBuilder::cmp, INTEGER);
        self.set(Table31, 32, "cmpl", BlockBuilder::cmpl, INTEGER);
        self.set(Table31, 982, "icbi", BlockBuilder::icbi, INTEGER);

        self.set(Table31, 535, "lfsx", BlockBuilder::lfsx, FLOAT_MEM);
        self.set(Table31, 567, "lfsux", BlockBuilder::lfsux, FLOAT_MEM);
        self.set(Table31, 599, "lfdx", BlockBuilder::lfdx, FLOAT_MEM);
        self.set(Table31, 631, "lfdux", BlockBuilder::lfdux, FLOAT_MEM);
        self.set(Table31, 663, "stfsx", BlockBuilder::stfsx, FLOAT_MEM);
        self.set(Table31, 695, "stfsux", BlockBuilder::stfsux, FLOAT_MEM);
        self.set(Table31, 727, "stfdx", BlockBuilder::stfdx, FLOAT_MEM);
        self.set(Table31, 759, "stfdux", BlockBuilder::stfdux, FLOAT_MEM);
        self.set(Table31, 983, "stfiwx", BlockBuilder::stfiwx, FLOAT_MEM);
    }

    /// The register budget these tables were built for.
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Returns the handler bound to `ins`.
    #[inline]
    pub fn dispatch(&self, ins: Ins) -> Handler {
        match self.primary[ins.primary() as usize] {
            Slot::Handler(handler) => handler,
            Slot::Nested(nested) => self.secondary[nested as usize][nested.index(ins)],
        }
    }

    /// The handler at slot `index` of `table`.
    pub fn get(&self, table: Nested, index: usize) -> Option<Handler> {
        self.secondary[table as usize].get(index).copied()
    }

    /// The handler bound to primary opcode `opcode`, if it isn't a nested table.
    pub fn get_primary(&self, opcode: u8) -> Option<Handler> {
        match self.primary.get(opcode as usize)? {
            Slot::Handler(handler) => Some(*handler),
            Slot::Nested(_) => None,
        }
    }

    /// Lists the native handlers of `table`, one `index name` pair per line. Aliasing slots of
    /// A-form opcodes are listed once, at their lowest index.
    pub fn listing(&self, table: Nested) -> String {
        let mut out = String::new();
        let mut seen = Vec::new();
        for (index, handler) in self.secondary[table as usize].iter().enumerate() {
            let name = handler.name();
            if !handler.is_native() || seen.contains(&name) {
                continue;
            }

            seen.push(name);
            let _ = writeln!(out, "{index} {name}");
        }

        out
    }
}

static TABLES: OnceLock<Tables> = OnceLock::new();

/// Returns the process-wide tables for the default register budget, building them on first use.
/// Calling this again returns the same tables.
pub fn init() -> &'static Tables {
    TABLES.get_or_init(|| {
        tracing::debug!("building dispatch tables");
        Tables::new(Capacity::default())
    })
}

#[cfg(test)]
mod tests {
    use gekko::disasm::Extensions;

    use super::*;

    fn ins(code: u32) -> Ins {
        Ins::new(code, Extensions::gekko_broadway())
    }

    #[test]
    fn dispatch_is_total() {
        let tables = init();

        for primary in 0..64u32 {
            for extended in 0..1024u32 {
                let code = (primary << 26) | (extended << 1);
                // must not panic, every slot holds a handler
                let _ = tables.dispatch(ins(code));
                let _ = tables.dispatch(ins(code | 1));
            }
        }

        for table in Nested::ALL {
            for index in 0..table.len() {
                assert!(tables.get(table, index).is_some());
            }

            assert!(tables.get_primary(table.primary()).is_none());
        }
    }

    #[test]
    fn init_is_idempotent() {
        let first = init();
        let second = init();

        assert!(std::ptr::eq(first, second));

        let rebuilt = Tables::new(Capacity::default());
        for table in Nested::ALL {
            assert_eq!(first.listing(table), rebuilt.listing(table));
        }
    }

    #[test]
    fn unknown_opcodes_fall_back() {
        let tables = init();

        // primary 0 is not an instruction
        assert!(!tables.dispatch(ins(0)).is_native());
        // rlwinm is interpreted
        assert!(!tables.dispatch(ins(0x5485_463E)).is_native());
        // fadd f0, f1, f2
        assert_eq!(tables.dispatch(ins(0xFC01_102A)).name(), "fadd");
        // fadds f0, f1, f2
        assert_eq!(tables.dispatch(ins(0xEC01_102A)).name(), "fadds");
    }

    #[test]
    fn a_form_aliases_are_bound() {
        let tables = init();

        // fmadd only looks at the low 5 bits of the extended opcode, frC lives in the rest
        for frc in 0..32u32 {
            let code = 0xFC01_103A | (frc << 6);
            assert_eq!(tables.dispatch(ins(code)).name(), "fmadd");
        }
    }

    #[test]
    fn oversized_demand_falls_back() {
        let tables = Tables::new(Capacity { int: 2, float: 4 });

        // paired singles need 8 float slots
        assert!(!tables.get(Nested::Table4, 21).unwrap().is_native());
        // cmp needs 4 integer slots
        assert!(!tables.get(Nested::Table31, 0).unwrap().is_native());
        // fmr fits
        assert!(tables.get(Nested::Table63, 72).unwrap().is_native());
    }

    #[test]
    fn single_precision_listing() {
        insta::assert_snapshot!(init().listing(Nested::Table59), @r"
        18 fdivs
        20 fsubs
        21 fadds
        24 fres
        25 fmuls
        28 fmsubs
        29 fmadds
        30 fnmsubs
        31 fnmadds
        ");
    }
}
