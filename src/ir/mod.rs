//! Intermediate representation shared between the frontend and the backend.

mod block;
pub mod opt;

pub use block::{Arg, Block, Inst, InstRef, Opcode, Terminal, Type};

/// ARM condition codes, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    EQ,
    NE,
    CS,
    CC,
    MI,
    PL,
    VS,
    VC,
    HI,
    LS,
    GE,
    LT,
    GT,
    LE,
    AL,
}

impl Cond {
    pub fn from_bits(bits: u32) -> Cond {
        match bits & 0xF {
            0x0 => Cond::EQ,
            0x1 => Cond::NE,
            0x2 => Cond::CS,
            0x3 => Cond::CC,
            0x4 => Cond::MI,
            0x5 => Cond::PL,
            0x6 => Cond::VS,
            0x7 => Cond::VC,
            0x8 => Cond::HI,
            0x9 => Cond::LS,
            0xA => Cond::GE,
            0xB => Cond::LT,
            0xC => Cond::GT,
            0xD => Cond::LE,
            _ => Cond::AL,
        }
    }
}

/// FPSCR bits that affect code generation, carried in the location
/// descriptor so that blocks compiled under different FP modes never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fpscr(pub u32);

/// RMode, FZ and DN.
pub const FPSCR_MODE_MASK: u32 = 0x03C0_0000;

impl Fpscr {
    /// Rounding mode, FPSCR\[23:22\].
    pub fn rmode(self) -> u32 {
        (self.0 >> 22) & 0b11
    }

    /// Flush-to-zero enabled.
    pub fn ftz(self) -> bool {
        self.0 & (1 << 24) != 0
    }

    /// Default-NaN enabled.
    pub fn dn(self) -> bool {
        self.0 & (1 << 25) != 0
    }
}

/// A 64-bit opaque value uniquely identifying a guest execution point: the
/// guest PC plus every mode bit that affects decode or codegen. Two
/// descriptors compare equal iff they produce identical translated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationDescriptor(u64);

const THUMB_BIT: u64 = 1 << 32;
const FPSCR_SHIFT: u32 = 11; // moves FPSCR[25:22] to descriptor bits 33..=36

impl LocationDescriptor {
    pub fn new(pc: u32, thumb: bool, fpscr: u32) -> Self {
        let mut value = pc as u64;
        if thumb {
            value |= THUMB_BIT;
        }
        value |= ((fpscr & FPSCR_MODE_MASK) as u64) << FPSCR_SHIFT;
        Self(value)
    }

    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn pc(self) -> u32 {
        self.0 as u32
    }

    pub fn thumb(self) -> bool {
        self.0 & THUMB_BIT != 0
    }

    pub fn fpscr(self) -> Fpscr {
        Fpscr(((self.0 >> FPSCR_SHIFT) as u32) & FPSCR_MODE_MASK)
    }

    /// Mode bits without the PC, for rebuilding a descriptor around a
    /// dynamically computed branch target.
    pub fn upper_half(self) -> u64 {
        self.0 & !0xFFFF_FFFF
    }

    pub fn advance_pc(self, amount: i32) -> Self {
        let pc = (self.pc() as i64 + amount as i64) as u32;
        Self(self.upper_half() | pc as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_separates_fp_modes() {
        let plain = LocationDescriptor::new(0x1000, false, 0);
        let ftz = LocationDescriptor::new(0x1000, false, 1 << 24);
        assert_ne!(plain, ftz);
        assert_eq!(plain.pc(), ftz.pc());
        assert!(ftz.fpscr().ftz());
        assert!(!ftz.fpscr().dn());
    }

    #[test]
    fn advance_pc_preserves_mode_bits() {
        let desc = LocationDescriptor::new(0x1000, false, 3 << 22);
        let next = desc.advance_pc(8);
        assert_eq!(next.pc(), 0x1008);
        assert_eq!(next.upper_half(), desc.upper_half());
        assert_eq!(next.fpscr().rmode(), 3);
    }
}
