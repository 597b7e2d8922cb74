//! Memory type range registers, read once to pick EPT memory types.

use alloc::vec::Vec;

use bit_field::BitField;

use crate::hal::VmxArch;
use crate::msr::Msr;

numeric_enum_macro::numeric_enum! {
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Memory types shared by MTRRs, PAT and EPT leaf entries. (SDM Vol. 3A, Section 12.3)
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}
}

/// End of the first MiB, described by the fixed-range MTRRs.
const FIXED_RANGE_END: u64 = 0x10_0000;

/// Fixed-range MTRRs as (register, first address, bytes per field).
/// Each register holds eight one-byte types. (SDM Vol. 3A, Section 12.11.2.2)
fn fixed_range_registers() -> impl Iterator<Item = (u32, u64, u64)> {
    [
        (Msr::IA32_MTRR_FIX64K_00000 as u32, 0, 0x1_0000),
        (Msr::IA32_MTRR_FIX16K_80000 as u32, 0x8_0000, 0x4000),
        (Msr::IA32_MTRR_FIX16K_A0000 as u32, 0xa_0000, 0x4000),
    ]
    .into_iter()
    .chain((0..8u32).map(|n| (Msr::mtrr_fix4k(n), 0xc_0000 + n as u64 * 0x8000, 0x1000)))
}

/// One enabled variable-range MTRR, or one field of a fixed-range MTRR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrRange {
    pub base: u64,
    pub size: u64,
    pub mem_type: MemoryType,
}

impl MtrrRange {
    fn overlaps(&self, base: u64, size: u64) -> bool {
        self.base < base + size && base < self.base + self.size
    }
}

/// Snapshot of the MTRR configuration of the current processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtrrData {
    pub enabled: bool,
    pub fixed_enabled: bool,
    pub default_type: MemoryType,
    /// The 88 fixed ranges of the first MiB, empty unless `fixed_enabled`.
    pub fixed: Vec<MtrrRange>,
    pub variable: Vec<MtrrRange>,
}

impl MtrrData {
    /// MTRRs switched off: everything is uncacheable.
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            fixed_enabled: false,
            default_type: MemoryType::Uncacheable,
            fixed: Vec::new(),
            variable: Vec::new(),
        }
    }

    /// Read IA32_MTRRCAP, IA32_MTRR_DEF_TYPE, the fixed ranges and the
    /// variable-range pairs.
    ///
    /// `max_phys_addr` bounds the range masks.
    pub fn read<A: VmxArch>(max_phys_addr: u8) -> Self {
        let cap = Msr::IA32_MTRRCAP.read::<A>();
        let def_type = Msr::IA32_MTRR_DEF_TYPE.read::<A>();
        let phys_mask = (1u64 << max_phys_addr) - 1;

        let variable = (0..cap.get_bits(0..8) as u32)
            .filter_map(|n| {
                let base = A::rdmsr(Msr::mtrr_physbase(n));
                let mask = A::rdmsr(Msr::mtrr_physmask(n));
                if !mask.get_bit(11) {
                    return None;
                }
                let mask = mask & phys_mask & !0xfff;
                let mem_type = MemoryType::try_from(base.get_bits(0..8) as u8)
                    .unwrap_or(MemoryType::Uncacheable);
                Some(MtrrRange {
                    base: base & mask,
                    size: (!mask & phys_mask) + 1,
                    mem_type,
                })
            })
            .collect();

        let fixed_enabled = cap.get_bit(8) && def_type.get_bit(10);
        let fixed = if fixed_enabled {
            fixed_range_registers()
                .flat_map(|(msr, start, unit)| {
                    let types = A::rdmsr(msr);
                    (0..8usize).map(move |i| MtrrRange {
                        base: start + i as u64 * unit,
                        size: unit,
                        mem_type: MemoryType::try_from(types.get_bits(i * 8..(i + 1) * 8) as u8)
                            .unwrap_or(MemoryType::Uncacheable),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            enabled: def_type.get_bit(11),
            fixed_enabled,
            default_type: MemoryType::try_from(def_type.get_bits(0..8) as u8)
                .unwrap_or(MemoryType::Uncacheable),
            fixed,
            variable,
        }
    }

    /// Effective memory type of `[base, base + size)`. (SDM Vol. 3A, Section 12.11.4.1)
    pub fn memory_type(&self, base: u64, size: u64) -> MemoryType {
        if !self.enabled {
            return MemoryType::Uncacheable;
        }
        // The fixed ranges override the variable ones in the first MiB. A
        // query spanning several fixed types has no single exact type.
        if self.fixed_enabled && base < FIXED_RANGE_END {
            let mut types = self
                .fixed
                .iter()
                .filter(|r| r.overlaps(base, size))
                .map(|r| r.mem_type);
            return match types.next() {
                Some(first) if base + size <= FIXED_RANGE_END && types.all(|t| t == first) => {
                    first
                }
                _ => MemoryType::Uncacheable,
            };
        }

        let mut result: Option<MemoryType> = None;
        for range in self.variable.iter().filter(|r| r.overlaps(base, size)) {
            if range.mem_type == MemoryType::Uncacheable {
                return MemoryType::Uncacheable;
            }
            // WT wins over WB; otherwise the lowest encoding is the safest.
            result = Some(match result {
                Some(current) => current.min(range.mem_type),
                None => range.mem_type,
            });
        }
        result.unwrap_or(self.default_type)
    }
}
