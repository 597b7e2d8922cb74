use bit_field::BitField;
use bitflags::bitflags;
use x86::segmentation::SegmentSelector;
use x86_64::structures::DescriptorTablePointer;

bitflags! {
    /// Access rights for VMCS guest register states.
    ///
    /// The low 16 bits correspond to bits 23:8 of the upper 32 bits of a 64-bit
    /// segment descriptor. (SDM Vol. 3C, Section 24.4.1)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        /// Segment has been accessed (data/code) or is busy (TSS).
        const ACCESSED          = 1 << 0;
        /// Writable data / readable code.
        const WRITABLE          = 1 << 1;
        /// Expand-down data / conforming code.
        const CONFORMING        = 1 << 2;
        /// Code segment.
        const EXECUTABLE        = 1 << 3;
        /// Code or data segment (not a system segment).
        const CODE_DATA         = 1 << 4;
        const DPL_RING_3        = 3 << 5;
        const PRESENT           = 1 << 7;
        /// Available for use by system software.
        const AVAILABLE         = 1 << 12;
        /// 64-bit code segment.
        const LONG_MODE         = 1 << 13;
        /// Default operation size is 32-bit.
        const DB                = 1 << 14;
        /// Limit is in 4 KiB units.
        const GRANULARITY       = 1 << 15;
        /// The segment register is unusable.
        const UNUSABLE          = 1 << 16;

        /// Busy 64-bit TSS type.
        const TSS_BUSY          = 0b1011;
        /// Available 64-bit TSS type.
        const TSS_AVAIL         = 0b1001;
    }
}

impl SegmentAccessRights {
    const TYPE_MASK: u32 = 0xf;

    /// Descriptor privilege level.
    pub fn dpl(&self) -> u8 {
        self.bits().get_bits(5..7) as u8
    }

    /// Access rights as encoded in bits 40..56 of a descriptor.
    pub fn from_descriptor(desc: u64) -> Self {
        Self::from_bits_truncate(desc.get_bits(40..56) as u32 & 0xf0ff)
    }

    /// Rewrite the type field of a raw descriptor, e.g. to drop a TSS busy flag.
    pub fn set_descriptor_type(desc: &mut u64, type_bits: Self) {
        desc.set_bits(40..44, (type_bits.bits() & Self::TYPE_MASK) as u64);
    }

    pub fn is_system(&self) -> bool {
        !self.contains(Self::CODE_DATA)
    }
}

/// A segment register decoded from a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: SegmentSelector,
    pub base: u64,
    pub limit: u32,
    pub access_rights: SegmentAccessRights,
}

impl Segment {
    /// The state VMX expects for a null or unused segment register.
    pub fn invalid() -> Self {
        Self {
            selector: SegmentSelector::from_raw(0),
            base: 0,
            limit: 0,
            access_rights: SegmentAccessRights::UNUSABLE,
        }
    }

    /// Decodes `selector` from the GDT referenced by `gdt`.
    ///
    /// Null selectors and LDT-relative selectors yield [`Segment::invalid`].
    pub fn from_selector(selector: SegmentSelector, gdt: &DescriptorTablePointer) -> Self {
        let index = selector.index() as usize;
        let entry_count = (gdt.limit as usize + 1) / core::mem::size_of::<u64>();
        let table_indicator = selector.bits().get_bit(2);
        if index == 0 || table_indicator || index >= entry_count {
            return Self {
                selector,
                ..Self::invalid()
            };
        }

        let table =
            unsafe { core::slice::from_raw_parts(gdt.base.as_ptr::<u64>(), entry_count) };
        let entry = table[index];
        let access_rights = SegmentAccessRights::from_descriptor(entry);

        let mut base = entry.get_bits(16..40) | entry.get_bits(56..64) << 24;
        if access_rights.is_system() && index + 1 < entry_count {
            // 16-byte system descriptor: upper half of the base in the next slot.
            base |= table[index + 1].get_bits(0..32) << 32;
        }

        let mut limit = (entry.get_bits(0..16) | entry.get_bits(48..52) << 16) as u32;
        if access_rights.contains(SegmentAccessRights::GRANULARITY) {
            limit = (limit << 12) | 0xfff;
        }

        let access_rights = if access_rights.contains(SegmentAccessRights::PRESENT) {
            access_rights
        } else {
            access_rights | SegmentAccessRights::UNUSABLE
        };

        Self {
            selector,
            base,
            limit,
            access_rights,
        }
    }
}
