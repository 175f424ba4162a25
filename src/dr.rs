//! x86 debug register layout
//!
//! DR0-DR3 hold breakpoint addresses, DR6 reports what triggered the last
//! debug exception and DR7 enables the four slots and sets their condition
//! and length. Fields are accessed with explicit shifts and masks on the raw
//! `u64`, never through a struct overlay.
//!
//! Refs:
//! - Intel SDM Vol. 3B, 17.2 "Debug Registers"

use std::fmt;
use std::str::FromStr;

pub const SLOT_COUNT: usize = 4;

const TWO_BITS: u64 = 0b11;

const LOCAL_EXACT_BIT: u32 = 8;
const GLOBAL_EXACT_BIT: u32 = 9;
const RTM_BIT: u32 = 11;
const GENERAL_DETECT_BIT: u32 = 13;

/// One of the four hardware breakpoint slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Dr0 = 0,
    Dr1 = 1,
    Dr2 = 2,
    Dr3 = 3,
}

impl Slot {
    /// All slots in allocation order
    pub const ALL: [Slot; SLOT_COUNT] = [Slot::Dr0, Slot::Dr1, Slot::Dr2, Slot::Dr3];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    fn local_enable_shift(self) -> u32 {
        self as u32 * 2
    }

    fn global_enable_shift(self) -> u32 {
        self as u32 * 2 + 1
    }

    fn condition_shift(self) -> u32 {
        16 + self as u32 * 4
    }

    fn length_shift(self) -> u32 {
        18 + self as u32 * 4
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DR{}", self.index())
    }
}

/// Access type that triggers a slot (the R/Wn field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    /// Break on instruction execution only
    Execute = 0b00,
    /// Break on data writes only
    Write = 0b01,
    /// Break on I/O reads or writes, needs CR4.DE
    IoReadWrite = 0b10,
    /// Break on data reads or writes but not instruction fetches
    ReadWrite = 0b11,
}

impl Condition {
    pub fn bits(self) -> u64 {
        self as u64
    }

    /// Decodes the low two bits of `bits`
    pub fn from_bits(bits: u64) -> Self {
        match bits & TWO_BITS {
            0b00 => Self::Execute,
            0b01 => Self::Write,
            0b10 => Self::IoReadWrite,
            _ => Self::ReadWrite,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Execute => "execute",
            Self::Write => "write",
            Self::IoReadWrite => "io",
            Self::ReadWrite => "rw",
        };
        f.write_str(name)
    }
}

impl FromStr for Condition {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "execute" | "x" => Ok(Self::Execute),
            "write" | "w" => Ok(Self::Write),
            "io" => Ok(Self::IoReadWrite),
            "rw" | "readwrite" => Ok(Self::ReadWrite),
            _ => Err("no such condition"),
        }
    }
}

/// Size of the watched location (the LENn field).
///
/// The raw encoding is not ordered by size: `10` is 8 bytes and `11` is 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Length {
    One = 0b00,
    Two = 0b01,
    Eight = 0b10,
    Four = 0b11,
}

impl Length {
    pub fn bits(self) -> u64 {
        self as u64
    }

    /// Decodes the low two bits of `bits`
    pub fn from_bits(bits: u64) -> Self {
        match bits & TWO_BITS {
            0b00 => Self::One,
            0b01 => Self::Two,
            0b10 => Self::Eight,
            _ => Self::Four,
        }
    }

    pub fn bytes(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

/// `DR6` debug status register.
///
/// Only modelled; nothing in this crate acts on it.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Dr6(pub u64);

impl Dr6 {
    /// B0 through B3 (bits 0 through 3): conditions met at the last #DB
    pub fn breakpoint_condition(self) -> u8 {
        (self.0 & 0b1111) as u8
    }

    /// Whether the condition for `slot` was met
    pub fn triggered(self, slot: Slot) -> bool {
        (self.0 >> slot.index()) & 1 != 0
    }

    /// BD (bit 13): next instruction accesses a debug register
    pub fn debug_register_access_detected(self) -> bool {
        (self.0 >> 13) & 1 != 0
    }

    /// BS (bit 14): single-step trap
    pub fn single_step(self) -> bool {
        (self.0 >> 14) & 1 != 0
    }

    /// BT (bit 15): task switch
    pub fn task_switch(self) -> bool {
        (self.0 >> 15) & 1 != 0
    }

    /// RTM (bit 16), active low
    pub fn restricted_transactional_memory(self) -> bool {
        (self.0 >> 16) & 1 != 0
    }
}

impl fmt::Debug for Dr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dr6")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("b", &format_args!("{:04b}", self.breakpoint_condition()))
            .field("bd", &self.debug_register_access_detected())
            .field("bs", &self.single_step())
            .field("bt", &self.task_switch())
            .finish()
    }
}

/// `DR7` debug control register
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Dr7(pub u64);

impl Dr7 {
    fn bit(self, shift: u32) -> bool {
        (self.0 >> shift) & 1 != 0
    }

    fn set_bit(&mut self, shift: u32, value: bool) {
        if value {
            self.0 |= 1 << shift;
        } else {
            self.0 &= !(1 << shift);
        }
    }

    fn field(self, shift: u32) -> u64 {
        (self.0 >> shift) & TWO_BITS
    }

    fn set_field(&mut self, shift: u32, value: u64) {
        self.0 = (self.0 & !(TWO_BITS << shift)) | ((value & TWO_BITS) << shift);
    }

    /// Ln flag (bits 0, 2, 4, 6)
    pub fn local_enabled(self, slot: Slot) -> bool {
        self.bit(slot.local_enable_shift())
    }

    pub fn set_local_enabled(&mut self, slot: Slot, enabled: bool) {
        self.set_bit(slot.local_enable_shift(), enabled)
    }

    /// Gn flag (bits 1, 3, 5, 7)
    pub fn global_enabled(self, slot: Slot) -> bool {
        self.bit(slot.global_enable_shift())
    }

    pub fn set_global_enabled(&mut self, slot: Slot, enabled: bool) {
        self.set_bit(slot.global_enable_shift(), enabled)
    }

    /// R/Wn field (bits 16-17, 20-21, 24-25, 28-29)
    pub fn condition(self, slot: Slot) -> Condition {
        Condition::from_bits(self.field(slot.condition_shift()))
    }

    pub fn set_condition(&mut self, slot: Slot, condition: Condition) {
        self.set_field(slot.condition_shift(), condition.bits())
    }

    /// LENn field (bits 18-19, 22-23, 26-27, 30-31)
    pub fn length(self, slot: Slot) -> Length {
        Length::from_bits(self.field(slot.length_shift()))
    }

    pub fn set_length(&mut self, slot: Slot, length: Length) {
        self.set_field(slot.length_shift(), length.bits())
    }

    /// LE flag (bit 8)
    pub fn local_exact(self) -> bool {
        self.bit(LOCAL_EXACT_BIT)
    }

    pub fn set_local_exact(&mut self, value: bool) {
        self.set_bit(LOCAL_EXACT_BIT, value)
    }

    /// GE flag (bit 9)
    pub fn global_exact(self) -> bool {
        self.bit(GLOBAL_EXACT_BIT)
    }

    pub fn set_global_exact(&mut self, value: bool) {
        self.set_bit(GLOBAL_EXACT_BIT, value)
    }

    /// RTM flag (bit 11)
    pub fn restricted_transactional_memory(self) -> bool {
        self.bit(RTM_BIT)
    }

    /// GD flag (bit 13)
    pub fn general_detect(self) -> bool {
        self.bit(GENERAL_DETECT_BIT)
    }

    pub fn set_general_detect(&mut self, value: bool) {
        self.set_bit(GENERAL_DETECT_BIT, value)
    }

    /// First slot, in ascending order, whose local enable flag is clear
    pub fn find_free_slot(self) -> Option<Slot> {
        Slot::ALL.into_iter().find(|&slot| !self.local_enabled(slot))
    }

    /// Locally enabled slots with their decoded condition and length
    pub fn armed_slots(self) -> impl Iterator<Item = (Slot, Condition, Length)> {
        Slot::ALL
            .into_iter()
            .filter(move |&slot| self.local_enabled(slot))
            .map(move |slot| (slot, self.condition(slot), self.length(slot)))
    }
}

impl fmt::Debug for Dr7 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Dr7");
        dbg.field("raw", &format_args!("{:#x}", self.0));
        for (slot, condition, length) in self.armed_slots() {
            dbg.field(
                &format!("dr{}", slot.index()),
                &format_args!("{} {}B", condition, length.bytes()),
            );
        }
        dbg.finish()
    }
}

/// The debug registers of one thread, as read from or written to its context
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugContext {
    pub address: [u64; SLOT_COUNT],
    pub status: Dr6,
    pub control: Dr7,
}

impl DebugContext {
    pub fn find_free_slot(&self) -> Option<Slot> {
        self.control.find_free_slot()
    }

    /// Arms `slot`. Fields of the other slots and the global flags are kept.
    pub fn encode_slot(&mut self, slot: Slot, address: u64, condition: Condition, length: Length) {
        self.address[slot.index()] = address;
        self.control.set_local_enabled(slot, true);
        self.control.set_condition(slot, condition);
        self.control.set_length(slot, length);
    }

    /// Disarms `slot` and zeroes its condition, length and address
    pub fn clear_slot(&mut self, slot: Slot) {
        self.address[slot.index()] = 0;
        self.control.set_local_enabled(slot, false);
        self.control.set_condition(slot, Condition::Execute);
        self.control.set_length(slot, Length::One);
    }
}
