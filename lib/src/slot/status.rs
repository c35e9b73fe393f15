use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Boolean part of the status of a slot.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SlotFlags: u32 {
        /// The slot has been handed out by `get_unused`.
        const ON_USED = 0x0001;
        /// The payload of the slot has not been produced yet.
        const NOT_READY = 0x0002;
        /// The codec keeps the slot as a reference picture.
        const CODEC_USE = 0x0004;
        /// The slot is the current output target of the hardware.
        const HAL_OUTPUT = 0x0008;
        const EOS = 0x0010;
        const HAS_BUFFER = 0x0020;
        const HAS_FRAME = 0x0040;
    }
}

/// Returned when a usage counter would go below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Underflow;

/// Status of a slot: flags, plus counters of non-exclusive holders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStatus {
    flags: SlotFlags,
    hal_use: u8,
    queue_use: u8,
}

impl SlotStatus {
    pub fn flags(&self) -> SlotFlags {
        self.flags
    }

    pub fn contains(&self, flags: SlotFlags) -> bool {
        self.flags.contains(flags)
    }

    pub(super) fn insert(&mut self, flags: SlotFlags) {
        self.flags.insert(flags);
    }

    pub(super) fn remove(&mut self, flags: SlotFlags) {
        self.flags.remove(flags);
    }

    pub(super) fn set(&mut self, flags: SlotFlags, value: bool) {
        self.flags.set(flags, value);
    }

    pub fn is_used(&self) -> bool {
        self.contains(SlotFlags::ON_USED)
    }

    pub fn is_ready(&self) -> bool {
        !self.contains(SlotFlags::NOT_READY)
    }

    /// Number of hardware-side holders.
    pub fn hal_use(&self) -> u8 {
        self.hal_use
    }

    /// Number of queues holding the slot.
    pub fn queue_use(&self) -> u8 {
        self.queue_use
    }

    pub(super) fn inc_hal_use(&mut self) {
        self.hal_use = self.hal_use.saturating_add(1);
    }

    pub(super) fn dec_hal_use(&mut self) -> Result<(), Underflow> {
        self.hal_use = self.hal_use.checked_sub(1).ok_or(Underflow)?;
        Ok(())
    }

    pub(super) fn inc_queue_use(&mut self) {
        self.queue_use = self.queue_use.saturating_add(1);
    }

    pub(super) fn dec_queue_use(&mut self) -> Result<(), Underflow> {
        self.queue_use = self.queue_use.checked_sub(1).ok_or(Underflow)?;
        Ok(())
    }

    /// An allocated slot nobody has an interest in anymore can return to the
    /// free pool.
    pub fn is_reclaimable(&self) -> bool {
        self.is_used()
            && !self
                .flags
                .intersects(SlotFlags::NOT_READY | SlotFlags::CODEC_USE | SlotFlags::HAL_OUTPUT)
            && self.hal_use == 0
            && self.queue_use == 0
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (SlotFlags::ON_USED, "used"),
            (SlotFlags::NOT_READY, "not_ready"),
            (SlotFlags::CODEC_USE, "codec"),
            (SlotFlags::HAL_OUTPUT, "hal_out"),
            (SlotFlags::EOS, "eos"),
            (SlotFlags::HAS_BUFFER, "buf"),
            (SlotFlags::HAS_FRAME, "frm"),
        ];

        write!(f, "{:#06x} hal {} queue {} [", self.flags.bits(), self.hal_use, self.queue_use)?;
        let mut first = true;
        for (flag, name) in names {
            if self.flags.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str("]")
    }
}

/// Operations recorded into the history of a slot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOp {
    Init,
    GetUnused,
    SetFlag(super::SlotUsage),
    ClrFlag(super::SlotUsage),
    Enqueue(super::SlotQueue),
    Dequeue(super::SlotQueue),
    SetEos,
    SetFrame,
    SetBuffer,
    DefaultInfo,
    Reclaim,
    Reset,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotRecord {
    pub index: usize,
    pub op: SlotOp,
    pub before: SlotStatus,
    pub after: SlotStatus,
}

impl fmt::Display for SlotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {:<3} {:<20} {} -> {}",
            self.index,
            format!("{:?}", self.op),
            self.before,
            self.after
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut status = SlotStatus::default();
        assert_eq!(status.dec_hal_use(), Err(Underflow));
        assert_eq!(status.dec_queue_use(), Err(Underflow));

        for _ in 0..300 {
            status.inc_hal_use();
        }
        assert_eq!(status.hal_use(), u8::MAX);

        status.inc_queue_use();
        assert_eq!(status.dec_queue_use(), Ok(()));
        assert_eq!(status.queue_use(), 0);
    }

    #[test]
    fn test_reclaimable() {
        let mut status = SlotStatus::default();
        // Free slots are never reclaimed.
        assert!(!status.is_reclaimable());

        status.insert(SlotFlags::ON_USED | SlotFlags::NOT_READY | SlotFlags::HAS_FRAME);
        assert!(!status.is_reclaimable());
        status.remove(SlotFlags::NOT_READY);
        assert!(status.is_reclaimable());

        status.inc_hal_use();
        assert!(!status.is_reclaimable());
        status.dec_hal_use().unwrap();
        status.insert(SlotFlags::CODEC_USE);
        assert!(!status.is_reclaimable());
    }

    #[test]
    fn test_display() {
        let mut status = SlotStatus::default();
        status.insert(SlotFlags::ON_USED | SlotFlags::NOT_READY);
        status.inc_queue_use();
        assert_eq!(status.to_string(), "0x0003 hal 0 queue 1 [used not_ready]");
    }
}
