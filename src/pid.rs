//! Reference-counted elementary stream filters of one device.
//!
//! The first few slots are reserved for the live streams (audio, video, PCR,
//! teletext, Dolby); the rest form a pool for everything else. A PID in a
//! live slot is routed to the decoder while it has a single user and moved
//! to the TS tap as soon as a second user (typically a recording) appears.

use log::{debug, error};

use crate::dmx::{Demux, DmxOutput, FilterHandle, PesFilter, PesType, PID_DISABLED};
use crate::error::PidError;

pub const MAX_PID_HANDLES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidKind {
    Audio,
    Video,
    Pcr,
    Teletext,
    Dolby,
    Other,
}

const FIRST_OTHER: usize = 5;

impl PidKind {
    fn slot(self) -> usize {
        match self {
            PidKind::Audio => 0,
            PidKind::Video => 1,
            PidKind::Pcr => 2,
            PidKind::Teletext => 3,
            PidKind::Dolby => 4,
            PidKind::Other => FIRST_OTHER,
        }
    }
}

/// Whether slot `index` feeds the decoder.
fn decoder_slot(index: usize) -> bool {
    index <= PidKind::Teletext.slot()
}

fn pes_type(index: usize) -> PesType {
    match index {
        0 => PesType::Audio,
        1 => PesType::Video,
        2 => PesType::Pcr,
        3 => PesType::Teletext,
        _ => PesType::Other,
    }
}

/// Result of [`PidTable::detach`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Detached {
    /// The video slot was closed; the decoder has to leave any play mode.
    pub video_released: bool,
}

#[derive(Default)]
struct PidSlot {
    pid: u16,
    used: u32,
    handle: Option<Box<dyn FilterHandle>>,
}

impl PidSlot {
    fn clear(&mut self) {
        self.pid = 0;
        self.used = 0;
        self.handle = None;
    }
}

pub struct PidTable {
    slots: Vec<PidSlot>,
}

impl Default for PidTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PidTable {
    pub fn new() -> Self {
        PidTable {
            slots: (0..MAX_PID_HANDLES).map(|_| PidSlot::default()).collect(),
        }
    }

    pub fn has_pid(&self, pid: u16) -> bool {
        pid != 0 && self.slots.iter().any(|s| s.used > 0 && s.pid == pid)
    }

    /// PID held by the fixed slot of `kind`; 0 for [`PidKind::Other`] or an
    /// empty slot.
    pub fn pid(&self, kind: PidKind) -> u16 {
        match kind {
            PidKind::Other => 0,
            _ => self.slots[kind.slot()].pid,
        }
    }

    /// Number of users of the fixed slot of `kind`.
    pub fn usage(&self, kind: PidKind) -> u32 {
        match kind {
            PidKind::Other => 0,
            _ => self.slots[kind.slot()].used,
        }
    }

    /// Registers one more user of `pid`. PID 0 means "no stream" and is
    /// accepted without touching the hardware.
    pub fn attach(&mut self, kind: PidKind, pid: u16, demux: &dyn Demux) -> Result<(), PidError> {
        if pid == 0 {
            return Ok(());
        }

        let mut existing = None;
        let mut free = None;
        if kind == PidKind::Pcr {
            // PCR is always addressed through its own slot
            let slot = &self.slots[kind.slot()];
            if slot.used > 0 && slot.pid == pid {
                existing = Some(kind.slot());
            }
        } else {
            for (i, slot) in self.slots.iter().enumerate() {
                if i == PidKind::Pcr.slot() {
                    continue;
                }
                if slot.used > 0 && slot.pid == pid {
                    existing = Some(i);
                } else if free.is_none() && i >= FIRST_OTHER && slot.used == 0 {
                    free = Some(i);
                }
            }
        }

        if let Some(n) = existing {
            self.slots[n].used += 1;
            if self.slots[n].used == 2 && decoder_slot(n) {
                debug!("PID {pid} has a second user, moving it to the TS tap");
                if let Err(e) = self.program(n, demux) {
                    self.slots[n].used -= 1;
                    return Err(e);
                }
            }
            return Ok(());
        }

        let n = match kind {
            PidKind::Other => free.ok_or_else(|| {
                error!("no free slot for PID {pid}");
                PidError::NoFreeSlot(pid)
            })?,
            _ => kind.slot(),
        };
        let slot = &mut self.slots[n];
        slot.pid = pid;
        slot.used = 1;
        if let Err(e) = self.program(n, demux) {
            error!("{e}");
            self.slots[n].clear();
            return Err(e);
        }
        Ok(())
    }

    /// Drops one user of `pid`. The filter is closed with the last one.
    pub fn detach(&mut self, kind: PidKind, pid: u16) -> Detached {
        if pid == 0 {
            return Detached::default();
        }
        let n = match kind {
            PidKind::Pcr => Some(kind.slot()).filter(|&n| self.slots[n].pid == pid),
            _ => self
                .slots
                .iter()
                .enumerate()
                .position(|(i, s)| i != PidKind::Pcr.slot() && s.used > 0 && s.pid == pid),
        };
        let Some(n) = n else {
            return Detached::default();
        };
        let slot = &mut self.slots[n];
        if slot.used == 0 {
            return Detached::default();
        }
        slot.used -= 1;
        if slot.used > 0 {
            return Detached::default();
        }

        let mut video_released = false;
        if let Some(mut handle) = slot.handle.take() {
            if let Err(e) = handle.stop() {
                error!("DMX_STOP failed for PID {pid}: {e}");
            }
            if decoder_slot(n) {
                let reset = PesFilter {
                    pid: PID_DISABLED,
                    output: DmxOutput::Decoder,
                    pes_type: pes_type(n),
                };
                if let Err(e) = handle.set_pes_filter(&reset) {
                    error!("DMX_SET_PES_FILTER failed for PID {PID_DISABLED}: {e}");
                }
                video_released = pes_type(n) == PesType::Video;
            }
        }
        slot.clear();
        Detached { video_released }
    }

    /// Points the fixed slot of `kind` at another PID, keeping its users.
    /// Returns `false` when the slot is empty or already carries `pid`.
    pub fn retarget(&mut self, kind: PidKind, pid: u16, demux: &dyn Demux) -> Result<bool, PidError> {
        let n = kind.slot();
        if kind == PidKind::Other || self.slots[n].pid == 0 || self.slots[n].pid == pid {
            return Ok(false);
        }
        self.slots[n].pid = pid;
        self.program(n, demux)?;
        Ok(true)
    }

    /// Opens the handle of slot `n` if needed and sets its PES filter.
    fn program(&mut self, n: usize, demux: &dyn Demux) -> Result<(), PidError> {
        let slot = &mut self.slots[n];
        let pid = slot.pid;
        if slot.handle.is_none() {
            let handle = demux.open_filter().map_err(|source| PidError::Open { pid, source })?;
            slot.handle = Some(handle);
        }
        let filter = PesFilter {
            pid,
            output: if decoder_slot(n) && slot.used <= 1 {
                DmxOutput::Decoder
            } else {
                DmxOutput::TsTap
            },
            pes_type: pes_type(n),
        };
        if let Some(handle) = slot.handle.as_mut() {
            handle
                .set_pes_filter(&filter)
                .map_err(|source| PidError::SetFilter { pid, source })?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        for (i, slot) in self.slots.iter().enumerate() {
            assert_eq!(slot.handle.is_some(), slot.used > 0, "slot {i}");
            if slot.used == 0 {
                assert_eq!(slot.pid, 0, "slot {i}");
            }
        }
    }
}
