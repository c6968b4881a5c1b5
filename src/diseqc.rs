//! Satellite switch control.
//!
//! Which commands a given source/frequency/polarization needs is decided by
//! an external [`DiseqcSource`]; the tuner only replays the sequence.

use crate::channel::{Polarization, Source};

/// Maximum length of a DiSEqC master command message.
pub const DISEQC_MAX_MSG: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiseqcAction {
    ToneOff,
    ToneOn,
    Voltage13,
    Voltage18,
    MiniA,
    MiniB,
    /// Raw master command bytes; anything past [`DISEQC_MAX_MSG`] is dropped.
    Codes(Vec<u8>),
}

/// A resolved switch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiseqcEntry {
    pub actions: Vec<DiseqcAction>,
    /// Local oscillator frequency of the LNB behind this switch position, MHz.
    pub lof: u32,
}

pub trait DiseqcSource: Send + Sync {
    fn resolve(
        &self,
        source: Source,
        frequency: u32,
        polarization: Polarization,
    ) -> Option<DiseqcEntry>;
}

/// A source with no entries. Only useful with switch automation disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiseqc;

impl DiseqcSource for NoDiseqc {
    fn resolve(&self, _: Source, _: u32, _: Polarization) -> Option<DiseqcEntry> {
        None
    }
}
