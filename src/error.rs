use std::io;

use thiserror::Error;

use crate::channel::DeliverySystem;

/// Reasons a single tune attempt is abandoned.
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("too many tuning commands on frontend {0}")]
    TooManyCommands(usize),

    #[error("frontend {frontend}: {op} failed: {source}")]
    Io {
        frontend: usize,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no DiSEqC parameters found for transponder {0}")]
    NoDiseqcEntry(u32),

    #[error("frontend {frontend}: {parameter} {value} out of range")]
    OutOfRange {
        frontend: usize,
        parameter: &'static str,
        value: u32,
    },

    #[error("frontend {0} doesn't provide DVB-S2")]
    S2NotSupported(usize),

    #[error("attempt to set channel with unsupported delivery system {0}")]
    UnsupportedDeliverySystem(DeliverySystem),
}

#[derive(Debug, Error)]
pub enum PidError {
    #[error("can't open filter handle for PID {pid}: {source}")]
    Open {
        pid: u16,
        #[source]
        source: io::Error,
    },

    #[error("can't set PES filter for PID {pid}: {source}")]
    SetFilter {
        pid: u16,
        #[source]
        source: io::Error,
    },

    #[error("no free slot for PID {0}")]
    NoFreeSlot(u16),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} has no tuner")]
    NoTuner(usize),

    #[error("failed to set PIDs for channel {channel} on device {device}: {source}")]
    Pid {
        channel: u32,
        device: usize,
        #[source]
        source: PidError,
    },

    #[error("can't open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
