pub mod arbiter;
pub mod channel;
pub mod ci;
pub mod config;
pub mod decoder;
pub mod device;
pub mod diseqc;
pub mod dmx;
pub mod error;
pub mod frontend;
pub mod pid;
pub mod transfer;
pub mod tuner;

#[cfg(test)]
pub mod testing;
