//! Simulated hardware and collaborators for unit tests.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::{Channel, DeliverySystem, Polarization, Source};
use crate::ci::DecryptionSlot;
use crate::config::SwitchConfig;
use crate::decoder::Decoder;
use crate::device::{Device, DeviceParts};
use crate::diseqc::{DiseqcEntry, DiseqcSource, NoDiseqc};
use crate::dmx::{Demux, FilterHandle, PesFilter};
use crate::frontend::{Burst, CommandSeq, Frontend, FrontendStatus, Tone, Voltage};
use crate::transfer::{TransferPath, TransferRequest};
use crate::tuner::Tuner;

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn io_failure() -> io::Error {
    io::Error::from_raw_os_error(libc::EIO)
}

#[derive(Default)]
struct FrontendHw {
    status: FrontendStatus,
    fail_set_properties: bool,
    batches: Vec<CommandSeq>,
    tones: Vec<Tone>,
    voltages: Vec<Voltage>,
    bursts: Vec<Burst>,
    master_cmds: Vec<Vec<u8>>,
}

/// A frontend whose status is set by the test. Clones share state.
#[derive(Clone, Default)]
pub struct FakeFrontend {
    hw: Arc<Mutex<FrontendHw>>,
}

impl FakeFrontend {
    pub fn set_status(&self, status: FrontendStatus) {
        self.hw.lock().status = status;
    }

    pub fn fail_set_properties(&self, fail: bool) {
        self.hw.lock().fail_set_properties = fail;
    }

    pub fn batches(&self) -> Vec<CommandSeq> {
        self.hw.lock().batches.clone()
    }

    pub fn tones(&self) -> Vec<Tone> {
        self.hw.lock().tones.clone()
    }

    pub fn voltages(&self) -> Vec<Voltage> {
        self.hw.lock().voltages.clone()
    }

    pub fn bursts(&self) -> Vec<Burst> {
        self.hw.lock().bursts.clone()
    }

    pub fn master_cmds(&self) -> Vec<Vec<u8>> {
        self.hw.lock().master_cmds.clone()
    }
}

impl Frontend for FakeFrontend {
    fn read_status(&mut self, timeout: Duration) -> io::Result<FrontendStatus> {
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Ok(self.hw.lock().status)
    }

    fn set_properties(&mut self, seq: &CommandSeq) -> io::Result<()> {
        let mut hw = self.hw.lock();
        if hw.fail_set_properties {
            return Err(io_failure());
        }
        hw.batches.push(seq.clone());
        Ok(())
    }

    fn set_tone(&mut self, tone: Tone) -> io::Result<()> {
        self.hw.lock().tones.push(tone);
        Ok(())
    }

    fn set_voltage(&mut self, voltage: Voltage) -> io::Result<()> {
        self.hw.lock().voltages.push(voltage);
        Ok(())
    }

    fn send_burst(&mut self, burst: Burst) -> io::Result<()> {
        self.hw.lock().bursts.push(burst);
        Ok(())
    }

    fn send_master_cmd(&mut self, msg: &[u8]) -> io::Result<()> {
        self.hw.lock().master_cmds.push(msg.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct DemuxHw {
    opened: usize,
    open_handles: usize,
    stops: usize,
    filters: Vec<PesFilter>,
    fail_open: bool,
    fail_set_filter: bool,
}

/// A demux recording every filter it was asked to set.
#[derive(Clone, Default)]
pub struct FakeDemux {
    hw: Arc<Mutex<DemuxHw>>,
}

impl FakeDemux {
    pub fn opened(&self) -> usize {
        self.hw.lock().opened
    }

    pub fn open_handles(&self) -> usize {
        self.hw.lock().open_handles
    }

    pub fn stops(&self) -> usize {
        self.hw.lock().stops
    }

    pub fn filters(&self) -> Vec<PesFilter> {
        self.hw.lock().filters.clone()
    }

    pub fn fail_open(&self, fail: bool) {
        self.hw.lock().fail_open = fail;
    }

    pub fn fail_set_filter(&self, fail: bool) {
        self.hw.lock().fail_set_filter = fail;
    }
}

impl Demux for FakeDemux {
    fn open_filter(&self) -> io::Result<Box<dyn FilterHandle>> {
        let mut hw = self.hw.lock();
        if hw.fail_open {
            return Err(io_failure());
        }
        hw.opened += 1;
        hw.open_handles += 1;
        Ok(Box::new(FakeFilter {
            hw: Arc::clone(&self.hw),
        }))
    }
}

struct FakeFilter {
    hw: Arc<Mutex<DemuxHw>>,
}

impl FilterHandle for FakeFilter {
    fn set_pes_filter(&mut self, filter: &PesFilter) -> io::Result<()> {
        let mut hw = self.hw.lock();
        if hw.fail_set_filter {
            return Err(io_failure());
        }
        hw.filters.push(*filter);
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        self.hw.lock().stops += 1;
        Ok(())
    }
}

impl Drop for FakeFilter {
    fn drop(&mut self) {
        self.hw.lock().open_handles -= 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderCall {
    Mute(bool),
    Blank(bool),
    ClearBuffers,
    AvSync(bool),
    AudioBypass(bool),
    ReturnToLive,
}

/// A decoder recording its calls. Audio bypass can be made to fail.
#[derive(Clone, Default)]
pub struct FakeDecoder {
    calls: Arc<Mutex<Vec<DecoderCall>>>,
    bypass_unsupported: Arc<Mutex<bool>>,
}

impl FakeDecoder {
    pub fn calls(&self) -> Vec<DecoderCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn set_bypass_unsupported(&self, unsupported: bool) {
        *self.bypass_unsupported.lock() = unsupported;
    }
}

impl Decoder for FakeDecoder {
    fn set_mute(&mut self, on: bool) -> io::Result<()> {
        self.calls.lock().push(DecoderCall::Mute(on));
        Ok(())
    }

    fn set_blank(&mut self, on: bool) -> io::Result<()> {
        self.calls.lock().push(DecoderCall::Blank(on));
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.calls.lock().push(DecoderCall::ClearBuffers);
        Ok(())
    }

    fn set_av_sync(&mut self, on: bool) -> io::Result<()> {
        self.calls.lock().push(DecoderCall::AvSync(on));
        Ok(())
    }

    fn set_audio_bypass(&mut self, on: bool) -> io::Result<()> {
        self.calls.lock().push(DecoderCall::AudioBypass(on));
        if on && *self.bypass_unsupported.lock() {
            return Err(io_failure());
        }
        Ok(())
    }

    fn return_to_live(&mut self) -> io::Result<()> {
        self.calls.lock().push(DecoderCall::ReturnToLive);
        Ok(())
    }
}

/// Resolves every query to the same entry and counts the queries.
pub struct FakeDiseqc {
    entry: DiseqcEntry,
    queries: Mutex<usize>,
}

impl FakeDiseqc {
    pub fn with_entry(entry: DiseqcEntry) -> Self {
        FakeDiseqc {
            entry,
            queries: Mutex::new(0),
        }
    }

    pub fn queries(&self) -> usize {
        *self.queries.lock()
    }
}

impl DiseqcSource for FakeDiseqc {
    fn resolve(&self, _: Source, _: u32, _: Polarization) -> Option<DiseqcEntry> {
        *self.queries.lock() += 1;
        Some(self.entry.clone())
    }
}

/// A CAM that decrypts only the listed channel numbers.
pub struct FakeCam {
    pub decryptable: Vec<u32>,
}

impl DecryptionSlot for FakeCam {
    fn can_decrypt(&self, channel: &Channel) -> bool {
        self.decryptable.contains(&channel.number)
    }

    fn slot_number(&self) -> u32 {
        1
    }
}

#[derive(Default)]
pub struct FakeTransfer {
    started: Mutex<Vec<(usize, TransferRequest)>>,
}

impl FakeTransfer {
    pub fn started(&self) -> Vec<(usize, TransferRequest)> {
        self.started.lock().clone()
    }
}

impl TransferPath for FakeTransfer {
    fn start(&self, device: usize, request: TransferRequest) {
        self.started.lock().push((device, request));
    }
}

/// Handles to the simulated hardware behind a [`fake_device`].
#[derive(Clone, Default)]
pub struct FakeHardware {
    pub frontend: FakeFrontend,
    pub demux: FakeDemux,
    pub decoder: FakeDecoder,
}

pub fn fake_device(system: DeliverySystem, with_decoder: bool) -> (Device, FakeHardware) {
    fake_device_with_cam(system, with_decoder, None)
}

pub fn fake_device_with_cam(
    system: DeliverySystem,
    with_decoder: bool,
    cam: Option<Arc<dyn DecryptionSlot>>,
) -> (Device, FakeHardware) {
    let hw = FakeHardware::default();
    let tuner = Tuner::new(
        Box::new(hw.frontend.clone()),
        0,
        system,
        Arc::new(NoDiseqc),
        SwitchConfig::default(),
    )
    .unwrap();
    let decoder = with_decoder.then(|| Box::new(hw.decoder.clone()) as Box<dyn Decoder>);
    let device = Device::new(DeviceParts {
        card_index: 0,
        adapter: 0,
        tuner: Some(tuner),
        demux: Box::new(hw.demux.clone()),
        decoder,
        cam,
        video_index: Some(0),
    });
    (device, hw)
}
