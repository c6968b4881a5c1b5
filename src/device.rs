use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};

use crate::channel::{DeliverySystem, Transponder};
use crate::ci::DecryptionSlot;
use crate::config::Config;
use crate::decoder::{Decoder, DvbDecoder, PlayMode};
use crate::diseqc::DiseqcSource;
use crate::dmx::{self, Demux, DvbDemux};
use crate::error::{DeviceError, PidError};
use crate::frontend::{frontend_path, DvbFrontend};
use crate::pid::{PidKind, PidTable};
use crate::tuner::Tuner;

/// Receivers currently attached to a device, as reported by the recording
/// and live-view layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub receivers: usize,
    /// Highest priority among the attached receivers.
    pub priority: i32,
}

/// Hardware handles a [`Device`] is assembled from.
pub struct DeviceParts {
    pub card_index: usize,
    pub adapter: u32,
    pub tuner: Option<Tuner>,
    pub demux: Box<dyn Demux>,
    pub decoder: Option<Box<dyn Decoder>>,
    pub cam: Option<Arc<dyn DecryptionSlot>>,
    pub video_index: Option<u32>,
}

/// One DVB adapter: a tuner, its PID table and an optional decoder.
pub struct Device {
    card_index: usize,
    adapter: u32,
    tuner: Option<Tuner>,
    delivery_system: DeliverySystem,
    provided_systems: u32,
    demux: Box<dyn Demux>,
    decoder: Option<Box<dyn Decoder>>,
    cam: Option<Arc<dyn DecryptionSlot>>,
    video_index: Option<u32>,
    pids: PidTable,
    primary: bool,
    play_mode: PlayMode,
    activity: Activity,
}

impl Device {
    pub fn new(parts: DeviceParts) -> Self {
        let delivery_system = parts
            .tuner
            .as_ref()
            .map_or(DeliverySystem::Undefined, Tuner::delivery_system);
        let provided_systems = match delivery_system {
            DeliverySystem::Undefined => 0,
            DeliverySystem::Dvbs2 => 2,
            _ => 1,
        };
        let video_index = parts.video_index.filter(|_| parts.decoder.is_some());
        Device {
            card_index: parts.card_index,
            adapter: parts.adapter,
            tuner: parts.tuner,
            delivery_system,
            provided_systems,
            demux: parts.demux,
            decoder: parts.decoder,
            cam: parts.cam,
            video_index,
            pids: PidTable::new(),
            primary: false,
            play_mode: PlayMode::None,
            activity: Activity::default(),
        }
    }

    /// Opens `/dev/dvb/adapter<adapter>` and starts its tuner.
    pub fn open(
        adapter: u32,
        card_index: usize,
        video_index: Option<u32>,
        config: &Config,
        diseqc: Arc<dyn DiseqcSource>,
    ) -> Result<Self, DeviceError> {
        let frontend = DvbFrontend::open(adapter).map_err(|source| DeviceError::Open {
            path: frontend_path(adapter),
            source,
        })?;

        let tuner = match frontend.info() {
            Ok(fe_info) => {
                info!(
                    "device {} provides {} (\"{}\")",
                    card_index + 1,
                    fe_info.delivery_system,
                    fe_info.name
                );
                let tuner = Tuner::new(
                    Box::new(frontend),
                    card_index,
                    fe_info.delivery_system,
                    diseqc,
                    config.switch.clone(),
                )
                .map_err(|source| DeviceError::Open {
                    path: frontend_path(adapter),
                    source,
                })?;
                Some(tuner)
            }
            Err(e) => {
                error!("FE_GET_INFO failed on device {}: {e}", card_index + 1);
                None
            }
        };

        let decoder = DvbDecoder::open(adapter).map(|d| Box::new(d) as Box<dyn Decoder>);
        if decoder.is_some() {
            debug!("device {} has a decoder", card_index + 1);
        }

        Ok(Device::new(DeviceParts {
            card_index,
            adapter,
            tuner,
            demux: Box::new(DvbDemux::new(adapter)),
            decoder,
            cam: None,
            video_index,
        }))
    }

    pub fn card_index(&self) -> usize {
        self.card_index
    }

    pub fn adapter(&self) -> u32 {
        self.adapter
    }

    pub fn tuner(&self) -> Option<&Tuner> {
        self.tuner.as_ref()
    }

    pub fn delivery_system(&self) -> DeliverySystem {
        self.delivery_system
    }

    /// DVB-S2 frontends count twice since they also receive DVB-S.
    pub fn provided_systems(&self) -> u32 {
        self.provided_systems
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn video_index(&self) -> Option<u32> {
        self.video_index
    }

    pub fn cam(&self) -> Option<&dyn DecryptionSlot> {
        self.cam.as_deref()
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn set_primary(&mut self, primary: bool) {
        self.primary = primary;
    }

    pub fn set_activity(&mut self, activity: Activity) {
        self.activity = activity;
    }

    pub fn receiving(&self) -> bool {
        self.activity.receivers > 0
    }

    /// Priority of the most important receiver, if any is attached.
    pub fn priority(&self) -> Option<i32> {
        self.receiving().then_some(self.activity.priority)
    }

    pub fn is_tuned_to(&self, transponder: &Transponder) -> bool {
        self.tuner.as_ref().is_some_and(|t| t.is_tuned_to(transponder))
    }

    pub fn has_lock(&self, timeout: Duration) -> bool {
        self.tuner.as_ref().is_some_and(|t| t.wait_for_lock(timeout))
    }

    pub fn request_tune(&self, transponder: &Transponder, force: bool) -> Result<(), DeviceError> {
        let tuner = self.tuner.as_ref().ok_or(DeviceError::NoTuner(self.card_index))?;
        tuner.request_tune(transponder, force);
        Ok(())
    }

    pub fn pids(&self) -> &PidTable {
        &self.pids
    }

    pub fn has_pid(&self, pid: u16) -> bool {
        self.pids.has_pid(pid)
    }

    pub fn attach_pid(&mut self, kind: PidKind, pid: u16) -> Result<(), PidError> {
        self.pids.attach(kind, pid, self.demux.as_ref())
    }

    pub fn detach_pid(&mut self, kind: PidKind, pid: u16) {
        if self.pids.detach(kind, pid).video_released {
            // needed before a PID can move from decoder to tap routing
            self.set_play_mode(PlayMode::None);
        }
    }

    pub(crate) fn retarget_pid(&mut self, kind: PidKind, pid: u16) -> Result<bool, PidError> {
        self.pids.retarget(kind, pid, self.demux.as_ref())
    }

    pub fn play_mode(&self) -> PlayMode {
        self.play_mode
    }

    pub fn set_play_mode(&mut self, mode: PlayMode) {
        match mode {
            PlayMode::None => {
                self.decoder_op("return to live mode", |d| d.return_to_live());
            }
            PlayMode::AudioVideo | PlayMode::AudioOnlyBlack if self.play_mode == PlayMode::None => {
                self.turn_off_live_mode(true);
            }
            _ => {}
        }
        self.play_mode = mode;
    }

    /// Silences the decoder (for a live view) and releases the live slots.
    pub fn turn_off_live_mode(&mut self, live_view: bool) {
        if live_view {
            // avoid noise while switching
            self.decoder_op("AUDIO_SET_MUTE", |d| d.set_mute(true));
            self.decoder_op("VIDEO_SET_BLANK", |d| d.set_blank(true));
            self.decoder_op("clear buffers", |d| d.clear_buffers());
        }
        for kind in [
            PidKind::Audio,
            PidKind::Video,
            PidKind::Pcr,
            PidKind::Teletext,
            PidKind::Dolby,
        ] {
            let pid = self.pids.pid(kind);
            self.detach_pid(kind, pid);
        }
    }

    /// Switches the audio bypass; `false` when there is no decoder or the
    /// driver refuses.
    pub fn set_audio_bypass(&mut self, on: bool) -> bool {
        self.decoder_op("AUDIO_SET_BYPASS_MODE", |d| d.set_audio_bypass(on))
    }

    pub(crate) fn set_mute(&mut self, on: bool) {
        self.decoder_op("AUDIO_SET_MUTE", |d| d.set_mute(on));
    }

    pub(crate) fn set_av_sync(&mut self, on: bool) {
        self.decoder_op("AUDIO_SET_AV_SYNC", |d| d.set_av_sync(on));
    }

    /// Section filter on a fresh demux handle. Closing the file removes it.
    pub fn open_section_filter(&self, pid: u16, tid: u8, mask: u8) -> io::Result<File> {
        dmx::open_section_filter(self.adapter, pid, tid, mask)
    }

    fn decoder_op(&mut self, op: &str, f: impl FnOnce(&mut dyn Decoder) -> io::Result<()>) -> bool {
        let Some(decoder) = self.decoder.as_mut() else {
            return false;
        };
        match f(decoder.as_mut()) {
            Ok(()) => true,
            Err(e) => {
                error!("device {}: {op} failed: {e}", self.card_index + 1);
                false
            }
        }
    }
}

/// Whether `path` exists and can be opened. Missing and unbound devices are
/// not worth a log line.
fn probe(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    debug!("probing {}", path.display());
    match OpenOptions::new().read(true).open(path) {
        Ok(_) => true,
        Err(e) => {
            if !matches!(e.raw_os_error(), Some(libc::ENODEV | libc::EINVAL)) {
                error!("{}: {e}", path.display());
            }
            false
        }
    }
}

/// Opens adapters 0, 1, ... up to the configured maximum, stopping at the
/// first one that is missing.
pub fn discover(config: &Config, diseqc: Arc<dyn DiseqcSource>) -> Vec<Device> {
    let mut devices = Vec::new();
    let mut next_video = config.discovery.video_offset;
    for adapter in 0..config.discovery.max_devices {
        if !probe(Path::new(&frontend_path(adapter))) {
            break;
        }
        let card_index = adapter as usize;
        match Device::open(adapter, card_index, Some(next_video), config, Arc::clone(&diseqc)) {
            Ok(mut device) => {
                if device.has_decoder() {
                    next_video += 1;
                }
                device.set_primary(card_index == config.discovery.primary_device);
                devices.push(device);
            }
            Err(e) => {
                error!("{e}");
                break;
            }
        }
    }
    match devices.len() {
        0 => info!("no DVB device found"),
        1 => info!("found 1 video device"),
        n => info!("found {n} video devices"),
    }
    devices
}

/// Adapters present under `/dev/dvb`, without opening them.
pub fn list_adapters() -> Vec<u32> {
    let Ok(entries) = fs::read_dir("/dev/dvb") else {
        return Vec::new();
    };
    let mut adapters: Vec<u32> = entries
        .flatten()
        .filter_map(|e| {
            e.file_name()
                .to_str()?
                .strip_prefix("adapter")?
                .parse()
                .ok()
        })
        .collect();
    adapters.sort_unstable();
    adapters
}
