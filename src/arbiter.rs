//! Decides whether a device can serve a channel and carries out the switch.
//!
//! A device that is already locked to the right transponder is reused for
//! additional streams whenever decryption and priority rules permit, rather
//! than forcing a retune that would interrupt an active receiver.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};

use crate::channel::{Channel, DeliverySystem, Source, SourceKind};
use crate::config::{ArbitrationPolicy, DolbyTransferMode, SwitchConfig};
use crate::device::Device;
use crate::diseqc::DiseqcSource;
use crate::error::DeviceError;
use crate::pid::PidKind;
use crate::transfer::{TransferPath, TransferRequest};

/// Priority of a device without receivers.
pub const IDLE_PRIORITY: i32 = -1;

/// Answer of [`Arbitrator::provides_channel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Provision {
    pub available: bool,
    /// The device could serve the channel after its receivers are detached.
    pub needs_detach: bool,
}

/// Who asked for a channel switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Viewer,
    /// Background scan. It waits for lock and sets its own filters.
    Scan,
}

/// What a channel switch sees of the device and the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchInputs {
    pub tuned: bool,
    pub primary: bool,
    pub live_view: bool,
    pub has_decoder: bool,
    /// The video slot already carries the requested video PID.
    pub video_slot_matches: bool,
    /// The audio slot already carries the requested audio PID.
    pub audio_slot_matches: bool,
    /// The audio slot carries the requested Dolby PID.
    pub audio_slot_holds_dolby: bool,
    /// The requested video (or audio, for radio) PID is attached somewhere.
    pub stream_attached: bool,
    pub encrypted: bool,
    /// A decryption slot is present and refuses the channel.
    pub decryption_refused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRoute {
    /// Attach the streams to this device's decoder.
    AttachLocally,
    /// Relay the streams to the primary device's decoder.
    Handoff,
    /// Leave stream setup to whoever asked (recordings).
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchPlan {
    pub teardown_live: bool,
    pub retune: bool,
    pub route: StreamRoute,
}

pub fn plan_switch(inputs: &SwitchInputs) -> SwitchPlan {
    let retune = !inputs.tuned;

    // for a new live view the old PIDs have to go; for a recording they have
    // to move from decoder to tap routing
    let teardown_live = inputs.has_decoder
        && (retune || !inputs.primary || inputs.live_view || inputs.video_slot_matches);

    let mut handoff = inputs.primary
        && !retune
        && ((inputs.live_view
            && inputs.stream_attached
            && (!inputs.video_slot_matches
                || (!inputs.audio_slot_matches && !inputs.audio_slot_holds_dolby)))
            || (!inputs.live_view && (inputs.video_slot_matches || inputs.audio_slot_matches)));
    if inputs.decryption_refused && inputs.live_view && inputs.primary && inputs.encrypted {
        handoff = true;
    }

    let route = if handoff {
        StreamRoute::Handoff
    } else if inputs.has_decoder && inputs.live_view {
        StreamRoute::AttachLocally
    } else {
        StreamRoute::Leave
    };

    SwitchPlan {
        teardown_live,
        retune,
        route,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTrack {
    /// Index into the channel's audio PIDs.
    Audio(usize),
    /// Index into the channel's Dolby PIDs.
    Dolby(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSwitch {
    /// The audio slot now carries the track.
    Switched,
    /// The track is served through the transfer path.
    Transfer,
    Unchanged,
}

pub struct Arbitrator {
    policy: ArbitrationPolicy,
    switch: SwitchConfig,
    diseqc: Arc<dyn DiseqcSource>,
    transfer: Arc<dyn TransferPath>,
}

impl Arbitrator {
    pub fn new(
        policy: ArbitrationPolicy,
        switch: SwitchConfig,
        diseqc: Arc<dyn DiseqcSource>,
        transfer: Arc<dyn TransferPath>,
    ) -> Self {
        Arbitrator {
            policy,
            switch,
            diseqc,
            transfer,
        }
    }

    pub fn provides_source(&self, device: &Device, source: Source) -> bool {
        source.kind == SourceKind::None || device.delivery_system().source_kind() == source.kind
    }

    pub fn provides_transponder(&self, device: &Device, channel: &Channel) -> bool {
        let tp = &channel.transponder;
        if !self.provides_source(device, tp.source) {
            return false;
        }
        if !tp.source.is_sat() {
            return true;
        }
        if device.delivery_system() == DeliverySystem::Dvbs && tp.system == DeliverySystem::Dvbs2 {
            return false;
        }
        !self.switch.diseqc
            || self
                .diseqc
                .resolve(tp.source, tp.frequency, tp.polarization)
                .is_some()
    }

    /// Current priority of a receiving `device`. The primary device never
    /// drops below the preemption threshold.
    fn active_priority(&self, device: &Device) -> i32 {
        let base = if device.is_primary() {
            self.policy.primary_limit - 1
        } else {
            IDLE_PRIORITY
        };
        device.priority().map_or(base, |p| p.max(base))
    }

    /// Whether `device` can serve `channel` for a request of `priority`.
    /// `None` marks a background request, which any capable device accepts.
    pub fn provides_channel(
        &self,
        device: &Device,
        channel: &Channel,
        priority: Option<i32>,
    ) -> Provision {
        let mut provision = Provision::default();
        if !self.provides_transponder(device, channel) {
            return provision;
        }

        let Some(priority) = priority.filter(|_| device.receiving()) else {
            provision.available = true;
            return provision;
        };
        provision.available = priority > self.active_priority(device);

        if device.is_tuned_to(&channel.transponder) {
            let missing = |pid: u16| pid != 0 && !device.has_pid(pid);
            let preempts_primary = priority >= self.policy.primary_limit;
            if missing(channel.video_pid) || missing(channel.audio_pid()) {
                match device.cam() {
                    Some(cam) if channel.is_encrypted() => {
                        if cam.can_decrypt(channel) {
                            provision.available = true;
                        } else {
                            debug!(
                                "CAM {} can't decrypt channel {}",
                                cam.slot_number(),
                                channel.number
                            );
                            provision.needs_detach = true;
                        }
                    }
                    _ if !device.is_primary() => provision.available = true,
                    _ => provision.available = preempts_primary,
                }
            } else {
                provision.available = !device.is_primary() || preempts_primary;
            }
        } else {
            provision.needs_detach = true;
        }
        provision
    }

    pub fn switch_inputs(&self, device: &Device, channel: &Channel, live_view: bool) -> SwitchInputs {
        let pids = device.pids();
        let vpid = channel.video_pid;
        let apid = channel.audio_pid();
        let dpid = channel.dolby_pid();
        SwitchInputs {
            tuned: device.is_tuned_to(&channel.transponder),
            primary: device.is_primary(),
            live_view,
            has_decoder: device.has_decoder(),
            video_slot_matches: pids.pid(PidKind::Video) == vpid,
            audio_slot_matches: pids.pid(PidKind::Audio) == apid,
            audio_slot_holds_dolby: dpid != 0 && pids.pid(PidKind::Audio) == dpid,
            stream_attached: device.has_pid(if vpid != 0 { vpid } else { apid }),
            encrypted: channel.is_encrypted(),
            decryption_refused: device.cam().is_some_and(|cam| !cam.can_decrypt(channel)),
        }
    }

    /// Switches `device` to `channel`.
    pub fn set_channel(
        &self,
        device: &mut Device,
        channel: &Channel,
        live_view: bool,
        origin: RequestOrigin,
    ) -> Result<(), DeviceError> {
        if device.tuner().is_none() {
            return Err(DeviceError::NoTuner(device.card_index()));
        }
        let plan = plan_switch(&self.switch_inputs(device, channel, live_view));
        debug!(
            "device {}: switching to channel {} ({plan:?})",
            device.card_index() + 1,
            channel.number
        );

        if plan.teardown_live {
            device.turn_off_live_mode(live_view);
        }

        device.request_tune(&channel.transponder, plan.retune)?;

        if origin == RequestOrigin::Scan {
            return Ok(());
        }

        match plan.route {
            StreamRoute::AttachLocally => {
                device.set_audio_bypass(false);
                let attached = device
                    .attach_pid(PidKind::Pcr, channel.pcr_pid)
                    .and_then(|()| device.attach_pid(PidKind::Video, channel.video_pid))
                    .and_then(|()| device.attach_pid(PidKind::Audio, channel.audio_pid()));
                if let Err(source) = attached {
                    return Err(DeviceError::Pid {
                        channel: channel.number,
                        device: device.card_index() + 1,
                        source,
                    });
                }
                if device.is_primary() {
                    if let Err(e) = device.attach_pid(PidKind::Teletext, channel.teletext_pid) {
                        error!("{e}");
                    }
                }
                // muting here keeps audio working after a replay; unmuting
                // causes a glitch between channels of the same transponder
                device.set_mute(true);
                device.set_av_sync(true);
            }
            StreamRoute::Handoff => {
                self.transfer
                    .start(device.card_index(), TransferRequest::for_channel(channel));
            }
            StreamRoute::Leave => {}
        }
        Ok(())
    }

    /// Selects an audio track of the channel currently shown on `device`.
    pub fn set_audio_track(
        &self,
        device: &mut Device,
        channel: &Channel,
        track: AudioTrack,
    ) -> Result<TrackSwitch, DeviceError> {
        let (pid, dolby) = match track {
            AudioTrack::Audio(i) => (channel.audio_pids.get(i).copied(), false),
            AudioTrack::Dolby(i) => (channel.dolby_pids.get(i).copied(), true),
        };
        let Some(pid) = pid.filter(|&pid| pid != 0) else {
            return Ok(TrackSwitch::Unchanged);
        };

        device.set_audio_bypass(false);
        let bypass = dolby
            && self.policy.dolby_transfer_mode == DolbyTransferMode::BypassAndTransfer
            && device.set_audio_bypass(true);

        if !dolby || bypass {
            let switched = device
                .retarget_pid(PidKind::Audio, pid)
                .map_err(|source| DeviceError::Pid {
                    channel: channel.number,
                    device: device.card_index() + 1,
                    source,
                })?;
            return Ok(if switched {
                TrackSwitch::Switched
            } else {
                TrackSwitch::Unchanged
            });
        }

        if self.policy.dolby_transfer_mode == DolbyTransferMode::Off {
            return Ok(TrackSwitch::Unchanged);
        }
        // Dolby without bypass only works in transfer mode
        self.transfer
            .start(device.card_index(), TransferRequest::for_channel(channel));
        Ok(TrackSwitch::Transfer)
    }

    pub fn has_lock(&self, device: &Device, timeout: Duration) -> bool {
        device.has_lock(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CodeRate, Modulation, Polarization, Transponder, CA_ENCRYPTED_MIN};
    use crate::device::Activity;
    use crate::diseqc::{DiseqcEntry, NoDiseqc};
    use crate::dmx::DmxOutput;
    use crate::frontend::FrontendStatus;
    use crate::testing::{
        fake_device, fake_device_with_cam, wait_until, DecoderCall, FakeCam, FakeDiseqc,
        FakeHardware, FakeTransfer,
    };
    use crate::tuner::TunerStatus;

    const SETTLE: Duration = Duration::from_secs(3);

    fn terrestrial_channel(number: u32, frequency: u32) -> Channel {
        Channel {
            number,
            name: format!("Channel {number}"),
            transponder: Transponder {
                source: Source::TERRESTRIAL,
                frequency,
                bandwidth: 8_000_000,
                modulation: Modulation::Qam16,
                code_rate_hp: CodeRate::Fec2_3,
                system: DeliverySystem::Dvbt,
                ..Default::default()
            },
            video_pid: 100 + number as u16 * 10,
            pcr_pid: 100 + number as u16 * 10,
            audio_pids: vec![101 + number as u16 * 10, 102 + number as u16 * 10],
            dolby_pids: vec![106 + number as u16 * 10],
            teletext_pid: 105 + number as u16 * 10,
            service_id: number as u16,
            ..Default::default()
        }
    }

    fn satellite_channel(system: DeliverySystem) -> Channel {
        Channel {
            number: 7,
            transponder: Transponder {
                source: Source::satellite(192),
                frequency: 11_836,
                polarization: Polarization::Horizontal,
                symbol_rate: 27_500,
                system,
                ..Default::default()
            },
            video_pid: 0x6FF,
            audio_pids: vec![0x700],
            ..Default::default()
        }
    }

    fn arbitrator(transfer: Arc<FakeTransfer>) -> Arbitrator {
        Arbitrator::new(
            ArbitrationPolicy::default(),
            SwitchConfig::default(),
            Arc::new(NoDiseqc),
            transfer,
        )
    }

    fn tune_and_wait(device: &Device, hw: &FakeHardware, channel: &Channel) {
        hw.frontend.set_status(FrontendStatus::HAS_LOCK);
        device.request_tune(&channel.transponder, true).unwrap();
        assert!(device.has_lock(Duration::from_secs(5)));
    }

    // --- decision table ---

    #[test]
    fn test_plan_retune_on_new_transponder() {
        let plan = plan_switch(&SwitchInputs {
            tuned: false,
            primary: true,
            live_view: true,
            has_decoder: true,
            ..Default::default()
        });
        assert_eq!(
            plan,
            SwitchPlan {
                teardown_live: true,
                retune: true,
                route: StreamRoute::AttachLocally
            }
        );
    }

    #[test]
    fn test_plan_budget_card_never_tears_down() {
        let plan = plan_switch(&SwitchInputs {
            tuned: false,
            primary: false,
            live_view: true,
            has_decoder: false,
            ..Default::default()
        });
        assert!(!plan.teardown_live);
        assert!(plan.retune);
        assert_eq!(plan.route, StreamRoute::Leave);
    }

    #[test]
    fn test_plan_live_switch_on_same_transponder_while_recording() {
        // another channel's video is already tapped by a recording
        let plan = plan_switch(&SwitchInputs {
            tuned: true,
            primary: true,
            live_view: true,
            has_decoder: true,
            stream_attached: true,
            video_slot_matches: false,
            ..Default::default()
        });
        assert!(!plan.retune);
        assert_eq!(plan.route, StreamRoute::Handoff);
    }

    #[test]
    fn test_plan_live_switch_back_to_decoder_streams() {
        let plan = plan_switch(&SwitchInputs {
            tuned: true,
            primary: true,
            live_view: true,
            has_decoder: true,
            stream_attached: true,
            video_slot_matches: true,
            audio_slot_holds_dolby: true,
            ..Default::default()
        });
        assert_eq!(plan.route, StreamRoute::AttachLocally);
    }

    #[test]
    fn test_plan_recording_of_live_channel_hands_off() {
        let plan = plan_switch(&SwitchInputs {
            tuned: true,
            primary: true,
            live_view: false,
            has_decoder: true,
            video_slot_matches: true,
            ..Default::default()
        });
        assert!(plan.teardown_live);
        assert_eq!(plan.route, StreamRoute::Handoff);
    }

    #[test]
    fn test_plan_recording_on_secondary_device() {
        let plan = plan_switch(&SwitchInputs {
            tuned: true,
            primary: false,
            live_view: false,
            has_decoder: true,
            video_slot_matches: true,
            ..Default::default()
        });
        assert!(plan.teardown_live);
        assert!(!plan.retune);
        assert_eq!(plan.route, StreamRoute::Leave);
    }

    #[test]
    fn test_plan_refused_decryption_hands_off() {
        let inputs = SwitchInputs {
            tuned: false,
            primary: true,
            live_view: true,
            has_decoder: true,
            encrypted: true,
            decryption_refused: true,
            ..Default::default()
        };
        assert_eq!(plan_switch(&inputs).route, StreamRoute::Handoff);
        let fta = SwitchInputs {
            encrypted: false,
            ..inputs
        };
        assert_eq!(plan_switch(&fta).route, StreamRoute::AttachLocally);
    }

    // --- provisioning ---

    #[test]
    fn test_provides_source() {
        let arb = arbitrator(Arc::default());
        let (device, _) = fake_device(DeliverySystem::Dvbt, false);
        assert!(arb.provides_source(&device, Source::TERRESTRIAL));
        assert!(arb.provides_source(&device, Source::default()));
        assert!(!arb.provides_source(&device, Source::CABLE));
        assert!(!arb.provides_source(&device, Source::satellite(192)));
    }

    #[test]
    fn test_s2_channel_refused_on_first_generation_frontend() {
        let arb = arbitrator(Arc::default());
        let channel = satellite_channel(DeliverySystem::Dvbs2);
        let (device, _) = fake_device(DeliverySystem::Dvbs, false);
        assert!(!arb.provides_transponder(&device, &channel));
        assert!(!arb.provides_channel(&device, &channel, None).available);

        let (device, _) = fake_device(DeliverySystem::Dvbs2, false);
        assert!(arb.provides_channel(&device, &channel, None).available);
        let (device, _) = fake_device(DeliverySystem::Dvbs2, false);
        assert!(arb.provides_channel(&device, &satellite_channel(DeliverySystem::Dvbs), Some(0)).available);
    }

    #[test]
    fn test_satellite_needs_diseqc_entry_when_automated() {
        let switch = SwitchConfig {
            diseqc: true,
            ..SwitchConfig::default()
        };
        let channel = satellite_channel(DeliverySystem::Dvbs);
        let (device, _) = fake_device(DeliverySystem::Dvbs, false);

        let arb = Arbitrator::new(
            ArbitrationPolicy::default(),
            switch.clone(),
            Arc::new(NoDiseqc),
            Arc::new(FakeTransfer::default()),
        );
        assert!(!arb.provides_transponder(&device, &channel));

        let diseqc = Arc::new(FakeDiseqc::with_entry(DiseqcEntry {
            actions: Vec::new(),
            lof: 10_600,
        }));
        let arb = Arbitrator::new(
            ArbitrationPolicy::default(),
            switch,
            diseqc.clone(),
            Arc::new(FakeTransfer::default()),
        );
        assert!(arb.provides_transponder(&device, &channel));
        assert_eq!(diseqc.queries(), 1);
    }

    #[test]
    fn test_background_request_ignores_receivers() {
        let arb = arbitrator(Arc::default());
        let channel = terrestrial_channel(1, 474);
        let (mut device, _) = fake_device(DeliverySystem::Dvbt, true);
        device.set_activity(Activity {
            receivers: 3,
            priority: 99,
        });
        let provision = arb.provides_channel(&device, &channel, None);
        assert!(provision.available);
        assert!(!provision.needs_detach);
    }

    #[test]
    fn test_idle_device_is_available() {
        let arb = arbitrator(Arc::default());
        let (device, _) = fake_device(DeliverySystem::Dvbt, false);
        let provision = arb.provides_channel(&device, &terrestrial_channel(1, 474), Some(0));
        assert_eq!(
            provision,
            Provision {
                available: true,
                needs_detach: false
            }
        );
    }

    #[test]
    fn test_idle_primary_device_is_available_below_primary_limit() {
        let policy = ArbitrationPolicy {
            primary_limit: 20,
            ..ArbitrationPolicy::default()
        };
        let arb = Arbitrator::new(
            policy,
            SwitchConfig::default(),
            Arc::new(NoDiseqc),
            Arc::new(FakeTransfer::default()),
        );
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        device.set_primary(true);
        let channel = terrestrial_channel(1, 474);
        assert_eq!(
            arb.provides_channel(&device, &channel, Some(10)),
            Provision {
                available: true,
                needs_detach: false
            }
        );

        // still idle while tuned elsewhere
        tune_and_wait(&device, &hw, &terrestrial_channel(2, 482));
        assert_eq!(
            arb.provides_channel(&device, &channel, Some(10)),
            Provision {
                available: true,
                needs_detach: false
            }
        );
    }

    #[test]
    fn test_busy_device_on_other_transponder_needs_detach() {
        let arb = arbitrator(Arc::default());
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, false);
        tune_and_wait(&device, &hw, &terrestrial_channel(1, 474));
        device.set_activity(Activity {
            receivers: 1,
            priority: 10,
        });

        let provision = arb.provides_channel(&device, &terrestrial_channel(2, 482), Some(50));
        assert!(provision.available);
        assert!(provision.needs_detach);

        let provision = arb.provides_channel(&device, &terrestrial_channel(2, 482), Some(5));
        assert!(!provision.available);
        assert!(provision.needs_detach);
    }

    #[test]
    fn test_busy_device_on_same_transponder_is_shared() {
        let arb = arbitrator(Arc::default());
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, false);
        let recorded = terrestrial_channel(1, 474);
        tune_and_wait(&device, &hw, &recorded);
        device.attach_pid(PidKind::Other, recorded.video_pid).unwrap();
        device.set_activity(Activity {
            receivers: 1,
            priority: 50,
        });

        // different service on the same multiplex, lower priority
        let mut other = terrestrial_channel(2, 474);
        other.transponder = recorded.transponder.clone();
        let provision = arb.provides_channel(&device, &other, Some(10));
        assert!(provision.available);
        assert!(!provision.needs_detach);
    }

    #[test]
    fn test_primary_device_respects_primary_limit() {
        let policy = ArbitrationPolicy {
            primary_limit: 20,
            ..ArbitrationPolicy::default()
        };
        let arb = Arbitrator::new(
            policy,
            SwitchConfig::default(),
            Arc::new(NoDiseqc),
            Arc::new(FakeTransfer::default()),
        );
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        device.set_primary(true);
        let live = terrestrial_channel(1, 474);
        tune_and_wait(&device, &hw, &live);
        device.set_activity(Activity {
            receivers: 1,
            priority: 0,
        });

        let mut other = terrestrial_channel(2, 474);
        other.transponder = live.transponder.clone();
        assert!(!arb.provides_channel(&device, &other, Some(10)).available);
        assert!(arb.provides_channel(&device, &other, Some(30)).available);
    }

    #[test]
    fn test_encrypted_channel_depends_on_cam() {
        let arb = arbitrator(Arc::default());
        let cam = Arc::new(FakeCam {
            decryptable: vec![1],
        });
        let (mut device, hw) = fake_device_with_cam(DeliverySystem::Dvbt, false, Some(cam));
        let first = terrestrial_channel(1, 474);
        tune_and_wait(&device, &hw, &first);
        device.set_activity(Activity {
            receivers: 1,
            priority: 50,
        });

        let mut decryptable = first.clone();
        decryptable.ca = CA_ENCRYPTED_MIN;
        assert!(arb.provides_channel(&device, &decryptable, Some(10)).available);

        let mut refused = terrestrial_channel(2, 474);
        refused.transponder = first.transponder.clone();
        refused.ca = 0x1702;
        let provision = arb.provides_channel(&device, &refused, Some(10));
        assert!(!provision.available);
        assert!(provision.needs_detach);
    }

    // --- channel switching ---

    #[test]
    fn test_set_channel_live_attaches_streams() {
        let transfer = Arc::new(FakeTransfer::default());
        let arb = arbitrator(transfer.clone());
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        device.set_primary(true);
        let channel = terrestrial_channel(1, 474);

        arb.set_channel(&mut device, &channel, true, RequestOrigin::Viewer)
            .unwrap();
        assert!(wait_until(SETTLE, || device
            .tuner()
            .is_some_and(|t| t.status() >= TunerStatus::Programmed)));

        assert_eq!(device.pids().pid(PidKind::Pcr), channel.pcr_pid);
        assert_eq!(device.pids().pid(PidKind::Video), channel.video_pid);
        assert_eq!(device.pids().pid(PidKind::Audio), channel.audio_pid());
        assert_eq!(device.pids().pid(PidKind::Teletext), channel.teletext_pid);
        let calls = hw.decoder.calls();
        assert!(calls.contains(&DecoderCall::AudioBypass(false)));
        assert_eq!(
            &calls[calls.len() - 2..],
            &[DecoderCall::Mute(true), DecoderCall::AvSync(true)]
        );
        assert!(transfer.started().is_empty());
    }

    #[test]
    fn test_set_channel_on_secondary_device_skips_teletext() {
        let arb = arbitrator(Arc::default());
        let (mut device, _) = fake_device(DeliverySystem::Dvbt, true);
        let channel = terrestrial_channel(1, 474);
        arb.set_channel(&mut device, &channel, true, RequestOrigin::Viewer)
            .unwrap();
        assert_eq!(device.pids().pid(PidKind::Video), channel.video_pid);
        assert_eq!(device.pids().pid(PidKind::Teletext), 0);
    }

    #[test]
    fn test_set_channel_from_scan_skips_streams() {
        let arb = arbitrator(Arc::default());
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        let channel = terrestrial_channel(1, 474);
        arb.set_channel(&mut device, &channel, true, RequestOrigin::Scan)
            .unwrap();
        assert!(wait_until(SETTLE, || device
            .tuner()
            .is_some_and(|t| t.status() >= TunerStatus::Programmed)));
        assert_eq!(hw.demux.opened(), 0);
    }

    #[test]
    fn test_set_channel_attach_failure() {
        let arb = arbitrator(Arc::default());
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        hw.demux.fail_open(true);
        let err = arb
            .set_channel(&mut device, &terrestrial_channel(4, 474), true, RequestOrigin::Viewer)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Pid { channel: 4, device: 1, .. }));
    }

    #[test]
    fn test_recording_of_live_channel_moves_to_transfer() {
        let transfer = Arc::new(FakeTransfer::default());
        let arb = arbitrator(transfer.clone());
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        device.set_primary(true);
        let channel = terrestrial_channel(1, 474);
        hw.frontend.set_status(FrontendStatus::HAS_LOCK);
        arb.set_channel(&mut device, &channel, true, RequestOrigin::Viewer)
            .unwrap();
        assert!(device.has_lock(Duration::from_secs(5)));

        // a recording of the same channel on the primary device
        arb.set_channel(&mut device, &channel, false, RequestOrigin::Viewer)
            .unwrap();
        assert_eq!(device.pids().pid(PidKind::Video), 0);
        let started = transfer.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, 0);
        assert_eq!(started[0].1.video_pid, channel.video_pid);
        assert_eq!(started[0].1.audio_pids, channel.audio_pids);
    }

    #[test]
    fn test_live_switch_within_transponder_keeps_tuning() {
        let arb = arbitrator(Arc::default());
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        device.set_primary(true);
        let first = terrestrial_channel(1, 474);
        hw.frontend.set_status(FrontendStatus::HAS_LOCK);
        arb.set_channel(&mut device, &first, true, RequestOrigin::Viewer)
            .unwrap();
        assert!(device.has_lock(Duration::from_secs(5)));
        let programmed = hw.frontend.batches().len();

        let mut second = terrestrial_channel(2, 474);
        second.transponder = first.transponder.clone();
        arb.set_channel(&mut device, &second, true, RequestOrigin::Viewer)
            .unwrap();
        assert_eq!(device.pids().pid(PidKind::Video), second.video_pid);
        assert!(!device.has_pid(first.video_pid));
        assert!(device.has_lock(Duration::ZERO));
        assert_eq!(hw.frontend.batches().len(), programmed);
        let video = hw
            .demux
            .filters()
            .into_iter()
            .rfind(|f| f.pid == second.video_pid)
            .unwrap();
        assert_eq!(video.output, DmxOutput::Decoder);
    }

    #[test]
    fn test_set_channel_without_tuner() {
        use crate::device::DeviceParts;
        use crate::testing::FakeDemux;

        let arb = arbitrator(Arc::default());
        let mut device = Device::new(DeviceParts {
            card_index: 2,
            adapter: 2,
            tuner: None,
            demux: Box::new(FakeDemux::default()),
            decoder: None,
            cam: None,
            video_index: None,
        });
        let err = arb
            .set_channel(&mut device, &terrestrial_channel(1, 474), true, RequestOrigin::Viewer)
            .unwrap_err();
        assert!(matches!(err, DeviceError::NoTuner(2)));
    }

    // --- audio tracks ---

    fn live_device(policy: ArbitrationPolicy) -> (Arbitrator, Arc<FakeTransfer>, Device, FakeHardware, Channel) {
        let transfer = Arc::new(FakeTransfer::default());
        let arb = Arbitrator::new(
            policy,
            SwitchConfig::default(),
            Arc::new(NoDiseqc),
            transfer.clone(),
        );
        let (mut device, hw) = fake_device(DeliverySystem::Dvbt, true);
        device.set_primary(true);
        let channel = terrestrial_channel(1, 474);
        arb.set_channel(&mut device, &channel, true, RequestOrigin::Viewer)
            .unwrap();
        (arb, transfer, device, hw, channel)
    }

    #[test]
    fn test_switch_between_audio_tracks() {
        let (arb, transfer, mut device, _, channel) = live_device(ArbitrationPolicy::default());
        let result = arb
            .set_audio_track(&mut device, &channel, AudioTrack::Audio(1))
            .unwrap();
        assert_eq!(result, TrackSwitch::Switched);
        assert_eq!(device.pids().pid(PidKind::Audio), channel.audio_pids[1]);

        let result = arb
            .set_audio_track(&mut device, &channel, AudioTrack::Audio(1))
            .unwrap();
        assert_eq!(result, TrackSwitch::Unchanged);
        assert!(transfer.started().is_empty());
    }

    #[test]
    fn test_missing_track_is_ignored() {
        let (arb, _, mut device, _, channel) = live_device(ArbitrationPolicy::default());
        let result = arb
            .set_audio_track(&mut device, &channel, AudioTrack::Dolby(5))
            .unwrap();
        assert_eq!(result, TrackSwitch::Unchanged);
        assert_eq!(device.pids().pid(PidKind::Audio), channel.audio_pid());
    }

    #[test]
    fn test_dolby_track_with_bypass() {
        let (arb, transfer, mut device, hw, channel) = live_device(ArbitrationPolicy::default());
        let result = arb
            .set_audio_track(&mut device, &channel, AudioTrack::Dolby(0))
            .unwrap();
        assert_eq!(result, TrackSwitch::Switched);
        assert_eq!(device.pids().pid(PidKind::Audio), channel.dolby_pid());
        assert_eq!(hw.decoder.calls().last(), Some(&DecoderCall::AudioBypass(true)));
        assert!(transfer.started().is_empty());
    }

    #[test]
    fn test_dolby_track_without_bypass_uses_transfer() {
        let (arb, transfer, mut device, hw, channel) = live_device(ArbitrationPolicy::default());
        hw.decoder.set_bypass_unsupported(true);
        let result = arb
            .set_audio_track(&mut device, &channel, AudioTrack::Dolby(0))
            .unwrap();
        assert_eq!(result, TrackSwitch::Transfer);
        assert_eq!(transfer.started().len(), 1);
        assert_eq!(device.pids().pid(PidKind::Audio), channel.audio_pid());
    }

    #[test]
    fn test_dolby_transfer_only_mode() {
        let policy = ArbitrationPolicy {
            dolby_transfer_mode: DolbyTransferMode::TransferOnly,
            ..ArbitrationPolicy::default()
        };
        let (arb, transfer, mut device, hw, channel) = live_device(policy);
        hw.decoder.clear_calls();
        let result = arb
            .set_audio_track(&mut device, &channel, AudioTrack::Dolby(0))
            .unwrap();
        assert_eq!(result, TrackSwitch::Transfer);
        assert!(!hw.decoder.calls().contains(&DecoderCall::AudioBypass(true)));
        assert_eq!(transfer.started().len(), 1);
    }

    #[test]
    fn test_dolby_off_mode() {
        let policy = ArbitrationPolicy {
            dolby_transfer_mode: DolbyTransferMode::Off,
            ..ArbitrationPolicy::default()
        };
        let (arb, transfer, mut device, _, channel) = live_device(policy);
        let result = arb
            .set_audio_track(&mut device, &channel, AudioTrack::Dolby(0))
            .unwrap();
        assert_eq!(result, TrackSwitch::Unchanged);
        assert!(transfer.started().is_empty());
    }
}
