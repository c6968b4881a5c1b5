//! Front-end lock state machine.
//!
//! Every [`Tuner`] owns one frontend and a worker thread that polls it.
//! Callers only ever set a target ([`Tuner::request_tune`]) and observe the
//! outcome ([`Tuner::is_tuned_to`], [`Tuner::wait_for_lock`]); programming the
//! hardware, retrying on timeouts and tracking lock loss all happen on the
//! worker.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::channel::{DeliverySystem, Polarization, RollOff, Transponder};
use crate::config::SwitchConfig;
use crate::diseqc::{DiseqcAction, DiseqcSource};
use crate::error::TuneError;
use crate::frontend::{
    Burst, CommandSeq, Frontend, FrontendStatus, PILOT_AUTO, Tone, Voltage, DTV_BANDWIDTH_HZ,
    DTV_CLEAR, DTV_CODE_RATE_HP, DTV_CODE_RATE_LP, DTV_DELIVERY_SYSTEM, DTV_FREQUENCY,
    DTV_GUARD_INTERVAL, DTV_HIERARCHY, DTV_INNER_FEC, DTV_INVERSION, DTV_MODULATION, DTV_PILOT,
    DTV_ROLLOFF, DTV_SYMBOL_RATE, DTV_TRANSMISSION_MODE, DTV_TUNE,
};

const DVBS_TUNE_TIMEOUT: Duration = Duration::from_millis(9000);
const DVBS_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);
const DVBC_TUNE_TIMEOUT: Duration = Duration::from_millis(9000);
const DVBC_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);
const DVBT_TUNE_TIMEOUT: Duration = Duration::from_millis(9000);
const DVBT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

const STATUS_POLL: Duration = Duration::from_millis(10);
const IDLE_WAIT: Duration = Duration::from_millis(1000);
const TIMEOUT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TunerStatus {
    /// No target.
    Idle,
    /// Target set, hardware not yet programmed.
    Requested,
    /// Hardware programmed, waiting for lock.
    Programmed,
    Locked,
}

struct State {
    status: TunerStatus,
    transponder: Transponder,
    /// Last DiSEqC sequence sent, so an unchanged one isn't repeated.
    last_diseqc: Option<Vec<DiseqcAction>>,
    last_timeout_report: Option<Instant>,
    tune_timeout: Duration,
    lock_timeout: Duration,
}

impl State {
    fn new() -> Self {
        State {
            status: TunerStatus::Idle,
            transponder: Transponder::default(),
            last_diseqc: None,
            last_timeout_report: None,
            tune_timeout: Duration::ZERO,
            lock_timeout: Duration::ZERO,
        }
    }

    /// Records a tune timeout at `now`. Returns whether it should be logged.
    fn note_timeout(&mut self, now: Instant) -> bool {
        if !report_due(self.last_timeout_report, now) {
            return false;
        }
        self.last_timeout_report = Some(now);
        true
    }
}

fn report_due(last: Option<Instant>, now: Instant) -> bool {
    last.is_none_or(|t| now.saturating_duration_since(t) > TIMEOUT_REPORT_INTERVAL)
}

struct Shared {
    state: Mutex<State>,
    locked: Condvar,
    new_target: Condvar,
    running: AtomicBool,
}

pub struct Tuner {
    index: usize,
    delivery_system: DeliverySystem,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tuner {
    /// Takes ownership of `frontend` and starts the polling worker.
    pub fn new(
        mut frontend: Box<dyn Frontend>,
        index: usize,
        delivery_system: DeliverySystem,
        diseqc: Arc<dyn DiseqcSource>,
        switch: SwitchConfig,
    ) -> io::Result<Self> {
        if matches!(delivery_system, DeliverySystem::Dvbs | DeliverySystem::Dvbs2) {
            // must explicitly turn on LNB power
            if let Err(e) = frontend.set_voltage(Voltage::V13) {
                error!("frontend {index}: FE_SET_VOLTAGE failed: {e}");
            }
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            locked: Condvar::new(),
            new_target: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker = Worker {
            index,
            frontend,
            delivery_system,
            diseqc,
            switch,
            shared: Arc::clone(&shared),
        };
        let handle = thread::Builder::new()
            .name(format!("tuner{}", index + 1))
            .spawn(move || worker.run())?;

        Ok(Tuner {
            index,
            delivery_system,
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn delivery_system(&self) -> DeliverySystem {
        self.delivery_system
    }

    pub fn status(&self) -> TunerStatus {
        self.shared.state.lock().status
    }

    /// True once the hardware has been programmed for a transponder that
    /// matches `transponder`.
    pub fn is_tuned_to(&self, transponder: &Transponder) -> bool {
        let state = self.shared.state.lock();
        state.status >= TunerStatus::Programmed && state.transponder.same_transponder(transponder)
    }

    /// Sets the target. With `force` the hardware is reprogrammed; without
    /// it only the stored descriptor is replaced and lock state is untouched.
    pub fn request_tune(&self, transponder: &Transponder, force: bool) {
        let mut state = self.shared.state.lock();
        if force {
            state.status = TunerStatus::Requested;
        }
        state.transponder = transponder.clone();
        state.last_timeout_report = None;
        self.shared.new_target.notify_all();
    }

    /// Whether the frontend has lock, waiting up to `timeout` for it.
    pub fn wait_for_lock(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.status == TunerStatus::Locked || timeout.is_zero() {
            return state.status == TunerStatus::Locked;
        }
        let deadline = Instant::now() + timeout;
        while state.status != TunerStatus::Locked && self.shared.running.load(Ordering::SeqCst) {
            if self.shared.locked.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.status == TunerStatus::Locked
    }

    /// Stops the worker. Anyone blocked in [`Tuner::wait_for_lock`] returns
    /// `false`.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.status = TunerStatus::Idle;
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.new_target.notify_all();
            self.shared.locked.notify_all();
        }
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("tuner on device {} panicked", self.index + 1);
            }
        }
    }
}

impl Drop for Tuner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    index: usize,
    frontend: Box<dyn Frontend>,
    delivery_system: DeliverySystem,
    diseqc: Arc<dyn DiseqcSource>,
    switch: SwitchConfig,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let mut deadline = Instant::now();
        let mut lost_lock = false;
        let mut status = FrontendStatus::empty();

        while shared.running.load(Ordering::SeqCst) {
            match self.frontend.read_status(STATUS_POLL) {
                Ok(new_status) => status = new_status,
                Err(e) => debug!("frontend {}: FE_READ_STATUS failed: {e}", self.index),
            }

            let mut state = shared.state.lock();
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            match state.status {
                TunerStatus::Idle => {}
                TunerStatus::Requested => {
                    match self.set_frontend(&mut state) {
                        Ok(()) => state.status = TunerStatus::Programmed,
                        Err(e) => {
                            error!("{e}");
                            state.status = TunerStatus::Idle;
                        }
                    }
                    deadline = Instant::now() + state.tune_timeout;
                    continue;
                }
                TunerStatus::Programmed | TunerStatus::Locked => {
                    if state.status == TunerStatus::Programmed && Instant::now() >= deadline {
                        state.status = TunerStatus::Requested;
                        state.last_diseqc = None;
                        if state.note_timeout(Instant::now()) {
                            info!(
                                "frontend {} timed out while tuning to tp {}",
                                self.index,
                                state.transponder.transponder_id()
                            );
                        }
                        continue;
                    }
                    if status.contains(FrontendStatus::REINIT) {
                        state.status = TunerStatus::Requested;
                        state.last_diseqc = None;
                        state.last_timeout_report = None;
                        info!("frontend {} was reinitialized", self.index);
                        continue;
                    }
                    if status.contains(FrontendStatus::HAS_LOCK) {
                        if lost_lock {
                            info!(
                                "frontend {} regained lock on tp {}",
                                self.index,
                                state.transponder.transponder_id()
                            );
                            lost_lock = false;
                        }
                        state.status = TunerStatus::Locked;
                        state.last_timeout_report = None;
                        shared.locked.notify_all();
                    } else if state.status == TunerStatus::Locked {
                        lost_lock = true;
                        info!(
                            "frontend {} lost lock on tp {}",
                            self.index,
                            state.transponder.transponder_id()
                        );
                        state.status = TunerStatus::Programmed;
                        state.last_timeout_report = None;
                        deadline = Instant::now() + state.lock_timeout;
                        continue;
                    }
                }
            }

            if state.status != TunerStatus::Programmed {
                shared.new_target.wait_for(&mut state, IDLE_WAIT);
            }
        }
        debug!("tuner on device {} stopped", self.index + 1);
    }

    /// Logs a failed switch/LNB control call. These are not fatal: a missing
    /// lock later triggers a retry.
    fn check(&self, op: &str, result: io::Result<()>) {
        if let Err(e) = result {
            error!("frontend {}: {op} failed: {e}", self.index);
        }
    }

    fn set_frontend(&mut self, state: &mut State) -> Result<(), TuneError> {
        let mut clear = CommandSeq::new(self.index);
        clear.push(DTV_CLEAR, 0)?;
        self.frontend
            .set_properties(&clear)
            .map_err(io_error(self.index, "FE_SET_PROPERTY"))?;

        let tp = state.transponder.clone();
        let mut seq = CommandSeq::new(self.index);
        let (tune_timeout, lock_timeout) = match self.delivery_system {
            DeliverySystem::Dvbs | DeliverySystem::Dvbs2 => {
                let frequency = self.prepare_lnb(&tp, &mut state.last_diseqc)?;
                push_satellite(&mut seq, &tp, frequency, self.delivery_system, self.index)?;
                (DVBS_TUNE_TIMEOUT, DVBS_LOCK_TIMEOUT)
            }
            DeliverySystem::DvbcAnnexAc | DeliverySystem::DvbcAnnexB => {
                push_cable(&mut seq, &tp, self.delivery_system, self.index)?;
                (DVBC_TUNE_TIMEOUT, DVBC_LOCK_TIMEOUT)
            }
            DeliverySystem::Dvbt => {
                push_terrestrial(&mut seq, &tp, self.delivery_system)?;
                (DVBT_TUNE_TIMEOUT, DVBT_LOCK_TIMEOUT)
            }
            other => return Err(TuneError::UnsupportedDeliverySystem(other)),
        };
        seq.push(DTV_TUNE, 0)?;
        self.frontend
            .set_properties(&seq)
            .map_err(io_error(self.index, "FE_SET_PROPERTY"))?;

        state.tune_timeout = tune_timeout;
        state.lock_timeout = lock_timeout;
        Ok(())
    }

    /// Drives the dish for `tp` and returns the intermediate frequency in MHz.
    fn prepare_lnb(
        &mut self,
        tp: &Transponder,
        last_diseqc: &mut Option<Vec<DiseqcAction>>,
    ) -> Result<u32, TuneError> {
        let mut frequency = i64::from(tp.frequency);
        if self.switch.diseqc {
            let entry = self
                .diseqc
                .resolve(tp.source, tp.frequency, tp.polarization)
                .ok_or(TuneError::NoDiseqcEntry(tp.transponder_id()))?;
            if !entry.actions.is_empty() && last_diseqc.as_ref() != Some(&entry.actions) {
                for action in &entry.actions {
                    self.execute(action);
                }
                *last_diseqc = Some(entry.actions.clone());
            }
            frequency -= i64::from(entry.lof);
        } else {
            let lnb = LnbSetting::select(tp.frequency, tp.polarization, &self.switch);
            frequency -= i64::from(lnb.lof);
            let result = self.frontend.set_voltage(lnb.voltage);
            self.check("FE_SET_VOLTAGE", result);
            let result = self.frontend.set_tone(lnb.tone);
            self.check("FE_SET_TONE", result);
        }
        // C-band LNBs put the transponder below the local oscillator
        Ok(frequency.unsigned_abs() as u32)
    }

    fn execute(&mut self, action: &DiseqcAction) {
        let (op, result) = match action {
            DiseqcAction::ToneOff => ("FE_SET_TONE", self.frontend.set_tone(Tone::Off)),
            DiseqcAction::ToneOn => ("FE_SET_TONE", self.frontend.set_tone(Tone::On)),
            DiseqcAction::Voltage13 => ("FE_SET_VOLTAGE", self.frontend.set_voltage(Voltage::V13)),
            DiseqcAction::Voltage18 => ("FE_SET_VOLTAGE", self.frontend.set_voltage(Voltage::V18)),
            DiseqcAction::MiniA => ("FE_DISEQC_SEND_BURST", self.frontend.send_burst(Burst::MiniA)),
            DiseqcAction::MiniB => ("FE_DISEQC_SEND_BURST", self.frontend.send_burst(Burst::MiniB)),
            DiseqcAction::Codes(codes) => (
                "FE_DISEQC_SEND_MASTER_CMD",
                self.frontend.send_master_cmd(codes),
            ),
        };
        self.check(op, result);
    }
}

fn io_error(frontend: usize, op: &'static str) -> impl FnOnce(io::Error) -> TuneError {
    move |source| TuneError::Io {
        frontend,
        op,
        source,
    }
}

/// Band selection for a plain universal LNB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LnbSetting {
    pub lof: u32,
    pub tone: Tone,
    pub voltage: Voltage,
}

impl LnbSetting {
    pub(crate) fn select(frequency: u32, polarization: Polarization, switch: &SwitchConfig) -> Self {
        let (lof, tone) = if frequency < switch.lnb_slof {
            (switch.lnb_low, Tone::Off)
        } else {
            (switch.lnb_high, Tone::On)
        };
        let voltage = match polarization {
            Polarization::Vertical | Polarization::CircularRight => Voltage::V13,
            _ => Voltage::V18,
        };
        LnbSetting { lof, tone, voltage }
    }
}

/// Scales a frequency given in kHz or MHz up to Hz.
pub fn frequency_to_hz(mut f: u32) -> u32 {
    while f != 0 && f < 1_000_000 {
        f *= 1000;
    }
    f
}

/// Scales a kHz/kBd value to Hz/Bd.
fn kilo(frontend: usize, parameter: &'static str, value: u32) -> Result<u32, TuneError> {
    value.checked_mul(1000).ok_or(TuneError::OutOfRange {
        frontend,
        parameter,
        value,
    })
}

/// DVB-S/DVB-S2 properties. `frequency` is the intermediate frequency in MHz.
fn push_satellite(
    seq: &mut CommandSeq,
    tp: &Transponder,
    frequency: u32,
    frontend_system: DeliverySystem,
    index: usize,
) -> Result<(), TuneError> {
    seq.push(DTV_DELIVERY_SYSTEM, tp.system as u32)?;
    seq.push(DTV_FREQUENCY, kilo(index, "frequency", frequency)?)?;
    seq.push(DTV_MODULATION, tp.modulation as u32)?;
    seq.push(DTV_SYMBOL_RATE, kilo(index, "symbol rate", tp.symbol_rate)?)?;
    seq.push(DTV_INNER_FEC, tp.code_rate_hp as u32)?;
    seq.push(DTV_INVERSION, tp.inversion as u32)?;
    if tp.system == DeliverySystem::Dvbs2 {
        if frontend_system != DeliverySystem::Dvbs2 {
            return Err(TuneError::S2NotSupported(index));
        }
        seq.push(DTV_PILOT, PILOT_AUTO)?;
        seq.push(DTV_ROLLOFF, tp.roll_off as u32)?;
    } else {
        // DVB-S always has a roll-off of 0.35
        seq.push(DTV_ROLLOFF, RollOff::RollOff35 as u32)?;
    }
    Ok(())
}

fn push_cable(
    seq: &mut CommandSeq,
    tp: &Transponder,
    frontend_system: DeliverySystem,
    index: usize,
) -> Result<(), TuneError> {
    seq.push(DTV_DELIVERY_SYSTEM, frontend_system as u32)?;
    seq.push(DTV_FREQUENCY, frequency_to_hz(tp.frequency))?;
    seq.push(DTV_INVERSION, tp.inversion as u32)?;
    seq.push(DTV_SYMBOL_RATE, kilo(index, "symbol rate", tp.symbol_rate)?)?;
    seq.push(DTV_INNER_FEC, tp.code_rate_hp as u32)?;
    seq.push(DTV_MODULATION, tp.modulation as u32)?;
    Ok(())
}

fn push_terrestrial(
    seq: &mut CommandSeq,
    tp: &Transponder,
    frontend_system: DeliverySystem,
) -> Result<(), TuneError> {
    seq.push(DTV_DELIVERY_SYSTEM, frontend_system as u32)?;
    seq.push(DTV_FREQUENCY, frequency_to_hz(tp.frequency))?;
    seq.push(DTV_INVERSION, tp.inversion as u32)?;
    seq.push(DTV_BANDWIDTH_HZ, tp.bandwidth)?;
    seq.push(DTV_CODE_RATE_HP, tp.code_rate_hp as u32)?;
    seq.push(DTV_CODE_RATE_LP, tp.code_rate_lp as u32)?;
    seq.push(DTV_MODULATION, tp.modulation as u32)?;
    seq.push(DTV_TRANSMISSION_MODE, tp.transmission_mode as u32)?;
    seq.push(DTV_GUARD_INTERVAL, tp.guard_interval as u32)?;
    seq.push(DTV_HIERARCHY, tp.hierarchy as u32)?;
    Ok(())
}
