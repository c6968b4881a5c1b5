use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::ChannelError;

/// CA system ids below this value are free-to-air or reserved ranges.
pub const CA_ENCRYPTED_MIN: u16 = 0x0100;

/// Kernel `fe_delivery_system` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum DeliverySystem {
    #[default]
    Undefined = 0,
    DvbcAnnexAc = 1,
    DvbcAnnexB = 2,
    Dvbt = 3,
    Dss = 4,
    Dvbs = 5,
    Dvbs2 = 6,
    Dvbh = 7,
    Isdbt = 8,
    Isdbs = 9,
    Isdbc = 10,
    Atsc = 11,
    Atscmh = 12,
    Dmbth = 13,
    Cmmb = 14,
    Dab = 15,
}

impl DeliverySystem {
    pub fn source_kind(self) -> SourceKind {
        match self {
            DeliverySystem::Dvbs | DeliverySystem::Dvbs2 => SourceKind::Satellite,
            DeliverySystem::DvbcAnnexAc | DeliverySystem::DvbcAnnexB => SourceKind::Cable,
            DeliverySystem::Dvbt => SourceKind::Terrestrial,
            _ => SourceKind::None,
        }
    }
}

impl fmt::Display for DeliverySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliverySystem::Undefined => "UNDEFINED",
            DeliverySystem::DvbcAnnexAc | DeliverySystem::DvbcAnnexB => "DVB-C",
            DeliverySystem::Dvbt => "DVB-T",
            DeliverySystem::Dss => "DSS",
            DeliverySystem::Dvbs => "DVB-S",
            DeliverySystem::Dvbs2 => "DVB-S2",
            DeliverySystem::Dvbh => "DVB-H",
            DeliverySystem::Isdbt => "ISDBT",
            DeliverySystem::Isdbs => "ISDBS",
            DeliverySystem::Isdbc => "ISDBC",
            DeliverySystem::Atsc => "ATSC",
            DeliverySystem::Atscmh => "ATSCMH",
            DeliverySystem::Dmbth => "DMBTH",
            DeliverySystem::Cmmb => "CMMB",
            DeliverySystem::Dab => "DAB",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SourceKind {
    #[default]
    None,
    Cable,
    Satellite,
    Terrestrial,
}

/// Signal source. Satellites carry their orbital position in tenths of a
/// degree, east positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Source {
    pub kind: SourceKind,
    pub position: i16,
}

impl Source {
    pub const CABLE: Source = Source { kind: SourceKind::Cable, position: 0 };
    pub const TERRESTRIAL: Source = Source { kind: SourceKind::Terrestrial, position: 0 };

    pub fn satellite(position: i16) -> Self {
        Source { kind: SourceKind::Satellite, position }
    }

    pub fn is_sat(&self) -> bool {
        self.kind == SourceKind::Satellite
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SourceKind::None => f.write_str("-"),
            SourceKind::Cable => f.write_str("C"),
            SourceKind::Terrestrial => f.write_str("T"),
            SourceKind::Satellite => {
                let p = self.position.unsigned_abs();
                let dir = if self.position < 0 { 'W' } else { 'E' };
                write!(f, "S{}.{}{dir}", p / 10, p % 10)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Polarization {
    #[default]
    None,
    Horizontal,
    Vertical,
    CircularLeft,
    CircularRight,
}

impl Polarization {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'H' => Some(Polarization::Horizontal),
            'V' => Some(Polarization::Vertical),
            'L' => Some(Polarization::CircularLeft),
            'R' => Some(Polarization::CircularRight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Modulation {
    #[default]
    Qpsk = 0,
    Qam16 = 1,
    Qam32 = 2,
    Qam64 = 3,
    Qam128 = 4,
    Qam256 = 5,
    QamAuto = 6,
    Vsb8 = 7,
    Vsb16 = 8,
    Psk8 = 9,
    Apsk16 = 10,
    Apsk32 = 11,
    Dqpsk = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum CodeRate {
    None = 0,
    Fec1_2 = 1,
    Fec2_3 = 2,
    Fec3_4 = 3,
    Fec4_5 = 4,
    Fec5_6 = 5,
    Fec6_7 = 6,
    Fec7_8 = 7,
    Fec8_9 = 8,
    #[default]
    Auto = 9,
    Fec3_5 = 10,
    Fec9_10 = 11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Inversion {
    Off = 0,
    On = 1,
    #[default]
    Auto = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum TransmissionMode {
    Mode2K = 0,
    Mode8K = 1,
    #[default]
    Auto = 2,
    Mode4K = 3,
    Mode1K = 4,
    Mode16K = 5,
    Mode32K = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum GuardInterval {
    Guard1_32 = 0,
    Guard1_16 = 1,
    Guard1_8 = 2,
    Guard1_4 = 3,
    #[default]
    Auto = 4,
    Guard1_128 = 5,
    Guard19_128 = 6,
    Guard19_256 = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Hierarchy {
    #[default]
    None = 0,
    Hierarchy1 = 1,
    Hierarchy2 = 2,
    Hierarchy4 = 3,
    Auto = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum RollOff {
    #[default]
    RollOff35 = 0,
    RollOff20 = 1,
    RollOff25 = 2,
    Auto = 3,
}

/// Everything needed to lock onto one multiplex.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transponder {
    pub source: Source,
    /// MHz for satellites; Hz, kHz or MHz for cable and terrestrial.
    pub frequency: u32,
    pub polarization: Polarization,
    /// kSym/s
    pub symbol_rate: u32,
    pub modulation: Modulation,
    pub code_rate_hp: CodeRate,
    pub code_rate_lp: CodeRate,
    pub roll_off: RollOff,
    pub guard_interval: GuardInterval,
    pub transmission_mode: TransmissionMode,
    pub hierarchy: Hierarchy,
    /// Hz, 0 = auto
    pub bandwidth: u32,
    pub inversion: Inversion,
    pub system: DeliverySystem,
}

impl Transponder {
    /// Frequency scaled to MHz, with the polarization folded in for
    /// satellites that reuse a frequency on both planes.
    pub fn transponder_id(&self) -> u32 {
        let mut tf = self.frequency;
        while tf > 20_000 {
            tf /= 1000;
        }
        if self.source.is_sat() {
            tf += match self.polarization {
                Polarization::Horizontal => 100_000,
                Polarization::Vertical => 200_000,
                Polarization::CircularLeft => 300_000,
                Polarization::CircularRight => 400_000,
                Polarization::None => 0,
            };
        }
        tf
    }

    /// Whether `other` describes the same physical signal. Only the
    /// parameters that matter for `other`'s delivery family are compared.
    pub fn same_transponder(&self, other: &Transponder) -> bool {
        if self.source != other.source || self.transponder_id() != other.transponder_id() {
            return false;
        }
        let kind = other.source.kind;
        let cable = kind == SourceKind::Cable;
        let sat = kind == SourceKind::Satellite;
        let terr = kind == SourceKind::Terrestrial;
        let cst = cable || sat || terr;

        if terr && self.bandwidth != other.bandwidth {
            return false;
        }
        if cst && self.code_rate_hp != other.code_rate_hp {
            return false;
        }
        if terr && self.code_rate_lp != other.code_rate_lp {
            return false;
        }
        if terr && self.guard_interval != other.guard_interval {
            return false;
        }
        if cst && self.inversion != other.inversion {
            return false;
        }
        if cst && self.modulation != other.modulation {
            return false;
        }
        if sat && self.roll_off != other.roll_off {
            return false;
        }
        if sat && self.system != other.system {
            return false;
        }
        if (cable || sat) && self.symbol_rate != other.symbol_rate {
            return false;
        }
        if terr && self.transmission_mode != other.transmission_mode {
            return false;
        }
        if terr && self.hierarchy != other.hierarchy {
            return false;
        }
        true
    }
}

/// Identity of a service: where it is broadcast and its service id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub source: Source,
    pub transponder: u32,
    pub service_id: u16,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.source, self.transponder, self.service_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub number: u32,
    pub name: String,
    pub transponder: Transponder,
    pub video_pid: u16,
    pub pcr_pid: u16,
    pub audio_pids: Vec<u16>,
    pub dolby_pids: Vec<u16>,
    pub subtitle_pids: Vec<u16>,
    pub teletext_pid: u16,
    pub ca: u16,
    pub service_id: u16,
}

impl Channel {
    pub fn audio_pid(&self) -> u16 {
        self.audio_pids.first().copied().unwrap_or(0)
    }

    pub fn dolby_pid(&self) -> u16 {
        self.dolby_pids.first().copied().unwrap_or(0)
    }

    pub fn is_encrypted(&self) -> bool {
        self.ca >= CA_ENCRYPTED_MIN
    }

    pub fn id(&self) -> ChannelId {
        ChannelId {
            source: self.transponder.source,
            transponder: self.transponder.transponder_id(),
            service_id: self.service_id,
        }
    }
}

fn parse_bandwidth(s: &str) -> Result<u32, String> {
    match s {
        "BANDWIDTH_6_MHZ" => Ok(6_000_000),
        "BANDWIDTH_7_MHZ" => Ok(7_000_000),
        "BANDWIDTH_8_MHZ" => Ok(8_000_000),
        "BANDWIDTH_5_MHZ" => Ok(5_000_000),
        "BANDWIDTH_10_MHZ" => Ok(10_000_000),
        "BANDWIDTH_1_712_MHZ" => Ok(1_712_000),
        "BANDWIDTH_AUTO" => Ok(0),
        _ => Err(format!("Unknown bandwidth: {s}")),
    }
}

fn parse_modulation(s: &str) -> Result<Modulation, String> {
    match s {
        "QPSK" => Ok(Modulation::Qpsk),
        "QAM_16" => Ok(Modulation::Qam16),
        "QAM_32" => Ok(Modulation::Qam32),
        "QAM_64" => Ok(Modulation::Qam64),
        "QAM_128" => Ok(Modulation::Qam128),
        "QAM_256" => Ok(Modulation::Qam256),
        "QAM_AUTO" => Ok(Modulation::QamAuto),
        "8VSB" => Ok(Modulation::Vsb8),
        "16VSB" => Ok(Modulation::Vsb16),
        "PSK_8" => Ok(Modulation::Psk8),
        _ => Err(format!("Unknown modulation: {s}")),
    }
}

fn parse_fec(s: &str) -> Result<CodeRate, String> {
    match s {
        "FEC_NONE" => Ok(CodeRate::None),
        "FEC_1_2" => Ok(CodeRate::Fec1_2),
        "FEC_2_3" => Ok(CodeRate::Fec2_3),
        "FEC_3_4" => Ok(CodeRate::Fec3_4),
        "FEC_4_5" => Ok(CodeRate::Fec4_5),
        "FEC_5_6" => Ok(CodeRate::Fec5_6),
        "FEC_6_7" => Ok(CodeRate::Fec6_7),
        "FEC_7_8" => Ok(CodeRate::Fec7_8),
        "FEC_8_9" => Ok(CodeRate::Fec8_9),
        "FEC_AUTO" => Ok(CodeRate::Auto),
        "FEC_3_5" => Ok(CodeRate::Fec3_5),
        "FEC_9_10" => Ok(CodeRate::Fec9_10),
        _ => Err(format!("Unknown FEC: {s}")),
    }
}

fn parse_inversion(s: &str) -> Result<Inversion, String> {
    match s {
        "INVERSION_OFF" => Ok(Inversion::Off),
        "INVERSION_ON" => Ok(Inversion::On),
        "INVERSION_AUTO" => Ok(Inversion::Auto),
        _ => Err(format!("Unknown inversion: {s}")),
    }
}

fn parse_transmission_mode(s: &str) -> Result<TransmissionMode, String> {
    match s {
        "TRANSMISSION_MODE_2K" => Ok(TransmissionMode::Mode2K),
        "TRANSMISSION_MODE_8K" => Ok(TransmissionMode::Mode8K),
        "TRANSMISSION_MODE_AUTO" => Ok(TransmissionMode::Auto),
        "TRANSMISSION_MODE_4K" => Ok(TransmissionMode::Mode4K),
        "TRANSMISSION_MODE_1K" => Ok(TransmissionMode::Mode1K),
        "TRANSMISSION_MODE_16K" => Ok(TransmissionMode::Mode16K),
        "TRANSMISSION_MODE_32K" => Ok(TransmissionMode::Mode32K),
        _ => Err(format!("Unknown transmission mode: {s}")),
    }
}

fn parse_guard_interval(s: &str) -> Result<GuardInterval, String> {
    match s {
        "GUARD_INTERVAL_1_32" => Ok(GuardInterval::Guard1_32),
        "GUARD_INTERVAL_1_16" => Ok(GuardInterval::Guard1_16),
        "GUARD_INTERVAL_1_8" => Ok(GuardInterval::Guard1_8),
        "GUARD_INTERVAL_1_4" => Ok(GuardInterval::Guard1_4),
        "GUARD_INTERVAL_AUTO" => Ok(GuardInterval::Auto),
        _ => Err(format!("Unknown guard interval: {s}")),
    }
}

fn parse_hierarchy(s: &str) -> Result<Hierarchy, String> {
    match s {
        "HIERARCHY_NONE" => Ok(Hierarchy::None),
        "HIERARCHY_1" => Ok(Hierarchy::Hierarchy1),
        "HIERARCHY_2" => Ok(Hierarchy::Hierarchy2),
        "HIERARCHY_4" => Ok(Hierarchy::Hierarchy4),
        "HIERARCHY_AUTO" => Ok(Hierarchy::Auto),
        _ => Err(format!("Unknown hierarchy: {s}")),
    }
}

fn parse_num<T: FromStr>(what: &str, s: &str) -> Result<T, String>
where
    T::Err: fmt::Display,
{
    s.parse::<T>().map_err(|e| format!("invalid {what} '{s}': {e}"))
}

/// Parses one zap-style line. The field count selects the family:
/// 13 fields tzap (DVB-T), 9 fields czap (DVB-C), 8 fields szap (DVB-S).
fn parse_zap_line(number: u32, fields: &[&str]) -> Result<Channel, String> {
    let mut tp = Transponder::default();
    let (vpid, apid, sid) = match fields.len() {
        13 => {
            tp.source = Source::TERRESTRIAL;
            tp.system = DeliverySystem::Dvbt;
            tp.frequency = parse_num("frequency", fields[1])?;
            tp.inversion = parse_inversion(fields[2])?;
            tp.bandwidth = parse_bandwidth(fields[3])?;
            tp.code_rate_hp = parse_fec(fields[4])?;
            tp.code_rate_lp = parse_fec(fields[5])?;
            tp.modulation = parse_modulation(fields[6])?;
            tp.transmission_mode = parse_transmission_mode(fields[7])?;
            tp.guard_interval = parse_guard_interval(fields[8])?;
            tp.hierarchy = parse_hierarchy(fields[9])?;
            (fields[10], fields[11], fields[12])
        }
        9 => {
            tp.source = Source::CABLE;
            tp.system = DeliverySystem::DvbcAnnexAc;
            tp.frequency = parse_num("frequency", fields[1])?;
            tp.inversion = parse_inversion(fields[2])?;
            tp.symbol_rate = parse_num::<u32>("symbol rate", fields[3])? / 1000;
            tp.code_rate_hp = parse_fec(fields[4])?;
            tp.modulation = parse_modulation(fields[5])?;
            (fields[6], fields[7], fields[8])
        }
        8 => {
            // The switch input number (fields[3]) is resolved by the DiSEqC source.
            tp.source = Source::satellite(0);
            tp.system = DeliverySystem::Dvbs;
            tp.frequency = parse_num("frequency", fields[1])?;
            tp.polarization = fields[2]
                .chars()
                .next()
                .and_then(Polarization::from_char)
                .ok_or_else(|| format!("invalid polarization '{}'", fields[2]))?;
            tp.symbol_rate = parse_num("symbol rate", fields[4])?;
            (fields[5], fields[6], fields[7])
        }
        n => return Err(format!("expected 8, 9 or 13 fields, got {n}")),
    };

    let video_pid: u16 = parse_num("video PID", vpid)?;
    let audio_pid: u16 = parse_num("audio PID", apid)?;
    Ok(Channel {
        number,
        name: fields[0].to_string(),
        transponder: tp,
        video_pid,
        pcr_pid: video_pid,
        audio_pids: if audio_pid != 0 { vec![audio_pid] } else { Vec::new() },
        service_id: parse_num("service ID", sid)?,
        ..Default::default()
    })
}

pub fn parse_channels_conf(path: &Path) -> Result<Vec<Channel>, ChannelError> {
    let content = fs::read_to_string(path).map_err(|source| ChannelError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut channels = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(':').collect();
        let number = channels.len() as u32 + 1;
        let channel = parse_zap_line(number, &fields).map_err(|message| ChannelError::Parse {
            line: line_num + 1,
            message,
        })?;
        channels.push(channel);
    }

    Ok(channels)
}
