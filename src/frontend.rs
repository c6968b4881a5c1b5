use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd};
use std::time::Duration;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::channel::DeliverySystem;
use crate::diseqc::DISEQC_MAX_MSG;
use crate::error::TuneError;

// DVB v5 API property command IDs
pub const DTV_TUNE: u32 = 1;
pub const DTV_CLEAR: u32 = 2;
pub const DTV_FREQUENCY: u32 = 3;
pub const DTV_MODULATION: u32 = 4;
pub const DTV_BANDWIDTH_HZ: u32 = 5;
pub const DTV_INVERSION: u32 = 6;
pub const DTV_SYMBOL_RATE: u32 = 8;
pub const DTV_INNER_FEC: u32 = 9;
pub const DTV_PILOT: u32 = 12;
pub const DTV_ROLLOFF: u32 = 13;
pub const DTV_DELIVERY_SYSTEM: u32 = 17;
pub const DTV_CODE_RATE_HP: u32 = 36;
pub const DTV_CODE_RATE_LP: u32 = 37;
pub const DTV_GUARD_INTERVAL: u32 = 38;
pub const DTV_TRANSMISSION_MODE: u32 = 39;
pub const DTV_HIERARCHY: u32 = 40;

pub const PILOT_AUTO: u32 = 2;

/// Upper bound on properties in one FE_SET_PROPERTY batch.
pub const MAX_FRONTEND_CMDS: usize = 16;

// fe_type_t
const FE_QPSK: u32 = 0;
const FE_QAM: u32 = 1;
const FE_OFDM: u32 = 2;
const FE_ATSC: u32 = 3;

const FE_CAN_2G_MODULATION: u32 = 0x1000_0000;

bitflags! {
    /// Kernel `fe_status_t`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FrontendStatus: u32 {
        const HAS_SIGNAL = 0x01;
        const HAS_CARRIER = 0x02;
        const HAS_VITERBI = 0x04;
        const HAS_SYNC = 0x08;
        const HAS_LOCK = 0x10;
        const TIMEDOUT = 0x20;
        const REINIT = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    On = 0,
    Off = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voltage {
    V13 = 0,
    V18 = 1,
    Off = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Burst {
    MiniA = 0,
    MiniB = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub cmd: u32,
    pub data: u32,
}

/// A bounded batch of frontend properties.
#[derive(Debug, Clone)]
pub struct CommandSeq {
    frontend: usize,
    props: Vec<Property>,
}

impl CommandSeq {
    pub fn new(frontend: usize) -> Self {
        CommandSeq {
            frontend,
            props: Vec::with_capacity(MAX_FRONTEND_CMDS),
        }
    }

    pub fn push(&mut self, cmd: u32, data: u32) -> Result<(), TuneError> {
        if self.props.len() >= MAX_FRONTEND_CMDS {
            return Err(TuneError::TooManyCommands(self.frontend));
        }
        self.props.push(Property { cmd, data });
        Ok(())
    }

    pub fn props(&self) -> &[Property] {
        &self.props
    }

    pub fn get(&self, cmd: u32) -> Option<u32> {
        self.props.iter().find(|p| p.cmd == cmd).map(|p| p.data)
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

/// The front-end hardware as seen by the tuner worker.
pub trait Frontend: Send {
    /// Waits up to `timeout` for frontend events, then reads the status.
    fn read_status(&mut self, timeout: Duration) -> io::Result<FrontendStatus>;
    fn set_properties(&mut self, seq: &CommandSeq) -> io::Result<()>;
    fn set_tone(&mut self, tone: Tone) -> io::Result<()>;
    fn set_voltage(&mut self, voltage: Voltage) -> io::Result<()>;
    fn send_burst(&mut self, burst: Burst) -> io::Result<()>;
    fn send_master_cmd(&mut self, msg: &[u8]) -> io::Result<()>;
}

// Kernel struct: dtv_property (76 bytes, packed)
//   cmd: u32, reserved: [u32; 3], u: union(56 bytes), result: i32
#[repr(C, packed)]
struct DtvProperty {
    cmd: u32,
    reserved: [u32; 3],
    data: u32,
    _padding: [u8; 52], // remaining union space (56 - 4)
    result: i32,
}

// Kernel struct: dtv_properties (16 bytes on 64-bit)
//   num: u32, (4 bytes padding), props: *mut DtvProperty
#[repr(C)]
struct DtvProperties {
    num: u32,
    props: *mut DtvProperty,
}

impl DtvProperty {
    fn new(cmd: u32, data: u32) -> Self {
        DtvProperty {
            cmd,
            reserved: [0; 3],
            data,
            _padding: [0; 52],
            result: 0,
        }
    }
}

#[repr(C)]
struct DvbDiseqcMasterCmd {
    msg: [u8; DISEQC_MAX_MSG],
    msg_len: u8,
}

// Kernel struct: dvb_frontend_event (40 bytes)
//   status: u32, parameters: dvb_frontend_parameters (36 bytes)
#[allow(dead_code)]
#[repr(C)]
struct DvbFrontendEvent {
    status: u32,
    frequency: u32,
    inversion: u32,
    _params: [u32; 7],
}

// Kernel struct: dvb_frontend_info (168 bytes)
#[allow(dead_code)]
#[repr(C)]
struct DvbFrontendInfo {
    name: [u8; 128],
    fe_type: u32,
    frequency_min: u32,
    frequency_max: u32,
    frequency_stepsize: u32,
    frequency_tolerance: u32,
    symbol_rate_min: u32,
    symbol_rate_max: u32,
    symbol_rate_tolerance: u32,
    notifier_delay: u32,
    caps: u32,
}

// ioctl declarations
nix::ioctl_write_ptr!(fe_set_property, b'o', 82, DtvProperties);
nix::ioctl_read!(fe_read_status, b'o', 69, u32);
nix::ioctl_read!(fe_get_event, b'o', 78, DvbFrontendEvent);
nix::ioctl_read!(fe_get_info, b'o', 61, DvbFrontendInfo);
nix::ioctl_write_ptr!(fe_diseqc_send_master_cmd, b'o', 63, DvbDiseqcMasterCmd);
nix::ioctl_write_int_bad!(fe_diseqc_send_burst, nix::request_code_none!(b'o', 65));
nix::ioctl_write_int_bad!(fe_set_tone, nix::request_code_none!(b'o', 66));
nix::ioctl_write_int_bad!(fe_set_voltage, nix::request_code_none!(b'o', 67));

/// What FE_GET_INFO reports about a frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendInfo {
    pub name: String,
    pub delivery_system: DeliverySystem,
}

/// Maps the legacy frontend type and capability bits to a delivery system.
fn delivery_system_of(fe_type: u32, caps: u32) -> Option<DeliverySystem> {
    match fe_type {
        FE_QPSK if caps & FE_CAN_2G_MODULATION != 0 => Some(DeliverySystem::Dvbs2),
        FE_QPSK => Some(DeliverySystem::Dvbs),
        FE_OFDM => Some(DeliverySystem::Dvbt),
        FE_QAM => Some(DeliverySystem::DvbcAnnexAc),
        FE_ATSC => Some(DeliverySystem::Atsc),
        _ => None,
    }
}

pub fn frontend_path(adapter: u32) -> String {
    format!("/dev/dvb/adapter{adapter}/frontend0")
}

/// A Linux DVB frontend character device.
pub struct DvbFrontend {
    fe_file: File,
}

impl DvbFrontend {
    pub fn open(adapter: u32) -> io::Result<Self> {
        let fe_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(frontend_path(adapter))?;
        Ok(DvbFrontend { fe_file })
    }

    pub fn info(&self) -> io::Result<FrontendInfo> {
        let fd = self.fe_file.as_raw_fd();
        let mut info = DvbFrontendInfo {
            name: [0; 128],
            fe_type: 0,
            frequency_min: 0,
            frequency_max: 0,
            frequency_stepsize: 0,
            frequency_tolerance: 0,
            symbol_rate_min: 0,
            symbol_rate_max: 0,
            symbol_rate_tolerance: 0,
            notifier_delay: 0,
            caps: 0,
        };
        unsafe {
            fe_get_info(fd, &mut info)?;
        }
        let len = info.name.iter().position(|&b| b == 0).unwrap_or(info.name.len());
        let name = String::from_utf8_lossy(&info.name[..len]).trim().to_string();
        let delivery_system = delivery_system_of(info.fe_type, info.caps).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unknown frontend type {}", info.fe_type),
            )
        })?;
        Ok(FrontendInfo {
            name,
            delivery_system,
        })
    }

    fn drain_events(&self) {
        let fd = self.fe_file.as_raw_fd();
        let mut event = DvbFrontendEvent {
            status: 0,
            frequency: 0,
            inversion: 0,
            _params: [0; 7],
        };
        // just to clear the event queue, the actual status is read afterwards
        while unsafe { fe_get_event(fd, &mut event) }.is_ok() {}
    }
}

impl Frontend for DvbFrontend {
    fn read_status(&mut self, timeout: Duration) -> io::Result<FrontendStatus> {
        if !timeout.is_zero() {
            let poll_fd = PollFd::new(self.fe_file.as_fd(), PollFlags::POLLIN | PollFlags::POLLPRI);
            let poll_timeout =
                PollTimeout::try_from(timeout.as_millis() as i32).unwrap_or(PollTimeout::NONE);
            match poll(&mut [poll_fd], poll_timeout) {
                Ok(n) if n > 0 => self.drain_events(),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let fd = self.fe_file.as_raw_fd();
        loop {
            let mut status: u32 = 0;
            match unsafe { fe_read_status(fd, &mut status) } {
                Ok(_) => return Ok(FrontendStatus::from_bits_truncate(status)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn set_properties(&mut self, seq: &CommandSeq) -> io::Result<()> {
        let fd = self.fe_file.as_raw_fd();
        let mut props: Vec<DtvProperty> = seq
            .props()
            .iter()
            .map(|p| DtvProperty::new(p.cmd, p.data))
            .collect();
        let mut dtv_props = DtvProperties {
            num: props.len() as u32,
            props: props.as_mut_ptr(),
        };
        unsafe {
            fe_set_property(fd, &mut dtv_props)?;
        }
        Ok(())
    }

    fn set_tone(&mut self, tone: Tone) -> io::Result<()> {
        unsafe { fe_set_tone(self.fe_file.as_raw_fd(), tone as libc::c_int) }?;
        Ok(())
    }

    fn set_voltage(&mut self, voltage: Voltage) -> io::Result<()> {
        unsafe { fe_set_voltage(self.fe_file.as_raw_fd(), voltage as libc::c_int) }?;
        Ok(())
    }

    fn send_burst(&mut self, burst: Burst) -> io::Result<()> {
        unsafe { fe_diseqc_send_burst(self.fe_file.as_raw_fd(), burst as libc::c_int) }?;
        Ok(())
    }

    fn send_master_cmd(&mut self, msg: &[u8]) -> io::Result<()> {
        let mut cmd = DvbDiseqcMasterCmd {
            msg: [0; DISEQC_MAX_MSG],
            msg_len: 0,
        };
        let len = msg.len().min(cmd.msg.len());
        cmd.msg[..len].copy_from_slice(&msg[..len]);
        cmd.msg_len = len as u8;
        unsafe {
            fe_diseqc_send_master_cmd(self.fe_file.as_raw_fd(), &cmd)?;
        }
        Ok(())
    }
}
