use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use log::error;

pub const DMX_FILTER_SIZE: usize = 16;
pub const DMX_IMMEDIATE_START: u32 = 4;

const DMX_IN_FRONTEND: u32 = 0;

/// PID value no stream ever uses; parks a decoder filter.
pub const PID_DISABLED: u16 = 0x1FFF;

/// Kernel `dmx_output_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmxOutput {
    Decoder = 0,
    Tap = 1,
    TsTap = 2,
}

/// Kernel `dmx_pes_type_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesType {
    Audio = 0,
    Video = 1,
    Teletext = 2,
    Subtitle = 3,
    Pcr = 4,
    Other = 20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesFilter {
    pub pid: u16,
    pub output: DmxOutput,
    pub pes_type: PesType,
}

/// One open demux handle. Dropping it closes the handle.
pub trait FilterHandle: Send {
    fn set_pes_filter(&mut self, filter: &PesFilter) -> io::Result<()>;
    fn stop(&mut self) -> io::Result<()>;
}

pub trait Demux: Send {
    fn open_filter(&self) -> io::Result<Box<dyn FilterHandle>>;
}

#[repr(C)]
pub struct DmxFilter {
    pub filter: [u8; DMX_FILTER_SIZE],
    pub mask: [u8; DMX_FILTER_SIZE],
    pub mode: [u8; DMX_FILTER_SIZE],
}

#[repr(C)]
pub struct DmxSctFilterParams {
    pub pid: u16,
    pub filter: DmxFilter,
    pub timeout: u32,
    pub flags: u32,
}

#[repr(C)]
struct DmxPesFilterParams {
    pid: u16,
    input: u32,
    output: u32,
    pes_type: u32,
    flags: u32,
}

nix::ioctl_none!(dmx_stop, b'o', 42);
nix::ioctl_write_ptr!(dmx_set_filter, b'o', 43, DmxSctFilterParams);
nix::ioctl_write_ptr!(dmx_set_pes_filter, b'o', 44, DmxPesFilterParams);

pub fn demux_path(adapter: u32) -> String {
    format!("/dev/dvb/adapter{adapter}/demux0")
}

fn open_demux(adapter: u32) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(demux_path(adapter))
}

/// Open the demux device and set a section filter matching `tid` under
/// `mask` on the given PID.
pub fn open_section_filter(adapter: u32, pid: u16, tid: u8, mask: u8) -> io::Result<File> {
    let demux_file = open_demux(adapter).inspect_err(|e| {
        error!("can't open filter handle on '{}': {e}", demux_path(adapter));
    })?;

    let fd = demux_file.as_raw_fd();

    let mut params = DmxSctFilterParams {
        pid,
        filter: DmxFilter {
            filter: [0u8; DMX_FILTER_SIZE],
            mask: [0u8; DMX_FILTER_SIZE],
            mode: [0u8; DMX_FILTER_SIZE],
        },
        timeout: 0,
        flags: DMX_IMMEDIATE_START,
    };
    params.filter.filter[0] = tid;
    params.filter.mask[0] = mask;

    unsafe {
        dmx_set_filter(fd, &params).inspect_err(|e| {
            error!("can't set filter (pid={pid}, tid={tid:02X}, mask={mask:02X}): {e}");
        })?;
    }

    Ok(demux_file)
}

/// PES filters on `/dev/dvb/adapterN/demux0`.
pub struct DvbDemux {
    adapter: u32,
}

impl DvbDemux {
    pub fn new(adapter: u32) -> Self {
        DvbDemux { adapter }
    }
}

impl Demux for DvbDemux {
    fn open_filter(&self) -> io::Result<Box<dyn FilterHandle>> {
        let file = open_demux(self.adapter)?;
        Ok(Box::new(DvbFilter { file }))
    }
}

struct DvbFilter {
    file: File,
}

impl FilterHandle for DvbFilter {
    fn set_pes_filter(&mut self, filter: &PesFilter) -> io::Result<()> {
        let params = DmxPesFilterParams {
            pid: filter.pid,
            input: DMX_IN_FRONTEND,
            output: filter.output as u32,
            pes_type: filter.pes_type as u32,
            flags: DMX_IMMEDIATE_START,
        };
        unsafe {
            dmx_set_pes_filter(self.file.as_raw_fd(), &params)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        unsafe {
            dmx_stop(self.file.as_raw_fd())?;
        }
        Ok(())
    }
}
