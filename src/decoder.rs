//! The few decoder controls a channel switch needs. Everything else about
//! playback belongs to the player layer.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use log::error;

const AUDIO_SOURCE_DEMUX: libc::c_int = 0;
const VIDEO_SOURCE_DEMUX: libc::c_int = 0;
const VIDEO_SOURCE_MEMORY: libc::c_int = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayMode {
    /// Decoder fed from the demux (live view).
    #[default]
    None,
    AudioVideo,
    AudioOnlyBlack,
    AudioOnly,
    VideoOnly,
}

pub trait Decoder: Send {
    fn set_mute(&mut self, on: bool) -> io::Result<()>;
    fn set_blank(&mut self, on: bool) -> io::Result<()>;
    fn clear_buffers(&mut self) -> io::Result<()>;
    fn set_av_sync(&mut self, on: bool) -> io::Result<()>;
    fn set_audio_bypass(&mut self, on: bool) -> io::Result<()>;
    /// Routes audio and video back to the demux, leaving any replay mode.
    fn return_to_live(&mut self) -> io::Result<()>;
}

nix::ioctl_write_int_bad!(audio_stop, nix::request_code_none!(b'o', 1));
nix::ioctl_write_int_bad!(audio_select_source, nix::request_code_none!(b'o', 5));
nix::ioctl_write_int_bad!(audio_set_mute, nix::request_code_none!(b'o', 6));
nix::ioctl_write_int_bad!(audio_set_av_sync, nix::request_code_none!(b'o', 7));
nix::ioctl_write_int_bad!(audio_set_bypass_mode, nix::request_code_none!(b'o', 8));
nix::ioctl_none_bad!(audio_clear_buffer, nix::request_code_none!(b'o', 12));
nix::ioctl_write_int_bad!(video_stop, nix::request_code_none!(b'o', 21));
nix::ioctl_none_bad!(video_play, nix::request_code_none!(b'o', 22));
nix::ioctl_write_int_bad!(video_select_source, nix::request_code_none!(b'o', 25));
nix::ioctl_write_int_bad!(video_set_blank, nix::request_code_none!(b'o', 26));
nix::ioctl_none_bad!(video_clear_buffer, nix::request_code_none!(b'o', 34));

/// Logs a failed decoder ioctl without aborting the sequence it is part of.
fn check(op: &str, result: nix::Result<libc::c_int>) {
    if let Err(e) = result {
        error!("{op} failed: {e}");
    }
}

/// Full-featured card decoder (`video0` + `audio0`).
pub struct DvbDecoder {
    video: File,
    audio: File,
}

impl DvbDecoder {
    /// Opens the decoder pair, or returns `None` when the adapter has none.
    pub fn open(adapter: u32) -> Option<Self> {
        let open = |name: &str| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(format!("/dev/dvb/adapter{adapter}/{name}0"))
                .ok()
        };
        Some(DvbDecoder {
            video: open("video")?,
            audio: open("audio")?,
        })
    }
}

impl Decoder for DvbDecoder {
    fn set_mute(&mut self, on: bool) -> io::Result<()> {
        unsafe { audio_set_mute(self.audio.as_raw_fd(), on as libc::c_int) }?;
        Ok(())
    }

    fn set_blank(&mut self, on: bool) -> io::Result<()> {
        unsafe { video_set_blank(self.video.as_raw_fd(), on as libc::c_int) }?;
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        unsafe {
            audio_clear_buffer(self.audio.as_raw_fd())?;
            video_clear_buffer(self.video.as_raw_fd())?;
        }
        Ok(())
    }

    fn set_av_sync(&mut self, on: bool) -> io::Result<()> {
        unsafe { audio_set_av_sync(self.audio.as_raw_fd(), on as libc::c_int) }?;
        Ok(())
    }

    fn set_audio_bypass(&mut self, on: bool) -> io::Result<()> {
        unsafe { audio_set_bypass_mode(self.audio.as_raw_fd(), on as libc::c_int) }?;
        Ok(())
    }

    fn return_to_live(&mut self) -> io::Result<()> {
        let video = self.video.as_raw_fd();
        let audio = self.audio.as_raw_fd();
        // each step is attempted even if an earlier one fails
        unsafe {
            check("VIDEO_SET_BLANK", video_set_blank(video, 1));
            check("VIDEO_SELECT_SOURCE", video_select_source(video, VIDEO_SOURCE_MEMORY));
            check("VIDEO_PLAY", video_play(video));
            check("VIDEO_STOP", video_stop(video, 1));
            check("AUDIO_STOP", audio_stop(audio, 1));
            check("VIDEO_CLEAR_BUFFER", video_clear_buffer(video));
            check("AUDIO_CLEAR_BUFFER", audio_clear_buffer(audio));
            check("VIDEO_SELECT_SOURCE", video_select_source(video, VIDEO_SOURCE_DEMUX));
            check("AUDIO_SELECT_SOURCE", audio_select_source(audio, AUDIO_SOURCE_DEMUX));
            check("AUDIO_SET_AV_SYNC", audio_set_av_sync(audio, 1));
            check("AUDIO_SET_MUTE", audio_set_mute(audio, 0));
        }
        Ok(())
    }
}
