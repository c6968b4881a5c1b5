use crate::channel::{Channel, ChannelId};

/// Streams to relay from a receiving device to the primary device's decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub channel_id: ChannelId,
    pub video_pid: u16,
    pub audio_pids: Vec<u16>,
    pub dolby_pids: Vec<u16>,
    pub subtitle_pids: Vec<u16>,
}

impl TransferRequest {
    pub fn for_channel(channel: &Channel) -> Self {
        TransferRequest {
            channel_id: channel.id(),
            video_pid: channel.video_pid,
            audio_pids: channel.audio_pids.clone(),
            dolby_pids: channel.dolby_pids.clone(),
            subtitle_pids: channel.subtitle_pids.clone(),
        }
    }
}

pub trait TransferPath: Send + Sync {
    /// Start relaying `request` from device `device`.
    fn start(&self, device: usize, request: TransferRequest);
}
