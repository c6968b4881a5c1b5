use crate::channel::Channel;

/// A CAM slot attached to a device.
pub trait DecryptionSlot: Send + Sync {
    fn can_decrypt(&self, channel: &Channel) -> bool;
    fn slot_number(&self) -> u32;
}
