use serde::{Deserialize, Serialize};
use std::fmt;

/// Widest channel group any supported model has.
pub const MAX_CHANNELS_PER_GROUP: usize = 8;

/// Channels within one group, indexed by channel number.
///
/// Serialized as a list of booleans so configuration files read naturally:
/// `acquisition_mask = [true, true, false, ...]`.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(try_from = "Vec<bool>", into = "Vec<bool>")]
pub struct ChannelMask {
    channels: [bool; MAX_CHANNELS_PER_GROUP],
}

impl ChannelMask {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            channels: [true; MAX_CHANNELS_PER_GROUP],
        }
    }

    /// Only the first `n` channels set.
    pub fn first(n: usize) -> Self {
        let mut mask = Self::none();
        for ch in 0..n.min(MAX_CHANNELS_PER_GROUP) {
            mask.channels[ch] = true;
        }
        mask
    }

    pub fn from_bits(bits: u8) -> Self {
        let mut mask = Self::none();
        for (ch, flag) in mask.channels.iter_mut().enumerate() {
            *flag = bits & (1 << ch) != 0;
        }
        mask
    }

    /// Packs the mask into the register layout, bit `n` = channel `n`.
    pub fn bits(&self) -> u8 {
        self.channels
            .iter()
            .enumerate()
            .fold(0u8, |acc, (ch, &on)| acc | (u8::from(on) << ch))
    }

    pub fn get(&self, channel: usize) -> Option<bool> {
        self.channels.get(channel).copied()
    }

    /// Returns `false` when `channel` is outside the mask width.
    pub fn set(&mut self, channel: usize, enabled: bool) -> bool {
        match self.channels.get_mut(channel) {
            Some(flag) => {
                *flag = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }

    pub fn count(&self) -> usize {
        self.channels.iter().filter(|&&on| on).count()
    }

    /// Enabled channel numbers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(ch, &on)| on.then_some(ch))
    }

    /// Highest enabled channel, if any.
    pub fn highest(&self) -> Option<usize> {
        self.iter().last()
    }
}

/// Missing trailing entries are off. More entries than a group has is an
/// error rather than a silent truncation.
impl TryFrom<Vec<bool>> for ChannelMask {
    type Error = String;

    fn try_from(flags: Vec<bool>) -> Result<Self, Self::Error> {
        if flags.len() > MAX_CHANNELS_PER_GROUP {
            return Err(format!(
                "{} channel flags given, a group has at most {MAX_CHANNELS_PER_GROUP}",
                flags.len()
            ));
        }
        let mut mask = Self::none();
        mask.channels[..flags.len()].copy_from_slice(&flags);
        Ok(mask)
    }
}

impl From<ChannelMask> for Vec<bool> {
    fn from(mask: ChannelMask) -> Self {
        mask.channels.to_vec()
    }
}

impl fmt::Debug for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (ch, on) in self.channels.iter().enumerate() {
            if ch > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", u8::from(*on))?;
        }
        write!(f, "] (0x{:02x})", self.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_follow_channel_index() {
        let mut mask = ChannelMask::none();
        assert!(mask.set(0, true));
        assert!(mask.set(3, true));
        assert!(!mask.set(8, true));
        assert_eq!(mask.bits(), 0b0000_1001);
        assert_eq!(ChannelMask::from_bits(0b0000_1001), mask);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(mask.highest(), Some(3));
        assert_eq!(mask.count(), 2);
    }

    #[test]
    fn order_is_channel_index_not_insertion() {
        let mut mask = ChannelMask::none();
        mask.set(5, true);
        mask.set(1, true);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn all_and_first() {
        assert_eq!(ChannelMask::all().bits(), 0xFF);
        assert_eq!(ChannelMask::first(2).bits(), 0b11);
        assert!(ChannelMask::none().is_empty());
        assert_eq!(ChannelMask::none().get(9), None);
    }

    #[test]
    fn short_flag_lists_pad_with_off() {
        let mask = ChannelMask::try_from(vec![true, false, true]).unwrap();
        assert_eq!(mask.bits(), 0b101);
        assert_eq!(Vec::from(mask).len(), MAX_CHANNELS_PER_GROUP);
    }

    #[test]
    fn too_many_flags_are_rejected() {
        let err = ChannelMask::try_from(vec![true; MAX_CHANNELS_PER_GROUP + 1]).unwrap_err();
        assert!(err.contains("9 channel flags"));
        assert!(ChannelMask::try_from(vec![true; MAX_CHANNELS_PER_GROUP]).is_ok());
    }

    #[test]
    fn debug_shows_flags_and_hex() {
        let mask = ChannelMask::first(1);
        assert_eq!(format!("{mask:?}"), "[1, 0, 0, 0, 0, 0, 0, 0] (0x01)");
    }
}
