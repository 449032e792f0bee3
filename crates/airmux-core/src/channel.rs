//! Multiplexer channel identifiers and the occupied-channel set

use core::fmt;

/// Number of downstream segments on a TCA9548A-style multiplexer.
pub const MAX_CHANNELS: usize = 8;

/// A multiplexer-selectable bus segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    /// Create a channel, rejecting indices the multiplexer does not have.
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < MAX_CHANNELS {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    /// Control register value that routes the bus to this channel.
    pub const fn select_mask(self) -> u8 {
        1 << self.0
    }

    /// All channels below `count`, ascending. `count` is clamped to [`MAX_CHANNELS`].
    pub fn first(count: u8) -> impl Iterator<Item = Channel> {
        (0..count.min(MAX_CHANNELS as u8)).map(Channel)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channels with a sensor attached, in ascending order and without duplicates.
///
/// Built once at startup by the scanner. There is no way to add or remove a
/// channel afterwards, so the set stays stable for the life of the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccupiedChannels {
    channels: heapless::Vec<Channel, MAX_CHANNELS>,
}

impl OccupiedChannels {
    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        self.channels.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.channels.binary_search(&channel).is_ok()
    }

    pub fn as_slice(&self) -> &[Channel] {
        &self.channels
    }
}

impl FromIterator<Channel> for OccupiedChannels {
    fn from_iter<T: IntoIterator<Item = Channel>>(iter: T) -> Self {
        let mut channels = heapless::Vec::<Channel, MAX_CHANNELS>::new();
        for channel in iter {
            // There are only MAX_CHANNELS distinct channels, so after dedup the push cannot overflow.
            if !channels.contains(&channel) {
                let _ = channels.push(channel);
            }
        }
        channels.sort_unstable();
        Self { channels }
    }
}

impl fmt::Display for OccupiedChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, channel) in self.channels.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{channel}")?;
        }
        f.write_str("]")
    }
}
