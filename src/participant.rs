//! Participant identification type.

use std::fmt;

/// Identifies a remote participant whose audio is mixed for playback.
///
/// This is the session id the server assigns to a connected user. It is a
/// plain `u32` so it can be copied in and out of the real-time mixer without
/// touching the allocator.
///
/// # Example
///
/// ```
/// use duplex_audio::ParticipantId;
///
/// let alice = ParticipantId::new(12);
/// let bob: ParticipantId = 31.into();
///
/// assert_ne!(alice, bob);
/// assert_eq!(alice.get(), 12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u32);

impl ParticipantId {
    /// Creates a participant id from a session id.
    pub const fn new(session: u32) -> Self {
        Self(session)
    }

    /// Returns the raw session id.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ParticipantId {
    fn from(session: u32) -> Self {
        Self::new(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_equality() {
        assert_eq!(ParticipantId::new(3), ParticipantId::from(3));
        assert_ne!(ParticipantId::new(3), ParticipantId::new(4));
    }

    #[test]
    fn test_participant_display() {
        assert_eq!(ParticipantId::new(42).to_string(), "#42");
    }

    #[test]
    fn test_participant_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(ParticipantId::new(1));
        set.insert(ParticipantId::new(2));
        set.insert(ParticipantId::new(1)); // duplicate

        assert_eq!(set.len(), 2);
    }
}
