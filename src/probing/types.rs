use derive_more::{Add, AddAssign, Sub};

/// `Sequence` number newtype.
///
/// A monotonically increasing number assigned to every attempted probe send. Sequence 0 is
/// reserved as "never assigned"; the first probe of a destination attempt is sequence 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd, Add, Sub, AddAssign)]
pub struct Sequence(pub u32);

/// `TimeToLive` (ttl) newtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd, Add, Sub, AddAssign)]
pub struct TimeToLive(pub u8);

/// `Window` newtype: the target number of in-flight probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd)]
pub struct Window(pub u16);

/// `PacketSize` newtype: the total IP packet length, headers included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd)]
pub struct PacketSize(pub usize);

/// `Port` newtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd)]
pub struct Port(pub u16);

impl From<Sequence> for i64 {
    fn from(sequence: Sequence) -> Self {
        Self::from(sequence.0)
    }
}
