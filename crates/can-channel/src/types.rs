use core::fmt;
use time::OffsetDateTime;

/// Extended frame format flag in the raw identifier field.
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag.
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error frame flag.
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
/// Largest standard (11-bit) identifier.
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Largest extended (29-bit) identifier.
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Maximum payload of a classic CAN frame.
pub const CAN_MAX_DATA_LENGTH: usize = 8;
/// Size of one kernel `can_frame` record on the wire.
pub const CAN_MTU: usize = core::mem::size_of::<RawCanFrame>();

/// Raw CAN socket protocol (`CAN_RAW`).
pub const CAN_SOCK_RAW: i32 = 1;
/// Alternate sub-protocol selector accepted by some kernels.
pub const CAN_SOCK_SEVEN: i32 = 7;

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if u32::from(id11) <= CAN_SFF_MASK {
            Some(Self {
                raw: u32::from(id11),
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= CAN_EFF_MASK {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl TryFrom<u32> for CanId {
    type Error = u32;

    /// Picks the standard format whenever the value fits in 11 bits.
    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        if raw <= CAN_SFF_MASK {
            Ok(Self {
                raw,
                extended: false,
            })
        } else {
            Self::extended(raw).ok_or(raw)
        }
    }
}

impl PartialOrd for CanId {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanId {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.raw
            .cmp(&other.raw)
            .then(self.extended.cmp(&other.extended))
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// Kernel `struct can_frame`, byte-for-byte.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C, align(8))]
pub struct RawCanFrame {
    /// 32 bit identifier plus EFF/RTR/ERR flags
    pub can_id: u32,
    /// data length code, 0..=8
    pub can_dlc: u8,
    pub pad: u8,
    pub res0: u8,
    pub len8_dlc: u8,
    pub data: [u8; 8],
}

impl RawCanFrame {
    pub fn is_extended(&self) -> bool {
        self.can_id & CAN_EFF_FLAG != 0
    }

    /// Identifier with the flag bits stripped.
    pub fn id_bits(&self) -> u32 {
        if self.is_extended() {
            self.can_id & CAN_EFF_MASK
        } else {
            self.can_id & CAN_SFF_MASK
        }
    }
}

/// Kernel `struct can_filter`: a frame passes when
/// `received_id & can_mask == can_id & can_mask`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct RawCanFilter {
    pub can_id: u32,
    pub can_mask: u32,
}

/// A classic CAN message.
///
/// The payload is not bounded here; the channel rejects anything longer
/// than [`CAN_MAX_DATA_LENGTH`] before it reaches the socket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanMessage {
    id: CanId,
    data: Vec<u8>,
    rtr: bool,
    timestamp: Option<Timestamp>,
}

impl CanMessage {
    pub fn new(id: CanId, data: &[u8]) -> Self {
        Self {
            id,
            data: data.to_vec(),
            rtr: false,
            timestamp: None,
        }
    }

    pub fn remote(id: CanId, dlc: u8) -> Self {
        Self {
            id,
            data: vec![0; usize::from(dlc.min(CAN_MAX_DATA_LENGTH as u8))],
            rtr: true,
            timestamp: None,
        }
    }

    /// Decode a frame read from the kernel.
    pub fn from_raw(raw: RawCanFrame) -> Self {
        let id = if raw.is_extended() {
            CanId {
                raw: raw.id_bits(),
                extended: true,
            }
        } else {
            CanId {
                raw: raw.id_bits(),
                extended: false,
            }
        };
        let len = usize::from(raw.can_dlc).min(CAN_MAX_DATA_LENGTH);
        Self {
            id,
            data: raw.data[..len].to_vec(),
            rtr: raw.can_id & CAN_RTR_FLAG != 0,
            timestamp: None,
        }
    }

    /// Kernel layout of this message. Payload bytes past 8 are dropped.
    pub fn raw_frame(&self) -> RawCanFrame {
        let mut can_id = self.id.raw();
        if self.id.is_extended() {
            can_id |= CAN_EFF_FLAG;
        }
        if self.rtr {
            can_id |= CAN_RTR_FLAG;
        }
        let len = self.data.len().min(CAN_MAX_DATA_LENGTH);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&self.data[..len]);
        RawCanFrame {
            can_id,
            can_dlc: len as u8,
            data,
            ..RawCanFrame::default()
        }
    }

    pub fn id(&self) -> CanId {
        self.id
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn is_remote(&self) -> bool {
        self.rtr
    }
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    pub fn with_timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_matches_kernel_layout() {
        assert_eq!(CAN_MTU, 16);
        assert_eq!(core::mem::align_of::<RawCanFrame>(), 8);
        assert_eq!(core::mem::size_of::<RawCanFilter>(), 8);
    }

    #[test]
    fn id_from_u32_picks_format() {
        let std = CanId::try_from(0x7FF_u32).unwrap();
        assert!(!std.is_extended());
        let ext = CanId::try_from(0x800_u32).unwrap();
        assert!(ext.is_extended());
        assert_eq!(CanId::try_from(0x2000_0000_u32), Err(0x2000_0000));
        assert!(CanId::standard(0x800).is_none());
    }

    #[test]
    fn ids_order_numerically() {
        let a = CanId::standard(0x100).unwrap();
        let b = CanId::extended(0x1234).unwrap();
        assert!(a < b);
        assert_eq!(format!("{a}"), "0x100");
        assert_eq!(format!("{b}"), "0x00001234");
    }

    #[test]
    fn extended_message_sets_flag_in_raw_frame() {
        let id = CanId::extended(0x18DA_F110).unwrap();
        let raw = CanMessage::new(id, &[1, 2, 3]).raw_frame();
        assert_eq!(raw.can_id, 0x18DA_F110 | CAN_EFF_FLAG);
        assert_eq!(raw.can_dlc, 3);
        assert_eq!(&raw.data[..3], &[1, 2, 3]);
        assert_eq!(&raw.data[3..], &[0; 5]);
    }

    #[test]
    fn from_raw_decodes_flags_and_clamps_dlc() {
        let raw = RawCanFrame {
            can_id: 0x123 | CAN_RTR_FLAG,
            can_dlc: 12,
            data: [9; 8],
            ..RawCanFrame::default()
        };
        let msg = CanMessage::from_raw(raw);
        assert_eq!(msg.id(), CanId::standard(0x123).unwrap());
        assert!(msg.is_remote());
        assert_eq!(msg.len(), 8);
    }
}
