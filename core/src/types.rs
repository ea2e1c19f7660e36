//! Shared protocol types: packet kinds, authentication classes, interface
//! identifiers and addressing.

use std::fmt;
use std::time::Duration;

/// First payload byte of an unauthenticated key-identifier request.
///
/// A peer that does not yet know which key this node derives from sends a
/// single byte equal to this magic; the pipeline answers with a
/// [`PacketType::KeyIds`] packet.
pub const KEY_ID_REQ_MAGIC: u8 = 0xA0;

/// First payload byte of a rate-limit request.
///
/// Two payload forms share the magic, distinguished by total length:
/// 2 bytes = `[magic, delay_ms]`, 4 bytes = `[magic, 0, kbps_lo, kbps_hi]`.
pub const RATE_LIMIT_REQ_MAGIC: u8 = 0xA1;

/// Application payload kind carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    EchoReq,
    EchoRsp,
    Ack,
    KeyIds,
    Tdf,
    RpcCmd,
    RpcData,
    RpcDataAck,
    RpcRsp,
    ReceivedEpacket,
    Forward,
    ForwardAutoConn,
    ConnTerminated,
    /// Unrecognised wire value, preserved for relaying.
    Other(u8),
}

impl Default for PacketType {
    fn default() -> Self {
        PacketType::Other(0)
    }
}

impl Default for InterfaceId {
    fn default() -> Self {
        InterfaceId::Dummy
    }
}

impl PacketType {
    pub fn to_wire(self) -> u8 {
        match self {
            PacketType::EchoReq => 0x01,
            PacketType::EchoRsp => 0x02,
            PacketType::Ack => 0x03,
            PacketType::KeyIds => 0x04,
            PacketType::Tdf => 0x05,
            PacketType::RpcCmd => 0x06,
            PacketType::RpcData => 0x07,
            PacketType::RpcDataAck => 0x08,
            PacketType::RpcRsp => 0x09,
            PacketType::ReceivedEpacket => 0x0A,
            PacketType::Forward => 0x0B,
            PacketType::ForwardAutoConn => 0x0C,
            PacketType::ConnTerminated => 0x0D,
            PacketType::Other(v) => v,
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match value {
            0x01 => PacketType::EchoReq,
            0x02 => PacketType::EchoRsp,
            0x03 => PacketType::Ack,
            0x04 => PacketType::KeyIds,
            0x05 => PacketType::Tdf,
            0x06 => PacketType::RpcCmd,
            0x07 => PacketType::RpcData,
            0x08 => PacketType::RpcDataAck,
            0x09 => PacketType::RpcRsp,
            0x0A => PacketType::ReceivedEpacket,
            0x0B => PacketType::Forward,
            0x0C => PacketType::ForwardAutoConn,
            0x0D => PacketType::ConnTerminated,
            v => PacketType::Other(v),
        }
    }
}

/// Authentication intent (TX) or observed outcome (RX) of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Auth {
    /// Decryption failed or has not run yet.
    #[default]
    Failure,
    /// Keyed to this specific node.
    Device,
    /// Keyed to the shared network.
    Network,
    /// Opaque relay payload, already encrypted by the remote; the codec
    /// passes it through untouched.
    RemoteEncrypted,
}

/// Bits of the frame header flag word.
pub mod flags {
    /// Payload encrypted with the device-scoped key.
    pub const ENCRYPTION_DEVICE: u16 = 0x0001;
    /// Payload encrypted with the network-scoped key.
    pub const ENCRYPTION_NETWORK: u16 = 0x0002;
    /// Sender requests an ACK for this packet.
    pub const ACK_REQUEST: u16 = 0x0004;
}

/// Enumerated transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceId {
    Serial,
    Udp,
    BtAdv,
    BtCentral,
    BtPeripheral,
    Hci,
    Dummy,
}

impl InterfaceId {
    /// True for the Bluetooth-sourced kinds a gateway forwards upstream.
    pub fn is_bluetooth(self) -> bool {
        matches!(
            self,
            InterfaceId::BtAdv | InterfaceId::BtCentral | InterfaceId::BtPeripheral
        )
    }

    pub fn to_wire(self) -> u8 {
        match self {
            InterfaceId::Serial => 0x01,
            InterfaceId::Udp => 0x02,
            InterfaceId::BtAdv => 0x03,
            InterfaceId::BtCentral => 0x04,
            InterfaceId::BtPeripheral => 0x05,
            InterfaceId::Hci => 0x06,
            InterfaceId::Dummy => 0x07,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(InterfaceId::Serial),
            0x02 => Some(InterfaceId::Udp),
            0x03 => Some(InterfaceId::BtAdv),
            0x04 => Some(InterfaceId::BtCentral),
            0x05 => Some(InterfaceId::BtPeripheral),
            0x06 => Some(InterfaceId::Hci),
            0x07 => Some(InterfaceId::Dummy),
            _ => None,
        }
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterfaceId::Serial => "serial",
            InterfaceId::Udp => "udp",
            InterfaceId::BtAdv => "bt-adv",
            InterfaceId::BtCentral => "bt-central",
            InterfaceId::BtPeripheral => "bt-peripheral",
            InterfaceId::Hci => "hci",
            InterfaceId::Dummy => "dummy",
        };
        write!(f, "{}", name)
    }
}

/// A Bluetooth link address with its type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BtAddr {
    /// Address type (0 = public, 1 = random).
    pub kind: u8,
    pub addr: [u8; 6],
}

impl BtAddr {
    pub const WIRE_SIZE: usize = 7;

    pub fn new(kind: u8, addr: [u8; 6]) -> Self {
        Self { kind, addr }
    }

    pub fn write_to(&self, out: &mut impl bytes::BufMut) {
        out.put_u8(self.kind);
        out.put_slice(&self.addr);
    }

    pub fn read_from(src: &[u8]) -> Option<Self> {
        if src.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&src[1..7]);
        Some(Self { kind: src[0], addr })
    }
}

impl fmt::Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}/{}",
            self.addr[0], self.addr[1], self.addr[2], self.addr[3], self.addr[4], self.addr[5],
            self.kind
        )
    }
}

/// Per-transport source address of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceAddress {
    /// Wired transports have no link address.
    #[default]
    Unspecified,
    Bt(BtAddr),
}

impl InterfaceAddress {
    /// Size of the address portion of a gateway appendage.
    pub fn wire_size(&self) -> usize {
        match self {
            InterfaceAddress::Unspecified => 0,
            InterfaceAddress::Bt(_) => BtAddr::WIRE_SIZE,
        }
    }
}

/// Destination of an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// Broadcast to every peer the transport can reach.
    #[default]
    AllPeers,
    Specific(InterfaceAddress),
}

/// Wait bound for blocking operations (buffer allocation, receive control).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail (or disable) immediately.
    NoWait,
    /// Block (or stay enabled) indefinitely.
    Forever,
    For(Duration),
}
