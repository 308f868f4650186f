//! Discovery and data protocol for PixelPusher-family devices.
//!
//! Devices announce themselves with periodic multicast beacons on
//! [`DISCOVERY_PORT`]. A beacon carries a fixed [`DeviceHeader`] followed by
//! a device-type-specific block; only PixelPusher blocks are decoded. Pixel
//! and command traffic is sent over unicast UDP to the port the device
//! reports in its beacon.

pub mod pixelpusher;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{ProtocolError, SendError};
use crate::io::{ByteSliceReader, DatagramSender};

/// The UDP port on which devices multicast their discovery beacons.
pub const DISCOVERY_PORT: u16 = 7331;

/// The default device protocol version, as observed on modern PixelPusher
/// devices.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 1;

/// The on-wire size of a [`DeviceHeader`].
pub const DEVICE_HEADER_LEN: usize = 24;

/// The type of device described by a [`DeviceHeader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    EtherDream,
    LumiaBridge,
    PixelPusher,
    Unknown(u8),
}

impl DeviceType {
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => DeviceType::EtherDream,
            1 => DeviceType::LumiaBridge,
            2 => DeviceType::PixelPusher,
            other => DeviceType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            DeviceType::EtherDream => 0,
            DeviceType::LumiaBridge => 1,
            DeviceType::PixelPusher => 2,
            DeviceType::Unknown(v) => v,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::EtherDream => write!(f, "ETHERDREAM"),
            DeviceType::LumiaBridge => write!(f, "LUMIABRIDGE"),
            DeviceType::PixelPusher => write!(f, "PIXELPUSHER"),
            DeviceType::Unknown(v) => write!(f, "UNKNOWN({})", v),
        }
    }
}

/// The fixed header at the start of every discovery beacon.
///
/// Wire format:
///
/// ```text
/// uint8_t  mac_address[6];
/// uint8_t  ip_address[4];
/// uint8_t  device_type;
/// uint8_t  protocol_version;   // for the device, not the discovery
/// uint16_t vendor_id;          // little-endian, as are all that follow
/// uint16_t product_id;
/// uint16_t hw_revision;
/// uint16_t sw_revision;
/// uint32_t link_speed;         // in bits per second
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceHeader {
    pub mac_address: [u8; 6],
    pub ip_address: [u8; 4],
    pub device_type: DeviceType,
    pub protocol_version: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub hardware_revision: u16,
    pub software_revision: u16,
    pub link_speed: u32,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Unknown(0xFF)
    }
}

impl DeviceHeader {
    pub fn parse(r: &mut ByteSliceReader<'_>) -> Result<Self, ProtocolError> {
        if r.remaining() < DEVICE_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                context: "device header",
            });
        }

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&r.next(6).unwrap());
        let mut ip = [0u8; 4];
        ip.copy_from_slice(&r.next(4).unwrap());

        Ok(DeviceHeader {
            mac_address: mac,
            ip_address: ip,
            device_type: DeviceType::from_wire(r.read_u8().unwrap()),
            protocol_version: r.read_u8().unwrap(),
            vendor_id: r.read_u16_le().unwrap(),
            product_id: r.read_u16_le().unwrap(),
            hardware_revision: r.read_u16_le().unwrap(),
            software_revision: r.read_u16_le().unwrap(),
            link_speed: r.read_u32_le().unwrap(),
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.mac_address);
        buf.extend_from_slice(&self.ip_address);
        buf.push(self.device_type.to_wire());
        buf.push(self.protocol_version);
        buf.extend_from_slice(&self.vendor_id.to_le_bytes());
        buf.extend_from_slice(&self.product_id.to_le_bytes());
        buf.extend_from_slice(&self.hardware_revision.to_le_bytes());
        buf.extend_from_slice(&self.software_revision.to_le_bytes());
        buf.extend_from_slice(&self.link_speed.to_le_bytes());
    }

    /// The MAC address rendered as lowercase colon-separated hex. This is
    /// the stable device ID used throughout the library.
    pub fn hardware_addr_string(&self) -> String {
        let m = &self.mac_address;
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }

    pub fn ip4_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip_address)
    }

    pub fn set_ip4_address(&mut self, ip: Ipv4Addr) {
        self.ip_address = ip.octets();
    }
}

/// The device-specific block that follows the [`DeviceHeader`] in a beacon.
///
/// Closed over the device families this library decodes; beacons for other
/// device types fail with [`ProtocolError::UnsupportedDeviceType`].
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceBlock {
    PixelPusher(pixelpusher::Device),
}

/// The full set of information contained in a discovery beacon.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryHeaders {
    pub header: DeviceHeader,
    pub device: DeviceBlock,
}

/// Parses a discovery beacon payload.
///
/// Fails if the device header is invalid or the device type is not
/// supported.
pub fn parse_discovery(data: &[u8]) -> Result<DiscoveryHeaders, ProtocolError> {
    let mut r = ByteSliceReader::new(data);
    let header = DeviceHeader::parse(&mut r)?;

    let device = match header.device_type {
        DeviceType::PixelPusher => DeviceBlock::PixelPusher(pixelpusher::Device::parse(
            &mut r,
            header.software_revision,
        )?),
        other => return Err(ProtocolError::UnsupportedDeviceType(other.to_wire())),
    };

    Ok(DiscoveryHeaders { header, device })
}

impl DiscoveryHeaders {
    /// Serializes the beacon payload.
    pub fn write_packet(&self, buf: &mut Vec<u8>) {
        self.header.write(buf);
        match &self.device {
            DeviceBlock::PixelPusher(pp) => pp.write(buf, self.header.software_revision),
        }
    }

    /// The PixelPusher block, if this device is a PixelPusher.
    pub fn pixel_pusher(&self) -> Option<&pixelpusher::Device> {
        match &self.device {
            DeviceBlock::PixelPusher(pp) => Some(pp),
        }
    }

    pub fn pixel_pusher_mut(&mut self) -> Option<&mut pixelpusher::Device> {
        match &mut self.device {
            DeviceBlock::PixelPusher(pp) => Some(pp),
        }
    }

    /// The device's data address, as described by its headers.
    pub fn addr(&self) -> SocketAddr {
        let port = match &self.device {
            DeviceBlock::PixelPusher(pp) => pp.my_port,
        };
        SocketAddr::V4(SocketAddrV4::new(self.header.ip4_address(), port))
    }

    /// The stable device ID: lowercase-hex MAC.
    pub fn hardware_addr_string(&self) -> String {
        self.header.hardware_addr_string()
    }

    /// The number of strips attached to this device.
    pub fn num_strips(&self) -> usize {
        match &self.device {
            DeviceBlock::PixelPusher(pp) => pp.strips_attached as usize,
        }
    }

    /// The total number of pixels across all strips.
    pub fn num_pixels(&self) -> usize {
        match &self.device {
            DeviceBlock::PixelPusher(pp) => {
                pp.strips_attached as usize * pp.pixels_per_strip as usize
            }
        }
    }

    /// A [`PacketReader`] configured for this device.
    pub fn packet_reader(&self) -> PacketReader {
        match &self.device {
            DeviceBlock::PixelPusher(pp) => PacketReader::PixelPusher(pp.packet_reader()),
        }
    }

    /// A [`PacketStream`] assembler configured for this device.
    pub fn packet_stream(&self) -> PacketStream {
        match &self.device {
            DeviceBlock::PixelPusher(pp) => PacketStream::PixelPusher(pp.packet_stream()),
        }
    }
}

impl fmt::Display for DiscoveryHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device{{mac_address={}, ip_address={}, device_type={}, protocol_version={}, \
             vendor_id=0x{:x}, product_id=0x{:x}, hardware_revision={}, software_revision={}, \
             link_speed={}}}",
            self.hardware_addr_string(),
            self.header.ip4_address(),
            self.header.device_type,
            self.header.protocol_version,
            self.header.vendor_id,
            self.header.product_id,
            self.header.hardware_revision,
            self.header.software_revision,
            self.header.link_speed,
        )
    }
}

/// A single parsed data-protocol packet, tagged by device family.
#[derive(Clone, Debug)]
pub enum Packet<'a> {
    PixelPusher(pixelpusher::Packet<'a>),
}

impl Packet<'_> {
    /// Converts into a packet that owns all of its pixel data.
    pub fn into_owned(self) -> Packet<'static> {
        match self {
            Packet::PixelPusher(p) => Packet::PixelPusher(p.into_owned()),
        }
    }
}

/// A per-device datagram parser, tagged by device family.
#[derive(Clone, Debug, PartialEq)]
pub enum PacketReader {
    PixelPusher(pixelpusher::PacketReader),
}

impl PacketReader {
    /// Parses a single inbound datagram.
    ///
    /// The returned packet references `data` and must not outlive it.
    pub fn read_packet<'a>(&self, data: &'a [u8]) -> Result<Packet<'a>, ProtocolError> {
        let mut r = ByteSliceReader::new(data);
        self.read_packet_from(&mut r)
    }

    /// Parses a single inbound datagram from an existing reader.
    pub fn read_packet_from<'a>(
        &self,
        r: &mut ByteSliceReader<'a>,
    ) -> Result<Packet<'a>, ProtocolError> {
        match self {
            PacketReader::PixelPusher(pr) => pr.read_packet(r).map(Packet::PixelPusher),
        }
    }
}

/// A per-device outbound packet assembler, tagged by device family.
#[derive(Debug)]
pub enum PacketStream {
    PixelPusher(pixelpusher::PacketStream),
}

impl PacketStream {
    /// Sends the contents of `packet`, batching strip states as configured.
    pub fn send(
        &mut self,
        ds: &mut dyn DatagramSender,
        packet: &Packet<'_>,
    ) -> Result<(), SendError> {
        match (self, packet) {
            (PacketStream::PixelPusher(ps), Packet::PixelPusher(pkt)) => ps.send(ds, pkt),
        }
    }

    /// Flushes any buffered strip states.
    pub fn flush(&mut self, ds: &mut dyn DatagramSender) -> Result<(), SendError> {
        match self {
            PacketStream::PixelPusher(ps) => ps.flush(ds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon_bytes(device_type: u8) -> Vec<u8> {
        let mut b = vec![
            0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22, // mac
            192, 168, 1, 40, // ip
            device_type, 1, // type, protocol version
            0x01, 0x00, // vendor
            0x02, 0x00, // product
            0x03, 0x00, // hw revision
            101, 0, // sw revision
            0x00, 0xE1, 0xF5, 0x05, // link speed (100 Mbit)
        ];
        // Minimal PixelPusher base block: 2 strips, 1 per packet, 8 pixels.
        b.extend_from_slice(&[
            2, 1, 8, 0, //
            0, 0, 0, 0, // update period
            0, 0, 0, 0, // power total
            0, 0, 0, 0, // delta sequence
            3, 0, 0, 0, // controller ordinal
            7, 0, 0, 0, // group ordinal
            0, 0, 0, 0, // artnet
        ]);
        // ext101: port 9897 + 2 reserved.
        b.extend_from_slice(&[0xA9, 0x26, 0, 0]);
        b
    }

    #[test]
    fn parse_discovery_pixelpusher() {
        let dh = parse_discovery(&beacon_bytes(2)).unwrap();

        assert_eq!(dh.header.device_type, DeviceType::PixelPusher);
        assert_eq!(dh.header.software_revision, 101);
        assert_eq!(dh.hardware_addr_string(), "aa:bb:cc:00:11:22");
        assert_eq!(dh.num_strips(), 2);
        assert_eq!(dh.num_pixels(), 16);
        assert_eq!(dh.addr().to_string(), "192.168.1.40:9897");

        let pp = dh.pixel_pusher().unwrap();
        assert_eq!(pp.my_port, 9897);
        assert_eq!(pp.group_ordinal, 7);
        assert_eq!(pp.controller_ordinal, 3);
    }

    #[test]
    fn parse_discovery_rejects_other_device_types() {
        assert_eq!(
            parse_discovery(&beacon_bytes(0)),
            Err(ProtocolError::UnsupportedDeviceType(0))
        );
        assert_eq!(
            parse_discovery(&beacon_bytes(1)),
            Err(ProtocolError::UnsupportedDeviceType(1))
        );
    }

    #[test]
    fn parse_discovery_truncated_header() {
        assert_eq!(
            parse_discovery(&[0u8; 10]),
            Err(ProtocolError::Truncated {
                context: "device header"
            })
        );
    }

    #[test]
    fn discovery_round_trip() {
        let bytes = beacon_bytes(2);
        let dh = parse_discovery(&bytes).unwrap();

        let mut out = Vec::new();
        dh.write_packet(&mut out);
        assert_eq!(out, bytes);
    }
}
