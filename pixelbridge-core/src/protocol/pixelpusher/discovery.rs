//! The PixelPusher block of a discovery beacon.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::ProtocolError;
use crate::io::ByteSliceReader;

use super::packet::{PacketReader, PacketStream};
use super::strip::StripFlags;

/// The port that PixelPusher devices historically advertised for pixel
/// data. Modern devices report their port in the beacon, but the value is
/// kept for the record.
pub const LISTEN_PORT: u16 = 5078;

/// The data port to assume when a beacon predates the `my_port` extension.
pub const DEFAULT_PORT: u16 = 9798;

/// The software revision below which other PixelPusher libraries warn that
/// the device firmware should be updated. Earlier revisions still parse.
pub const MIN_ACCEPTABLE_SOFTWARE_REVISION: u16 = 121;

/// The latest software revision this library knows about.
pub const LATEST_SOFTWARE_REVISION: u16 = 122;

bitflags! {
    /// Device-level flags (software revision >= 117).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PusherFlags: u32 {
        const PROTECTED             = 1 << 0;
        /// Sent packets must be a fixed size (Photon).
        const FIXED_SIZE            = 1 << 1;
        const GLOBAL_BRIGHTNESS     = 1 << 2;
        const STRIP_BRIGHTNESS      = 1 << 3;
        const MONOCHROME_NOT_PACKED = 1 << 4;
    }
}

/// The PixelPusher device block of a discovery beacon.
///
/// The base block is always present. Three extensions follow, gated by the
/// device header's software revision: `my_port` (>= 101), per-strip flags
/// (>= 109), and pusher flags/segments/power domain (>= 117). A beacon that
/// ends cleanly before an extension is legal and leaves the defaults in
/// place; a beacon that ends in the middle of an extension is malformed.
///
/// Base block wire format (all multi-byte fields little-endian):
///
/// ```text
/// uint8_t  strips_attached;
/// uint8_t  max_strips_per_packet;
/// uint16_t pixels_per_strip;
/// uint32_t update_period;       // in microseconds
/// uint32_t power_total;         // in PWM units
/// uint32_t delta_sequence;      // received vs. expected sequence numbers
/// int32_t  controller_ordinal;
/// int32_t  group_ordinal;
/// int16_t  artnet_universe;
/// int16_t  artnet_channel;
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub strips_attached: u8,
    pub max_strips_per_packet: u8,
    pub pixels_per_strip: u16,
    pub update_period: u32,
    pub power_total: u32,
    pub delta_sequence: u32,
    pub controller_ordinal: i32,
    pub group_ordinal: i32,
    pub artnet_universe: i16,
    pub artnet_channel: i16,

    /// The device's data port (>= 101). Defaults to [`DEFAULT_PORT`].
    pub my_port: u16,

    /// Flags for each attached strip (>= 109). Always holds exactly
    /// `strips_attached` entries; the wire form carries a minimum of eight
    /// bytes, zero-padded when fewer strips are attached.
    pub strip_flags: Vec<StripFlags>,

    /// Raw pusher flags (>= 117). See [`PusherFlags`] for the known bits.
    pub pusher_flags: u32,
    pub segments: u32,
    pub power_domain: u32,

    /// Bytes remaining after the last recognized extension, preserved so a
    /// re-emitted beacon reproduces its source.
    pub extra: Vec<u8>,
}

impl Default for Device {
    fn default() -> Self {
        Device {
            strips_attached: 0,
            max_strips_per_packet: 0,
            pixels_per_strip: 0,
            update_period: 0,
            power_total: 0,
            delta_sequence: 0,
            controller_ordinal: 0,
            group_ordinal: 0,
            artnet_universe: 0,
            artnet_channel: 0,
            my_port: DEFAULT_PORT,
            strip_flags: Vec::new(),
            pusher_flags: 0,
            segments: 0,
            power_domain: 0,
            extra: Vec::new(),
        }
    }
}

const BASE_BLOCK_LEN: usize = 28;
const EXT_101_LEN: usize = 4;
const EXT_117_LEN: usize = 14;

impl Device {
    /// Reads a PixelPusher block, selecting which extensions to read based
    /// on the software revision and the remaining data.
    pub fn parse(r: &mut ByteSliceReader<'_>, sw_revision: u16) -> Result<Self, ProtocolError> {
        if r.remaining() < BASE_BLOCK_LEN {
            return Err(ProtocolError::Truncated {
                context: "pixelpusher base block",
            });
        }

        let mut d = Device {
            strips_attached: r.read_u8().unwrap(),
            max_strips_per_packet: r.read_u8().unwrap(),
            pixels_per_strip: r.read_u16_le().unwrap(),
            update_period: r.read_u32_le().unwrap(),
            power_total: r.read_u32_le().unwrap(),
            delta_sequence: r.read_u32_le().unwrap(),
            controller_ordinal: r.read_i32_le().unwrap(),
            group_ordinal: r.read_i32_le().unwrap(),
            artnet_universe: r.read_i16_le().unwrap(),
            artnet_channel: r.read_i16_le().unwrap(),
            ..Device::default()
        };
        d.strip_flags = vec![StripFlags::empty(); d.strips_attached as usize];

        // (Software revision >= 101): my_port.
        if sw_revision < 101 || r.is_empty() {
            d.extra = r.take_rest().into_owned();
            return Ok(d);
        }
        if r.remaining() < EXT_101_LEN {
            return Err(ProtocolError::Truncated {
                context: "pixelpusher extension (sw >= 101)",
            });
        }
        d.my_port = r.read_u16_le().unwrap();
        r.skip(2); // reserved

        // (Software revision >= 109): strip flags. At least eight flag
        // bytes are present on the wire regardless of how many strips are
        // attached.
        if sw_revision < 109 || r.is_empty() {
            d.extra = r.take_rest().into_owned();
            return Ok(d);
        }
        let wire_flags = (d.strips_attached as usize).max(8);
        let Some(flag_bytes) = r.next(wire_flags) else {
            return Err(ProtocolError::Truncated {
                context: "pixelpusher strip flags (sw >= 109)",
            });
        };
        for (sf, b) in d.strip_flags.iter_mut().zip(flag_bytes.iter()) {
            *sf = StripFlags::from_wire(*b);
        }

        // (Software revision >= 117): pusher flags, segments, power domain.
        if sw_revision < 117 || r.is_empty() {
            d.extra = r.take_rest().into_owned();
            return Ok(d);
        }
        if r.remaining() < EXT_117_LEN {
            return Err(ProtocolError::Truncated {
                context: "pixelpusher extension (sw >= 117)",
            });
        }
        r.skip(2); // reserved
        d.pusher_flags = r.read_u32_le().unwrap();
        d.segments = r.read_u32_le().unwrap();
        d.power_domain = r.read_u32_le().unwrap();

        d.extra = r.take_rest().into_owned();
        Ok(d)
    }

    /// Writes this block, emitting each extension only when the software
    /// revision allows it. Preserved `extra` bytes follow the last written
    /// extension, so writing with the revision the block was parsed at
    /// reproduces the original bytes.
    pub fn write(&self, buf: &mut Vec<u8>, sw_revision: u16) {
        buf.push(self.strips_attached);
        buf.push(self.max_strips_per_packet);
        buf.extend_from_slice(&self.pixels_per_strip.to_le_bytes());
        buf.extend_from_slice(&self.update_period.to_le_bytes());
        buf.extend_from_slice(&self.power_total.to_le_bytes());
        buf.extend_from_slice(&self.delta_sequence.to_le_bytes());
        buf.extend_from_slice(&self.controller_ordinal.to_le_bytes());
        buf.extend_from_slice(&self.group_ordinal.to_le_bytes());
        buf.extend_from_slice(&self.artnet_universe.to_le_bytes());
        buf.extend_from_slice(&self.artnet_channel.to_le_bytes());

        if sw_revision < 101 {
            buf.extend_from_slice(&self.extra);
            return;
        }
        buf.extend_from_slice(&self.my_port.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);

        if sw_revision < 109 {
            buf.extend_from_slice(&self.extra);
            return;
        }
        // Write one byte per strip flag, padding up to eight when fewer
        // strips are attached. More than eight strips write exactly that
        // many, with no padding.
        for sf in &self.strip_flags {
            buf.push(sf.to_wire());
        }
        for _ in self.strip_flags.len()..8 {
            buf.push(0x00);
        }

        if sw_revision < 117 {
            buf.extend_from_slice(&self.extra);
            return;
        }
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.pusher_flags.to_le_bytes());
        buf.extend_from_slice(&self.segments.to_le_bytes());
        buf.extend_from_slice(&self.power_domain.to_le_bytes());

        buf.extend_from_slice(&self.extra);
    }

    /// The device's update period, expressed in microseconds on the wire,
    /// as a [`Duration`].
    pub fn update_period_duration(&self) -> Duration {
        Duration::from_micros(u64::from(self.update_period))
    }

    pub fn flags(&self) -> PusherFlags {
        PusherFlags::from_bits_truncate(self.pusher_flags)
    }

    /// The fixed packet size this device requires, or 0 when the device
    /// does not set `FIXED_SIZE`.
    pub fn fixed_size(&self) -> usize {
        if !self.flags().contains(PusherFlags::FIXED_SIZE) {
            return 0;
        }

        let strips = (self.max_strips_per_packet as usize).min(self.strips_attached as usize);

        // [ID] + per strip: [strip number] + RGB pixels.
        4 + (1 + 3 * self.pixels_per_strip as usize) * strips
    }

    /// A [`PacketReader`] configured for this device.
    pub fn packet_reader(&self) -> PacketReader {
        PacketReader {
            pixels_per_strip: self.pixels_per_strip as usize,
            strip_flags: self.strip_flags.clone(),
        }
    }

    /// A [`PacketStream`] configured for this device.
    pub fn packet_stream(&self) -> PacketStream {
        PacketStream::new(
            self.max_strips_per_packet,
            self.pixels_per_strip,
            self.fixed_size(),
        )
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PixelPusher{{strips_attached={}, max_strips_per_packet={}, pixels_per_strip={}, \
             update_period={:?}, power_total={}, delta_sequence={}, controller_ordinal={}, \
             group_ordinal={}, my_port={}, pusher_flags=0x{:08x}, segments={}, power_domain={}}}",
            self.strips_attached,
            self.max_strips_per_packet,
            self.pixels_per_strip,
            self.update_period_duration(),
            self.power_total,
            self.delta_sequence,
            self.controller_ordinal,
            self.group_ordinal,
            self.my_port,
            self.pusher_flags,
            self.segments,
            self.power_domain,
        )
    }
}
