//! Event records.
//!
//! Each event carries one strip state for one device. On disk an event is
//! a varint-length-prefixed record of fixed-width little-endian fields:
//!
//! ```text
//! uint64 offset;        // duration from stream start, microseconds
//! uint32 device;        // file-local device index
//! uint8  strip_number;
//! uint8  pixel_type;    // 0 = RGB, 1 = RGBOW
//! uint32 data_len;
//! uint8  data[data_len];
//! ```

use std::io::{Read, Write};
use std::time::Duration;

use pixelbridge_core::io as core_io;
use pixelbridge_core::pixel::PixelBuffer;
use pixelbridge_core::protocol::{pixelpusher, Packet};

use super::{PixelType, StreamDevice, StreamError};

const EVENT_HEADER_LEN: usize = 8 + 4 + 1 + 1 + 4;

/// A single recorded event: one strip state for one device.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Offset from the start of the stream.
    pub offset: Duration,

    /// File-local device index, resolved through the event file's device
    /// mapping.
    pub device: i64,

    pub strip_number: u8,
    pub pixel_type: PixelType,
    pub pixel_data: Vec<u8>,
}

impl Event {
    /// Writes this event as one length-prefixed record. Returns the total
    /// number of bytes written.
    pub(super) fn write_framed<W: Write>(&self, w: &mut W) -> std::io::Result<usize> {
        let payload_len = EVENT_HEADER_LEN + self.pixel_data.len();

        let mut buf = Vec::with_capacity(core_io::MAX_VARINT_LEN + payload_len);
        core_io::write_varint(&mut buf, payload_len as u64);
        buf.extend_from_slice(&(self.offset.as_micros() as u64).to_le_bytes());
        buf.extend_from_slice(&(self.device as u32).to_le_bytes());
        buf.push(self.strip_number);
        buf.push(match self.pixel_type {
            PixelType::Rgb => 0,
            PixelType::Rgbow => 1,
        });
        buf.extend_from_slice(&(self.pixel_data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.pixel_data);

        w.write_all(&buf)?;
        Ok(buf.len())
    }

    /// Reads the next length-prefixed record from `r`.
    ///
    /// Returns `Ok(None)` on a clean end of stream.
    pub(super) fn read_framed<R: Read>(r: &mut R) -> Result<Option<Event>, StreamError> {
        let io_err = |source| StreamError::Io {
            op: "read event",
            path: Default::default(),
            source,
        };

        let Some(len) = core_io::read_varint(r).map_err(io_err)? else {
            return Ok(None);
        };
        let len = len as usize;
        if len < EVENT_HEADER_LEN {
            return Err(StreamError::CorruptEvent("record shorter than its header"));
        }

        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).map_err(io_err)?;

        let offset_micros = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let device = u32::from_le_bytes(payload[8..12].try_into().unwrap());
        let strip_number = payload[12];
        let pixel_type = match payload[13] {
            0 => PixelType::Rgb,
            1 => PixelType::Rgbow,
            _ => return Err(StreamError::CorruptEvent("unknown pixel type")),
        };
        let data_len = u32::from_le_bytes(payload[14..18].try_into().unwrap()) as usize;
        if EVENT_HEADER_LEN + data_len != len {
            return Err(StreamError::CorruptEvent("data length disagrees with frame"));
        }
        payload.drain(..EVENT_HEADER_LEN);

        Ok(Some(Event {
            offset: Duration::from_micros(offset_micros),
            device: i64::from(device),
            strip_number,
            pixel_type,
            pixel_data: payload,
        }))
    }

    /// Decodes this event into a protocol packet.
    ///
    /// The packet references this event's pixel bytes; the metadata device
    /// record supplies the strip's authoritative layout.
    pub fn decode(&self, device: &StreamDevice) -> Result<Packet<'_>, StreamError> {
        let layout = device
            .strip_layout(self.strip_number as usize)
            .ok_or(StreamError::CorruptEvent("strip index out of bounds"))?;

        Ok(Packet::PixelPusher(pixelpusher::Packet::strip_states(
            0,
            vec![pixelpusher::StripState {
                strip_number: self.strip_number,
                pixels: PixelBuffer::from_bytes(layout, &self.pixel_data),
            }],
        )))
    }
}

/// Encodes a protocol packet as zero or more events for device
/// `device_index`, all stamped with `offset`.
///
/// Commands are not currently recordable and produce
/// [`StreamError::EncodingNotSupported`].
pub(super) fn encode_packet(
    device_index: i64,
    packet: &Packet<'_>,
    offset: Duration,
) -> Result<Vec<Event>, StreamError> {
    let Packet::PixelPusher(pp) = packet;
    match &pp.body {
        pixelpusher::PacketBody::Command(_) => Err(StreamError::EncodingNotSupported),
        pixelpusher::PacketBody::StripStates(states) => Ok(states
            .iter()
            .map(|ss| Event {
                offset,
                device: device_index,
                strip_number: ss.strip_number,
                pixel_type: PixelType::from_layout(ss.pixels.layout()),
                pixel_data: ss.pixels.bytes().to_vec(),
            })
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelbridge_core::pixel::{BufferLayout, Pixel};
    use pixelbridge_core::protocol::pixelpusher::Command;
    use std::io::Cursor;

    use crate::replay::streamfile::StreamStrip;

    fn event() -> Event {
        Event {
            offset: Duration::from_micros(1_500_000),
            device: 3,
            strip_number: 1,
            pixel_type: PixelType::Rgb,
            pixel_data: vec![10, 20, 30, 40, 50, 60],
        }
    }

    #[test]
    fn framed_round_trip() {
        let mut buf = Vec::new();
        let written = event().write_framed(&mut buf).unwrap();
        assert_eq!(written, buf.len());

        let mut cursor = Cursor::new(&buf);
        let decoded = Event::read_framed(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, event());

        // The stream ends cleanly after the one record.
        assert!(Event::read_framed(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let mut buf = Vec::new();
        event().write_framed(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        let err = Event::read_framed(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, StreamError::Io { .. }));
    }

    #[test]
    fn encode_splits_strip_states_into_events() {
        let mut pixels = PixelBuffer::new(BufferLayout::Rgb);
        pixels.set_pixels(&[Pixel::rgb(1, 2, 3)]);
        let packet = Packet::PixelPusher(pixelpusher::Packet::strip_states(
            9,
            vec![
                pixelpusher::StripState {
                    strip_number: 0,
                    pixels: pixels.clone(),
                },
                pixelpusher::StripState {
                    strip_number: 1,
                    pixels,
                },
            ],
        ));

        let events = encode_packet(7, &packet, Duration::from_micros(42)).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.device == 7));
        assert!(events.iter().all(|e| e.offset == Duration::from_micros(42)));
        assert_eq!(events[1].strip_number, 1);
        assert_eq!(events[0].pixel_data, vec![1, 2, 3]);
    }

    #[test]
    fn commands_are_not_encodable() {
        let packet = Packet::PixelPusher(pixelpusher::Packet::command(0, Command::Reset));
        assert!(matches!(
            encode_packet(0, &packet, Duration::ZERO),
            Err(StreamError::EncodingNotSupported)
        ));
    }

    #[test]
    fn decode_uses_the_device_strip_layout() {
        let device = StreamDevice {
            id: "aa".to_string(),
            ordinal: None,
            pixels_per_strip: 2,
            strips: vec![
                StreamStrip {
                    pixel_type: PixelType::Rgb,
                },
                StreamStrip {
                    pixel_type: PixelType::Rgbow,
                },
            ],
        };

        let e = Event {
            offset: Duration::ZERO,
            device: 0,
            strip_number: 1,
            pixel_type: PixelType::Rgbow,
            pixel_data: vec![1, 2, 3, 4, 4, 4, 5, 5, 5],
        };

        let Packet::PixelPusher(pkt) = e.decode(&device).unwrap();
        let pixelpusher::PacketBody::StripStates(states) = pkt.body else {
            panic!("expected strip states");
        };
        assert_eq!(states[0].pixels.layout(), BufferLayout::Rgbow);
        assert_eq!(
            states[0].pixels.pixel(0),
            Pixel {
                red: 1,
                green: 2,
                blue: 3,
                orange: 4,
                white: 5,
            }
        );

        // A strip index past the device's strip count is corrupt.
        let bad = Event {
            strip_number: 9,
            ..e
        };
        assert!(bad.decode(&device).is_err());
    }
}
