//! Pixel/command datagram parsing and outbound packet assembly.

use crate::error::{ProtocolError, SendError};
use crate::io::{ByteSliceReader, DatagramSender};
use crate::pixel::PixelBuffer;

use super::command::{Command, COMMAND_MAGIC};
use super::strip::{StripFlags, StripState};

/// A single PixelPusher data packet.
#[derive(Clone, Debug)]
pub struct Packet<'a> {
    /// The packet index, big-endian on the wire.
    pub id: u32,

    /// The packet's payload: exactly one command or a run of strip states.
    pub body: PacketBody<'a>,
}

/// The payload of a [`Packet`].
#[derive(Clone, Debug)]
pub enum PacketBody<'a> {
    Command(Command),
    StripStates(Vec<StripState<'a>>),
}

impl Packet<'_> {
    pub fn command(id: u32, command: Command) -> Packet<'static> {
        Packet {
            id,
            body: PacketBody::Command(command),
        }
    }

    pub fn strip_states(id: u32, states: Vec<StripState<'_>>) -> Packet<'_> {
        Packet {
            id,
            body: PacketBody::StripStates(states),
        }
    }

    /// Converts into a packet that owns all of its pixel data.
    pub fn into_owned(self) -> Packet<'static> {
        Packet {
            id: self.id,
            body: match self.body {
                PacketBody::Command(c) => PacketBody::Command(c),
                PacketBody::StripStates(ss) => {
                    PacketBody::StripStates(ss.into_iter().map(StripState::into_owned).collect())
                }
            },
        }
    }
}

/// Parses inbound datagrams for a single device configuration.
///
/// A reader is generally obtained from a device's discovery block, which
/// supplies the per-strip flags needed to decode pixel data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PacketReader {
    /// The number of pixels belonging to each strip.
    pub pixels_per_strip: usize,

    /// Flags for each strip, indexed by strip number. Each strip's encoding
    /// depends on its configuration.
    pub strip_flags: Vec<StripFlags>,
}

impl PacketReader {
    /// Parses a single datagram.
    ///
    /// The returned packet's pixel buffers reference the reader's backing
    /// slice and must not outlive it.
    pub fn read_packet<'a>(&self, r: &mut ByteSliceReader<'a>) -> Result<Packet<'a>, ProtocolError> {
        let id = r.read_u32_be().ok_or(ProtocolError::Truncated {
            context: "packet index",
        })?;

        // A command datagram is identified by its magic prefix.
        if r.peek(COMMAND_MAGIC.len()).as_ref() == COMMAND_MAGIC {
            r.skip(COMMAND_MAGIC.len());
            let command = Command::read(r, false)?;
            return Ok(Packet::command(id, command));
        }

        // A pixel datagram: read strip states until the datagram ends. A
        // clean end between strips is success; an end mid-strip is not.
        let mut states = Vec::new();
        while let Some(strip_number) = r.read_u8() {
            if strip_number as usize >= self.strip_flags.len() {
                return Err(ProtocolError::StripOutOfRange {
                    strip: strip_number,
                    max: self.strip_flags.len().saturating_sub(1),
                });
            }
            let layout = self.strip_flags[strip_number as usize].layout();

            let size = self.pixels_per_strip * layout.pixel_size();
            let data = r.next(size).ok_or(ProtocolError::Truncated {
                context: "strip pixel data",
            })?;

            states.push(StripState {
                strip_number,
                pixels: PixelBuffer::from_cow(layout, data),
            });
        }

        Ok(Packet::strip_states(id, states))
    }
}

/// Assembles outbound datagrams for a single device.
///
/// A stream is generally obtained from a device's discovery block. Strip
/// states are batched into datagrams under three constraints: the device's
/// maximum strips per packet, the link's maximum datagram size, and an
/// optional fixed datagram size (zero-padded). Commands are sent
/// immediately and are never batched with pixel data.
///
/// Every emitted datagram begins with a 4-byte big-endian packet index;
/// the index increments exactly once per successfully sent datagram.
#[derive(Debug)]
pub struct PacketStream {
    /// The maximum number of strip states in a single datagram.
    pub max_strips_per_packet: u8,

    /// The pixels per strip this device expects. When > 0, submitted strip
    /// states with a different pixel count are conformed to this length.
    pub pixels_per_strip: u16,

    /// When > 0, every emitted datagram is padded to exactly this size.
    /// A datagram that naturally exceeds it is sent unpadded.
    pub fixed_size: usize,

    /// The index to assign to the next datagram.
    pub next_id: u32,

    command_buf: Vec<u8>,
    strip_buf: Vec<u8>,
    strip_count: usize,
}

impl PacketStream {
    pub fn new(max_strips_per_packet: u8, pixels_per_strip: u16, fixed_size: usize) -> Self {
        PacketStream {
            max_strips_per_packet,
            pixels_per_strip,
            fixed_size,
            next_id: 0,
            command_buf: Vec::new(),
            strip_buf: Vec::new(),
            strip_count: 0,
        }
    }

    /// Sends the contents of `packet`.
    ///
    /// The packet's own index is ignored; the stream assigns its own. Strip
    /// states may be buffered rather than sent; call [`PacketStream::flush`]
    /// to force them out.
    pub fn send(
        &mut self,
        ds: &mut dyn DatagramSender,
        packet: &Packet<'_>,
    ) -> Result<(), SendError> {
        match &packet.body {
            PacketBody::Command(cmd) => self.send_command(ds, cmd),
            PacketBody::StripStates(states) => {
                for ss in states {
                    self.send_or_enqueue_strip_state(ds, ss)?;
                }
                Ok(())
            }
        }
    }

    /// Formats and sends a command datagram immediately.
    pub fn send_command(
        &mut self,
        ds: &mut dyn DatagramSender,
        cmd: &Command,
    ) -> Result<(), SendError> {
        let mut buf = std::mem::take(&mut self.command_buf);
        reset_packet_buffer(&mut buf);
        cmd.write(&mut buf, true);

        let result = self.finalize_and_send(ds, &mut buf);
        self.command_buf = buf;
        result
    }

    /// Enqueues a strip state, sending a datagram when a constraint is
    /// reached.
    ///
    /// Enqueueing may flush previously-buffered states to make room. At
    /// most one send operation occurs per call.
    pub fn send_or_enqueue_strip_state(
        &mut self,
        ds: &mut dyn DatagramSender,
        ss: &StripState<'_>,
    ) -> Result<(), SendError> {
        if ss.pixels.is_empty() {
            return Ok(());
        }

        // Conform the state to the device's pixels-per-strip, truncating or
        // zero-filling as needed.
        let conformed;
        let data: &[u8] = if self.pixels_per_strip > 0
            && ss.pixels.len() != self.pixels_per_strip as usize
        {
            let mut pixels = PixelBuffer::new(ss.pixels.layout());
            pixels.clone_from_with_len(&ss.pixels, self.pixels_per_strip as usize);
            conformed = pixels;
            conformed.bytes()
        } else {
            ss.pixels.bytes()
        };

        if self.strip_count == 0 {
            reset_packet_buffer(&mut self.strip_buf);
        }

        // Apply the maximum packet size constraint.
        let strip_data_size = 1 + data.len(); // [strip number] + data
        let mps = self.max_packet_size(ds);
        if mps > 0 && self.strip_buf.len() + strip_data_size > mps {
            if self.strip_count == 0 {
                return Err(ProtocolError::StripDataTooLarge {
                    size: strip_data_size,
                    max: mps,
                }
                .into());
            }

            // There is buffered data; flush it and try again.
            self.flush(ds)?;
            if self.strip_buf.len() + strip_data_size > mps {
                return Err(ProtocolError::StripDataTooLarge {
                    size: strip_data_size,
                    max: mps,
                }
                .into());
            }
        }

        self.strip_buf.push(ss.strip_number);
        self.strip_buf.extend_from_slice(data);
        self.strip_count += 1;

        if self.strip_count >= self.max_strips_per_packet as usize {
            return self.flush(ds);
        }
        Ok(())
    }

    /// Sends any buffered strip states. Does nothing when nothing is
    /// buffered.
    ///
    /// A flush that fails leaves the buffered states in place; a retry sees
    /// the same strips and the packet index is not consumed.
    pub fn flush(&mut self, ds: &mut dyn DatagramSender) -> Result<(), SendError> {
        if self.strip_count == 0 {
            return Ok(());
        }

        let mut buf = std::mem::take(&mut self.strip_buf);
        let result = self.finalize_and_send(ds, &mut buf);
        self.strip_buf = buf;

        if result.is_ok() {
            self.strip_count = 0;
        }
        result
    }

    /// The effective maximum packet size: the link's maximum datagram size,
    /// tightened to the fixed size when one is set.
    fn max_packet_size(&self, ds: &dyn DatagramSender) -> usize {
        let link = ds.max_datagram_size();
        if self.fixed_size > 0 && self.fixed_size < link {
            self.fixed_size
        } else {
            link
        }
    }

    /// Stamps the packet index, applies fixed-size padding, validates the
    /// size, and sends. The index is consumed only on a successful send, and
    /// the buffer is reset for the next packet.
    fn finalize_and_send(
        &mut self,
        ds: &mut dyn DatagramSender,
        buf: &mut Vec<u8>,
    ) -> Result<(), SendError> {
        buf[..4].copy_from_slice(&self.next_id.to_be_bytes());

        let natural_len = buf.len();
        if self.fixed_size > 0 && buf.len() < self.fixed_size {
            buf.resize(self.fixed_size, 0x00);
        }

        let result = (|| {
            let max = ds.max_datagram_size();
            if buf.len() > max {
                return Err(SendError::from(ProtocolError::PacketTooLarge {
                    size: buf.len(),
                    max,
                }));
            }
            ds.send_datagram(buf)?;
            Ok(())
        })();

        if result.is_err() {
            // Strip the padding so retained content can be retried or
            // appended to.
            buf.truncate(natural_len);
            return result;
        }

        reset_packet_buffer(buf);
        self.next_id = self.next_id.wrapping_add(1);
        Ok(())
    }
}

/// Clears `buf` down to the 4-byte space reserved at the beginning for the
/// packet index.
fn reset_packet_buffer(buf: &mut Vec<u8>) {
    if buf.len() < 4 {
        buf.clear();
        buf.extend_from_slice(&[0x00; 4]);
    } else {
        buf.truncate(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::{BufferLayout, Pixel};
    use crate::protocol::pixelpusher::Security;
    use std::io;

    /// A DatagramSender that records everything sent through it.
    #[derive(Debug, Default)]
    struct RecordingSender {
        datagrams: Vec<Vec<u8>>,
        max_size: usize,
        fail_next: bool,
    }

    impl RecordingSender {
        fn with_max(max_size: usize) -> Self {
            RecordingSender {
                max_size,
                ..RecordingSender::default()
            }
        }
    }

    impl DatagramSender for RecordingSender {
        fn send_datagram(&mut self, data: &[u8]) -> io::Result<()> {
            if self.fail_next {
                self.fail_next = false;
                return Err(io::Error::new(io::ErrorKind::Other, "send refused"));
            }
            self.datagrams.push(data.to_vec());
            Ok(())
        }

        fn max_datagram_size(&self) -> usize {
            self.max_size
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn reader_two_strips() -> PacketReader {
        // Strip 0 is RGB, strip 1 is RGBOW.
        PacketReader {
            pixels_per_strip: 2,
            strip_flags: vec![StripFlags::empty(), StripFlags::RGBOW],
        }
    }

    fn rgb_state(strip_number: u8, seed: u8) -> StripState<'static> {
        let mut pixels = PixelBuffer::new(BufferLayout::Rgb);
        pixels.set_pixels(&[
            Pixel::rgb(seed, seed + 1, seed + 2),
            Pixel::rgb(seed + 3, seed + 4, seed + 5),
        ]);
        StripState {
            strip_number,
            pixels,
        }
    }

    #[test]
    fn parses_a_command_datagram() {
        let mut data = vec![0xAA, 0xBB, 0xCC, 0xDD];
        data.extend_from_slice(&COMMAND_MAGIC);
        data.push(0x01);

        let mut r = ByteSliceReader::new(&data);
        let pkt = reader_two_strips().read_packet(&mut r).unwrap();

        assert_eq!(pkt.id, 0xAABBCCDD);
        assert!(matches!(pkt.body, PacketBody::Command(Command::Reset)));
    }

    #[test]
    fn parses_a_pixel_datagram_with_rgbow_strip() {
        let mut data = vec![0xAA, 0xBB, 0xCC, 0xDD];
        data.push(1); // RGBOW strip
        data.extend_from_slice(&[
            1, 2, 3, 4, 4, 4, 5, 5, 5, //
            6, 7, 8, 9, 9, 9, 10, 10, 10,
        ]);

        let mut r = ByteSliceReader::new(&data);
        let pkt = reader_two_strips().read_packet(&mut r).unwrap();

        assert_eq!(pkt.id, 0xAABBCCDD);
        let PacketBody::StripStates(states) = pkt.body else {
            panic!("expected strip states");
        };
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].strip_number, 1);
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
        assert_eq!(
            states[0].pixels.pixel(1),
            Pixel {
                red: 6,
                green: 7,
                blue: 8,
                orange: 9,
                white: 10,
            }
        );
    }

    #[test]
    fn parses_multiple_strip_states_in_order() {
        let mut data = vec![0, 0, 0, 1];
        data.push(0);
        data.extend_from_slice(&[1, 1, 1, 2, 2, 2]); // strip 0, RGB
        data.push(1);
        data.extend_from_slice(&[0; 18]); // strip 1, RGBOW

        let mut r = ByteSliceReader::new(&data);
        let pkt = reader_two_strips().read_packet(&mut r).unwrap();

        let PacketBody::StripStates(states) = pkt.body else {
            panic!("expected strip states");
        };
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].strip_number, 0);
        assert_eq!(states[1].strip_number, 1);
    }

    #[test]
    fn rejects_out_of_range_strip() {
        let data = [0, 0, 0, 1, 7];
        let mut r = ByteSliceReader::new(&data);
        assert!(matches!(
            reader_two_strips().read_packet(&mut r),
            Err(ProtocolError::StripOutOfRange { strip: 7, max: 1 })
        ));
    }

    #[test]
    fn rejects_mid_strip_eof() {
        let data = [0, 0, 0, 1, 0, 1, 1]; // strip 0 needs 6 pixel bytes
        let mut r = ByteSliceReader::new(&data);
        assert!(matches!(
            reader_two_strips().read_packet(&mut r),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_pixel_datagram_parses_to_no_states() {
        let data = [0, 0, 0, 5];
        let mut r = ByteSliceReader::new(&data);
        let pkt = reader_two_strips().read_packet(&mut r).unwrap();

        let PacketBody::StripStates(states) = pkt.body else {
            panic!("expected strip states");
        };
        assert!(states.is_empty());
        assert_eq!(pkt.id, 5);
    }

    #[test]
    fn batches_strips_and_increments_ids() {
        let mut ds = RecordingSender::with_max(1024);
        let mut ps = PacketStream::new(2, 2, 0);
        ps.next_id = 0x0000FACE;

        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(0, 10))
            .unwrap();
        assert!(ds.datagrams.is_empty());

        // The second strip reaches max_strips_per_packet and triggers one
        // datagram with both strips in call order.
        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(1, 20))
            .unwrap();
        assert_eq!(ds.datagrams.len(), 1);

        let mut expected = vec![0x00, 0x00, 0xFA, 0xCE];
        expected.push(0);
        expected.extend_from_slice(&[10, 11, 12, 13, 14, 15]);
        expected.push(1);
        expected.extend_from_slice(&[20, 21, 22, 23, 24, 25]);
        assert_eq!(ds.datagrams[0], expected);

        // A third strip buffers until an explicit flush, which uses the
        // next index.
        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(0, 30))
            .unwrap();
        assert_eq!(ds.datagrams.len(), 1);
        ps.flush(&mut ds).unwrap();
        assert_eq!(ds.datagrams.len(), 2);
        assert_eq!(&ds.datagrams[1][..4], &[0x00, 0x00, 0xFA, 0xCF]);
        assert_eq!(ds.datagrams[1][4], 0);
        assert_eq!(ps.next_id, 0x0000FAD0);
    }

    #[test]
    fn empty_strip_state_is_a_noop() {
        let mut ds = RecordingSender::with_max(1024);
        let mut ps = PacketStream::new(1, 0, 0);

        let ss = StripState {
            strip_number: 0,
            pixels: PixelBuffer::new(BufferLayout::Rgb),
        };
        ps.send_or_enqueue_strip_state(&mut ds, &ss).unwrap();
        ps.flush(&mut ds).unwrap();
        assert!(ds.datagrams.is_empty());
    }

    #[test]
    fn conforms_strip_length_to_pixels_per_strip() {
        let mut ds = RecordingSender::with_max(1024);
        let mut ps = PacketStream::new(1, 4, 0);

        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(0, 1))
            .unwrap();
        assert_eq!(ds.datagrams.len(), 1);
        // 4-byte id + strip number + 4 pixels * 3 bytes, zero-filled tail.
        assert_eq!(ds.datagrams[0].len(), 4 + 1 + 12);
        assert_eq!(&ds.datagrams[0][11..], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn pads_datagrams_to_fixed_size() {
        let mut ds = RecordingSender::with_max(1024);
        let mut ps = PacketStream::new(1, 2, 32);

        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(0, 1))
            .unwrap();
        assert_eq!(ds.datagrams.len(), 1);
        assert_eq!(ds.datagrams[0].len(), 32);
        // Natural size is 4 + 1 + 6; the tail is zero padding.
        assert!(ds.datagrams[0][11..].iter().all(|b| *b == 0));

        let mut cmd_ds = RecordingSender::with_max(1024);
        ps.send_command(&mut cmd_ds, &Command::Reset).unwrap();
        assert_eq!(cmd_ds.datagrams[0].len(), 32);
    }

    #[test]
    fn oversized_datagram_fails_without_consuming_the_id() {
        let mut ds = RecordingSender::with_max(16);
        let mut ps = PacketStream::new(1, 0, 0);

        // One RGBOW strip of 2 pixels: 4 + 1 + 18 bytes > 16.
        let mut pixels = PixelBuffer::with_len(BufferLayout::Rgbow, 2);
        pixels.set_pixel(0, Pixel::rgb(1, 1, 1));
        let ss = StripState {
            strip_number: 0,
            pixels,
        };

        let err = ps.send_or_enqueue_strip_state(&mut ds, &ss).unwrap_err();
        assert!(matches!(
            err,
            SendError::Protocol(ProtocolError::StripDataTooLarge { .. })
        ));
        assert!(ds.datagrams.is_empty());
        assert_eq!(ps.next_id, 0);
    }

    #[test]
    fn oversized_command_fails() {
        let mut ds = RecordingSender::with_max(16);
        let mut ps = PacketStream::new(1, 0, 0);

        let cmd = Command::WifiConfigure {
            ssid: "a-rather-long-network-name".to_string(),
            key: "k".to_string(),
            security: Security::WPA2,
        };
        let err = ps.send_command(&mut ds, &cmd).unwrap_err();
        assert!(matches!(
            err,
            SendError::Protocol(ProtocolError::PacketTooLarge { .. })
        ));
        assert_eq!(ps.next_id, 0);
    }

    #[test]
    fn failed_flush_retains_buffered_strips() {
        let mut ds = RecordingSender::with_max(1024);
        let mut ps = PacketStream::new(4, 2, 0);

        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(0, 10))
            .unwrap();

        ds.fail_next = true;
        assert!(ps.flush(&mut ds).is_err());
        assert_eq!(ps.next_id, 0);

        // The retry sees the same strips and succeeds with the same id.
        ps.flush(&mut ds).unwrap();
        assert_eq!(ds.datagrams.len(), 1);
        assert_eq!(&ds.datagrams[0][..4], &[0, 0, 0, 0]);
        assert_eq!(ds.datagrams[0][4], 0);
        assert_eq!(ps.next_id, 1);
    }

    #[test]
    fn full_buffer_flushes_then_retries() {
        // Room for the id plus exactly one strip (1 + 6 bytes): 11 bytes.
        let mut ds = RecordingSender::with_max(11);
        let mut ps = PacketStream::new(4, 2, 0);

        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(0, 10))
            .unwrap();
        assert!(ds.datagrams.is_empty());

        // The second strip does not fit, so the first is flushed to make
        // room.
        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(1, 20))
            .unwrap();
        assert_eq!(ds.datagrams.len(), 1);
        assert_eq!(ds.datagrams[0][4], 0);

        ps.flush(&mut ds).unwrap();
        assert_eq!(ds.datagrams.len(), 2);
        assert_eq!(ds.datagrams[1][4], 1);
        assert_eq!(ps.next_id, 2);
    }

    #[test]
    fn commands_and_pixels_are_never_mixed() {
        let mut ds = RecordingSender::with_max(1024);
        let mut ps = PacketStream::new(4, 2, 0);

        ps.send_or_enqueue_strip_state(&mut ds, &rgb_state(0, 10))
            .unwrap();
        ps.send_command(&mut ds, &Command::Reset).unwrap();

        // The command went out alone; the pixel data is still buffered.
        assert_eq!(ds.datagrams.len(), 1);
        assert_eq!(&ds.datagrams[0][4..20], &COMMAND_MAGIC);

        ps.flush(&mut ds).unwrap();
        assert_eq!(ds.datagrams.len(), 2);
        assert_eq!(ds.datagrams[1][4], 0);
    }
}
