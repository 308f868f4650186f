//! Pixel values and packed pixel buffers.
//!
//! A [`PixelBuffer`] holds the exact wire representation of a run of
//! consecutive pixels. Two layouts exist: RGB (3 bytes per pixel) and RGBOW
//! (9 bytes per pixel, with the orange and white bytes each written three
//! times on the wire although they carry a single byte of information).

use std::borrow::Cow;
use std::fmt;

/// Linear expansion table for pixel data.
///
/// Applying this table linearizes display luminance, which improves the
/// quality of video rendering on LED strips.
const PIXEL_LINEAR_EXP: [u8; 256] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3,
    3, 3, 3, 3, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, 4, 5, 5, 5, 5, 5, 5, 5, 5, 6, 6, 6, 6, 6, 6,
    7, 7, 7, 7, 7, 7, 8, 8, 8, 8, 8, 9, 9, 9, 9, 9, 10, 10, 10, 10, 11, 11, 11, 11, 12, 12, 12,
    13, 13, 13, 14, 14, 14, 14, 15, 15, 16, 16, 16, 17, 17, 17, 18, 18, 19, 19, 20, 20, 20, 21,
    21, 22, 22, 23, 23, 24, 25, 25, 26, 26, 27, 27, 28, 29, 29, 30, 31, 31, 32, 33, 34, 34, 35,
    36, 37, 38, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52, 54, 55, 56, 57, 59,
    60, 61, 63, 64, 65, 67, 68, 70, 72, 73, 75, 76, 78, 80, 82, 83, 85, 87, 89, 91, 93, 95, 97,
    99, 102, 104, 106, 109, 111, 114, 116, 119, 121, 124, 127, 129, 132, 135, 138, 141, 144, 148,
    151, 154, 158, 161, 165, 168, 172, 176, 180, 184, 188, 192, 196, 201, 205, 209, 214, 219, 224,
    229, 234, 239, 244, 249, 255,
];

/// The state of a single pixel.
///
/// Depending on the strip that the pixel belongs to, `orange` and `white`
/// may be ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pixel {
    pub red: u8,
    pub green: u8,
    pub blue: u8,

    // Orange and white each take three bytes in the RGBOW wire form,
    // despite holding a single byte value.
    pub orange: u8,
    pub white: u8,
}

impl Pixel {
    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Pixel {
            red,
            green,
            blue,
            orange: 0,
            white: 0,
        }
    }

    /// Returns this pixel shifted through the luminance linearization table.
    pub fn antilog(self) -> Self {
        Pixel {
            red: PIXEL_LINEAR_EXP[self.red as usize],
            green: PIXEL_LINEAR_EXP[self.green as usize],
            blue: PIXEL_LINEAR_EXP[self.blue as usize],
            orange: PIXEL_LINEAR_EXP[self.orange as usize],
            white: PIXEL_LINEAR_EXP[self.white as usize],
        }
    }
}

impl fmt::Display for Pixel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.orange == 0 && self.white == 0 {
            write!(f, "({}, {}, {})", self.red, self.green, self.blue)
        } else {
            write!(
                f,
                "({}, {}, {} / {}, {})",
                self.red, self.green, self.blue, self.orange, self.white
            )
        }
    }
}

/// The wire layout of a pixel buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BufferLayout {
    /// Contiguous (R, G, B) pixel value bytes.
    #[default]
    Rgb,
    /// Contiguous (R, G, B, O, O, O, W, W, W) pixel value bytes. The O and W
    /// bytes are each three copies of the same value.
    Rgbow,
}

impl BufferLayout {
    /// Bytes per pixel on the wire.
    pub const fn pixel_size(self) -> usize {
        match self {
            BufferLayout::Rgb => 3,
            BufferLayout::Rgbow => 9,
        }
    }
}

/// The wire format for a series of consecutive pixels.
///
/// The backing storage is either owned or borrowed from an inbound datagram,
/// which allows minimal-copy packet parsing: a buffer parsed from a datagram
/// references the datagram's bytes and cannot outlive them. Mutating a
/// borrowed buffer promotes it to an owned copy first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PixelBuffer<'a> {
    layout: BufferLayout,
    data: Cow<'a, [u8]>,
}

impl<'a> PixelBuffer<'a> {
    /// Creates an empty buffer with the given layout.
    pub fn new(layout: BufferLayout) -> PixelBuffer<'static> {
        PixelBuffer {
            layout,
            data: Cow::Owned(Vec::new()),
        }
    }

    /// Creates a zeroed buffer holding `pixels` pixels.
    pub fn with_len(layout: BufferLayout, pixels: usize) -> PixelBuffer<'static> {
        PixelBuffer {
            layout,
            data: Cow::Owned(vec![0; pixels * layout.pixel_size()]),
        }
    }

    /// Adopts `bytes` directly as backing storage, without copying.
    ///
    /// The buffer references `bytes` for as long as it lives; the borrow
    /// checker prevents the backing slice from being mutated or dropped
    /// while the buffer is active.
    pub fn from_bytes(layout: BufferLayout, bytes: &'a [u8]) -> PixelBuffer<'a> {
        PixelBuffer {
            layout,
            data: Cow::Borrowed(bytes),
        }
    }

    /// Adopts an already-materialized `Cow`, preserving its ownership.
    pub fn from_cow(layout: BufferLayout, bytes: Cow<'a, [u8]>) -> PixelBuffer<'a> {
        PixelBuffer {
            layout,
            data: bytes,
        }
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    /// The number of pixels held.
    pub fn len(&self) -> usize {
        self.data.len() / self.layout.pixel_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw wire bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Clears the buffer and sizes it to hold `pixels` zeroed pixels.
    pub fn reset(&mut self, pixels: usize) {
        self.resize_buffer(pixels);
        self.data.to_mut().fill(0);
    }

    fn resize_buffer(&mut self, pixels: usize) {
        let needed = pixels * self.layout.pixel_size();
        self.data.to_mut().resize(needed, 0);
    }

    /// Converts into a buffer that owns its storage.
    pub fn into_owned(self) -> PixelBuffer<'static> {
        PixelBuffer {
            layout: self.layout,
            data: Cow::Owned(self.data.into_owned()),
        }
    }

    /// Returns the pixel at index `i`, or a zero pixel if `i` is out of
    /// bounds.
    ///
    /// For RGBOW buffers, the single-byte orange and white values are read
    /// from the first byte of each wire triplet.
    pub fn pixel(&self, i: usize) -> Pixel {
        let size = self.layout.pixel_size();
        let offset = i * size;
        if offset + size > self.data.len() {
            return Pixel::default();
        }

        let b = &self.data[offset..offset + size];
        let mut p = Pixel::rgb(b[0], b[1], b[2]);
        if self.layout == BufferLayout::Rgbow {
            p.orange = b[3];
            p.white = b[6];
        }
        p
    }

    /// Sets the pixel at index `i`. Does nothing if `i` is out of bounds.
    ///
    /// For RGBOW buffers, the orange and white values are each written as
    /// three identical wire bytes.
    pub fn set_pixel(&mut self, i: usize, p: Pixel) {
        let size = self.layout.pixel_size();
        let offset = i * size;
        if offset + size > self.data.len() {
            return;
        }

        let b = &mut self.data.to_mut()[offset..offset + size];
        b[0] = p.red;
        b[1] = p.green;
        b[2] = p.blue;
        if size == BufferLayout::Rgbow.pixel_size() {
            b[3] = p.orange;
            b[4] = p.orange;
            b[5] = p.orange;
            b[6] = p.white;
            b[7] = p.white;
            b[8] = p.white;
        }
    }

    /// Replaces the buffer's content with the given pixels.
    pub fn set_pixels(&mut self, pixels: &[Pixel]) {
        self.resize_buffer(pixels.len());
        for (i, p) in pixels.iter().enumerate() {
            self.set_pixel(i, *p);
        }
    }

    /// Clones layout and contents from `other`.
    pub fn clone_from_buffer(&mut self, other: &PixelBuffer<'_>) {
        self.clone_from_with_len(other, other.len());
    }

    /// Clones the first `pixels` pixels of `other`, adopting its layout.
    ///
    /// If `other` has more pixels, the excess is discarded; if it has fewer,
    /// the remainder is zeroed (black).
    pub fn clone_from_with_len(&mut self, other: &PixelBuffer<'_>, pixels: usize) {
        self.layout = other.layout;
        self.resize_buffer(pixels);

        // Layouts now match, so the two buffers are byte-for-byte
        // compatible.
        let buf = self.data.to_mut();
        let copy = buf.len().min(other.data.len());
        buf[..copy].copy_from_slice(&other.data[..copy]);
        buf[copy..].fill(0);
    }

    /// Sets this buffer's pixel values to match `other` without changing its
    /// own layout or length.
    ///
    /// If the layouts match this is a fast byte copy; otherwise pixels are
    /// copied one-by-one up to the shorter of the two lengths.
    pub fn copy_pixel_values_from(&mut self, other: &PixelBuffer<'_>) {
        if self.layout == other.layout {
            let len = self.len();
            self.clone_from_with_len(other, len);
            return;
        }

        let count = self.len().min(other.len());
        for i in 0..count {
            self.set_pixel(i, other.pixel(i));
        }
    }

    /// Applies the luminance linearization table to every wire byte.
    ///
    /// This is more efficient than transforming each pixel individually. The
    /// transform is applied uniformly across layouts; in RGBOW buffers the
    /// duplicated orange/white bytes remain identical because the lookup is
    /// a pure function of the byte value.
    pub fn antilog(&mut self) {
        for b in self.data.to_mut() {
            *b = PIXEL_LINEAR_EXP[*b as usize];
        }
    }
}
