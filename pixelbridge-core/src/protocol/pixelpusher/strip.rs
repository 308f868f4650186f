//! Per-strip flags and pixel state.

use std::fmt;

use bitflags::bitflags;

use crate::pixel::{BufferLayout, PixelBuffer};

bitflags! {
    /// Flags describing an individual PixelPusher strip.
    ///
    /// Only [`StripFlags::RGBOW`] materially affects packet decoding; the
    /// remaining bits are carried through unchanged.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StripFlags: u8 {
        const RGBOW          = 1 << 0;
        const WIDE_PIXELS    = 1 << 1;
        const LOGARITHMIC    = 1 << 2;
        const MOTION         = 1 << 3;
        const NOT_IDEMPOTENT = 1 << 4;
        const BRIGHTNESS     = 1 << 5;
        const MONOCHROME     = 1 << 6;
    }
}

impl StripFlags {
    pub fn is_rgbow(self) -> bool {
        self.contains(StripFlags::RGBOW)
    }

    pub fn set_rgbow(&mut self, v: bool) {
        self.set(StripFlags::RGBOW, v);
    }

    /// The pixel buffer layout this strip's data uses on the wire.
    pub fn layout(self) -> BufferLayout {
        if self.is_rgbow() {
            BufferLayout::Rgbow
        } else {
            BufferLayout::Rgb
        }
    }

    pub fn from_wire(v: u8) -> Self {
        StripFlags::from_bits_retain(v)
    }

    pub fn to_wire(self) -> u8 {
        self.bits()
    }
}

const FLAG_NAMES: [(StripFlags, &str); 7] = [
    (StripFlags::RGBOW, "RGBOW"),
    (StripFlags::WIDE_PIXELS, "WIDEPIXELS"),
    (StripFlags::LOGARITHMIC, "LOGARITHMIC"),
    (StripFlags::MOTION, "MOTION"),
    (StripFlags::NOT_IDEMPOTENT, "NOTIDEMPOTENT"),
    (StripFlags::BRIGHTNESS, "BRIGHTNESS"),
    (StripFlags::MONOCHROME, "MONOCHROME"),
];

impl fmt::Display for StripFlags {
    /// Renders like `0x03(RGBOW|WIDEPIXELS)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if names.is_empty() {
            write!(f, "0x{:02X}", self.bits())
        } else {
            write!(f, "0x{:02X}({})", self.bits(), names.join("|"))
        }
    }
}

/// The pixel state of a single strip within a pixel datagram.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StripState<'a> {
    /// The strip this state belongs to, indexed within its device.
    pub strip_number: u8,

    /// The strip's pixels.
    pub pixels: PixelBuffer<'a>,
}

impl StripState<'_> {
    /// Converts into a state that owns its pixel data.
    pub fn into_owned(self) -> StripState<'static> {
        StripState {
            strip_number: self.strip_number,
            pixels: self.pixels.into_owned(),
        }
    }
}
