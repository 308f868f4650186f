//! Mutable per-device pixel state.

use pixelbridge_core::pixel::{Pixel, PixelBuffer};
use pixelbridge_core::protocol::{pixelpusher, DiscoveryHeaders, Packet};

/// Tracks the pixel state of a device and generates sync packets for the
/// strips that changed.
///
/// `Mutable` is not safe for concurrent use; concurrent users must lock
/// around it.
#[derive(Default)]
pub struct Mutable {
    strips: Vec<MutableStrip>,
    pixels_per_strip: usize,
}

#[derive(Default)]
struct MutableStrip {
    pixels: PixelBuffer<'static>,
    modified: bool,
}

impl Mutable {
    /// Creates a model sized from the device's discovery headers.
    pub fn new(dh: &DiscoveryHeaders) -> Self {
        let mut m = Mutable::default();
        m.initialize(dh);
        m
    }

    /// Ensures each strip state matches the state described by the
    /// device's discovery headers.
    ///
    /// May be called again after a header update; strips whose layout or
    /// length changed are rebuilt (and zeroed), others are left as they
    /// are.
    pub fn initialize(&mut self, dh: &DiscoveryHeaders) {
        let Some(pp) = dh.pixel_pusher() else {
            self.strips.clear();
            self.pixels_per_strip = 0;
            return;
        };

        self.strips.resize_with(pp.strips_attached as usize, || MutableStrip {
            pixels: PixelBuffer::new(Default::default()),
            modified: true,
        });
        self.pixels_per_strip = pp.pixels_per_strip as usize;

        for (i, strip) in self.strips.iter_mut().enumerate() {
            let layout = pp
                .strip_flags
                .get(i)
                .copied()
                .unwrap_or_default()
                .layout();

            if strip.pixels.layout() != layout || strip.pixels.len() != self.pixels_per_strip {
                let mut pixels = PixelBuffer::new(layout);
                pixels.reset(self.pixels_per_strip);
                strip.pixels = pixels;
                strip.modified = true;
            }
        }
    }

    pub fn num_strips(&self) -> usize {
        self.strips.len()
    }

    pub fn pixels_per_strip(&self) -> usize {
        self.pixels_per_strip
    }

    /// Sets one pixel, marking the strip dirty iff the value changed.
    ///
    /// Returns true when the pixel existed and was modified.
    pub fn set_pixel(&mut self, strip: usize, pixel: usize, v: Pixel) -> bool {
        if strip >= self.strips.len() || pixel >= self.pixels_per_strip {
            return false;
        }

        let ss = &mut self.strips[strip];
        if ss.pixels.pixel(pixel) == v {
            return false;
        }
        ss.pixels.set_pixel(pixel, v);
        ss.modified = true;
        true
    }

    /// Returns the pixel at the given position, or a zero pixel when out
    /// of range.
    pub fn get_pixel(&self, strip: usize, pixel: usize) -> Pixel {
        match self.strips.get(strip) {
            Some(ss) => ss.pixels.pixel(pixel),
            None => Pixel::default(),
        }
    }

    /// Sets a full strip's pixels from `pixels`, marking the strip dirty.
    ///
    /// When the layouts line up this is a fast buffer copy; otherwise
    /// pixels are copied one-by-one within bounds. Out-of-range strips are
    /// ignored.
    pub fn set_pixels(&mut self, strip: usize, pixels: &PixelBuffer<'_>) {
        let Some(ss) = self.strips.get_mut(strip) else {
            return;
        };
        ss.pixels.copy_pixel_values_from(pixels);
        ss.modified = true;
    }

    /// Clones the contents of the specified strip into `target`.
    ///
    /// Out-of-range strips leave `target` unmodified.
    pub fn clone_pixels_to(&self, strip: usize, target: &mut PixelBuffer<'_>) {
        if let Some(ss) = self.strips.get(strip) {
            target.clone_from_buffer(&ss.pixels);
        }
    }

    /// Generates a packet carrying an update for each modified strip,
    /// clearing the dirty flags. Returns `None` when nothing changed.
    pub fn sync_packet(&mut self) -> Option<Packet<'static>> {
        let mut states = Vec::new();
        for (i, ss) in self.strips.iter_mut().enumerate() {
            if !ss.modified {
                continue;
            }

            let mut pixels = PixelBuffer::new(ss.pixels.layout());
            pixels.clone_from_buffer(&ss.pixels);
            states.push(pixelpusher::StripState {
                strip_number: i as u8,
                pixels,
            });
            ss.modified = false;
        }

        if states.is_empty() {
            return None;
        }
        Some(Packet::PixelPusher(pixelpusher::Packet::strip_states(
            0, states,
        )))
    }
}
