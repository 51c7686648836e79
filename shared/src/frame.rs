/*!
Frame data structures.

A [`Frame`] borrows a buffer owned by the detector SDK. It only lives for
the duration of the visitor passed to the device, so the pixel slice can
never outlive the SDK's release of the buffer.
*/

use std::sync::Arc;

/// A completed frame, borrowed from the detector
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub width: u32,
    pub height: u32,
    /// Row-major pixel counts, `width * height` entries
    pub pixels: &'a [u32],
}

impl<'a> Frame<'a> {
    pub fn new(width: u32, height: u32, pixels: &'a [u32]) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Number of pixels the dimensions call for
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Copy the pixels out of the borrowed buffer.
    ///
    /// The copy is padded with zeros or truncated to `width * height` so
    /// that published data always matches the published dimensions.
    pub fn to_owned_pixels(&self) -> Arc<[i64]> {
        let len = self.expected_len();
        self.pixels
            .iter()
            .map(|p| i64::from(*p))
            .chain(std::iter::repeat(0))
            .take(len)
            .collect()
    }
}
