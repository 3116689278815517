//! Decoded image entries
//!
//! Wire format (little-endian):
//!
//! ```text
//! width: u32 | height: u32 | color_type: u32 | pixels: width * height * bpp bytes
//! ```

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::entry::{
    DecodeContext, DeserializeError, Reader, TransferCacheEntry, TransferCacheEntryType,
};

/// Pixel layout of an image entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorType {
    Rgba8888,
    Bgra8888,
    Alpha8,
}

impl ColorType {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorType::Rgba8888 | ColorType::Bgra8888 => 4,
            ColorType::Alpha8 => 1,
        }
    }

    fn wire_id(self) -> u32 {
        match self {
            ColorType::Rgba8888 => 0,
            ColorType::Bgra8888 => 1,
            ColorType::Alpha8 => 2,
        }
    }

    fn from_wire_id(id: u32) -> Result<Self, DeserializeError> {
        match id {
            0 => Ok(ColorType::Rgba8888),
            1 => Ok(ColorType::Bgra8888),
            2 => Ok(ColorType::Alpha8),
            other => Err(DeserializeError::UnknownColorType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    width: u32,
    height: u32,
    color_type: ColorType,
    pixels: Vec<u8>,
}

impl Default for ImageEntry {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            color_type: ColorType::Rgba8888,
            pixels: Vec::new(),
        }
    }
}

impl ImageEntry {
    /// Client-side encoding of an image.
    ///
    /// `pixels` is written as-is; the service validates its length.
    pub fn serialize(width: u32, height: u32, color_type: ColorType, pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + pixels.len());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&color_type.wire_id().to_le_bytes());
        out.extend_from_slice(pixels);
        out
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_type(&self) -> ColorType {
        self.color_type
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Number of pixel bytes an image of the given shape occupies
pub fn pixel_byte_len(width: u32, height: u32, color_type: ColorType) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(color_type.bytes_per_pixel())
}

impl TransferCacheEntry for ImageEntry {
    fn entry_type(&self) -> TransferCacheEntryType {
        TransferCacheEntryType::Image
    }

    fn cached_size(&self) -> usize {
        self.pixels.len()
    }

    fn deserialize(
        &mut self,
        context: &DecodeContext,
        data: &[u8],
    ) -> Result<(), DeserializeError> {
        context.ensure_usable()?;

        let mut reader = Reader::new(data);
        let width = reader.read_u32()?;
        let height = reader.read_u32()?;
        let color_type = ColorType::from_wire_id(reader.read_u32()?)?;

        if width == 0 || height == 0 {
            return Err(DeserializeError::InvalidDimensions { width, height });
        }
        let largest = width.max(height);
        if largest > context.max_texture_size {
            return Err(DeserializeError::TextureTooLarge {
                size: largest,
                max: context.max_texture_size,
            });
        }

        let expected = pixel_byte_len(width, height, color_type)
            .ok_or(DeserializeError::InvalidDimensions { width, height })?;
        if reader.remaining() != expected {
            return Err(DeserializeError::PixelLengthMismatch {
                expected,
                actual: reader.remaining(),
            });
        }
        let pixels = reader.take(expected)?.to_vec();
        reader.finish()?;

        *self = ImageEntry {
            width,
            height,
            color_type,
            pixels,
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
