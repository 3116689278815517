//! Color space entries
//!
//! Wire format: four id bytes (primaries, transfer, matrix, range), a flag
//! byte, and when the flag is set a row-major 3x4 matrix of `f32`.

use std::any::Any;
use std::mem;

use crate::entry::{
    DecodeContext, DeserializeError, Reader, TransferCacheEntry, TransferCacheEntryType,
};

const MAX_PRIMARIES_ID: u8 = 7;
const MAX_TRANSFER_ID: u8 = 9;
const MAX_MATRIX_ID: u8 = 5;
const MAX_RANGE_ID: u8 = 2;

/// A color space description
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColorSpace {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub range: u8,
    /// Custom primary transform, overriding `primaries` when present
    pub custom_matrix: Option<[f32; 12]>,
}

impl ColorSpace {
    pub fn new(primaries: u8, transfer: u8, matrix: u8, range: u8) -> Self {
        Self {
            primaries,
            transfer,
            matrix,
            range,
            custom_matrix: None,
        }
    }

    pub fn with_custom_matrix(mut self, matrix: [f32; 12]) -> Self {
        self.custom_matrix = Some(matrix);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorSpaceEntry {
    color_space: ColorSpace,
}

impl ColorSpaceEntry {
    /// Client-side encoding of a color space
    pub fn serialize(color_space: &ColorSpace) -> Vec<u8> {
        let mut out = vec![
            color_space.primaries,
            color_space.transfer,
            color_space.matrix,
            color_space.range,
        ];
        match &color_space.custom_matrix {
            Some(matrix) => {
                out.push(1);
                for value in matrix {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            None => out.push(0),
        }
        out
    }

    pub fn color_space(&self) -> &ColorSpace {
        &self.color_space
    }
}

fn checked_id(field: &'static str, value: u8, max: u8) -> Result<u8, DeserializeError> {
    if value > max {
        Err(DeserializeError::InvalidColorSpace { field, value })
    } else {
        Ok(value)
    }
}

impl TransferCacheEntry for ColorSpaceEntry {
    fn entry_type(&self) -> TransferCacheEntryType {
        TransferCacheEntryType::ColorSpace
    }

    fn cached_size(&self) -> usize {
        mem::size_of::<ColorSpace>()
    }

    fn deserialize(
        &mut self,
        context: &DecodeContext,
        data: &[u8],
    ) -> Result<(), DeserializeError> {
        context.ensure_usable()?;

        let mut reader = Reader::new(data);
        let primaries = checked_id("primaries", reader.read_u8()?, MAX_PRIMARIES_ID)?;
        let transfer = checked_id("transfer", reader.read_u8()?, MAX_TRANSFER_ID)?;
        let matrix = checked_id("matrix", reader.read_u8()?, MAX_MATRIX_ID)?;
        let range = checked_id("range", reader.read_u8()?, MAX_RANGE_ID)?;

        let custom_matrix = match reader.read_u8()? {
            0 => None,
            1 => {
                let mut values = [0f32; 12];
                for value in &mut values {
                    *value = reader.read_f32()?;
                    if !value.is_finite() {
                        return Err(DeserializeError::NonFiniteMatrix);
                    }
                }
                Some(values)
            }
            other => {
                return Err(DeserializeError::InvalidColorSpace {
                    field: "custom_matrix",
                    value: other,
                })
            }
        };
        reader.finish()?;

        self.color_space = ColorSpace {
            primaries,
            transfer,
            matrix,
            range,
            custom_matrix,
        };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
