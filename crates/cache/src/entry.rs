//! Service-side transfer cache entries
//!
//! A transfer cache entry is the service half of a resource a client has
//! serialized into shared memory. The service builds an empty entry for the
//! announced [`TransferCacheEntryType`], then deserializes the client's bytes
//! into it. Entries are opaque to the cache apart from their type and the
//! memory they occupy.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::color_space::ColorSpaceEntry;
use crate::image::ImageEntry;
use crate::raw_memory::RawMemoryEntry;

/// The kind of resource held by a transfer cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferCacheEntryType {
    /// Opaque bytes copied verbatim
    RawMemory,
    /// Decoded image pixels
    Image,
    /// Color space description with an optional custom matrix
    ColorSpace,
}

impl TransferCacheEntryType {
    /// All entry types, in wire id order
    pub const ALL: [TransferCacheEntryType; 3] = [
        TransferCacheEntryType::RawMemory,
        TransferCacheEntryType::Image,
        TransferCacheEntryType::ColorSpace,
    ];

    /// Stable numeric id used on the command buffer
    pub fn wire_id(self) -> u32 {
        match self {
            TransferCacheEntryType::RawMemory => 0,
            TransferCacheEntryType::Image => 1,
            TransferCacheEntryType::ColorSpace => 2,
        }
    }
}

impl TryFrom<u32> for TransferCacheEntryType {
    type Error = DeserializeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|entry_type| entry_type.wire_id() == value)
            .ok_or(DeserializeError::UnknownEntryType(value))
    }
}

impl fmt::Display for TransferCacheEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferCacheEntryType::RawMemory => "raw_memory",
            TransferCacheEntryType::Image => "image",
            TransferCacheEntryType::ColorSpace => "color_space",
        };
        f.write_str(name)
    }
}

/// State of the rendering context entries are decoded against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    /// Largest width or height an image may have
    pub max_texture_size: u32,
    /// Set once the underlying GPU context is gone; nothing can be uploaded
    pub context_lost: bool,
}

impl DecodeContext {
    pub fn new(max_texture_size: u32) -> Self {
        Self {
            max_texture_size,
            context_lost: false,
        }
    }

    pub fn lost() -> Self {
        Self {
            max_texture_size: 0,
            context_lost: true,
        }
    }

    /// Fails if the context can no longer be used for decoding
    pub fn ensure_usable(&self) -> Result<(), DeserializeError> {
        if self.context_lost {
            Err(DeserializeError::ContextLost)
        } else {
            Ok(())
        }
    }
}

impl Default for DecodeContext {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_TEXTURE_SIZE)
    }
}

/// Reasons client data could not be turned into an entry
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeserializeError {
    #[error("unknown transfer cache entry type {0}")]
    UnknownEntryType(u32),
    #[error("decode context has been lost")]
    ContextLost,
    #[error("payload truncated: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("image dimension {size} exceeds maximum texture size {max}")]
    TextureTooLarge { size: u32, max: u32 },
    #[error("unknown image color type {0}")]
    UnknownColorType(u32),
    #[error("pixel data is {actual} bytes, expected {expected}")]
    PixelLengthMismatch { expected: usize, actual: usize },
    #[error("invalid color space {field} id {value}")]
    InvalidColorSpace { field: &'static str, value: u8 },
    #[error("color matrix contains a non-finite value")]
    NonFiniteMatrix,
}

/// A deserialized resource owned by the transfer cache
pub trait TransferCacheEntry: Any {
    /// The kind of resource this entry holds
    fn entry_type(&self) -> TransferCacheEntryType;

    /// Memory held by this entry, in bytes
    fn cached_size(&self) -> usize;

    /// Decode `data` into this entry.
    ///
    /// On error the entry is left exactly as it was before the call.
    fn deserialize(&mut self, context: &DecodeContext, data: &[u8])
        -> Result<(), DeserializeError>;

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn TransferCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCacheEntry")
            .field("type", &self.entry_type())
            .field("cached_size", &self.cached_size())
            .finish()
    }
}

impl dyn TransferCacheEntry {
    /// Downcast to a concrete entry type
    pub fn downcast_ref<T: TransferCacheEntry>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Create an empty service-side entry for `entry_type`.
///
/// Returns `None` for types that have no service-side representation.
pub fn create_entry(entry_type: TransferCacheEntryType) -> Option<Box<dyn TransferCacheEntry>> {
    let entry: Box<dyn TransferCacheEntry> = match entry_type {
        TransferCacheEntryType::RawMemory => Box::<RawMemoryEntry>::default(),
        TransferCacheEntryType::Image => Box::<ImageEntry>::default(),
        TransferCacheEntryType::ColorSpace => Box::<ColorSpaceEntry>::default(),
    };
    Some(entry)
}

/// Create an entry for `entry_type` and deserialize `data` into it
pub fn deserialize_entry(
    entry_type: TransferCacheEntryType,
    context: &DecodeContext,
    data: &[u8],
) -> Result<Box<dyn TransferCacheEntry>, DeserializeError> {
    let mut entry =
        create_entry(entry_type).ok_or(DeserializeError::UnknownEntryType(entry_type.wire_id()))?;
    entry.deserialize(context, data)?;
    Ok(entry)
}

/// Little-endian cursor over client-provided bytes
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], DeserializeError> {
        if self.data.len() < len {
            return Err(DeserializeError::Truncated {
                needed: len,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DeserializeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DeserializeError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DeserializeError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn read_f32(&mut self) -> Result<f32, DeserializeError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Fails if any bytes were left unread
    pub(crate) fn finish(self) -> Result<(), DeserializeError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(DeserializeError::TrailingBytes(self.data.len()))
        }
    }
}
