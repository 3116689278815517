//! Raw memory entries: client bytes kept verbatim on the service side.

use std::any::Any;

use crate::entry::{DecodeContext, DeserializeError, TransferCacheEntry, TransferCacheEntryType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMemoryEntry {
    data: Vec<u8>,
}

impl RawMemoryEntry {
    /// Client-side encoding of a raw memory entry
    pub fn serialize(data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl TransferCacheEntry for RawMemoryEntry {
    fn entry_type(&self) -> TransferCacheEntryType {
        TransferCacheEntryType::RawMemory
    }

    fn cached_size(&self) -> usize {
        self.data.len()
    }

    fn deserialize(
        &mut self,
        context: &DecodeContext,
        data: &[u8],
    ) -> Result<(), DeserializeError> {
        context.ensure_usable()?;
        self.data = data.to_vec();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copies_payload() {
        let mut entry = RawMemoryEntry::default();
        entry
            .deserialize(&DecodeContext::default(), &RawMemoryEntry::serialize(&[4; 64]))
            .unwrap();
        assert_eq!(entry.cached_size(), 64);
        assert_eq!(entry.data(), &[4; 64][..]);
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let mut entry = RawMemoryEntry::default();
        entry.deserialize(&DecodeContext::default(), &[]).unwrap();
        assert_eq!(entry.cached_size(), 0);
    }

    #[test]
    fn test_lost_context_keeps_old_data() {
        let mut entry = RawMemoryEntry::default();
        entry.deserialize(&DecodeContext::default(), b"keep").unwrap();
        assert!(entry.deserialize(&DecodeContext::lost(), b"replace").is_err());
        assert_eq!(entry.data(), b"keep");
    }
}
