//! Payload container carried by one-way transactions.
//!
//! A parcel is a flat byte buffer plus a side table of attached handles.
//! Handles cannot travel as bytes, so writing one appends it to the table and
//! writes its table index into the buffer:
//!
//! ```text
//! [u32 BE][u32 BE]...[u64 BE: handle index]...
//! ```

use crate::config::WireConfig;
use crate::endpoint::OneWayHandle;
use crate::{Result, TetherError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Byte buffer with a read cursor and attached handles.
#[derive(Clone, Default)]
pub struct Parcel {
    data: BytesMut,
    read_pos: usize,
    objects: Vec<Arc<dyn OneWayHandle>>,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a parcel holding only raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut parcel = Self::new();
        parcel.data.put_slice(bytes);
        parcel
    }

    /// Total number of bytes written.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Bytes left between the read cursor and the end.
    pub fn data_avail(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Move the read cursor. Positions past the end are clamped.
    pub fn set_read_position(&mut self, pos: usize) {
        self.read_pos = pos.min(self.data.len());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_u32(bytes.len() as u32);
        self.data.put_slice(bytes);
    }

    /// Attach a handle and write its reference.
    pub fn write_handle(&mut self, handle: Arc<dyn OneWayHandle>) {
        let index = self.objects.len() as u64;
        self.objects.push(handle);
        self.data.put_u64(index);
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut chunk = self.take(4)?;
        Ok(chunk.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut chunk = self.take(8)?;
        Ok(chunk.get_u64())
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        if len > WireConfig::MAX_FRAME_PAYLOAD {
            return Err(TetherError::FrameTooLarge {
                size: len,
                max: WireConfig::MAX_FRAME_PAYLOAD,
            });
        }
        let chunk = self.take(len)?;
        Ok(Bytes::copy_from_slice(chunk))
    }

    /// Read a handle reference written by [`Parcel::write_handle`].
    pub fn read_handle(&mut self) -> Result<Arc<dyn OneWayHandle>> {
        let index = self.read_u64()?;
        usize::try_from(index)
            .ok()
            .and_then(|i| self.objects.get(i))
            .cloned()
            .ok_or_else(|| TetherError::Parcel {
                message: format!("no attached handle at index {}", index),
            })
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.data_avail() < len {
            return Err(TetherError::Parcel {
                message: format!(
                    "read of {} bytes at offset {} overruns {} byte parcel",
                    len,
                    self.read_pos,
                    self.data.len()
                ),
            });
        }
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.data[start..start + len])
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("data_size", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("objects", &self.objects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{LeakSafeEndpoint, LocalHandle};

    #[test]
    fn test_read_past_end_is_an_error() {
        let mut parcel = Parcel::new();
        parcel.write_u32(7);
        assert_eq!(parcel.read_u32().unwrap(), 7);
        assert!(matches!(parcel.read_u32(), Err(TetherError::Parcel { .. })));
    }

    #[test]
    fn test_handle_reference_resolves_to_attached_object() {
        let handle = LocalHandle::new(LeakSafeEndpoint::new());
        let id = handle.handle_id();

        let mut parcel = Parcel::new();
        parcel.write_u32(1);
        parcel.write_handle(handle);
        assert_eq!(parcel.data_size(), 4 + WireConfig::HANDLE_REF_SIZE);

        parcel.read_u32().unwrap();
        assert_eq!(parcel.read_handle().unwrap().handle_id(), id);
    }

    #[test]
    fn test_dangling_handle_reference_is_rejected() {
        let mut parcel = Parcel::new();
        parcel.write_u64(3);
        assert!(parcel.read_handle().is_err());
    }

    #[test]
    fn test_oversized_byte_string_is_rejected() {
        let mut parcel = Parcel::new();
        parcel.write_u32((WireConfig::MAX_FRAME_PAYLOAD + 1) as u32);
        assert!(matches!(
            parcel.read_bytes(),
            Err(TetherError::FrameTooLarge { .. })
        ));
    }
}
