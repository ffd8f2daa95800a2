//! Stream frame format.
//!
//! Every stream transaction carries exactly one frame, sent with code
//! `FIRST_CALL_ID + call_id`:
//!
//! ```text
//! [u32 BE: flags][u32 BE: sequence][u32 BE: len][payload bytes of len]
//! ```
//!
//! A close frame's payload is `[u32 BE: status code][UTF-8 description]`.

use crate::config::WireConfig;
use crate::parcel::Parcel;
use crate::status::{Code, Status};
use crate::{Result, TetherError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame carries the stream prefix (method name).
pub const FLAG_PREFIX: u32 = 0x1;
/// Frame carries one application message.
pub const FLAG_MESSAGE_DATA: u32 = 0x2;
/// Sender will not send more messages.
pub const FLAG_HALF_CLOSE: u32 = 0x4;
/// Frame closes the stream with a status.
pub const FLAG_CLOSE: u32 = 0x8;

/// One decoded stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u32,
    pub sequence: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u32, sequence: u32, payload: Bytes) -> Self {
        Self {
            flags,
            sequence,
            payload,
        }
    }

    /// A close frame carrying `status`.
    pub fn close(sequence: u32, status: &Status) -> Self {
        let description = status.description().unwrap_or_default();
        let mut payload = BytesMut::with_capacity(4 + description.len());
        payload.put_u32(status.code().value());
        payload.put_slice(description.as_bytes());
        Self::new(FLAG_CLOSE, sequence, payload.freeze())
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Decode the status of a close frame.
    pub fn close_status(&self) -> Result<Status> {
        if self.payload.len() < 4 {
            return Err(TetherError::Parcel {
                message: "close frame missing status code".to_string(),
            });
        }
        let mut payload = self.payload.clone();
        let code = Code::from_value(payload.get_u32());
        let status = Status::new(code);
        if payload.is_empty() {
            return Ok(status);
        }
        let description = String::from_utf8(payload.to_vec()).map_err(|_| TetherError::Parcel {
            message: "Invalid UTF-8 in close description".to_string(),
        })?;
        Ok(status.with_description(description))
    }

    pub fn to_parcel(&self) -> Result<Parcel> {
        if self.payload.len() > WireConfig::MAX_FRAME_PAYLOAD {
            return Err(TetherError::FrameTooLarge {
                size: self.payload.len(),
                max: WireConfig::MAX_FRAME_PAYLOAD,
            });
        }
        let mut parcel = Parcel::new();
        parcel.write_u32(self.flags);
        parcel.write_u32(self.sequence);
        parcel.write_bytes(&self.payload);
        Ok(parcel)
    }

    pub fn from_parcel(parcel: &mut Parcel) -> Result<Self> {
        let flags = parcel.read_u32()?;
        let sequence = parcel.read_u32()?;
        let payload = parcel.read_bytes()?;
        Ok(Self::new(flags, sequence, payload))
    }
}

/// Transaction code for a stream's frames.
pub fn call_code(call_id: u32) -> u32 {
    WireConfig::FIRST_CALL_ID + call_id
}

/// Stream id addressed by a transaction code, if it is a stream code at all.
pub fn call_id(code: u32) -> Option<u32> {
    code.checked_sub(WireConfig::FIRST_CALL_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parcel_roundtrip() {
        let frame = Frame::new(FLAG_MESSAGE_DATA, 3, Bytes::from_static(b"hello"));
        let mut parcel = frame.to_parcel().unwrap();
        assert_eq!(Frame::from_parcel(&mut parcel).unwrap(), frame);
    }

    #[test]
    fn test_close_frame_carries_status() {
        let status = Status::new(Code::Unavailable).with_description("gone");
        let frame = Frame::close(9, &status);
        assert!(frame.has(FLAG_CLOSE));
        assert_eq!(frame.close_status().unwrap(), status);
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut parcel = Parcel::new();
        parcel.write_u32(FLAG_MESSAGE_DATA);
        assert!(Frame::from_parcel(&mut parcel).is_err());
    }

    #[test]
    fn test_call_codes() {
        assert_eq!(call_id(call_code(4)), Some(4));
        assert_eq!(call_id(WireConfig::SHUTDOWN_TRANSPORT), None);
    }
}
