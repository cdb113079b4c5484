//! Bounds-checked primitive encoding shared by headers, frames and message bodies
//!
//! All integers are big-endian. Strings are a `u16` length followed by UTF-8
//! bytes, at most [`MAX_HANDSHAKE_STRING`] of them. Reads never panic on
//! short input: they return [`ProtocolError::MessageTooSmall`] naming the
//! field being read. Writes refuse values the reading side would reject.

use crate::constants::MAX_HANDSHAKE_STRING;
use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

/// Checked reads over any [`Buf`]
pub trait WireRead: Buf {
    fn ensure(&self, need: usize, field: &'static str) -> ProtocolResult<()> {
        if self.remaining() < need {
            return Err(ProtocolError::message_too_small(need, self.remaining(), field));
        }
        Ok(())
    }

    fn read_u8(&mut self, field: &'static str) -> ProtocolResult<u8> {
        self.ensure(1, field)?;
        Ok(self.get_u8())
    }

    fn read_bool(&mut self, field: &'static str) -> ProtocolResult<bool> {
        match self.read_u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::invalid_field(field, format!("boolean byte {other}"))),
        }
    }

    fn read_u16(&mut self, field: &'static str) -> ProtocolResult<u16> {
        self.ensure(2, field)?;
        Ok(self.get_u16())
    }

    fn read_u32(&mut self, field: &'static str) -> ProtocolResult<u32> {
        self.ensure(4, field)?;
        Ok(self.get_u32())
    }

    fn read_u64(&mut self, field: &'static str) -> ProtocolResult<u64> {
        self.ensure(8, field)?;
        Ok(self.get_u64())
    }

    fn read_i64(&mut self, field: &'static str) -> ProtocolResult<i64> {
        self.ensure(8, field)?;
        Ok(self.get_i64())
    }

    fn read_string(&mut self, field: &'static str) -> ProtocolResult<String> {
        let len = self.read_u16(field)? as usize;
        if len > MAX_HANDSHAKE_STRING {
            return Err(ProtocolError::InvalidString {
                field,
                reason: format!("length {len} exceeds {MAX_HANDSHAKE_STRING}"),
            });
        }
        self.ensure(len, field)?;
        let raw = self.copy_to_bytes(len);
        String::from_utf8(raw.to_vec()).map_err(|e| ProtocolError::InvalidString {
            field,
            reason: e.to_string(),
        })
    }

    fn read_uuid(&mut self, field: &'static str) -> ProtocolResult<Uuid> {
        self.ensure(16, field)?;
        let mut raw = [0u8; 16];
        self.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    /// Length-prefixed (`u32`) opaque bytes
    fn read_blob(&mut self, field: &'static str) -> ProtocolResult<Bytes> {
        let len = self.read_u32(field)? as usize;
        self.ensure(len, field)?;
        Ok(self.copy_to_bytes(len))
    }
}

impl<B: Buf> WireRead for B {}

/// Writes matching [`WireRead`]
pub trait WireWrite: BufMut {
    fn write_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn write_string(&mut self, field: &'static str, value: &str) -> ProtocolResult<()> {
        let len = value.len();
        if len > MAX_HANDSHAKE_STRING {
            return Err(ProtocolError::InvalidString {
                field,
                reason: format!("length {len} exceeds {MAX_HANDSHAKE_STRING}"),
            });
        }
        self.put_u16(len as u16);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    fn write_uuid(&mut self, value: &Uuid) {
        self.put_slice(value.as_bytes());
    }

    fn write_blob(&mut self, field: &'static str, value: &[u8]) -> ProtocolResult<()> {
        let len = u32::try_from(value.len()).map_err(|_| {
            ProtocolError::invalid_field(field, format!("length {} does not fit a u32 prefix", value.len()))
        })?;
        self.put_u32(len);
        self.put_slice(value);
        Ok(())
    }
}

impl<B: BufMut> WireWrite for B {}
