//! Bounds-checked primitives for reading and writing packet bodies.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PacketError, Result};
use crate::result::GlobalId;

/// Reads big-endian fields from one packet body.
///
/// Reads never run past the body: a short body yields
/// [`PacketError::Truncated`] instead of a panic.
pub(crate) struct BodyReader {
    code: u32,
    buf: Bytes,
}

impl BodyReader {
    pub(crate) fn new(code: u32, buf: Bytes) -> Self {
        Self { code, buf }
    }

    pub(crate) fn code(&self) -> u32 {
        self.code
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(PacketError::Truncated {
                code: self.code,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn get_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn get_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn get_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub(crate) fn get_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// A u32 length followed by that many bytes.
    pub(crate) fn get_blob(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.get_bytes(len)
    }

    pub(crate) fn get_string(&mut self) -> Result<String> {
        let raw = self.get_blob()?;
        String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8(self.code))
    }

    pub(crate) fn get_gid(&mut self) -> Result<GlobalId> {
        let raw = self.get_bytes(GlobalId::LENGTH)?;
        let mut gid = [0u8; GlobalId::LENGTH];
        gid.copy_from_slice(&raw);
        Ok(GlobalId::new(gid))
    }

    /// Everything left in the body.
    pub(crate) fn take_rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }

    pub(crate) fn malformed(&self, reason: impl Into<String>) -> PacketError {
        PacketError::Malformed {
            code: self.code,
            reason: reason.into(),
        }
    }
}

// Lengths are written as u32. Frames above the configured maximum packet size
// are rejected before reaching the wire, so a wrapped length is never sent.
pub(crate) fn put_blob(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u32(bytes.len() as u32);
    dst.put_slice(bytes);
}

pub(crate) fn put_string(dst: &mut BytesMut, value: &str) {
    put_blob(dst, value.as_bytes());
}
