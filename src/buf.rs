//! Checked little-endian cursor over a received payload.
//!
//! `bytes::Buf` panics on underflow; every read here reports a
//! [`Error::Protocol`] naming the field that was cut short instead.

use bytes::{Buf, Bytes};

use crate::types::{Error, Result};

#[derive(Debug, Clone)]
pub(crate) struct Reader {
    buf: Bytes,
}

macro_rules! checked_get {
    ($name:ident, $ty:ty, $get:ident) => {
        pub fn $name(&mut self, what: &'static str) -> Result<$ty> {
            self.need(std::mem::size_of::<$ty>(), what)?;
            Ok(self.buf.$get())
        }
    };
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &'static str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::protocol(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    checked_get!(u8, u8, get_u8);
    checked_get!(i8, i8, get_i8);
    checked_get!(u16, u16, get_u16_le);
    checked_get!(i16, i16, get_i16_le);
    checked_get!(u32, u32, get_u32_le);
    checked_get!(i32, i32, get_i32_le);
    checked_get!(u64, u64, get_u64_le);
    checked_get!(i64, i64, get_i64_le);
    checked_get!(f32, f32, get_f32_le);
    checked_get!(f64, f64, get_f64_le);

    pub fn id16(&mut self, what: &'static str) -> Result<[u8; 16]> {
        self.need(16, what)?;
        let mut out = [0u8; 16];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn bytes(&mut self, n: usize, what: &'static str) -> Result<Bytes> {
        self.need(n, what)?;
        Ok(self.buf.split_to(n))
    }

    /// Everything left, consuming the reader's view.
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    pub fn expect_end(&self, what: &'static str) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after {}",
                self.buf.remaining(),
                what
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_reads_little_endian_fields() {
        let mut out = BytesMut::new();
        out.put_u16_le(0xBEEF);
        out.put_u32_le(7);
        out.put_f64_le(1.5);
        let mut r = Reader::new(out.freeze());
        assert_eq!(r.u16("a").unwrap(), 0xBEEF);
        assert_eq!(r.u32("b").unwrap(), 7);
        assert_eq!(r.f64("c").unwrap(), 1.5);
        r.expect_end("test").unwrap();
    }

    #[test]
    fn test_underflow_is_protocol_error() {
        let mut r = Reader::new(Bytes::from_static(&[1, 2]));
        let err = r.u32("handle").unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("handle")));
        // Failed read consumes nothing.
        assert_eq!(r.remaining(), 2);
    }
}
