// JDWP binary codec
//
// Readers and writers for JDWP wire data. Every identifier is written with the
// width negotiated for its category (see `IdSizes`), so both halves carry the
// session's id sizes. Aggregates implement `JdwpEncode`/`JdwpDecode` and recurse
// field by field in declared order; sequences are 4-byte length-prefixed.

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{JdwpError, JdwpResult};
use crate::types::{IdKind, IdSizes};

/// A value that can be written in JDWP wire format.
pub trait JdwpEncode {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()>;
}

/// A value that can be read from JDWP wire format.
pub trait JdwpDecode: Sized {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self>;
}

pub struct JdwpWriter {
    buf: BytesMut,
    sizes: IdSizes,
}

impl JdwpWriter {
    pub fn new(sizes: IdSizes) -> Self {
        Self {
            buf: BytesMut::new(),
            sizes,
        }
    }

    pub fn sizes(&self) -> &IdSizes {
        &self.sizes
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn put<T: JdwpEncode + ?Sized>(&mut self, value: &T) -> JdwpResult<()> {
        value.encode(self)
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    /// JDWP string: 4-byte length prefix + UTF-8 bytes
    pub fn put_string(&mut self, s: &str) {
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    /// Sequence length prefix.
    pub fn put_len(&mut self, len: usize) -> JdwpResult<()> {
        let len = i32::try_from(len)
            .map_err(|_| JdwpError::encode(format!("sequence too long: {} elements", len)))?;
        self.buf.put_i32(len);
        Ok(())
    }

    /// Write an identifier using the negotiated width for its category.
    pub fn put_id(&mut self, kind: IdKind, raw: u64) -> JdwpResult<()> {
        let width = self.sizes.width(kind)?;
        if width < 8 && raw >> (width * 8) != 0 {
            return Err(JdwpError::encode(format!(
                "{:?} id {:#x} does not fit in {} bytes",
                kind, raw, width
            )));
        }
        self.buf.put_uint(raw, width);
        Ok(())
    }
}

/// Encode a value into a fresh buffer.
pub fn encode_to_vec<T: JdwpEncode + ?Sized>(value: &T, sizes: IdSizes) -> JdwpResult<Vec<u8>> {
    let mut w = JdwpWriter::new(sizes);
    value.encode(&mut w)?;
    Ok(w.into_vec())
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    sizes: IdSizes,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8], sizes: IdSizes) -> Self {
        Self { buf, sizes }
    }

    pub fn sizes(&self) -> &IdSizes {
        &self.sizes
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn require(&self, n: usize, what: &str) -> JdwpResult<()> {
        if self.buf.remaining() < n {
            return Err(JdwpError::decode(format!(
                "Not enough data for {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get<T: JdwpDecode>(&mut self) -> JdwpResult<T> {
        T::decode(self)
    }

    pub fn get_u8(&mut self) -> JdwpResult<u8> {
        self.require(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> JdwpResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i8(&mut self) -> JdwpResult<i8> {
        self.require(1, "i8")?;
        Ok(self.buf.get_i8())
    }

    pub fn get_u16(&mut self) -> JdwpResult<u16> {
        self.require(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn get_i16(&mut self) -> JdwpResult<i16> {
        self.require(2, "i16")?;
        Ok(self.buf.get_i16())
    }

    pub fn get_u32(&mut self) -> JdwpResult<u32> {
        self.require(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> JdwpResult<i32> {
        self.require(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn get_u64(&mut self) -> JdwpResult<u64> {
        self.require(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn get_i64(&mut self) -> JdwpResult<i64> {
        self.require(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub fn get_f32(&mut self) -> JdwpResult<f32> {
        self.require(4, "f32")?;
        Ok(self.buf.get_f32())
    }

    pub fn get_f64(&mut self) -> JdwpResult<f64> {
        self.require(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    /// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
    pub fn get_string(&mut self) -> JdwpResult<String> {
        let len = self.get_u32()? as usize;
        self.require(len, "string")?;

        let bytes = &self.buf[..len];
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|e| JdwpError::decode(format!("Invalid UTF-8 in string: {}", e)))?;
        self.buf.advance(len);
        Ok(s)
    }

    /// Sequence length prefix. Negative counts are malformed.
    pub fn get_len(&mut self) -> JdwpResult<usize> {
        let count = self.get_i32()?;
        usize::try_from(count)
            .map_err(|_| JdwpError::decode(format!("Negative sequence length: {}", count)))
    }

    /// Read an identifier using the negotiated width for its category.
    pub fn get_id(&mut self, kind: IdKind) -> JdwpResult<u64> {
        let width = self.sizes.width(kind)?;
        self.require(width, "id")?;
        Ok(self.buf.get_uint(width))
    }

    /// Fail if any bytes were left unread.
    pub fn finish(&self) -> JdwpResult<()> {
        if self.buf.has_remaining() {
            return Err(JdwpError::decode(format!(
                "{} trailing bytes left after decode",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Decode a whole payload, requiring every byte to be consumed.
pub fn decode_exact<T: JdwpDecode>(data: &[u8], sizes: IdSizes) -> JdwpResult<T> {
    let mut r = JdwpReader::new(data, sizes);
    let value = T::decode(&mut r)?;
    r.finish()?;
    Ok(value)
}

macro_rules! primitive_codec {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl JdwpEncode for $ty {
                fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
                    w.$put(*self);
                    Ok(())
                }
            }

            impl JdwpDecode for $ty {
                fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
                    r.$get()
                }
            }
        )*
    };
}

primitive_codec! {
    u8 => put_u8, get_u8;
    bool => put_bool, get_bool;
    i8 => put_i8, get_i8;
    u16 => put_u16, get_u16;
    i16 => put_i16, get_i16;
    u32 => put_u32, get_u32;
    i32 => put_i32, get_i32;
    u64 => put_u64, get_u64;
    i64 => put_i64, get_i64;
    f32 => put_f32, get_f32;
    f64 => put_f64, get_f64;
}

impl JdwpEncode for str {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_string(self);
        Ok(())
    }
}

impl JdwpEncode for String {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_string(self);
        Ok(())
    }
}

impl JdwpDecode for String {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        r.get_string()
    }
}

// Empty request/response body.
impl JdwpEncode for () {
    fn encode(&self, _w: &mut JdwpWriter) -> JdwpResult<()> {
        Ok(())
    }
}

impl JdwpDecode for () {
    fn decode(_r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        Ok(())
    }
}

impl<T: JdwpEncode + ?Sized> JdwpEncode for &T {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        (**self).encode(w)
    }
}

impl<T: JdwpEncode> JdwpEncode for [T] {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        w.put_len(self.len())?;
        for item in self {
            item.encode(w)?;
        }
        Ok(())
    }
}

impl<T: JdwpEncode> JdwpEncode for Vec<T> {
    fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
        self.as_slice().encode(w)
    }
}

impl<T: JdwpDecode> JdwpDecode for Vec<T> {
    fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
        let count = r.get_len()?;
        // Every element takes at least one byte; don't trust the count for allocation.
        let mut items = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            items.push(T::decode(r)?);
        }
        Ok(items)
    }
}

macro_rules! tuple_codec {
    ($($name:ident),+) => {
        impl<$($name: JdwpEncode),+> JdwpEncode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(&self, w: &mut JdwpWriter) -> JdwpResult<()> {
                let ($($name,)+) = self;
                $($name.encode(w)?;)+
                Ok(())
            }
        }

        impl<$($name: JdwpDecode),+> JdwpDecode for ($($name,)+) {
            fn decode(r: &mut JdwpReader<'_>) -> JdwpResult<Self> {
                Ok(($($name::decode(r)?,)+))
            }
        }
    };
}

tuple_codec!(A);
tuple_codec!(A, B);
tuple_codec!(A, B, C);
tuple_codec!(A, B, C, D);
tuple_codec!(A, B, C, D, E);
