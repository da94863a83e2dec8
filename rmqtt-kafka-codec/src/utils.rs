use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

/// Fieldless enum carried on the wire as one byte.
macro_rules! byte_enum {
    ($(#[$outer:meta])* pub enum $name:ident { $($(#[$attr:meta])* $variant:ident = $byte:literal),+ $(,)? }) => {
        $(#[$outer])*
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$attr])* $variant = $byte),+
        }

        impl TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;

            fn try_from(byte: u8) -> Result<Self, Self::Error> {
                [$($name::$variant),+]
                    .into_iter()
                    .find(|v| *v as u8 == byte)
                    .ok_or($crate::error::DecodeError::MalformedRecord)
            }
        }

        impl From<$name> for u8 {
            #[inline]
            fn from(v: $name) -> u8 {
                v as u8
            }
        }
    };
}

pub trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;

    fn decode_from(mut src: Bytes) -> Result<Self, DecodeError> {
        let v = Self::decode(&mut src)?;
        ensure!(!src.has_remaining(), DecodeError::InvalidLength); // trailing bytes
        Ok(v)
    }
}

pub trait Encode {
    fn encoded_size(&self) -> usize;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;

    /// Encode into a freshly allocated buffer owned by the caller.
    fn encode_to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Big-endian integers of a fixed width.
macro_rules! int_codec {
    ($($ty:ty => $get:ident, $put:ident;)+) => {
        $(
            impl Decode for $ty {
                #[inline]
                fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
                    ensure!(src.remaining() >= std::mem::size_of::<$ty>(), DecodeError::InvalidLength);
                    Ok(src.$get())
                }
            }

            impl Encode for $ty {
                #[inline]
                fn encoded_size(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }

                #[inline]
                fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
                    buf.$put(*self);
                    Ok(())
                }
            }
        )+
    };
}

int_codec! {
    u8 => get_u8, put_u8;
    u16 => get_u16, put_u16;
    i32 => get_i32, put_i32;
    u32 => get_u32, put_u32;
    i64 => get_i64, put_i64;
}

impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u16::decode(src)?;
        take(src, len as usize)
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ByteString::try_from(Bytes::decode(src)?).map_err(|_| DecodeError::Utf8Error)
    }
}

/// Nullable fields carry an `i16` length, `-1` meaning absent.
impl Decode for Option<ByteString> {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        match decode_nullable(src)? {
            None => Ok(None),
            Some(b) => ByteString::try_from(b).map(Some).map_err(|_| DecodeError::Utf8Error),
        }
    }
}

impl Decode for Option<Bytes> {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        decode_nullable(src)
    }
}

fn decode_nullable(src: &mut Bytes) -> Result<Option<Bytes>, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let len = src.get_i16();
    if len < 0 {
        ensure!(len == -1, DecodeError::MalformedRecord);
        return Ok(None);
    }
    take(src, len as usize).map(Some)
}

/// Payload blobs carry a `u32` length.
pub(crate) fn decode_blob(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = u32::decode(src)?;
    take(src, len as usize)
}

#[inline]
fn take(src: &mut Bytes, len: usize) -> Result<Bytes, DecodeError> {
    ensure!(src.remaining() >= len, DecodeError::InvalidLength);
    Ok(src.split_to(len))
}

pub(crate) fn encode_blob(blob: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    let len = u32::try_from(blob.len()).map_err(|_| EncodeError::InvalidLength)?;
    buf.put_u32(len);
    buf.extend_from_slice(blob);
    Ok(())
}

impl Encode for Bytes {
    fn encoded_size(&self) -> usize {
        self.as_ref().encoded_size()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_ref().encode(buf)
    }
}

impl Encode for ByteString {
    fn encoded_size(&self) -> usize {
        2 + self.len()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.as_bytes().encode(buf)
    }
}

impl Encode for Option<ByteString> {
    fn encoded_size(&self) -> usize {
        2 + self.as_ref().map(|s| s.len()).unwrap_or_default()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        encode_nullable(self.as_ref().map(|s| s.as_bytes().as_ref()), buf)
    }
}

impl Encode for Option<Bytes> {
    fn encoded_size(&self) -> usize {
        2 + self.as_ref().map(|b| b.len()).unwrap_or_default()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        encode_nullable(self.as_deref(), buf)
    }
}

fn encode_nullable(v: Option<&[u8]>, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match v {
        None => buf.put_i16(-1),
        Some(v) => {
            let len = i16::try_from(v.len()).map_err(|_| EncodeError::InvalidLength)?;
            buf.put_i16(len);
            buf.extend_from_slice(v);
        }
    }
    Ok(())
}

/// Strings and keys carry a `u16` length.
impl Encode for &[u8] {
    fn encoded_size(&self) -> usize {
        2 + self.len()
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let len = u16::try_from(self.len()).map_err(|_| EncodeError::InvalidLength)?;
        buf.put_u16(len);
        buf.extend_from_slice(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nullable() {
        let mut buf = BytesMut::new();
        Option::<ByteString>::None.encode(&mut buf).unwrap();
        Some(ByteString::from_static("text/plain")).encode(&mut buf).unwrap();
        assert_eq!(&buf[..2], b"\xff\xff");

        let mut src = buf.freeze();
        assert_eq!(Option::<ByteString>::decode(&mut src).unwrap(), None);
        assert_eq!(Option::<ByteString>::decode(&mut src).unwrap().as_deref(), Some("text/plain"));
        assert!(!src.has_remaining());
    }

    #[test]
    fn test_truncated() {
        let mut src = Bytes::from_static(b"\x00\x05abc");
        assert_eq!(ByteString::decode(&mut src), Err(DecodeError::InvalidLength));

        let mut src = Bytes::from_static(b"\xff\xfe");
        assert_eq!(Option::<Bytes>::decode(&mut src), Err(DecodeError::MalformedRecord));
    }

    #[test]
    fn test_trailing_bytes() {
        assert_eq!(i32::decode_from(Bytes::from_static(b"\x00\x00\x00\x01")), Ok(1));
        assert_eq!(i32::decode_from(Bytes::from_static(b"\x00\x00\x00\x01\x00")), Err(DecodeError::InvalidLength));
    }
}
