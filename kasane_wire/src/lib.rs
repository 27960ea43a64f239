//! Byte-stream primitives for the kasane persistence format.
//!
//! Everything is little-endian. Lengths and array elements use a
//! 7-bit-continuation varint (high bit = continue, 7 payload bits per
//! byte); signed integers go through their two's-complement bits, so `-1`
//! serialises as `ff ff ff ff 0f` and doubles as the "absent array"
//! sentinel. Scalar values are self-describing: a [`TypeCode`] byte
//! followed by a fixed-width payload, or a varint-length-prefixed body for
//! strings. The tag is what lets a reader step over values it does not
//! know how (or need) to decode.

use std::io::{Read, Write};

use chrono::{DateTime, LocalResult, TimeZone, Utc};
use snafu::{ensure, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Error)))]
pub enum Error {
    #[snafu(display("io error"))]
    IoError { source: std::io::Error },
    #[snafu(display("varint does not fit in 32 bits"))]
    VarintOverflowError,
    #[snafu(display("{len} is not an array length"))]
    BadLengthError { len: i32 },
    #[snafu(display("string is not valid utf-8"))]
    BadUtf8Error { source: std::string::FromUtf8Error },
    #[snafu(display("unknown value type code {code}"))]
    BadTypeCodeError { code: u8 },
    #[snafu(display("expected a {expected:?} value, stream holds {found:?}"))]
    TypeMismatchError { expected: TypeCode, found: TypeCode },
    #[snafu(display("stream ended {got}/{expected} bytes into a value"))]
    TruncatedError { expected: u64, got: u64 },
    #[snafu(display("timestamp {micros}us is out of range"))]
    BadTimestampError { micros: i64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn write_u8<W: Write>(w: &mut W, value: u8) -> Result<()> {
    w.write_all(&[value]).context(IoError)
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    Ok(read_bytes::<1, R>(r)?[0])
}

fn read_bytes<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).context(IoError)?;
    Ok(buf)
}

pub fn write_varint_u32<W: Write>(w: &mut W, mut value: u32) -> Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return write_u8(w, byte);
        }
        write_u8(w, byte | 0x80)?;
    }
}

pub fn write_varint_i32<W: Write>(w: &mut W, value: i32) -> Result<()> {
    write_varint_u32(w, value as u32)
}

pub fn read_varint_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut out = 0u32;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(r)?;
        if shift == 28 {
            // fifth byte carries the last 4 payload bits; a sixth is never legal
            ensure!(byte & 0x80 == 0, VarintOverflowError);
        }
        out |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
    }
}

pub fn read_varint_i32<R: Read>(r: &mut R) -> Result<i32> {
    Ok(read_varint_u32(r)? as i32)
}

/// Write an integer array, or the `-1` sentinel when there is none.
pub fn write_int_array<W: Write>(w: &mut W, values: Option<&[i32]>) -> Result<()> {
    match values {
        None => write_varint_i32(w, -1),
        Some(values) => {
            write_varint_i32(w, values.len() as i32)?;
            for &value in values {
                write_varint_i32(w, value)?;
            }
            Ok(())
        }
    }
}

pub fn read_int_array<R: Read>(r: &mut R) -> Result<Option<Vec<i32>>> {
    let len = read_varint_i32(r)?;
    if len == -1 {
        return Ok(None);
    }
    ensure!(len >= 0, BadLengthError { len });
    // a lying length should run into EOF, not the allocator
    let mut out = Vec::with_capacity(len.min(1 << 16) as usize);
    for _ in 0..len {
        out.push(read_varint_i32(r)?);
    }
    Ok(Some(out))
}

pub fn write_str<W: Write>(w: &mut W, value: &str) -> Result<()> {
    write_varint_u32(w, value.len() as u32)?;
    w.write_all(value.as_bytes()).context(IoError)
}

pub fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let len = u64::from(read_varint_u32(r)?);
    let mut buf = Vec::with_capacity(len.min(1 << 16) as usize);
    r.by_ref().take(len).read_to_end(&mut buf).context(IoError)?;
    ensure!(
        buf.len() as u64 == len,
        TruncatedError {
            expected: len,
            got: buf.len() as u64
        }
    );
    String::from_utf8(buf).context(BadUtf8Error)
}

/// Tag byte written ahead of every scalar value.
///
/// `Char` and `Decimal` exist so foreign streams stay skippable; no Rust
/// writer in this workspace produces them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeCode {
    Bool = 0,
    Char = 1,
    I8 = 2,
    U8 = 3,
    I16 = 4,
    U16 = 5,
    I32 = 6,
    U32 = 7,
    I64 = 8,
    U64 = 9,
    F32 = 10,
    F64 = 11,
    Decimal = 12,
    Timestamp = 13,
    Str = 14,
}

impl TypeCode {
    pub fn from_u8(code: u8) -> Result<TypeCode> {
        Ok(match code {
            0 => TypeCode::Bool,
            1 => TypeCode::Char,
            2 => TypeCode::I8,
            3 => TypeCode::U8,
            4 => TypeCode::I16,
            5 => TypeCode::U16,
            6 => TypeCode::I32,
            7 => TypeCode::U32,
            8 => TypeCode::I64,
            9 => TypeCode::U64,
            10 => TypeCode::F32,
            11 => TypeCode::F64,
            12 => TypeCode::Decimal,
            13 => TypeCode::Timestamp,
            14 => TypeCode::Str,
            _ => return BadTypeCodeError { code }.fail(),
        })
    }
}

/// A scalar that can travel through the stream under its [`TypeCode`].
pub trait WireValue: Sized {
    const CODE: TypeCode;

    fn write_payload<W: Write>(&self, w: &mut W) -> Result<()>;
    fn read_payload<R: Read>(r: &mut R) -> Result<Self>;
}

pub fn write_value<W: Write, V: WireValue>(w: &mut W, value: &V) -> Result<()> {
    write_u8(w, V::CODE as u8)?;
    value.write_payload(w)
}

pub fn read_value<R: Read, V: WireValue>(r: &mut R) -> Result<V> {
    let found = TypeCode::from_u8(read_u8(r)?)?;
    ensure!(
        found == V::CODE,
        TypeMismatchError {
            expected: V::CODE,
            found
        }
    );
    V::read_payload(r)
}

/// Step over one tagged value without interpreting it.
pub fn skip_value<R: Read>(r: &mut R) -> Result<()> {
    let code = TypeCode::from_u8(read_u8(r)?)?;
    let width = match code {
        TypeCode::Bool | TypeCode::I8 | TypeCode::U8 => 1,
        TypeCode::Char | TypeCode::I16 | TypeCode::U16 => 2,
        TypeCode::I32 | TypeCode::U32 | TypeCode::F32 => 4,
        TypeCode::I64 | TypeCode::U64 | TypeCode::F64 | TypeCode::Timestamp => 8,
        TypeCode::Decimal => 16,
        TypeCode::Str => u64::from(read_varint_u32(r)?),
    };
    let got = std::io::copy(&mut r.by_ref().take(width), &mut std::io::sink()).context(IoError)?;
    ensure!(
        got == width,
        TruncatedError {
            expected: width,
            got
        }
    );
    Ok(())
}

macro_rules! numeric_wire_value {
    ($($ty:ty => $code:ident),* $(,)?) => {$(
        impl WireValue for $ty {
            const CODE: TypeCode = TypeCode::$code;

            fn write_payload<W: Write>(&self, w: &mut W) -> Result<()> {
                w.write_all(&self.to_le_bytes()).context(IoError)
            }

            fn read_payload<R: Read>(r: &mut R) -> Result<Self> {
                Ok(<$ty>::from_le_bytes(read_bytes(r)?))
            }
        }
    )*};
}

numeric_wire_value! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

impl WireValue for bool {
    const CODE: TypeCode = TypeCode::Bool;

    fn write_payload<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u8(w, u8::from(*self))
    }

    fn read_payload<R: Read>(r: &mut R) -> Result<Self> {
        Ok(read_u8(r)? != 0)
    }
}

impl WireValue for String {
    const CODE: TypeCode = TypeCode::Str;

    fn write_payload<W: Write>(&self, w: &mut W) -> Result<()> {
        write_str(w, self)
    }

    fn read_payload<R: Read>(r: &mut R) -> Result<Self> {
        read_str(r)
    }
}

impl WireValue for DateTime<Utc> {
    const CODE: TypeCode = TypeCode::Timestamp;

    fn write_payload<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.timestamp_micros().to_le_bytes())
            .context(IoError)
    }

    fn read_payload<R: Read>(r: &mut R) -> Result<Self> {
        let micros = i64::from_le_bytes(read_bytes(r)?);
        match Utc.timestamp_micros(micros) {
            LocalResult::Single(at) => Ok(at),
            _ => BadTimestampError { micros }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn varint_bytes(value: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint_i32(&mut out, value).unwrap();
        out
    }

    #[test]
    fn varint_layout() {
        assert_eq!(varint_bytes(0), [0x00]);
        assert_eq!(varint_bytes(127), [0x7f]);
        assert_eq!(varint_bytes(128), [0x80, 0x01]);
        assert_eq!(varint_bytes(300), [0xac, 0x02]);
        assert_eq!(varint_bytes(-1), [0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn varint_round_trip() {
        for value in [0, 1, 127, 128, 300, 16383, 16384, i32::MAX, -1, -300, i32::MIN] {
            let bytes = varint_bytes(value);
            let mut r = bytes.as_slice();
            assert_eq!(read_varint_i32(&mut r).unwrap(), value);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn varint_rejects_a_sixth_byte() {
        let mut r = &[0xff, 0xff, 0xff, 0xff, 0xff, 0x01][..];
        assert!(matches!(
            read_varint_u32(&mut r),
            Err(Error::VarintOverflowError)
        ));
    }

    #[test]
    fn int_arrays_and_the_absent_sentinel() {
        let mut out = Vec::new();
        write_int_array(&mut out, None).unwrap();
        write_int_array(&mut out, Some(&[3, -7, 250])).unwrap();
        write_int_array(&mut out, Some(&[])).unwrap();

        let mut r = out.as_slice();
        assert_eq!(read_int_array(&mut r).unwrap(), None);
        assert_eq!(read_int_array(&mut r).unwrap(), Some(vec![3, -7, 250]));
        assert_eq!(read_int_array(&mut r).unwrap(), Some(vec![]));
        assert!(r.is_empty());
    }

    #[test]
    fn tagged_values_round_trip() {
        let mut out = Vec::new();
        write_value(&mut out, &true).unwrap();
        write_value(&mut out, &0x1234u16).unwrap();
        write_value(&mut out, &(-5i64)).unwrap();
        write_value(&mut out, &2.5f64).unwrap();
        write_value(&mut out, &String::from("すずり")).unwrap();
        let at = Utc.timestamp_micros(1_700_000_000_000_000).unwrap();
        write_value(&mut out, &at).unwrap();

        let mut r = out.as_slice();
        assert_eq!(read_value::<_, bool>(&mut r).unwrap(), true);
        assert_eq!(read_value::<_, u16>(&mut r).unwrap(), 0x1234);
        assert_eq!(read_value::<_, i64>(&mut r).unwrap(), -5);
        assert_eq!(read_value::<_, f64>(&mut r).unwrap(), 2.5);
        assert_eq!(read_value::<_, String>(&mut r).unwrap(), "すずり");
        assert_eq!(read_value::<_, DateTime<Utc>>(&mut r).unwrap(), at);
        assert!(r.is_empty());
    }

    #[test]
    fn tag_mismatch_is_detected() {
        let mut out = Vec::new();
        write_value(&mut out, &7i32).unwrap();
        let err = read_value::<_, bool>(&mut out.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatchError {
                expected: TypeCode::Bool,
                found: TypeCode::I32,
            }
        ));
    }

    #[test]
    fn skip_value_crosses_every_width() {
        let mut out = Vec::new();
        write_value(&mut out, &false).unwrap();
        write_value(&mut out, &1u8).unwrap();
        write_value(&mut out, &2u16).unwrap();
        write_value(&mut out, &3u32).unwrap();
        write_value(&mut out, &4u64).unwrap();
        write_value(&mut out, &5.0f32).unwrap();
        write_value(&mut out, &String::from("skipped")).unwrap();
        write_u8(&mut out, 0x5a).unwrap();

        let mut r = out.as_slice();
        for _ in 0..7 {
            skip_value(&mut r).unwrap();
        }
        assert_eq!(read_u8(&mut r).unwrap(), 0x5a);
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_string_is_an_error() {
        let mut out = Vec::new();
        write_varint_u32(&mut out, 12).unwrap();
        out.extend_from_slice(b"short");
        assert!(matches!(
            read_str(&mut out.as_slice()),
            Err(Error::TruncatedError {
                expected: 12,
                got: 5
            })
        ));
    }
}
