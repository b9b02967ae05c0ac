//! Reads and writes the versioned binary format a [`crate::Bytecode`] is
//! persisted as.
//!
//! Layout, big-endian throughout: 4-byte magic `BHAS`, 4-byte version, a
//! length-prefixed instruction stream, then a length-prefixed constant pool
//! where each constant starts with a one-byte tag. Grounded on
//! `sentrychris-omglang/runtime/src/bytecode.rs`'s manual `read_u32`/
//! `read_string` reader style, adapted from that format's little-endian,
//! non-recursive layout to this one's big-endian, recursively-nested
//! array/hash/function constants.

use std::fmt;
use std::io::{self, Read, Write};

use crate::constant::{CompiledFunction, Constant};
use crate::Bytecode;

const MAGIC: [u8; 4] = *b"BHAS";
const VERSION: u32 = 1;

const TAG_I64: u8 = 1;
const TAG_I8: u8 = 2;
const TAG_I16: u8 = 3;
const TAG_I32: u8 = 4;
const TAG_I64_ALT: u8 = 5;
const TAG_F32: u8 = 6;
const TAG_F64: u8 = 7;
const TAG_CHAR: u8 = 8;
const TAG_BOOL: u8 = 9;
const TAG_STR: u8 = 10;
const TAG_NULL: u8 = 11;
const TAG_FUNCTION: u8 = 12;
const TAG_ARRAY: u8 = 13;
const TAG_HASH: u8 = 14;

#[derive(Debug)]
pub enum SerializeError {
    BadMagic([u8; 4]),
    UnsupportedVersion(u32),
    UnknownConstantTag(u8),
    NonHashableKey(&'static str),
    UnexpectedEof,
    Io(io::Error),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::BadMagic(got) => {
                write!(f, "bad magic bytes {got:?}, expected {MAGIC:?}")
            }
            SerializeError::UnsupportedVersion(v) => {
                write!(f, "unsupported bytecode version {v}, expected {VERSION}")
            }
            SerializeError::UnknownConstantTag(tag) => write!(f, "unknown constant tag {tag}"),
            SerializeError::NonHashableKey(type_name) => {
                write!(f, "value of type '{type_name}' cannot serialize as a hash key")
            }
            SerializeError::UnexpectedEof => write!(f, "unexpected end of input"),
            SerializeError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<io::Error> for SerializeError {
    fn from(e: io::Error) -> Self {
        SerializeError::Io(e)
    }
}

/// Writes `bytecode` to `writer` in the format described in this module's
/// doc comment.
pub fn write<W: Write>(writer: &mut W, bytecode: &Bytecode) -> Result<(), SerializeError> {
    writer.write_all(&MAGIC)?;
    write_u32(writer, VERSION)?;

    write_u32(writer, bytecode.instructions.len() as u32)?;
    writer.write_all(&bytecode.instructions)?;

    write_u32(writer, bytecode.constants.len() as u32)?;
    for constant in &bytecode.constants {
        write_constant(writer, constant)?;
    }
    Ok(())
}

/// Reads a bytecode object back from `reader`. A bad magic or an
/// unsupported version is a fatal error before anything else is consumed.
pub fn read<R: Read>(reader: &mut R) -> Result<Bytecode, SerializeError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(eof_aware)?;
    if magic != MAGIC {
        return Err(SerializeError::BadMagic(magic));
    }

    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(SerializeError::UnsupportedVersion(version));
    }
    tracing::debug!(version, "deserializing bytecode");

    let ins_len = read_u32(reader)? as usize;
    let mut instructions = vec![0u8; ins_len];
    reader.read_exact(&mut instructions).map_err(eof_aware)?;

    let const_count = read_u32(reader)?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        constants.push(read_constant(reader)?);
    }

    Ok(Bytecode { instructions, constants })
}

/// Convenience wrapper around [`write`] for callers that just want bytes.
pub fn to_bytes(bytecode: &Bytecode) -> Vec<u8> {
    let mut buf = Vec::new();
    write(&mut buf, bytecode).expect("writing to an in-memory Vec never fails");
    buf
}

/// Convenience wrapper around [`read`] for callers that just have bytes.
pub fn from_bytes(data: &[u8]) -> Result<Bytecode, SerializeError> {
    let mut cursor = data;
    read(&mut cursor)
}

fn write_constant<W: Write>(writer: &mut W, constant: &Constant) -> Result<(), SerializeError> {
    match constant {
        // The compiler only ever produces 64-bit integer and float-point
        // constants (see `compiler::compile_literal`); the narrower tags
        // exist purely so this reader can ingest bytecode from an encoder
        // that does choose a tighter width.
        Constant::Int(v) => {
            writer.write_all(&[TAG_I64])?;
            write_i64(writer, *v)?;
        }
        Constant::Float(v) => {
            writer.write_all(&[TAG_F64])?;
            writer.write_all(&v.to_be_bytes())?;
        }
        Constant::Str(s) => {
            writer.write_all(&[TAG_STR])?;
            write_string(writer, s)?;
        }
        Constant::Bool(b) => {
            writer.write_all(&[TAG_BOOL, *b as u8])?;
        }
        Constant::Null => {
            writer.write_all(&[TAG_NULL])?;
        }
        Constant::CompiledFunction(f) => {
            writer.write_all(&[TAG_FUNCTION])?;
            write_u32(writer, f.instructions.len() as u32)?;
            writer.write_all(&f.instructions)?;
            write_u32(writer, f.num_locals as u32)?;
            write_u32(writer, f.num_parameters as u32)?;
        }
        Constant::Array(items) => {
            writer.write_all(&[TAG_ARRAY])?;
            write_u32(writer, items.len() as u32)?;
            for item in items {
                write_constant(writer, item)?;
            }
        }
        Constant::Hash(pairs) => {
            writer.write_all(&[TAG_HASH])?;
            write_u32(writer, pairs.len() as u32)?;
            for (key, value) in pairs {
                assert_hashable(key)?;
                write_constant(writer, key)?;
                write_constant(writer, value)?;
            }
        }
    }
    Ok(())
}

/// Hash keys must be of a kind with well-defined equality/hashing (mirrors
/// [`crate::value::Value::as_hash_key`]); floats, arrays, hashes, and
/// functions are rejected here the same way they are at VM run time.
fn assert_hashable(key: &Constant) -> Result<(), SerializeError> {
    match key {
        Constant::Int(_) | Constant::Str(_) | Constant::Bool(_) => Ok(()),
        other => Err(SerializeError::NonHashableKey(constant_type_name(other))),
    }
}

fn constant_type_name(constant: &Constant) -> &'static str {
    match constant {
        Constant::Int(_) => "integer",
        Constant::Float(_) => "float",
        Constant::Str(_) => "string",
        Constant::Bool(_) => "boolean",
        Constant::Null => "null",
        Constant::CompiledFunction(_) => "function",
        Constant::Array(_) => "array",
        Constant::Hash(_) => "hash",
    }
}

fn read_constant<R: Read>(reader: &mut R) -> Result<Constant, SerializeError> {
    let mut tag_byte = [0u8; 1];
    reader.read_exact(&mut tag_byte).map_err(eof_aware)?;

    Ok(match tag_byte[0] {
        TAG_I64 | TAG_I64_ALT => Constant::Int(read_i64(reader)?),
        TAG_I8 => {
            let mut b = [0u8; 1];
            reader.read_exact(&mut b).map_err(eof_aware)?;
            Constant::Int(b[0] as i8 as i64)
        }
        TAG_I16 => {
            let mut b = [0u8; 2];
            reader.read_exact(&mut b).map_err(eof_aware)?;
            Constant::Int(i16::from_be_bytes(b) as i64)
        }
        TAG_I32 => {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b).map_err(eof_aware)?;
            Constant::Int(i32::from_be_bytes(b) as i64)
        }
        TAG_F32 => {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b).map_err(eof_aware)?;
            Constant::Float(f32::from_be_bytes(b) as f64)
        }
        TAG_F64 => {
            let mut b = [0u8; 8];
            reader.read_exact(&mut b).map_err(eof_aware)?;
            Constant::Float(f64::from_be_bytes(b))
        }
        TAG_CHAR => {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b).map_err(eof_aware)?;
            let code_point = u32::from_be_bytes(b);
            // No dedicated scalar-value constant kind exists on this crate's
            // `Constant` (see `constant.rs`); a unicode scalar round-trips
            // as its code-point integer, the same way an untyped host would
            // see it.
            Constant::Int(code_point as i64)
        }
        TAG_BOOL => {
            let mut b = [0u8; 1];
            reader.read_exact(&mut b).map_err(eof_aware)?;
            Constant::Bool(b[0] != 0)
        }
        TAG_STR => Constant::Str(read_string(reader)?),
        TAG_NULL => Constant::Null,
        TAG_FUNCTION => {
            let len = read_u32(reader)? as usize;
            let mut instructions = vec![0u8; len];
            reader.read_exact(&mut instructions).map_err(eof_aware)?;
            let num_locals = read_u32(reader)?;
            let num_parameters = read_u32(reader)?;
            Constant::CompiledFunction(CompiledFunction {
                instructions,
                num_locals: num_locals as u8,
                num_parameters: num_parameters as u8,
            })
        }
        TAG_ARRAY => {
            let count = read_u32(reader)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(read_constant(reader)?);
            }
            Constant::Array(items)
        }
        TAG_HASH => {
            let count = read_u32(reader)?;
            let mut pairs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key = read_constant(reader)?;
                assert_hashable(&key)?;
                let value = read_constant(reader)?;
                pairs.push((key, value));
            }
            Constant::Hash(pairs)
        }
        other => {
            tracing::error!(tag = other, "unknown constant tag during deserialization");
            return Err(SerializeError::UnknownConstantTag(other));
        }
    })
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), SerializeError> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, SerializeError> {
    let mut b = [0u8; 4];
    reader.read_exact(&mut b).map_err(eof_aware)?;
    Ok(u32::from_be_bytes(b))
}

fn write_i64<W: Write>(writer: &mut W, value: i64) -> Result<(), SerializeError> {
    writer.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64, SerializeError> {
    let mut b = [0u8; 8];
    reader.read_exact(&mut b).map_err(eof_aware)?;
    Ok(i64::from_be_bytes(b))
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), SerializeError> {
    write_u32(writer, value.len() as u32)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, SerializeError> {
    let len = read_u32(reader)? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).map_err(eof_aware)?;
    String::from_utf8(bytes)
        .map_err(|e| SerializeError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// `read_exact` reports a truncated stream as `ErrorKind::UnexpectedEof`;
/// surface that distinctly rather than as a generic I/O failure.
fn eof_aware(e: io::Error) -> SerializeError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SerializeError::UnexpectedEof
    } else {
        SerializeError::Io(e)
    }
}
