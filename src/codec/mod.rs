//! Binary column codec for cross-process data transfer.
//!
//! A column is a fixed-width value vector plus a parallel missing-flag
//! vector. On the wire each vector is length-prefixed and little-endian;
//! decoding is strict and rejects anything that disagrees with the declared
//! shape. Two wire revisions exist: the current one and a deprecated legacy
//! layout kept for workers that still speak it. The revision is always
//! selected by an explicit tag, never sniffed from the bytes.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Result, WorkerError};

/// Byte-order marker written in front of every vector. Decoders reject
/// buffers that do not start with it.
const ORDER_MARKER: u8 = 0x4C;

/// Wire revision for column payloads.
///
/// `Legacy` is the deprecated layout (u32 lengths, bit-packed missing
/// flags, no alignment padding). It is never inferred from content; the
/// backend profile carries the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireRev {
    Legacy,
    Current,
}

/// Element type of a column. Width is fixed per type; a decoder for one
/// type never accepts bytes encoded for a different width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    I32,
    I64,
    F64,
}

impl ColumnType {
    pub fn element_width(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::I32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F64 => "f64",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "bool" => Some(Self::Bool),
            "i32" => Some(Self::I32),
            "i64" => Some(Self::I64),
            "f64" => Some(Self::F64),
            _ => None,
        }
    }
}

/// Typed value storage for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Bool(Vec<bool>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Bool(_) => ColumnType::Bool,
            Self::I32(_) => ColumnType::I32,
            Self::I64(_) => ColumnType::I64,
            Self::F64(_) => ColumnType::F64,
        }
    }
}

/// An immutable decoded column. `values` and `missing` always have the same
/// length; the value behind a set missing flag is unspecified and must not
/// be trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    values: ColumnValues,
    missing: Vec<bool>,
}

impl Column {
    pub fn new(values: ColumnValues, missing: Vec<bool>) -> Result<Self> {
        if values.len() != missing.len() {
            return Err(WorkerError::Format(format!(
                "column length mismatch: {} values vs {} missing flags",
                values.len(),
                missing.len()
            )));
        }
        Ok(Self { values, missing })
    }

    /// Column with no missing entries.
    pub fn dense(values: ColumnValues) -> Self {
        let missing = vec![false; values.len()];
        Self { values, missing }
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn values(&self) -> &ColumnValues {
        &self.values
    }

    pub fn missing(&self) -> &[bool] {
        &self.missing
    }

    pub fn column_type(&self) -> ColumnType {
        self.values.column_type()
    }
}

/// Encode a column for the given wire revision.
pub fn encode_column(column: &Column, rev: WireRev) -> Vec<u8> {
    let ty = column.column_type();
    let mut buf = Vec::with_capacity(32 + column.len() * ty.element_width());
    write_vector_header(&mut buf, ty.element_width(), column.len(), rev);
    match column.values() {
        ColumnValues::Bool(v) => {
            for x in v {
                buf.push(*x as u8);
            }
        }
        ColumnValues::I32(v) => {
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        ColumnValues::I64(v) => {
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        ColumnValues::F64(v) => {
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
    }
    write_vector_header(&mut buf, 1, column.len(), rev);
    match rev {
        WireRev::Current => {
            for flag in column.missing() {
                buf.push(*flag as u8);
            }
        }
        WireRev::Legacy => {
            // Bit-packed LSB-first, ceil(n/8) bytes.
            let mut byte = 0u8;
            for (i, flag) in column.missing().iter().enumerate() {
                if *flag {
                    byte |= 1 << (i % 8);
                }
                if i % 8 == 7 {
                    buf.push(byte);
                    byte = 0;
                }
            }
            if column.len() % 8 != 0 {
                buf.push(byte);
            }
        }
    }
    buf
}

/// Decode a column of the given type and declared length.
///
/// Fails with [`WorkerError::Format`] when the byte-order marker is wrong,
/// the element width does not match `ty`, any length field disagrees with
/// `declared_len`, the buffer is short, or trailing bytes remain.
pub fn decode_column(
    bytes: &[u8],
    ty: ColumnType,
    declared_len: usize,
    rev: WireRev,
) -> Result<Column> {
    let mut cursor = Cursor::new(bytes);
    read_vector_header(&mut cursor, ty.element_width(), declared_len, rev)?;

    let width = ty.element_width();
    ensure_remaining(&cursor, declared_len * width, "values")?;
    let values = match ty {
        ColumnType::Bool => {
            let mut v = Vec::with_capacity(declared_len);
            for _ in 0..declared_len {
                v.push(read_flag_byte(&mut cursor)?);
            }
            ColumnValues::Bool(v)
        }
        ColumnType::I32 => {
            let mut v = Vec::with_capacity(declared_len);
            for _ in 0..declared_len {
                v.push(cursor.read_i32::<LittleEndian>().map_err(short_read)?);
            }
            ColumnValues::I32(v)
        }
        ColumnType::I64 => {
            let mut v = Vec::with_capacity(declared_len);
            for _ in 0..declared_len {
                v.push(cursor.read_i64::<LittleEndian>().map_err(short_read)?);
            }
            ColumnValues::I64(v)
        }
        ColumnType::F64 => {
            let mut v = Vec::with_capacity(declared_len);
            for _ in 0..declared_len {
                v.push(cursor.read_f64::<LittleEndian>().map_err(short_read)?);
            }
            ColumnValues::F64(v)
        }
    };

    read_vector_header(&mut cursor, 1, declared_len, rev)?;
    let missing = match rev {
        WireRev::Current => {
            ensure_remaining(&cursor, declared_len, "missing flags")?;
            let mut flags = Vec::with_capacity(declared_len);
            for _ in 0..declared_len {
                flags.push(read_flag_byte(&mut cursor)?);
            }
            flags
        }
        WireRev::Legacy => {
            let packed_len = declared_len.div_ceil(8);
            ensure_remaining(&cursor, packed_len, "missing flags")?;
            let mut flags = Vec::with_capacity(declared_len);
            let mut byte = 0u8;
            for i in 0..declared_len {
                if i % 8 == 0 {
                    byte = cursor.read_u8().map_err(short_read)?;
                }
                flags.push(byte & (1 << (i % 8)) != 0);
            }
            flags
        }
    };

    if cursor.position() as usize != bytes.len() {
        return Err(WorkerError::Format(format!(
            "{} trailing bytes after column payload",
            bytes.len() - cursor.position() as usize
        )));
    }
    Column::new(values, missing)
}

fn write_vector_header(buf: &mut Vec<u8>, width: usize, len: usize, rev: WireRev) {
    buf.push(ORDER_MARKER);
    buf.push(width as u8);
    match rev {
        WireRev::Current => {
            buf.extend_from_slice(&(len as u64).to_le_bytes());
            // Pad so fixed-width values start on an element-width boundary
            // within the vector block (header is 10 bytes).
            for _ in 0..header_padding(width) {
                buf.push(0);
            }
        }
        WireRev::Legacy => {
            buf.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
}

fn read_vector_header(
    cursor: &mut Cursor<&[u8]>,
    expected_width: usize,
    declared_len: usize,
    rev: WireRev,
) -> Result<()> {
    let marker = cursor.read_u8().map_err(short_read)?;
    if marker != ORDER_MARKER {
        return Err(WorkerError::Format(format!(
            "missing or invalid byte-order marker: 0x{:02X}",
            marker
        )));
    }
    let width = cursor.read_u8().map_err(short_read)? as usize;
    if width != expected_width {
        return Err(WorkerError::Format(format!(
            "element width {} does not match expected width {}",
            width, expected_width
        )));
    }
    let len = match rev {
        WireRev::Current => cursor.read_u64::<LittleEndian>().map_err(short_read)? as usize,
        WireRev::Legacy => cursor.read_u32::<LittleEndian>().map_err(short_read)? as usize,
    };
    if len != declared_len {
        return Err(WorkerError::Format(format!(
            "vector length {} disagrees with declared length {}",
            len, declared_len
        )));
    }
    if rev == WireRev::Current {
        for _ in 0..header_padding(expected_width) {
            let pad = cursor.read_u8().map_err(short_read)?;
            if pad != 0 {
                return Err(WorkerError::Format(
                    "non-zero alignment padding in vector header".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Padding after the 10-byte current-revision header so the payload starts
/// on an element-width boundary.
fn header_padding(width: usize) -> usize {
    const HEADER_LEN: usize = 10;
    (width - (HEADER_LEN % width)) % width
}

fn read_flag_byte(cursor: &mut Cursor<&[u8]>) -> Result<bool> {
    match cursor.read_u8().map_err(short_read)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WorkerError::Format(format!(
            "invalid boolean byte 0x{:02X}",
            other
        ))),
    }
}

fn ensure_remaining(cursor: &Cursor<&[u8]>, needed: usize, what: &str) -> Result<()> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if remaining < needed {
        return Err(WorkerError::Format(format!(
            "buffer too short for {}: need {} bytes, have {}",
            what, needed, remaining
        )));
    }
    Ok(())
}

fn short_read(e: std::io::Error) -> WorkerError {
    WorkerError::Format(format!("truncated column payload: {}", e))
}
