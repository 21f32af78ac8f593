//! Binary codec for tabular results.
//!
//! A non-empty buffer is laid out as
//!
//! ```text
//! version: u8
//! column count: i32
//! per column:
//!     catalog, label, name, type name, table name, schema name   (i32 length + UTF-8)
//!     type code, display size, precision, scale, nullability     (i32)
//!     auto increment, case sensitive, currency, searchable,
//!     signed, read only                                          (u8 each)
//! rows until the buffer is exhausted, per cell:
//!     null flag: u8 (1 = null, 0 = present), then the payload if present
//! ```
//!
//! All integers are big-endian. A result with neither columns nor rows
//! encodes to a zero-length buffer.
//!
//! Two conversions are lossy: decimals travel as doubles, and temporal values
//! travel as epoch milliseconds interpreted in the local time zone.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::errors::{CacheError, CacheResult, ErrorKind};
use crate::types::{CellValue, ColumnDescriptor, Nullability, ResultSet, WireType};

/// Current wire format version, written as the first byte of every
/// non-empty buffer.
pub const FORMAT_VERSION: u8 = 1;

/// Default upper bound for an encoded result, 10 MiB.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;

// Buffers start small and grow up to the configured limit.
const INITIAL_BUFFER_SIZE: usize = 64 * 1024;

const NULL_FLAG: u8 = 1;
const PRESENT_FLAG: u8 = 0;

/// Encodes and decodes [`ResultSet`]s to a capacity-bounded byte buffer.
#[derive(Clone, Copy, Debug)]
pub struct ResultCodec {
    max_size: usize,
}

impl Default for ResultCodec {
    fn default() -> Self {
        ResultCodec::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl ResultCodec {
    /// Creates a codec whose encoded buffers never exceed `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        ResultCodec { max_size }
    }

    /// The configured buffer limit.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Encodes a result. Fails with [`ErrorKind::TooLarge`] rather than
    /// truncating when the result does not fit.
    pub fn encode(&self, result: &ResultSet) -> CacheResult<Bytes> {
        if result.is_empty() {
            return Ok(Bytes::new());
        }

        let mut w = BoundedWriter::new(self.max_size);
        w.put_u8(FORMAT_VERSION)?;

        let columns = result.columns();
        let wire_types = columns
            .iter()
            .map(resolve_wire_type)
            .collect::<CacheResult<Vec<_>>>()?;

        w.put_i32(len_as_i32(columns.len())?)?;
        for column in columns {
            write_column(&mut w, column)?;
        }

        for (row_idx, row) in result.rows().iter().enumerate() {
            if row.len() != columns.len() {
                fail!((
                    ErrorKind::TypeMismatch,
                    "Row width does not match column count",
                    format!(
                        "row {row_idx} has {} cells, expected {}",
                        row.len(),
                        columns.len()
                    )
                ));
            }
            for ((cell, wire), column) in row.iter().zip(&wire_types).zip(columns) {
                write_cell(&mut w, *wire, column, cell)?;
            }
        }

        Ok(w.finish())
    }

    /// Decodes a buffer produced by [`ResultCodec::encode`].
    pub fn decode(&self, bytes: &[u8]) -> CacheResult<ResultSet> {
        if bytes.is_empty() {
            return Ok(ResultSet::default());
        }
        if bytes.len() > self.max_size {
            fail!((
                ErrorKind::TooLarge,
                "Cached buffer exceeds configured maximum",
                format!("{} > {} bytes", bytes.len(), self.max_size)
            ));
        }

        let mut r = Reader::new(bytes);
        let version = r.get_u8()?;
        if version != FORMAT_VERSION {
            fail!((
                ErrorKind::Malformed,
                "Unknown format version",
                version.to_string()
            ));
        }

        let count = r.get_i32()?;
        if count < 0 {
            fail!((
                ErrorKind::Malformed,
                "Negative column count",
                count.to_string()
            ));
        }
        // Each column needs at least its six length prefixes.
        if count as usize > r.remaining() / 24 + 1 {
            fail!((
                ErrorKind::Malformed,
                "Column count exceeds buffer",
                count.to_string()
            ));
        }

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(read_column(&mut r)?);
        }
        let wire_types = columns
            .iter()
            .map(resolve_wire_type)
            .collect::<CacheResult<Vec<_>>>()?;

        if wire_types.is_empty() && r.remaining() > 0 {
            fail!((ErrorKind::Malformed, "Row data without columns"));
        }

        let mut rows = Vec::new();
        while r.remaining() > 0 {
            let mut row = Vec::with_capacity(wire_types.len());
            for wire in &wire_types {
                row.push(read_cell(&mut r, *wire)?);
            }
            rows.push(row);
        }

        Ok(ResultSet::with_rows(columns, rows))
    }

    /// Canonical byte form of a list of bound statement parameters. Equal
    /// parameter lists always produce equal bytes.
    pub fn encode_params(&self, params: &[CellValue]) -> CacheResult<Bytes> {
        let mut w = BoundedWriter::new(self.max_size);
        w.put_i32(len_as_i32(params.len())?)?;
        for param in params {
            match param.wire_type() {
                None => w.put_u8(0)?,
                Some(wire) => {
                    w.put_u8(wire as u8 + 1)?;
                    write_value(&mut w, wire, param)?;
                }
            }
        }
        Ok(w.finish())
    }
}

impl CellValue {
    /// The wire type a value would naturally use, `None` for NULL.
    fn wire_type(&self) -> Option<WireType> {
        let wire = match self {
            CellValue::Null => return None,
            CellValue::Boolean(_) => WireType::Boolean,
            CellValue::Int(_) => WireType::Int,
            CellValue::BigInt(_) => WireType::BigInt,
            CellValue::Float(_) => WireType::Float,
            CellValue::Double(_) => WireType::Double,
            CellValue::Decimal(_) => WireType::Decimal,
            CellValue::Text(_) => WireType::Text,
            CellValue::Bytes(_) => WireType::Bytes,
            CellValue::Date(_) => WireType::Date,
            CellValue::Time(_) => WireType::Time,
            CellValue::Timestamp(_) => WireType::Timestamp,
        };
        Some(wire)
    }
}

fn resolve_wire_type(column: &ColumnDescriptor) -> CacheResult<WireType> {
    column.wire_type().ok_or_else(|| {
        CacheError::from((
            ErrorKind::UnsupportedType,
            "Unsupported column type",
            format!(
                "column {:?} has type {} ({})",
                column.label, column.type_name, column.type_code
            ),
        ))
    })
}

fn len_as_i32(len: usize) -> CacheResult<i32> {
    i32::try_from(len).map_err(|_| {
        CacheError::from((
            ErrorKind::TooLarge,
            "Value too large for 32-bit length",
            format!("{len} bytes"),
        ))
    })
}

fn write_column(w: &mut BoundedWriter, column: &ColumnDescriptor) -> CacheResult<()> {
    for s in [
        &column.catalog,
        &column.label,
        &column.name,
        &column.type_name,
        &column.table_name,
        &column.schema_name,
    ] {
        w.put_str(s)?;
    }
    w.put_i32(column.type_code)?;
    w.put_i32(column.display_size)?;
    w.put_i32(column.precision)?;
    w.put_i32(column.scale)?;
    w.put_i32(column.nullable.code())?;
    for flag in [
        column.auto_increment,
        column.case_sensitive,
        column.currency,
        column.searchable,
        column.signed,
        column.read_only,
    ] {
        w.put_u8(flag as u8)?;
    }
    Ok(())
}

fn read_column(r: &mut Reader<'_>) -> CacheResult<ColumnDescriptor> {
    let catalog = r.get_string()?;
    let label = r.get_string()?;
    let name = r.get_string()?;
    let type_name = r.get_string()?;
    let table_name = r.get_string()?;
    let schema_name = r.get_string()?;
    let type_code = r.get_i32()?;
    let display_size = r.get_i32()?;
    let precision = r.get_i32()?;
    let scale = r.get_i32()?;
    let nullable_code = r.get_i32()?;
    let nullable = Nullability::from_code(nullable_code).ok_or_else(|| {
        CacheError::from((
            ErrorKind::Malformed,
            "Invalid nullability",
            nullable_code.to_string(),
        ))
    })?;

    Ok(ColumnDescriptor {
        catalog,
        label,
        name,
        type_name,
        table_name,
        schema_name,
        type_code,
        display_size,
        precision,
        scale,
        nullable,
        auto_increment: r.get_bool()?,
        case_sensitive: r.get_bool()?,
        currency: r.get_bool()?,
        searchable: r.get_bool()?,
        signed: r.get_bool()?,
        read_only: r.get_bool()?,
    })
}

fn write_cell(
    w: &mut BoundedWriter,
    wire: WireType,
    column: &ColumnDescriptor,
    cell: &CellValue,
) -> CacheResult<()> {
    if cell.is_null() {
        return w.put_u8(NULL_FLAG);
    }
    if !accepts(wire, cell) {
        fail!((
            ErrorKind::TypeMismatch,
            "Cell does not match column type",
            format!(
                "column {:?} is {} but value is {}",
                column.label,
                column.type_name,
                cell.variant_name()
            )
        ));
    }
    w.put_u8(PRESENT_FLAG)?;
    write_value(w, wire, cell)
}

// Widening conversions a column accepts on top of its own variant.
fn accepts(wire: WireType, cell: &CellValue) -> bool {
    matches!(
        (wire, cell),
        (WireType::Boolean, CellValue::Boolean(_))
            | (WireType::Int, CellValue::Int(_))
            | (WireType::BigInt, CellValue::BigInt(_) | CellValue::Int(_))
            | (WireType::Float, CellValue::Float(_))
            | (WireType::Double, CellValue::Double(_) | CellValue::Float(_))
            | (WireType::Decimal, CellValue::Decimal(_) | CellValue::Double(_))
            | (WireType::Text, CellValue::Text(_))
            | (WireType::Bytes, CellValue::Bytes(_))
            | (WireType::Date, CellValue::Date(_))
            | (WireType::Time, CellValue::Time(_))
            | (WireType::Timestamp, CellValue::Timestamp(_))
    )
}

fn write_value(w: &mut BoundedWriter, wire: WireType, cell: &CellValue) -> CacheResult<()> {
    match (wire, cell) {
        (WireType::Boolean, CellValue::Boolean(v)) => w.put_u8(*v as u8),
        (WireType::Int, CellValue::Int(v)) => w.put_i32(*v),
        (WireType::BigInt, CellValue::BigInt(v)) => w.put_i64(*v),
        (WireType::BigInt, CellValue::Int(v)) => w.put_i64(i64::from(*v)),
        (WireType::Float, CellValue::Float(v)) => w.put_f32(*v),
        (WireType::Double, CellValue::Double(v)) => w.put_f64(*v),
        (WireType::Double, CellValue::Float(v)) => w.put_f64(f64::from(*v)),
        (WireType::Decimal, CellValue::Decimal(v)) => {
            let d = v.to_f64().ok_or_else(|| {
                CacheError::from((
                    ErrorKind::TypeMismatch,
                    "Decimal not representable as double",
                    v.to_string(),
                ))
            })?;
            put_decimal(w, d)
        }
        (WireType::Decimal, CellValue::Double(v)) => put_decimal(w, *v),
        (WireType::Text, CellValue::Text(v)) => w.put_bytes(v.as_bytes()),
        (WireType::Bytes, CellValue::Bytes(v)) => w.put_bytes(v),
        (WireType::Date, CellValue::Date(v)) => {
            w.put_i64(local_millis(v.and_time(NaiveTime::default())))
        }
        (WireType::Time, CellValue::Time(v)) => {
            w.put_i64(local_millis(NaiveDate::default().and_time(*v)))
        }
        (WireType::Timestamp, CellValue::Timestamp(v)) => w.put_i64(local_millis(*v)),
        _ => Err(CacheError::from((
            ErrorKind::TypeMismatch,
            "Value does not match wire type",
            format!("{wire:?} / {}", cell.variant_name()),
        ))),
    }
}

fn read_cell(r: &mut Reader<'_>, wire: WireType) -> CacheResult<CellValue> {
    match r.get_u8()? {
        NULL_FLAG => return Ok(CellValue::Null),
        PRESENT_FLAG => {}
        other => fail!((
            ErrorKind::Malformed,
            "Invalid null flag",
            other.to_string()
        )),
    }

    let value = match wire {
        WireType::Boolean => CellValue::Boolean(r.get_bool()?),
        WireType::Int => CellValue::Int(r.get_i32()?),
        WireType::BigInt => CellValue::BigInt(r.get_i64()?),
        WireType::Float => CellValue::Float(r.get_f32()?),
        WireType::Double => CellValue::Double(r.get_f64()?),
        WireType::Decimal => {
            let d = r.get_f64()?;
            CellValue::Decimal(decimal_from_wire(d).ok_or_else(|| {
                CacheError::from((
                    ErrorKind::Malformed,
                    "Decimal out of range",
                    d.to_string(),
                ))
            })?)
        }
        WireType::Text => CellValue::Text(r.get_string()?),
        WireType::Bytes => CellValue::Bytes(r.get_bytes()?.to_vec()),
        WireType::Date => CellValue::Date(from_local_millis(r.get_i64()?)?.date()),
        WireType::Time => CellValue::Time(from_local_millis(r.get_i64()?)?.time()),
        WireType::Timestamp => CellValue::Timestamp(from_local_millis(r.get_i64()?)?),
    };
    Ok(value)
}

// Decoding picks the shortest decimal that rounds to the double, so 19.99
// comes back as 19.99 rather than its binary expansion.
fn decimal_from_wire(d: f64) -> Option<Decimal> {
    Decimal::from_f64(d)
}

// A double that would not decode is refused here, before anything is stored.
fn put_decimal(w: &mut BoundedWriter, d: f64) -> CacheResult<()> {
    if decimal_from_wire(d).is_none() {
        fail!((
            ErrorKind::TypeMismatch,
            "Value outside the decimal range",
            d.to_string()
        ));
    }
    w.put_f64(d)
}

fn local_millis(value: NaiveDateTime) -> i64 {
    // Wall-clock times skipped by a DST transition have no local instant;
    // those are taken as UTC.
    Local
        .from_local_datetime(&value)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| value.and_utc().timestamp_millis())
}

fn from_local_millis(millis: i64) -> CacheResult<NaiveDateTime> {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|dt: DateTime<Local>| dt.naive_local())
        .ok_or_else(|| {
            CacheError::from((
                ErrorKind::Malformed,
                "Timestamp out of range",
                millis.to_string(),
            ))
        })
}

/// Write side: refuses any write that would take the buffer past its limit.
struct BoundedWriter {
    buf: BytesMut,
    limit: usize,
}

impl BoundedWriter {
    fn new(limit: usize) -> Self {
        BoundedWriter {
            buf: BytesMut::with_capacity(limit.min(INITIAL_BUFFER_SIZE)),
            limit,
        }
    }

    fn reserve(&mut self, additional: usize) -> CacheResult<()> {
        let needed = self.buf.len().saturating_add(additional);
        if needed > self.limit {
            fail!((
                ErrorKind::TooLarge,
                "Result too large to cache",
                format!("needs more than {} bytes", self.limit)
            ));
        }
        self.buf.reserve(additional);
        Ok(())
    }

    fn put_u8(&mut self, v: u8) -> CacheResult<()> {
        self.reserve(1)?;
        self.buf.put_u8(v);
        Ok(())
    }

    fn put_i32(&mut self, v: i32) -> CacheResult<()> {
        self.reserve(4)?;
        self.buf.put_i32(v);
        Ok(())
    }

    fn put_i64(&mut self, v: i64) -> CacheResult<()> {
        self.reserve(8)?;
        self.buf.put_i64(v);
        Ok(())
    }

    fn put_f32(&mut self, v: f32) -> CacheResult<()> {
        self.reserve(4)?;
        self.buf.put_f32(v);
        Ok(())
    }

    fn put_f64(&mut self, v: f64) -> CacheResult<()> {
        self.reserve(8)?;
        self.buf.put_f64(v);
        Ok(())
    }

    fn put_bytes(&mut self, v: &[u8]) -> CacheResult<()> {
        let len = len_as_i32(v.len())?;
        self.reserve(4 + v.len())?;
        self.buf.put_i32(len);
        self.buf.put_slice(v);
        Ok(())
    }

    fn put_str(&mut self, v: &str) -> CacheResult<()> {
        self.put_bytes(v.as_bytes())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Read side: every read is bounds-checked so truncated input surfaces as
/// [`ErrorKind::Malformed`] instead of a panic.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> CacheResult<()> {
        if self.buf.remaining() < n {
            fail!((
                ErrorKind::Malformed,
                "Unexpected end of buffer",
                format!("needed {n} bytes, {} left", self.buf.remaining())
            ));
        }
        Ok(())
    }

    fn get_u8(&mut self) -> CacheResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn get_bool(&mut self) -> CacheResult<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => fail!((
                ErrorKind::Malformed,
                "Invalid boolean byte",
                other.to_string()
            )),
        }
    }

    fn get_i32(&mut self) -> CacheResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn get_i64(&mut self) -> CacheResult<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn get_f32(&mut self) -> CacheResult<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    fn get_f64(&mut self) -> CacheResult<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    fn get_bytes(&mut self) -> CacheResult<&'a [u8]> {
        let len = self.get_i32()?;
        if len < 0 {
            fail!((
                ErrorKind::Malformed,
                "Negative length prefix",
                len.to_string()
            ));
        }
        let len = len as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn get_string(&mut self) -> CacheResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            CacheError::from((ErrorKind::Malformed, "Invalid UTF-8 in string value"))
        })
    }
}
