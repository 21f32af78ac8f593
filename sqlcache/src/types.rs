use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

/// Declared SQL type codes, numbered the way JDBC-style drivers report them.
pub mod type_code {
    pub const BIT: i32 = -7;
    pub const TINYINT: i32 = -6;
    pub const SMALLINT: i32 = 5;
    pub const INTEGER: i32 = 4;
    pub const BIGINT: i32 = -5;
    pub const FLOAT: i32 = 6;
    pub const REAL: i32 = 7;
    pub const DOUBLE: i32 = 8;
    pub const NUMERIC: i32 = 2;
    pub const DECIMAL: i32 = 3;
    pub const CHAR: i32 = 1;
    pub const VARCHAR: i32 = 12;
    pub const LONGVARCHAR: i32 = -1;
    pub const DATE: i32 = 91;
    pub const TIME: i32 = 92;
    pub const TIMESTAMP: i32 = 93;
    pub const BINARY: i32 = -2;
    pub const VARBINARY: i32 = -3;
    pub const LONGVARBINARY: i32 = -4;
    pub const NULL: i32 = 0;
    pub const OTHER: i32 = 1111;
    pub const JAVA_OBJECT: i32 = 2000;
    pub const DISTINCT: i32 = 2001;
    pub const STRUCT: i32 = 2002;
    pub const ARRAY: i32 = 2003;
    pub const BLOB: i32 = 2004;
    pub const CLOB: i32 = 2005;
    pub const REF: i32 = 2006;
    pub const DATALINK: i32 = 70;
    pub const BOOLEAN: i32 = 16;
    pub const ROWID: i32 = -8;
    pub const NCHAR: i32 = -15;
    pub const NVARCHAR: i32 = -9;
    pub const LONGNVARCHAR: i32 = -16;
    pub const NCLOB: i32 = 2011;
    pub const SQLXML: i32 = 2009;
    pub const REF_CURSOR: i32 = 2012;
    pub const TIME_WITH_TIMEZONE: i32 = 2013;
    pub const TIMESTAMP_WITH_TIMEZONE: i32 = 2014;
}

/// The wire representation a declared column type maps to.
///
/// The set is closed: every type code either resolves to one of these or is
/// rejected by the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireType {
    /// One byte.
    Boolean,
    /// TINYINT, SMALLINT and INTEGER, promoted to four bytes.
    Int,
    /// Eight bytes.
    BigInt,
    /// Four byte IEEE754.
    Float,
    /// Eight byte IEEE754.
    Double,
    /// NUMERIC and DECIMAL, widened to an eight byte double.
    Decimal,
    /// Length-prefixed UTF-8, including CLOB and ROWID.
    Text,
    /// Length-prefixed raw bytes, including BLOB.
    Bytes,
    /// Milliseconds since the epoch at local midnight.
    Date,
    /// Milliseconds since the epoch on 1970-01-01 local time.
    Time,
    /// Milliseconds since the epoch in local time.
    Timestamp,
}

impl WireType {
    /// Resolves a declared type code, or `None` if the type cannot be cached.
    pub fn from_type_code(code: i32) -> Option<WireType> {
        use type_code::*;

        let wire = match code {
            BIT | BOOLEAN => WireType::Boolean,
            TINYINT | SMALLINT | INTEGER => WireType::Int,
            BIGINT => WireType::BigInt,
            REAL => WireType::Float,
            FLOAT | DOUBLE => WireType::Double,
            NUMERIC | DECIMAL => WireType::Decimal,
            CHAR | VARCHAR | LONGVARCHAR | NCHAR | NVARCHAR | LONGNVARCHAR | CLOB | NCLOB
            | ROWID => WireType::Text,
            BINARY | VARBINARY | LONGVARBINARY | BLOB => WireType::Bytes,
            DATE => WireType::Date,
            TIME | TIME_WITH_TIMEZONE => WireType::Time,
            TIMESTAMP | TIMESTAMP_WITH_TIMEZONE => WireType::Timestamp,
            _ => return None,
        };
        Some(wire)
    }
}

/// Whether a column admits NULL, as reported by the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Nullability {
    /// The column does not allow NULL.
    NoNulls,
    /// The column allows NULL.
    Nullable,
    /// The driver could not tell.
    #[default]
    Unknown,
}

impl Nullability {
    pub(crate) fn code(self) -> i32 {
        match self {
            Nullability::NoNulls => 0,
            Nullability::Nullable => 1,
            Nullability::Unknown => 2,
        }
    }

    pub(crate) fn from_code(code: i32) -> Option<Nullability> {
        match code {
            0 => Some(Nullability::NoNulls),
            1 => Some(Nullability::Nullable),
            2 => Some(Nullability::Unknown),
            _ => None,
        }
    }
}

/// Metadata for one result column.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub catalog: String,
    pub label: String,
    pub name: String,
    pub type_name: String,
    pub table_name: String,
    pub schema_name: String,
    /// Declared type code, see [`type_code`].
    pub type_code: i32,
    pub display_size: i32,
    pub precision: i32,
    pub scale: i32,
    pub nullable: Nullability,
    pub auto_increment: bool,
    pub case_sensitive: bool,
    pub currency: bool,
    pub searchable: bool,
    pub signed: bool,
    pub read_only: bool,
}

impl ColumnDescriptor {
    /// Creates a descriptor with label and name set to `name` and everything
    /// else defaulted.
    pub fn new(name: impl Into<String>, type_code: i32, type_name: impl Into<String>) -> Self {
        let name = name.into();
        ColumnDescriptor {
            label: name.clone(),
            name,
            type_name: type_name.into(),
            type_code,
            ..Default::default()
        }
    }

    /// Sets the owning table.
    pub fn with_table(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Sets the nullability flag.
    pub fn with_nullable(mut self, nullable: Nullability) -> Self {
        self.nullable = nullable;
        self
    }

    /// Sets precision and scale.
    pub fn with_precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// The wire representation for this column, if it has one.
    pub fn wire_type(&self) -> Option<WireType> {
        WireType::from_type_code(self.type_code)
    }
}

/// A single cell of a result row.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Null,
    Boolean(bool),
    /// TINYINT, SMALLINT and INTEGER columns.
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    /// Comes back from the cache with at most double precision.
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    /// Returns true if this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub(crate) fn variant_name(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Boolean(_) => "boolean",
            CellValue::Int(_) => "int",
            CellValue::BigInt(_) => "bigint",
            CellValue::Float(_) => "float",
            CellValue::Double(_) => "double",
            CellValue::Decimal(_) => "decimal",
            CellValue::Text(_) => "text",
            CellValue::Bytes(_) => "bytes",
            CellValue::Date(_) => "date",
            CellValue::Time(_) => "time",
            CellValue::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Boolean(v) => v.fmt(f),
            CellValue::Int(v) => v.fmt(f),
            CellValue::BigInt(v) => v.fmt(f),
            CellValue::Float(v) => v.fmt(f),
            CellValue::Double(v) => v.fmt(f),
            CellValue::Decimal(v) => v.fmt(f),
            CellValue::Text(v) => v.fmt(f),
            CellValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            CellValue::Date(v) => v.fmt(f),
            CellValue::Time(v) => v.fmt(f),
            CellValue::Timestamp(v) => v.fmt(f),
        }
    }
}

/// A materialized tabular result: column metadata shared by every row, and
/// the rows themselves.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    columns: Arc<[ColumnDescriptor]>,
    rows: Vec<Vec<CellValue>>,
}

impl ResultSet {
    /// Creates an empty result with the given columns.
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        ResultSet {
            columns: columns.into(),
            rows: Vec::new(),
        }
    }

    /// Creates a result from columns and rows.
    pub fn with_rows(columns: Vec<ColumnDescriptor>, rows: Vec<Vec<CellValue>>) -> Self {
        ResultSet {
            columns: columns.into(),
            rows,
        }
    }

    /// Appends a row. The row is checked against the columns when encoded.
    pub fn push_row(&mut self, row: Vec<CellValue>) {
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// True when there is neither column metadata nor any row.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }

    /// Consumes the result, returning its rows.
    pub fn into_rows(self) -> Vec<Vec<CellValue>> {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_integers_share_the_int_wire_type() {
        for code in [type_code::TINYINT, type_code::SMALLINT, type_code::INTEGER] {
            assert_eq!(WireType::from_type_code(code), Some(WireType::Int));
        }
    }

    #[test]
    fn structured_types_have_no_wire_type() {
        for code in [
            type_code::ARRAY,
            type_code::STRUCT,
            type_code::REF,
            type_code::SQLXML,
            type_code::JAVA_OBJECT,
            type_code::DISTINCT,
            type_code::OTHER,
            type_code::REF_CURSOR,
            type_code::DATALINK,
            type_code::NULL,
        ] {
            assert_eq!(WireType::from_type_code(code), None, "type code {code}");
        }
    }

    #[test]
    fn nullability_codes() {
        for n in [
            Nullability::NoNulls,
            Nullability::Nullable,
            Nullability::Unknown,
        ] {
            assert_eq!(Nullability::from_code(n.code()), Some(n));
        }
        assert_eq!(Nullability::from_code(7), None);
    }
}
