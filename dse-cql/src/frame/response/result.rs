//! RESULT response: void, rows, set keyspace, prepared and schema change.

use std::net::IpAddr;

use bytes::Bytes;
use uuid::Uuid;

use crate::frame::frame_errors::{CqlResultParseError, LowLevelDeserializationError};
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::frame::ProtocolVersion;

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

type StdResult<T, E> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    /// Absent on v2, which does not describe the result set of a prepared statement.
    pub result_metadata: Option<ResultMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

/// A decoded cell.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(i64),
    /// Scale and big-endian two's complement unscaled value.
    Decimal { scale: i32, unscaled: Vec<u8> },
    /// Days since the epoch, centered at 2^31.
    Date(u32),
    Double(f64),
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    /// Milliseconds since the epoch.
    Timestamp(i64),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        fields: Vec<(String, Option<CqlValue>)>,
    },
    SmallInt(i16),
    TinyInt(i8),
    /// Nanoseconds since midnight.
    Time(i64),
    Timeuuid(Uuid),
    Tuple(Vec<Option<CqlValue>>),
    Uuid(Uuid),
    /// Big-endian two's complement.
    Varint(Vec<u8>),
    /// Zero-length value of a type that cannot normally be empty.
    Empty,
    Custom(Vec<u8>),
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) | Self::Counter(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or set.
    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_pair_vec(self) -> Option<Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_specs.iter().position(|spec| spec.name == name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PartitionKeyIndex {
    /// Index of the bound value
    pub index: u16,
    /// Position of the column in the partition key
    pub sequence: u16,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedMetadata {
    pub col_count: usize,
    /// Sorted by `sequence`. Only v4 servers send these.
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

impl Rows {
    /// Values of the named column, one per row.
    pub fn column<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = Option<&'a CqlValue>>> {
        let idx = self.metadata.column_index(name)?;
        Some(self.rows.iter().map(move |row| row.columns[idx].as_ref()))
    }
}

#[derive(Debug, Clone)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_type(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<ColumnType, CqlResultParseError> {
    use ColumnType::*;
    let malformed = CqlResultParseError::RowsParseError;
    let id = types::read_short(buf).map_err(|err| malformed(err.into()))?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf).map_err(malformed)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        // 0x000A was "varchar" before v3 and is an alias of text
        0x000A | 0x000D => Text,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0020 => List(Box::new(deser_type(version, buf)?)),
        0x0021 => Map(
            Box::new(deser_type(version, buf)?),
            Box::new(deser_type(version, buf)?),
        ),
        0x0022 => Set(Box::new(deser_type(version, buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf).map_err(malformed)?.to_owned();
            let type_name = types::read_string(buf).map_err(malformed)?.to_owned();
            let fields_size = types::read_short(buf).map_err(|err| malformed(err.into()))?;
            let mut field_types = Vec::with_capacity(fields_size.into());
            for _ in 0..fields_size {
                let field_name = types::read_string(buf).map_err(malformed)?.to_owned();
                field_types.push((field_name, deser_type(version, buf)?));
            }
            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            }
        }
        0x0031 => {
            let len = types::read_short(buf).map_err(|err| malformed(err.into()))?;
            let types = (0..len)
                .map(|_| deser_type(version, buf))
                .collect::<StdResult<_, _>>()?;
            Tuple(types)
        }
        id => return Err(CqlResultParseError::UnknownColumnType(id)),
    })
}

fn deser_col_specs(
    version: ProtocolVersion,
    buf: &mut &[u8],
    global_table_spec: Option<&TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, CqlResultParseError> {
    let malformed = CqlResultParseError::RowsParseError;
    // Lengths come from the wire; never reserve more than the bytes left.
    let mut col_specs = Vec::with_capacity(col_count.min(buf.len()));
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf).map_err(malformed)?,
        };
        let name = types::read_string(buf).map_err(malformed)?.to_owned();
        let typ = deser_type(version, buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_result_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<ResultMetadata, CqlResultParseError> {
    let malformed = CqlResultParseError::RowsParseError;
    let flags = types::read_int(buf).map_err(|err| malformed(err.into()))?;
    let col_count = types::read_int_length(buf).map_err(malformed)?;

    let paging_state = if flags & FLAG_HAS_MORE_PAGES != 0 {
        Some(Bytes::copy_from_slice(
            types::read_bytes(buf).map_err(malformed)?,
        ))
    } else {
        None
    };

    if flags & FLAG_NO_METADATA != 0 {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: Vec::new(),
        });
    }

    let global_table_spec = if flags & FLAG_GLOBAL_TABLES_SPEC != 0 {
        Some(deser_table_spec(buf).map_err(malformed)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(version, buf, global_table_spec.as_ref(), col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_prepared_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<PreparedMetadata, CqlResultParseError> {
    let malformed = CqlResultParseError::PreparedParseError;
    let flags = types::read_int(buf).map_err(|err| malformed(err.into()))?;
    let col_count = types::read_int_length(buf).map_err(malformed)?;

    let mut pk_indexes = Vec::new();
    if version >= ProtocolVersion::V4 {
        let pk_count = types::read_int_length(buf).map_err(malformed)?;
        pk_indexes.reserve(pk_count.min(buf.len()));
        for sequence in 0..pk_count {
            let index = types::read_short(buf).map_err(|err| malformed(err.into()))?;
            pk_indexes.push(PartitionKeyIndex {
                index,
                sequence: sequence as u16,
            });
        }
    }

    let global_table_spec = if flags & FLAG_GLOBAL_TABLES_SPEC != 0 {
        Some(deser_table_spec(buf).map_err(malformed)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(version, buf, global_table_spec.as_ref(), col_count)?;

    Ok(PreparedMetadata {
        col_count,
        pk_indexes,
        col_specs,
    })
}

/// Collections use `[short]` sizes on v2 and `[int]` sizes afterwards.
fn read_collection_len(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<usize, LowLevelDeserializationError> {
    match version {
        ProtocolVersion::V2 => Ok(types::read_short_length(buf)?),
        _ => types::read_int_length(buf),
    }
}

fn read_collection_element<'a>(
    version: ProtocolVersion,
    buf: &mut &'a [u8],
) -> StdResult<Option<&'a [u8]>, LowLevelDeserializationError> {
    match version {
        ProtocolVersion::V2 => types::read_short_bytes(buf).map(Some),
        _ => types::read_bytes_opt(buf),
    }
}

fn fixed<const N: usize>(buf: &[u8]) -> StdResult<[u8; N], LowLevelDeserializationError> {
    buf.try_into()
        .map_err(|_| LowLevelDeserializationError::TooFewBytesReceived {
            expected: N,
            received: buf.len(),
        })
}

/// Decodes a single non-null cell of type `typ`.
pub fn deser_cql_value(
    version: ProtocolVersion,
    typ: &ColumnType,
    buf: &mut &[u8],
) -> StdResult<CqlValue, CqlResultParseError> {
    deser_cql_value_inner(version, typ, buf).map_err(|err| CqlResultParseError::ValueParseError {
        typ: format!("{:?}", typ),
        err,
    })
}

fn deser_cql_value_inner(
    version: ProtocolVersion,
    typ: &ColumnType,
    buf: &mut &[u8],
) -> StdResult<CqlValue, LowLevelDeserializationError> {
    use ColumnType::*;

    if buf.is_empty() && !matches!(typ, Ascii | Blob | Text | Custom(_)) {
        return Ok(CqlValue::Empty);
    }

    let value = match typ {
        Custom(_) => CqlValue::Custom(buf.to_vec()),
        Ascii => CqlValue::Ascii(std::str::from_utf8(buf)?.to_owned()),
        Text => CqlValue::Text(std::str::from_utf8(buf)?.to_owned()),
        Blob => CqlValue::Blob(buf.to_vec()),
        Boolean => CqlValue::Boolean(fixed::<1>(buf)?[0] != 0),
        Counter => CqlValue::Counter(i64::from_be_bytes(fixed(buf)?)),
        BigInt => CqlValue::BigInt(i64::from_be_bytes(fixed(buf)?)),
        Timestamp => CqlValue::Timestamp(i64::from_be_bytes(fixed(buf)?)),
        Time => CqlValue::Time(i64::from_be_bytes(fixed(buf)?)),
        Int => CqlValue::Int(i32::from_be_bytes(fixed(buf)?)),
        Date => CqlValue::Date(u32::from_be_bytes(fixed(buf)?)),
        SmallInt => CqlValue::SmallInt(i16::from_be_bytes(fixed(buf)?)),
        TinyInt => CqlValue::TinyInt(i8::from_be_bytes(fixed(buf)?)),
        Double => CqlValue::Double(f64::from_be_bytes(fixed(buf)?)),
        Float => CqlValue::Float(f32::from_be_bytes(fixed(buf)?)),
        Uuid => CqlValue::Uuid(uuid::Uuid::from_bytes(fixed(buf)?)),
        Timeuuid => CqlValue::Timeuuid(uuid::Uuid::from_bytes(fixed(buf)?)),
        Varint => CqlValue::Varint(buf.to_vec()),
        Decimal => {
            let mut rest = *buf;
            let scale = types::read_int(&mut rest)?;
            CqlValue::Decimal {
                scale,
                unscaled: rest.to_vec(),
            }
        }
        Inet => match buf.len() {
            4 => CqlValue::Inet(IpAddr::from(fixed::<4>(buf)?)),
            16 => CqlValue::Inet(IpAddr::from(fixed::<16>(buf)?)),
            n => return Err(LowLevelDeserializationError::InvalidInetLength(n as u8)),
        },
        List(elem) | Set(elem) => {
            let mut rest = *buf;
            let len = read_collection_len(version, &mut rest)?;
            let mut items = Vec::with_capacity(len.min(rest.len()));
            for _ in 0..len {
                let raw = read_collection_element(version, &mut rest)?.unwrap_or_default();
                items.push(deser_cql_value_inner(version, elem, &mut &*raw)?);
            }
            if matches!(typ, List(_)) {
                CqlValue::List(items)
            } else {
                CqlValue::Set(items)
            }
        }
        Map(key_type, value_type) => {
            let mut rest = *buf;
            let len = read_collection_len(version, &mut rest)?;
            let mut entries = Vec::with_capacity(len.min(rest.len()));
            for _ in 0..len {
                let raw_key = read_collection_element(version, &mut rest)?.unwrap_or_default();
                let raw_val = read_collection_element(version, &mut rest)?.unwrap_or_default();
                entries.push((
                    deser_cql_value_inner(version, key_type, &mut &*raw_key)?,
                    deser_cql_value_inner(version, value_type, &mut &*raw_val)?,
                ));
            }
            CqlValue::Map(entries)
        }
        UserDefinedType {
            type_name,
            keyspace,
            field_types,
        } => {
            let mut rest = *buf;
            let mut fields = Vec::with_capacity(field_types.len());
            for (field_name, field_type) in field_types {
                // Trailing fields may be missing if the type was altered.
                if rest.is_empty() {
                    fields.push((field_name.clone(), None));
                    continue;
                }
                let value = types::read_bytes_opt(&mut rest)?
                    .map(|mut raw| deser_cql_value_inner(version, field_type, &mut raw))
                    .transpose()?;
                fields.push((field_name.clone(), value));
            }
            CqlValue::UserDefinedType {
                keyspace: keyspace.clone(),
                type_name: type_name.clone(),
                fields,
            }
        }
        Tuple(elem_types) => {
            let mut rest = *buf;
            let elems = elem_types
                .iter()
                .map(|elem_type| {
                    types::read_bytes_opt(&mut rest)?
                        .map(|mut raw| deser_cql_value_inner(version, elem_type, &mut raw))
                        .transpose()
                })
                .collect::<StdResult<_, _>>()?;
            CqlValue::Tuple(elems)
        }
    };
    *buf = &[];
    Ok(value)
}

fn deser_rows(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Rows, CqlResultParseError> {
    let metadata = deser_result_metadata(version, buf)?;
    let malformed = CqlResultParseError::RowsParseError;

    let rows_count = types::read_int_length(buf).map_err(malformed)?;

    // Every cell carries at least its 4-byte length.
    let min_size = rows_count.saturating_mul(metadata.col_count.saturating_mul(4));
    if min_size > buf.len() {
        return Err(malformed(LowLevelDeserializationError::TooFewBytesReceived {
            expected: min_size,
            received: buf.len(),
        }));
    }

    // Rows without columns occupy no bytes, so only their count is kept.
    let materialized = if metadata.col_count == 0 { 0 } else { rows_count };
    let mut rows = Vec::with_capacity(materialized);
    for _ in 0..materialized {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for i in 0..metadata.col_count {
            let raw = types::read_bytes_opt(buf).map_err(malformed)?;
            // Without metadata the cells are kept opaque.
            let value = match (raw, metadata.col_specs.get(i)) {
                (None, _) => None,
                (Some(mut raw), Some(spec)) => Some(deser_cql_value(version, &spec.typ, &mut raw)?),
                (Some(raw), None) => Some(CqlValue::Blob(raw.to_vec())),
            };
            columns.push(value);
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, CqlResultParseError> {
    let keyspace_name = types::read_string(buf)
        .map_err(CqlResultParseError::SetKeyspaceParseError)?
        .to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<Prepared, CqlResultParseError> {
    let id = Bytes::copy_from_slice(
        types::read_short_bytes(buf).map_err(CqlResultParseError::PreparedParseError)?,
    );
    let prepared_metadata = deser_prepared_metadata(version, buf)?;
    let result_metadata = if version >= ProtocolVersion::V3 {
        Some(deser_result_metadata(version, buf)?)
    } else {
        None
    };

    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<SchemaChange, CqlResultParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(version, buf)
            .map_err(CqlResultParseError::SchemaChangeParseError)?,
    })
}

pub fn deserialize(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<Result, CqlResultParseError> {
    use self::Result::*;
    Ok(
        match types::read_int(buf)
            .map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?
        {
            0x0001 => Void,
            0x0002 => Rows(deser_rows(version, buf)?),
            0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
            0x0004 => Prepared(deser_prepared(version, buf)?),
            0x0005 => SchemaChange(deser_schema_change(version, buf)?),
            id => return Err(CqlResultParseError::UnknownResultId(id)),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::{write_bytes, write_int, write_short, write_string};
    use assert_matches::assert_matches;

    fn rows_body(version: ProtocolVersion) -> Vec<u8> {
        let mut body = Vec::new();
        write_int(0x0002, &mut body);
        write_int(FLAG_GLOBAL_TABLES_SPEC, &mut body);
        write_int(2, &mut body);
        write_string("system", &mut body).unwrap();
        write_string("schema_keyspaces", &mut body).unwrap();
        write_string("keyspace_name", &mut body).unwrap();
        write_short(0x000D, &mut body);
        write_string("strategy_options", &mut body).unwrap();
        write_short(0x0021, &mut body);
        write_short(0x000D, &mut body);
        write_short(0x000D, &mut body);

        write_int(1, &mut body);
        write_bytes(b"system", &mut body).unwrap();
        let mut map = Vec::new();
        match version {
            ProtocolVersion::V2 => {
                write_short(1, &mut map);
                types::write_short_bytes(b"replication_factor", &mut map).unwrap();
                types::write_short_bytes(b"3", &mut map).unwrap();
            }
            _ => {
                write_int(1, &mut map);
                write_bytes(b"replication_factor", &mut map).unwrap();
                write_bytes(b"3", &mut map).unwrap();
            }
        }
        write_bytes(&map, &mut body).unwrap();
        body
    }

    #[test]
    fn rows_with_collections_depend_on_version() {
        for version in [ProtocolVersion::V2, ProtocolVersion::V4] {
            let body = rows_body(version);
            let result = deserialize(version, &mut &body[..]).unwrap();
            let Result::Rows(rows) = result else {
                panic!("expected rows");
            };
            assert_eq!(rows.rows_count, 1);
            assert_eq!(rows.metadata.col_specs[0].table_spec.ks_name, "system");
            let names: Vec<_> = rows
                .column("keyspace_name")
                .unwrap()
                .map(|v| v.and_then(CqlValue::as_text).cloned())
                .collect();
            assert_eq!(names, vec![Some("system".to_owned())]);
            assert_eq!(
                rows.rows[0].columns[1],
                Some(CqlValue::Map(vec![(
                    CqlValue::Text("replication_factor".to_owned()),
                    CqlValue::Text("3".to_owned())
                )]))
            );
        }
    }

    #[test]
    fn set_keyspace() {
        let mut body = Vec::new();
        write_int(0x0003, &mut body);
        write_string("system", &mut body).unwrap();
        assert_matches!(
            deserialize(ProtocolVersion::V4, &mut &body[..]),
            Ok(Result::SetKeyspace(SetKeyspace { keyspace_name })) if keyspace_name == "system"
        );
    }

    #[test]
    fn prepared_pk_indexes_only_on_v4() {
        let mut body = Vec::new();
        write_int(0x0004, &mut body);
        types::write_short_bytes(&[0xAB, 0xCD], &mut body).unwrap();
        // prepared metadata: flags, col_count, pk_count, pk_index
        write_int(FLAG_GLOBAL_TABLES_SPEC, &mut body);
        write_int(1, &mut body);
        write_int(1, &mut body);
        write_short(0, &mut body);
        write_string("ks", &mut body).unwrap();
        write_string("t", &mut body).unwrap();
        write_string("pk", &mut body).unwrap();
        write_short(0x0009, &mut body);
        // result metadata: no metadata
        write_int(FLAG_NO_METADATA, &mut body);
        write_int(0, &mut body);

        let Result::Prepared(prepared) = deserialize(ProtocolVersion::V4, &mut &body[..]).unwrap()
        else {
            panic!("expected prepared");
        };
        assert_eq!(&prepared.id[..], &[0xAB, 0xCD]);
        assert_eq!(
            prepared.prepared_metadata.pk_indexes,
            vec![PartitionKeyIndex {
                index: 0,
                sequence: 0
            }]
        );
        assert_eq!(prepared.prepared_metadata.col_specs[0].typ, ColumnType::Int);
    }

    #[test]
    fn null_and_empty_cells() {
        let mut raw: &[u8] = &[];
        assert_eq!(
            deser_cql_value(ProtocolVersion::V4, &ColumnType::Int, &mut raw).unwrap(),
            CqlValue::Empty
        );
        let mut raw: &[u8] = &[];
        assert_eq!(
            deser_cql_value(ProtocolVersion::V4, &ColumnType::Text, &mut raw).unwrap(),
            CqlValue::Text(String::new())
        );
        let mut raw: &[u8] = &[0, 1];
        assert_matches!(
            deser_cql_value(ProtocolVersion::V4, &ColumnType::Int, &mut raw),
            Err(CqlResultParseError::ValueParseError { .. })
        );
    }

    #[test]
    fn announced_counts_beyond_body_are_rejected() {
        // One column, i32::MAX rows and no row data.
        let mut body = Vec::new();
        write_int(0x0002, &mut body);
        write_int(FLAG_NO_METADATA, &mut body);
        write_int(1, &mut body);
        write_int(i32::MAX, &mut body);
        assert_matches!(
            deserialize(ProtocolVersion::V4, &mut &body[..]),
            Err(CqlResultParseError::RowsParseError(
                LowLevelDeserializationError::TooFewBytesReceived { received: 0, .. }
            ))
        );

        // Without columns the rows are counted, not materialized.
        let mut body = Vec::new();
        write_int(0x0002, &mut body);
        write_int(FLAG_NO_METADATA, &mut body);
        write_int(0, &mut body);
        write_int(i32::MAX, &mut body);
        let Result::Rows(rows) = deserialize(ProtocolVersion::V4, &mut &body[..]).unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(rows.rows_count, i32::MAX as usize);
        assert!(rows.rows.is_empty());

        // A list announcing i32::MAX elements inside a 4-byte cell.
        let mut raw: &[u8] = &[0x7F, 0xFF, 0xFF, 0xFF];
        assert_matches!(
            deser_cql_value(
                ProtocolVersion::V4,
                &ColumnType::List(Box::new(ColumnType::Int)),
                &mut raw
            ),
            Err(CqlResultParseError::ValueParseError { .. })
        );
    }

    #[test]
    fn unknown_kind() {
        let mut body = Vec::new();
        write_int(0x0042, &mut body);
        assert_matches!(
            deserialize(ProtocolVersion::V4, &mut &body[..]),
            Err(CqlResultParseError::UnknownResultId(0x42))
        );
    }
}
