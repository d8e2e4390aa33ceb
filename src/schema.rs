//! Table schemas, primary keys, and the 16-byte German-string representation.
//!
//! Column offsets and strides are computed once when a [`TableSchema`] is
//! constructed and never recomputed on a hot path.

use crate::checksum::xxh3_of;
use std::cmp::Ordering;
use thiserror::Error;

/// Net weight of a Z-Set record. Addition is pointwise; zero annihilates.
pub type Weight = i64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("weight overflow: {0} + {1} would wrap i64")]
    WeightOverflow(Weight, Weight),
    #[error("column index {0} out of range for schema with {1} columns")]
    ColumnOutOfRange(usize, usize),
    #[error("primary key variant mismatch: schema expects {expected:?}, got {got:?}")]
    PkVariantMismatch { expected: PkVariant, got: PkVariant },
    #[error("string payload too long for an inline region: {0} bytes")]
    StringTooLong(usize),
    #[error("ingest batch schema hash {batch:#018x} does not match table schema {table:#018x}")]
    SchemaMismatch { batch: u64, table: u64 },
    #[error("column type mismatch at index {0}")]
    ColumnTypeMismatch(usize),
    #[error("expected {expected} payload values, got {got}")]
    PayloadArityMismatch { expected: usize, got: usize },
}

/// Adds a weight delta with overflow checking.
pub fn add_weight(current: Weight, delta: Weight) -> Result<Weight, SchemaError> {
    current
        .checked_add(delta)
        .ok_or(SchemaError::WeightOverflow(current, delta))
}

/// Which integer width a table's primary key column uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PkVariant {
    U64,
    U128,
}

impl PkVariant {
    pub fn byte_width(self) -> usize {
        match self {
            PkVariant::U64 => 8,
            PkVariant::U128 => 16,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            PkVariant::U64 => 0,
            PkVariant::U128 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PkVariant::U64),
            1 => Some(PkVariant::U128),
            _ => None,
        }
    }
}

/// A table primary key: natural unsigned comparison, fixed width per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrimaryKey {
    U64(u64),
    U128(u128),
}

impl PrimaryKey {
    pub fn variant(self) -> PkVariant {
        match self {
            PrimaryKey::U64(_) => PkVariant::U64,
            PrimaryKey::U128(_) => PkVariant::U128,
        }
    }

    pub fn to_le_bytes_vec(self) -> Vec<u8> {
        match self {
            PrimaryKey::U64(v) => v.to_le_bytes().to_vec(),
            PrimaryKey::U128(v) => v.to_le_bytes().to_vec(),
        }
    }

    pub fn from_le_bytes(variant: PkVariant, bytes: &[u8]) -> Self {
        match variant {
            PkVariant::U64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                PrimaryKey::U64(u64::from_le_bytes(buf))
            }
            PkVariant::U128 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(&bytes[..16]);
                PrimaryKey::U128(u128::from_le_bytes(buf))
            }
        }
    }

    pub fn as_u128(self) -> u128 {
        match self {
            PrimaryKey::U64(v) => v as u128,
            PrimaryKey::U128(v) => v,
        }
    }
}

/// Column type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
}

impl ColumnType {
    /// Fixed width this type occupies in a packed row. German strings always
    /// occupy exactly 16 bytes regardless of logical length.
    pub fn fixed_size(self) -> usize {
        match self {
            ColumnType::I8 | ColumnType::U8 => 1,
            ColumnType::I16 | ColumnType::U16 => 2,
            ColumnType::I32 | ColumnType::U32 | ColumnType::F32 => 4,
            ColumnType::I64 | ColumnType::U64 | ColumnType::F64 => 8,
            ColumnType::Str => GSTRING_SIZE,
        }
    }

    fn tag(self) -> u8 {
        match self {
            ColumnType::I8 => 0,
            ColumnType::I16 => 1,
            ColumnType::I32 => 2,
            ColumnType::I64 => 3,
            ColumnType::U8 => 4,
            ColumnType::U16 => 5,
            ColumnType::U32 => 6,
            ColumnType::U64 => 7,
            ColumnType::F32 => 8,
            ColumnType::F64 => 9,
            ColumnType::Str => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        ColumnDef { name: name.into(), ty }
    }
}

/// A table's immutable physical shape: PK variant, ordered column list (the
/// PK column included, at `pk_column_index`), and a stable schema hash.
#[derive(Debug, Clone)]
pub struct TableSchema {
    table_id: u64,
    pk_variant: PkVariant,
    columns: Vec<ColumnDef>,
    pk_column_index: usize,
    /// Offsets into the packed row payload for every non-PK column, in the
    /// same relative order as `columns` (PK column has no entry).
    payload_offsets: Vec<usize>,
    payload_stride: usize,
    schema_hash: u64,
}

impl TableSchema {
    pub fn new(
        table_id: u64,
        pk_variant: PkVariant,
        columns: Vec<ColumnDef>,
        pk_column_index: usize,
    ) -> Self {
        assert!(pk_column_index < columns.len(), "pk_column_index out of range");

        let mut payload_offsets = Vec::with_capacity(columns.len());
        let mut offset = 0usize;
        for (idx, col) in columns.iter().enumerate() {
            if idx == pk_column_index {
                payload_offsets.push(usize::MAX); // sentinel: not in payload
                continue;
            }
            payload_offsets.push(offset);
            offset += col.ty.fixed_size();
        }
        let payload_stride = offset;

        let schema_hash = compute_schema_hash(pk_variant, &columns, pk_column_index);

        TableSchema {
            table_id,
            pk_variant,
            columns,
            pk_column_index,
            payload_offsets,
            payload_stride,
            schema_hash,
        }
    }

    pub fn table_id(&self) -> u64 {
        self.table_id
    }

    pub fn pk_variant(&self) -> PkVariant {
        self.pk_variant
    }

    pub fn pk_column_index(&self) -> usize {
        self.pk_column_index
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Non-PK columns in declared order, i.e. the columns that make up a
    /// packed row payload.
    pub fn payload_columns(&self) -> impl Iterator<Item = (usize, &ColumnDef)> {
        self.columns
            .iter()
            .enumerate()
            .filter(move |(idx, _)| *idx != self.pk_column_index)
    }

    pub fn payload_column_count(&self) -> usize {
        self.columns.len() - 1
    }

    /// Byte offset of column `idx` (schema-global index, PK excluded) inside
    /// a packed row payload.
    pub fn payload_offset(&self, idx: usize) -> Result<usize, SchemaError> {
        if idx >= self.columns.len() || idx == self.pk_column_index {
            return Err(SchemaError::ColumnOutOfRange(idx, self.columns.len()));
        }
        Ok(self.payload_offsets[idx])
    }

    pub fn payload_stride(&self) -> usize {
        self.payload_stride
    }

    pub fn schema_hash(&self) -> u64 {
        self.schema_hash
    }

    pub fn node_stride(&self) -> usize {
        self.pk_variant.byte_width() + self.payload_stride
    }
}

// ---------------------------------------------------------------------------
// RowPayload as a decoded value sequence
// ---------------------------------------------------------------------------

/// A single non-PK column value, decoded from (or destined for) a packed
/// row payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(Vec<u8>),
}

impl ColumnValue {
    /// Total order over the value's resolved bytes. Floats order and compare
    /// by bit pattern rather than IEEE-754 total order, so NaN payloads get a
    /// well-defined position instead of comparing unequal to everything
    /// (see DESIGN.md).
    pub(crate) fn cmp_same_variant(&self, other: &ColumnValue) -> Ordering {
        match (self, other) {
            (ColumnValue::I8(a), ColumnValue::I8(b)) => a.cmp(b),
            (ColumnValue::I16(a), ColumnValue::I16(b)) => a.cmp(b),
            (ColumnValue::I32(a), ColumnValue::I32(b)) => a.cmp(b),
            (ColumnValue::I64(a), ColumnValue::I64(b)) => a.cmp(b),
            (ColumnValue::U8(a), ColumnValue::U8(b)) => a.cmp(b),
            (ColumnValue::U16(a), ColumnValue::U16(b)) => a.cmp(b),
            (ColumnValue::U32(a), ColumnValue::U32(b)) => a.cmp(b),
            (ColumnValue::U64(a), ColumnValue::U64(b)) => a.cmp(b),
            (ColumnValue::F32(a), ColumnValue::F32(b)) => a.to_bits().cmp(&b.to_bits()),
            (ColumnValue::F64(a), ColumnValue::F64(b)) => a.to_bits().cmp(&b.to_bits()),
            (ColumnValue::Str(a), ColumnValue::Str(b)) => a.cmp(b),
            _ => unreachable!("schema guarantees matching variants at a given column index"),
        }
    }
}

impl TableSchema {
    /// Packs decoded payload values into the fixed-stride on-disk/in-arena
    /// representation. `push_blob` receives the bytes of any string longer
    /// than the inline cap and returns the offset to embed.
    pub fn encode_payload(
        &self,
        values: &[ColumnValue],
        mut push_blob: impl FnMut(&[u8]) -> u64,
    ) -> Result<Vec<u8>, SchemaError> {
        if values.len() != self.payload_column_count() {
            return Err(SchemaError::PayloadArityMismatch {
                expected: self.payload_column_count(),
                got: values.len(),
            });
        }
        let mut buf = vec![0u8; self.payload_stride];
        for ((idx, col), value) in self.payload_columns().zip(values.iter()) {
            let off = self.payload_offsets[idx];
            write_column_value(&mut buf[off..off + col.ty.fixed_size()], col.ty, value, &mut push_blob)?;
        }
        Ok(buf)
    }

    /// Decodes a packed row payload back into values, dereferencing `heap`
    /// for any string stored in heap form.
    pub fn decode_payload(&self, bytes: &[u8], heap: &[u8]) -> Result<Vec<ColumnValue>, SchemaError> {
        let mut out = Vec::with_capacity(self.payload_column_count());
        for (idx, col) in self.payload_columns() {
            let off = self.payload_offsets[idx];
            let field = &bytes[off..off + col.ty.fixed_size()];
            out.push(read_column_value(field, col.ty, heap)?);
        }
        Ok(out)
    }

    /// Lexicographic comparison of two packed payloads, column by column in
    /// schema order, resolving string columns through their respective heaps.
    pub fn compare_payload_bytes(
        &self,
        a: &[u8],
        a_heap: &[u8],
        b: &[u8],
        b_heap: &[u8],
    ) -> Result<Ordering, SchemaError> {
        for (idx, col) in self.payload_columns() {
            let off = self.payload_offsets[idx];
            let field_a = &a[off..off + col.ty.fixed_size()];
            let field_b = &b[off..off + col.ty.fixed_size()];
            let ord = if col.ty == ColumnType::Str {
                let mut ra = [0u8; GSTRING_SIZE];
                ra.copy_from_slice(field_a);
                let mut rb = [0u8; GSTRING_SIZE];
                rb.copy_from_slice(field_b);
                GermanString::decode(&ra).cmp_cross(a_heap, &GermanString::decode(&rb), b_heap)?
            } else {
                let va = read_column_value(field_a, col.ty, a_heap)?;
                let vb = read_column_value(field_b, col.ty, b_heap)?;
                va.cmp_same_variant(&vb)
            };
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Full-row semantic equality of two packed payloads.
    pub fn payload_bytes_eq(
        &self,
        a: &[u8],
        a_heap: &[u8],
        b: &[u8],
        b_heap: &[u8],
    ) -> Result<bool, SchemaError> {
        Ok(self.compare_payload_bytes(a, a_heap, b, b_heap)? == Ordering::Equal)
    }
}

/// Column-by-column comparison of two already-decoded payload rows, used by
/// the tournament tree to order and group merge candidates without
/// re-encoding them into packed bytes.
pub(crate) fn compare_column_values(a: &[ColumnValue], b: &[ColumnValue]) -> Ordering {
    for (va, vb) in a.iter().zip(b.iter()) {
        let ord = va.cmp_same_variant(vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn write_column_value(
    field: &mut [u8],
    ty: ColumnType,
    value: &ColumnValue,
    push_blob: &mut impl FnMut(&[u8]) -> u64,
) -> Result<(), SchemaError> {
    match (ty, value) {
        (ColumnType::I8, ColumnValue::I8(v)) => field[0] = *v as u8,
        (ColumnType::I16, ColumnValue::I16(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::I32, ColumnValue::I32(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::I64, ColumnValue::I64(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::U8, ColumnValue::U8(v)) => field[0] = *v,
        (ColumnType::U16, ColumnValue::U16(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::U32, ColumnValue::U32(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::U64, ColumnValue::U64(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::F32, ColumnValue::F32(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::F64, ColumnValue::F64(v)) => field.copy_from_slice(&v.to_le_bytes()),
        (ColumnType::Str, ColumnValue::Str(bytes)) => {
            let gs = GermanString::from_bytes_with_heap(bytes, || push_blob(bytes));
            let mut raw = [0u8; GSTRING_SIZE];
            gs.encode(&mut raw);
            field.copy_from_slice(&raw);
        }
        _ => return Err(SchemaError::ColumnTypeMismatch(0)),
    }
    Ok(())
}

fn read_column_value(field: &[u8], ty: ColumnType, heap: &[u8]) -> Result<ColumnValue, SchemaError> {
    Ok(match ty {
        ColumnType::I8 => ColumnValue::I8(field[0] as i8),
        ColumnType::I16 => ColumnValue::I16(i16::from_le_bytes(field.try_into().unwrap())),
        ColumnType::I32 => ColumnValue::I32(i32::from_le_bytes(field.try_into().unwrap())),
        ColumnType::I64 => ColumnValue::I64(i64::from_le_bytes(field.try_into().unwrap())),
        ColumnType::U8 => ColumnValue::U8(field[0]),
        ColumnType::U16 => ColumnValue::U16(u16::from_le_bytes(field.try_into().unwrap())),
        ColumnType::U32 => ColumnValue::U32(u32::from_le_bytes(field.try_into().unwrap())),
        ColumnType::U64 => ColumnValue::U64(u64::from_le_bytes(field.try_into().unwrap())),
        ColumnType::F32 => ColumnValue::F32(f32::from_le_bytes(field.try_into().unwrap())),
        ColumnType::F64 => ColumnValue::F64(f64::from_le_bytes(field.try_into().unwrap())),
        ColumnType::Str => {
            let mut raw = [0u8; GSTRING_SIZE];
            raw.copy_from_slice(field);
            let gs = GermanString::decode(&raw);
            ColumnValue::Str(gs.resolve(heap)?.into_owned())
        }
    })
}

fn compute_schema_hash(pk_variant: PkVariant, columns: &[ColumnDef], pk_column_index: usize) -> u64 {
    let mut bytes = Vec::with_capacity(1 + columns.len());
    bytes.push(pk_variant.tag());
    bytes.push(pk_column_index as u8);
    for col in columns {
        bytes.push(col.ty.tag());
    }
    xxh3_of(&bytes)
}

// ---------------------------------------------------------------------------
// GermanString
// ---------------------------------------------------------------------------

pub const GSTRING_SIZE: usize = 16;
const INLINE_CAP: usize = 12; // 4-byte prefix + 8-byte suffix

/// The trailing 8 bytes of a [`GermanString`]: either the remainder of a
/// short string (length <= 12) or a heap offset for a long one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Inline([u8; 8]),
    Heap(u64),
}

/// 16-byte hybrid string representation: length + 4-byte prefix +
/// either an 8-byte inline suffix or an 8-byte heap offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GermanString {
    len: u32,
    prefix: [u8; 4],
    tail: Tail,
}

impl GermanString {
    /// Builds a short (`len <= 12`) fully-inline string.
    pub fn inline(bytes: &[u8]) -> Result<Self, SchemaError> {
        if bytes.len() > INLINE_CAP {
            return Err(SchemaError::StringTooLong(bytes.len()));
        }
        let mut prefix = [0u8; 4];
        let prefix_len = bytes.len().min(4);
        prefix[..prefix_len].copy_from_slice(&bytes[..prefix_len]);

        let mut suffix = [0u8; 8];
        if bytes.len() > 4 {
            let tail_bytes = &bytes[4..];
            suffix[..tail_bytes.len()].copy_from_slice(tail_bytes);
        }

        Ok(GermanString { len: bytes.len() as u32, prefix, tail: Tail::Inline(suffix) })
    }

    /// Builds a long (`len > 12`) string referencing `offset` in a blob heap.
    pub fn heap(bytes: &[u8], offset: u64) -> Self {
        debug_assert!(bytes.len() > INLINE_CAP);
        let mut prefix = [0u8; 4];
        let prefix_len = bytes.len().min(4);
        prefix[..prefix_len].copy_from_slice(&bytes[..prefix_len]);
        GermanString { len: bytes.len() as u32, prefix, tail: Tail::Heap(offset) }
    }

    /// Builds the form appropriate for `bytes`' length, given a heap-offset
    /// supplier used only for the long-string case.
    pub fn from_bytes_with_heap(bytes: &[u8], heap_offset: impl FnOnce() -> u64) -> Self {
        if bytes.len() <= INLINE_CAP {
            GermanString::inline(bytes).expect("length checked above")
        } else {
            GermanString::heap(bytes, heap_offset())
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_heap(&self) -> bool {
        matches!(self.tail, Tail::Heap(_))
    }

    pub fn heap_offset(&self) -> Option<u64> {
        match self.tail {
            Tail::Heap(off) => Some(off),
            Tail::Inline(_) => None,
        }
    }

    pub fn encode(&self, out: &mut [u8; GSTRING_SIZE]) {
        out[0..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..8].copy_from_slice(&self.prefix);
        match self.tail {
            Tail::Inline(suffix) => out[8..16].copy_from_slice(&suffix),
            Tail::Heap(offset) => out[8..16].copy_from_slice(&offset.to_le_bytes()),
        }
    }

    pub fn decode(raw: &[u8; GSTRING_SIZE]) -> Self {
        let len = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&raw[4..8]);
        let tail = if (len as usize) <= INLINE_CAP {
            let mut suffix = [0u8; 8];
            suffix.copy_from_slice(&raw[8..16]);
            Tail::Inline(suffix)
        } else {
            Tail::Heap(u64::from_le_bytes(raw[8..16].try_into().unwrap()))
        };
        GermanString { len, prefix, tail }
    }

    /// Reconstructs the full string bytes, dereferencing `heap` when needed.
    pub fn resolve<'a>(&self, heap: &'a [u8]) -> Result<std::borrow::Cow<'a, [u8]>, SchemaError> {
        use std::borrow::Cow;
        let len = self.len as usize;
        match self.tail {
            Tail::Inline(suffix) => {
                let mut buf = Vec::with_capacity(len);
                let prefix_len = len.min(4);
                buf.extend_from_slice(&self.prefix[..prefix_len]);
                if len > 4 {
                    buf.extend_from_slice(&suffix[..len - 4]);
                }
                Ok(Cow::Owned(buf))
            }
            Tail::Heap(offset) => {
                let start = offset as usize;
                let end = start
                    .checked_add(len)
                    .ok_or(SchemaError::StringTooLong(len))?;
                heap.get(start..end)
                    .map(Cow::Borrowed)
                    .ok_or(SchemaError::StringTooLong(len))
            }
        }
    }

    /// O(1) short-circuit inequality, then full comparison if needed.
    /// `self`/`other` may each live in a different blob heap.
    pub fn eq_cross(
        &self,
        self_heap: &[u8],
        other: &GermanString,
        other_heap: &[u8],
    ) -> Result<bool, SchemaError> {
        if self.len != other.len {
            return Ok(false);
        }
        if self.prefix != other.prefix {
            return Ok(false);
        }
        // Fast path: both short strings compare directly without materializing.
        if let (Tail::Inline(a), Tail::Inline(b)) = (self.tail, other.tail) {
            return Ok(a == b);
        }
        Ok(self.resolve(self_heap)? == other.resolve(other_heap)?)
    }

    /// Lexicographic ordering by resolved bytes, for payload sort order.
    pub fn cmp_cross(
        &self,
        self_heap: &[u8],
        other: &GermanString,
        other_heap: &[u8],
    ) -> Result<std::cmp::Ordering, SchemaError> {
        Ok(self.resolve(self_heap)?.cmp(&other.resolve(other_heap)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_round_trip_short() {
        let s = GermanString::inline(b"hi").unwrap();
        let mut raw = [0u8; GSTRING_SIZE];
        s.encode(&mut raw);
        let back = GermanString::decode(&raw);
        assert_eq!(back.resolve(&[]).unwrap().as_ref(), b"hi");
    }

    #[test]
    fn inline_round_trip_twelve_bytes() {
        let bytes = b"exactly12byt";
        assert_eq!(bytes.len(), 12);
        let s = GermanString::inline(bytes).unwrap();
        let mut raw = [0u8; GSTRING_SIZE];
        s.encode(&mut raw);
        let back = GermanString::decode(&raw);
        assert!(!back.is_heap());
        assert_eq!(back.resolve(&[]).unwrap().as_ref(), bytes);
    }

    #[test]
    fn heap_round_trip() {
        let mut heap = Vec::new();
        let payload = b"this string is definitely longer than twelve bytes";
        let offset = heap.len() as u64;
        heap.extend_from_slice(payload);
        let s = GermanString::heap(payload, offset);
        assert!(s.is_heap());
        assert_eq!(s.resolve(&heap).unwrap().as_ref(), payload.as_slice());
    }

    #[test]
    fn length_mismatch_is_o1_unequal() {
        let a = GermanString::inline(b"ab").unwrap();
        let b = GermanString::inline(b"abc").unwrap();
        assert!(!a.eq_cross(&[], &b, &[]).unwrap());
    }

    #[test]
    fn cross_heap_equality() {
        let mut heap_a = Vec::new();
        let mut heap_b = Vec::new();
        let payload = b"this string lives in two different heaps here";
        let off_a = heap_a.len() as u64;
        heap_a.extend_from_slice(payload);
        let off_b = heap_b.len() as u64;
        heap_b.extend_from_slice(payload);
        let a = GermanString::heap(payload, off_a);
        let b = GermanString::heap(payload, off_b);
        assert!(a.eq_cross(&heap_a, &b, &heap_b).unwrap());
    }

    #[test]
    fn schema_hash_stable_across_rebuilds() {
        let cols = vec![
            ColumnDef::new("pk", ColumnType::U64),
            ColumnDef::new("value", ColumnType::I64),
        ];
        let a = TableSchema::new(1, PkVariant::U64, cols.clone(), 0);
        let b = TableSchema::new(1, PkVariant::U64, cols, 0);
        assert_eq!(a.schema_hash(), b.schema_hash());
    }

    #[test]
    fn payload_offsets_skip_pk_column() {
        let cols = vec![
            ColumnDef::new("a", ColumnType::I32),
            ColumnDef::new("pk", ColumnType::U64),
            ColumnDef::new("b", ColumnType::I64),
        ];
        let schema = TableSchema::new(1, PkVariant::U64, cols, 1);
        assert_eq!(schema.payload_offset(0).unwrap(), 0);
        assert_eq!(schema.payload_offset(2).unwrap(), 4);
        assert_eq!(schema.payload_stride(), 12);
        assert!(schema.payload_offset(1).is_err());
    }

    #[test]
    fn weight_overflow_detected() {
        assert!(add_weight(i64::MAX, 1).is_err());
        assert_eq!(add_weight(5, -3).unwrap(), 2);
    }

    #[test]
    fn payload_encode_decode_round_trip_with_long_string() {
        let cols = vec![
            ColumnDef::new("pk", ColumnType::U64),
            ColumnDef::new("n", ColumnType::I64),
            ColumnDef::new("s", ColumnType::Str),
        ];
        let schema = TableSchema::new(1, PkVariant::U64, cols, 0);
        let mut blob = Vec::new();
        let long = b"this payload is long enough to force heap storage".to_vec();
        let values = vec![ColumnValue::I64(-7), ColumnValue::Str(long.clone())];
        let packed = schema
            .encode_payload(&values, |bytes| {
                let off = blob.len() as u64;
                blob.extend_from_slice(bytes);
                off
            })
            .unwrap();
        let decoded = schema.decode_payload(&packed, &blob).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn compare_payload_bytes_orders_by_column_then_string_content() {
        let cols = vec![ColumnDef::new("pk", ColumnType::U64), ColumnDef::new("s", ColumnType::Str)];
        let schema = TableSchema::new(1, PkVariant::U64, cols, 0);
        let mut heap = Vec::new();
        let a = schema
            .encode_payload(&[ColumnValue::Str(b"a".to_vec())], |b| {
                let off = heap.len() as u64;
                heap.extend_from_slice(b);
                off
            })
            .unwrap();
        let b = schema
            .encode_payload(&[ColumnValue::Str(b"b".to_vec())], |b| {
                let off = heap.len() as u64;
                heap.extend_from_slice(b);
                off
            })
            .unwrap();
        assert_eq!(schema.compare_payload_bytes(&a, &heap, &b, &heap).unwrap(), Ordering::Less);
    }
}
