//! In-memory Z-Set ordered by `(pk, payload)`, backed by a SkipList over a
//! dual arena (staging arena for nodes, blob arena for long strings).
//!
//! Lifecycle is `upsert` → `seal` → transmutation into a shard file. Instead
//! of last-write-wins point/tombstone entries this table performs in-place
//! weight summation and keeps a live node for every `(pk, payload)` pair
//! ever observed, including ones currently at net-zero weight (annihilation
//! pruning is deferred to transmutation).

use crate::arena::{Arena, ArenaError, ArenaOffset};
use crate::schema::{ColumnValue, PrimaryKey, SchemaError, TableSchema, Weight, add_weight};
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

const MAX_HEIGHT: usize = 16;
const NODE_HEADER_SIZE: usize = 12; // weight(8) + height(1) + padding(3)

#[derive(Debug, Error)]
pub enum MemtableError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("memtable is sealed and accepts no further upserts")]
    Sealed,
}

/// Deterministic per-node height generator, seeded fixed so tests never
/// depend on real randomness.
struct HeightSource {
    state: u64,
}

impl HeightSource {
    fn new(seed: u64) -> Self {
        HeightSource { state: seed | 1 }
    }

    fn next_bits(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Height with `p = 1/4` per level, capped at `MAX_HEIGHT`.
    fn next_height(&mut self) -> usize {
        let mut height = 1usize;
        let mut bits = self.next_bits();
        while height < MAX_HEIGHT {
            // two consecutive 1-bits occur with probability 1/4.
            if bits & 0b11 == 0b11 {
                height += 1;
                bits >>= 2;
            } else {
                break;
            }
        }
        height
    }
}

struct Node;

impl Node {
    fn size(height: usize, pk_width: usize, stride: usize) -> usize {
        NODE_HEADER_SIZE + 4 * height + pk_width + stride + 8 // trailing max_lsn
    }

    fn weight(staging: &Arena, node: ArenaOffset) -> Weight {
        i64::from_le_bytes(staging.read(node, 8).try_into().unwrap())
    }

    fn set_weight(staging: &mut Arena, node: ArenaOffset, w: Weight) {
        staging.write(node, &w.to_le_bytes());
    }

    fn height(staging: &Arena, node: ArenaOffset) -> usize {
        staging.read(node.plus(8), 1)[0] as usize
    }

    fn next(staging: &Arena, node: ArenaOffset, level: usize) -> ArenaOffset {
        let off = node.plus(NODE_HEADER_SIZE + 4 * level);
        let raw = u32::from_le_bytes(staging.read(off, 4).try_into().unwrap());
        ArenaOffset::from_raw(raw)
    }

    fn set_next(staging: &mut Arena, node: ArenaOffset, level: usize, target: ArenaOffset) {
        let off = node.plus(NODE_HEADER_SIZE + 4 * level);
        staging.write(off, &target.get().to_le_bytes());
    }

    fn pk_offset(height: usize) -> usize {
        NODE_HEADER_SIZE + 4 * height
    }

    fn pk_bytes<'a>(staging: &'a Arena, node: ArenaOffset, height: usize, pk_width: usize) -> &'a [u8] {
        staging.read(node.plus(Self::pk_offset(height)), pk_width)
    }

    fn payload_offset(height: usize, pk_width: usize) -> usize {
        Self::pk_offset(height) + pk_width
    }

    fn payload_bytes<'a>(
        staging: &'a Arena,
        node: ArenaOffset,
        height: usize,
        pk_width: usize,
        stride: usize,
    ) -> &'a [u8] {
        staging.read(node.plus(Self::payload_offset(height, pk_width)), stride)
    }

    fn lsn_offset(height: usize, pk_width: usize, stride: usize) -> usize {
        Self::payload_offset(height, pk_width) + stride
    }

    fn max_lsn(staging: &Arena, node: ArenaOffset, height: usize, pk_width: usize, stride: usize) -> u64 {
        let off = node.plus(Self::lsn_offset(height, pk_width, stride));
        u64::from_le_bytes(staging.read(off, 8).try_into().unwrap())
    }

    fn set_max_lsn(staging: &mut Arena, node: ArenaOffset, height: usize, pk_width: usize, stride: usize, lsn: u64) {
        let off = node.plus(Self::lsn_offset(height, pk_width, stride));
        staging.write(off, &lsn.to_le_bytes());
    }
}

/// One materialized row as yielded by [`Memtable::cursor_ascending`].
#[derive(Debug, Clone)]
pub struct MemtableRow {
    pub pk: PrimaryKey,
    pub payload: Vec<ColumnValue>,
    pub weight: Weight,
    pub max_lsn: u64,
}

pub struct Memtable {
    schema: Arc<TableSchema>,
    staging: Arena,
    blob: Arena,
    head: [ArenaOffset; MAX_HEIGHT],
    levels_in_use: usize,
    height_source: HeightSource,
    sealed: bool,
    len: usize,
}

impl Memtable {
    pub fn new(schema: Arc<TableSchema>, arena_slab_bytes: usize) -> Self {
        Memtable {
            schema,
            staging: Arena::new(arena_slab_bytes),
            blob: Arena::new(arena_slab_bytes),
            head: [ArenaOffset::NULL; MAX_HEIGHT],
            levels_in_use: 1,
            height_source: HeightSource::new(0x9E37_79B9_7F4A_7C15),
            sealed: false,
            len: 0,
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_occupancy(&self) -> usize {
        self.staging.byte_occupancy() + self.blob.byte_occupancy()
    }

    fn pk_width(&self) -> usize {
        self.schema.pk_variant().byte_width()
    }

    fn stride(&self) -> usize {
        self.schema.payload_stride()
    }

    /// `next` pointer at `level` from `cursor` (or the head, if `cursor` is
    /// null), respecting the node's own height.
    fn next_at(&self, cursor: ArenaOffset, level: usize) -> ArenaOffset {
        if cursor.is_null() {
            self.head[level]
        } else {
            let h = Node::height(&self.staging, cursor);
            if level < h { Node::next(&self.staging, cursor, level) } else { ArenaOffset::NULL }
        }
    }

    fn compare_key(
        &self,
        node: ArenaOffset,
        height: usize,
        pk: PrimaryKey,
        payload: &[u8],
        payload_heap: &[u8],
    ) -> Result<Ordering, SchemaError> {
        let pk_width = self.pk_width();
        let node_pk = PrimaryKey::from_le_bytes(pk.variant(), Node::pk_bytes(&self.staging, node, height, pk_width));
        match node_pk.cmp(&pk) {
            Ordering::Equal => {
                let node_payload = Node::payload_bytes(&self.staging, node, height, pk_width, self.stride());
                self.schema
                    .compare_payload_bytes(node_payload, self.blob.as_slice(), payload, payload_heap)
            }
            other => Ok(other),
        }
    }

    /// Finds predecessors at every level for `(pk, payload)`. Returns the
    /// matching node, if any, and the per-level predecessor chain.
    fn find(
        &self,
        pk: PrimaryKey,
        payload: &[u8],
        payload_heap: &[u8],
    ) -> Result<(Option<ArenaOffset>, [ArenaOffset; MAX_HEIGHT]), SchemaError> {
        let mut preds = [ArenaOffset::NULL; MAX_HEIGHT];
        let mut cursor = ArenaOffset::NULL;
        for level in (0..self.levels_in_use).rev() {
            loop {
                let next = self.next_at(cursor, level);
                if next.is_null() {
                    break;
                }
                let ord = self.compare_key(next, Node::height(&self.staging, next), pk, payload, payload_heap)?;
                if ord == Ordering::Less {
                    cursor = next;
                } else {
                    break;
                }
            }
            preds[level] = cursor;
        }

        let candidate = self.next_at(cursor, 0);
        if !candidate.is_null() {
            let ord = self.compare_key(candidate, Node::height(&self.staging, candidate), pk, payload, payload_heap)?;
            if ord == Ordering::Equal {
                return Ok((Some(candidate), preds));
            }
        }
        Ok((None, preds))
    }

    /// Applies a weight delta to `(pk, payload)`, inserting a new node if
    /// none exists yet. Returns the resulting net weight.
    pub fn upsert(
        &mut self,
        pk: PrimaryKey,
        payload: &[ColumnValue],
        weight_delta: Weight,
        lsn: u64,
    ) -> Result<Weight, MemtableError> {
        if self.sealed {
            return Err(MemtableError::Sealed);
        }

        let schema = self.schema.clone();
        let mut blob_err: Option<ArenaError> = None;
        let packed = schema
            .encode_payload(payload, |bytes| match self.blob.alloc_bytes(bytes, 1) {
                Ok(off) => off.get() as u64,
                Err(e) => {
                    blob_err = Some(e);
                    0
                }
            })
            .map_err(MemtableError::Schema)?;
        if let Some(e) = blob_err {
            return Err(MemtableError::Arena(e));
        }

        let blob_snapshot = self.blob.as_slice().to_vec();
        let (existing, preds) = self.find(pk, &packed, &blob_snapshot)?;

        if let Some(node) = existing {
            let height = Node::height(&self.staging, node);
            let current = Node::weight(&self.staging, node);
            let updated = add_weight(current, weight_delta).map_err(MemtableError::Schema)?;
            Node::set_weight(&mut self.staging, node, updated);
            let pk_width = self.pk_width();
            let stride = self.stride();
            let prev_lsn = Node::max_lsn(&self.staging, node, height, pk_width, stride);
            if lsn > prev_lsn {
                Node::set_max_lsn(&mut self.staging, node, height, pk_width, stride, lsn);
            }
            trace!(pk = ?pk, weight = updated, "memtable upsert: coalesced existing node");
            return Ok(updated);
        }

        let height = self.height_source.next_height();
        let pk_width = self.pk_width();
        let stride = self.stride();
        let size = Node::size(height, pk_width, stride);
        let node = self.staging.alloc(size, 8)?;

        Node::set_weight(&mut self.staging, node, weight_delta);
        self.staging.write(node.plus(8), &[height as u8, 0, 0, 0]);
        for level in 0..height {
            Node::set_next(&mut self.staging, node, level, ArenaOffset::NULL);
        }
        self.staging.write(node.plus(Node::pk_offset(height)), &pk.to_le_bytes_vec());
        self.staging.write(node.plus(Node::payload_offset(height, pk_width)), &packed);
        Node::set_max_lsn(&mut self.staging, node, height, pk_width, stride, lsn);

        if height > self.levels_in_use {
            self.levels_in_use = height;
        }

        for (level, &pred) in preds.iter().enumerate().take(height) {
            if pred.is_null() {
                let old_head = self.head[level];
                Node::set_next(&mut self.staging, node, level, old_head);
                self.head[level] = node;
            } else {
                let old_next = self.next_at(pred, level);
                Node::set_next(&mut self.staging, node, level, old_next);
                Node::set_next(&mut self.staging, pred, level, node);
            }
        }

        self.len += 1;
        trace!(pk = ?pk, weight = weight_delta, "memtable upsert: inserted new node");
        Ok(weight_delta)
    }

    /// Ascending `(pk, payload)` iteration at level 0. Includes zero-weight
    /// nodes; pruning happens at transmutation time.
    pub fn cursor_ascending(&self) -> MemtableCursor<'_> {
        MemtableCursor { table: self, cursor: self.head[0] }
    }

    /// Sums the weight of every node whose `(pk, payload)` matches, under
    /// full-row semantic equality.
    pub fn weight_of(&self, pk: PrimaryKey, payload: &[ColumnValue]) -> Result<Weight, MemtableError> {
        let mut scratch_blob = Vec::new();
        let packed = self
            .schema
            .encode_payload(payload, |bytes| {
                let off = scratch_blob.len() as u64;
                scratch_blob.extend_from_slice(bytes);
                off
            })
            .map_err(MemtableError::Schema)?;

        let mut cursor = ArenaOffset::NULL;
        for level in (0..self.levels_in_use).rev() {
            loop {
                let next = self.next_at(cursor, level);
                if next.is_null() {
                    break;
                }
                let ord = self.compare_key(next, Node::height(&self.staging, next), pk, &packed, &scratch_blob)?;
                match ord {
                    Ordering::Less => cursor = next,
                    Ordering::Equal => return Ok(Node::weight(&self.staging, next)),
                    Ordering::Greater => break,
                }
            }
        }
        Ok(0)
    }
}

pub struct MemtableCursor<'a> {
    table: &'a Memtable,
    cursor: ArenaOffset,
}

impl<'a> Iterator for MemtableCursor<'a> {
    type Item = MemtableRow;

    fn next(&mut self) -> Option<MemtableRow> {
        if self.cursor.is_null() {
            return None;
        }
        let node = self.cursor;
        let height = Node::height(&self.table.staging, node);
        let pk_width = self.table.pk_width();
        let stride = self.table.stride();
        let pk = PrimaryKey::from_le_bytes(
            self.table.schema.pk_variant(),
            Node::pk_bytes(&self.table.staging, node, height, pk_width),
        );
        let payload_bytes = Node::payload_bytes(&self.table.staging, node, height, pk_width, stride);
        let payload = self
            .table
            .schema
            .decode_payload(payload_bytes, self.table.blob.as_slice())
            .expect("memtable payload bytes are always well-formed");
        let weight = Node::weight(&self.table.staging, node);
        let max_lsn = Node::max_lsn(&self.table.staging, node, height, pk_width, stride);

        self.cursor = self.table.next_at(node, 0);

        Some(MemtableRow { pk, payload, weight, max_lsn })
    }
}
