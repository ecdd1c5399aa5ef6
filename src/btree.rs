//! C6 — B+tree keyed lookup for directory entries, indices, and attribute
//! directories (§3 "B+tree node", §4.6).
//!
//! The tree's header (magic/node-size/key-type/root-offset/free-list-head)
//! lives at node-slot 0 of the backing stream and is read back on every
//! [`BPlusTree::open`]/written on every structural change, so a tree
//! survives being closed and reopened with a different root after a split.
//!
//! Duplicate keys use the tag encoding §6 pins: the top two bits of the
//! stored `i64` are 0 (inline value), 2 (duplicate-node offset) or 3
//! (duplicate-fragment offset, low 10 bits a slot index). The first
//! duplicate lands in a fragment slot (up to 7 values); overflow promotes
//! to a dedicated duplicate-node (up to 125 values, chained via
//! `right_link` on further overflow); shrinking back to 7 or fewer demotes
//! to a fragment again. One simplification versus the original: each
//! fragment node here is dedicated to a single key (always using slot 0)
//! rather than packing up to 8 keys' fragments into a shared node — see
//! DESIGN.md.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::journal::Transaction;
use crate::layout::{BPLUS_TREE_MAGIC, NODE_SIZE};

const NULL_LINK: i64 = -1;

const TAG_INLINE: i64 = 0;
const TAG_DUP_NODE: i64 = 2;
const TAG_DUP_FRAGMENT: i64 = 3;

const FRAGMENT_SLOTS: usize = 8;
const FRAGMENT_SLOT_CAPACITY: usize = 7;
const DUP_NODE_CAPACITY: usize = 125;

const HEADER_KEY_TYPE_STRING: u8 = 0;
const HEADER_KEY_TYPE_INT64: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    String,
    Int64,
}

fn tag_of(value: i64) -> i64 {
    ((value as u64) >> 62) as i64
}

fn encode_tag(tag: i64, payload: i64) -> i64 {
    (((tag as u64) << 62) | (payload as u64)) as i64
}

fn dup_node_offset(value: i64) -> u64 {
    (value & !(0b11 << 62)) as u64
}

fn dup_fragment_offset(value: i64) -> u64 {
    ((value & !(0b11i64 << 62)) >> 10) as u64
}

fn dup_fragment_slot(value: i64) -> usize {
    (value & 0x3ff) as usize
}

fn encode_fragment_payload(node_offset: u64, slot: usize) -> i64 {
    ((node_offset as i64) << 10) | slot as i64
}

/// Byte-for-byte ordering used by every tree: strings compare with a
/// trailing-NUL-insensitive rule ("foo\0" == "foo"), integers compare
/// natively (§4.6 "Key ordering").
pub fn compare_keys(key_type: KeyType, a: &[u8], b: &[u8]) -> Ordering {
    match key_type {
        KeyType::String => {
            let a = a.strip_suffix(&[0u8]).unwrap_or(a);
            let b = b.strip_suffix(&[0u8]).unwrap_or(b);
            a.cmp(b)
        }
        KeyType::Int64 => {
            let a = i64::from_le_bytes(a.try_into().unwrap_or([0; 8]));
            let b = i64::from_le_bytes(b.try_into().unwrap_or([0; 8]));
            a.cmp(&b)
        }
    }
}

/// Abstraction over the tree's backing storage: a node store addressed by
/// byte offset within an inode's data stream, extended on demand in
/// node-size units (§4.6). Implemented by [`InodeNodeStore`] for the real
/// engine and by a plain `Vec` arena in tests.
pub trait NodeStore {
    fn read_node(&self, offset: u64) -> Result<Vec<u8>>;
    fn write_node(&self, offset: u64, data: &[u8]) -> Result<()>;
    fn alloc_node(&self) -> Result<u64>;
    fn free_node(&self, offset: u64) -> Result<()>;
}

struct Node {
    left_link: i64,
    right_link: i64,
    overflow_link: i64,
    keys: Vec<Vec<u8>>,
    values: Vec<i64>,
}

impl Node {
    fn new_leaf() -> Self {
        Node { left_link: NULL_LINK, right_link: NULL_LINK, overflow_link: NULL_LINK, keys: Vec::new(), values: Vec::new() }
    }

    fn is_leaf(&self) -> bool {
        self.overflow_link == NULL_LINK
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NODE_SIZE];
        buf[0..8].copy_from_slice(&self.left_link.to_le_bytes());
        buf[8..16].copy_from_slice(&self.right_link.to_le_bytes());
        buf[16..24].copy_from_slice(&self.overflow_link.to_le_bytes());
        buf[24..26].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        let total_key_bytes: usize = self.keys.iter().map(|k| k.len()).sum();
        buf[26..28].copy_from_slice(&(total_key_bytes as u16).to_le_bytes());

        let mut cursor = 28usize;
        let mut end_offsets = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            buf[cursor..cursor + key.len()].copy_from_slice(key);
            cursor += key.len();
            end_offsets.push(cursor as u16);
        }
        for end in &end_offsets {
            buf[cursor..cursor + 2].copy_from_slice(&end.to_le_bytes());
            cursor += 2;
        }
        for value in &self.values {
            buf[cursor..cursor + 8].copy_from_slice(&value.to_le_bytes());
            cursor += 8;
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 28 {
            return Err(Error::BadData);
        }
        let left_link = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let right_link = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let overflow_link = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        let key_count = u16::from_le_bytes(buf[24..26].try_into().unwrap()) as usize;
        let total_key_bytes = u16::from_le_bytes(buf[26..28].try_into().unwrap()) as usize;

        let mut cursor = 28usize;
        let key_bytes = &buf[cursor..cursor + total_key_bytes];
        cursor += total_key_bytes;
        let mut keys = Vec::with_capacity(key_count);
        let mut prev_end = 0usize;
        for i in 0..key_count {
            let end = u16::from_le_bytes(buf[cursor + i * 2..cursor + i * 2 + 2].try_into().unwrap()) as usize;
            keys.push(key_bytes[prev_end..end].to_vec());
            prev_end = end;
        }
        cursor += key_count * 2;
        let mut values = Vec::with_capacity(key_count);
        for i in 0..key_count {
            let v = i64::from_le_bytes(buf[cursor + i * 8..cursor + i * 8 + 8].try_into().unwrap());
            values.push(v);
        }
        Ok(Node { left_link, right_link, overflow_link, keys, values })
    }

    fn fits(&self, extra_key_len: usize) -> bool {
        let total_key_bytes: usize = self.keys.iter().map(|k| k.len()).sum::<usize>() + extra_key_len;
        let header_size = 28;
        header_size + total_key_bytes + (self.keys.len() + 1) * (2 + 8) < NODE_SIZE
    }
}

/// Whether a node holding exactly `keys` (one value per key, plus the
/// trailing overflow link) would still pack under [`NODE_SIZE`].
fn node_fits_keys(keys: &[Vec<u8>]) -> bool {
    let total_key_bytes: usize = keys.iter().map(|k| k.len()).sum();
    let header_size = 28;
    header_size + total_key_bytes + keys.len() * (2 + 8) < NODE_SIZE
}

/// A dedicated node holding up to [`DUP_NODE_CAPACITY`] duplicate values
/// plus a link to the next node in the chain once this one fills (§4.6
/// "Duplicate handling").
struct DupNode {
    right_link: i64,
    values: Vec<i64>,
}

impl DupNode {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NODE_SIZE];
        buf[0..8].copy_from_slice(&self.right_link.to_le_bytes());
        buf[8..10].copy_from_slice(&(self.values.len() as u16).to_le_bytes());
        let mut cursor = 10usize;
        for v in &self.values {
            buf[cursor..cursor + 8].copy_from_slice(&v.to_le_bytes());
            cursor += 8;
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::BadData);
        }
        let right_link = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let count = u16::from_le_bytes(buf[8..10].try_into().unwrap()) as usize;
        let mut values = Vec::with_capacity(count);
        let mut cursor = 10usize;
        for _ in 0..count {
            values.push(i64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap()));
            cursor += 8;
        }
        Ok(DupNode { right_link, values })
    }
}

/// A fragment node packs [`FRAGMENT_SLOTS`] independent slots of up to
/// [`FRAGMENT_SLOT_CAPACITY`] values each (§4.6 "Duplicate handling"); each
/// slot's first word is its value count. This implementation dedicates a
/// whole fragment node to a single key's slot 0 rather than sharing the
/// node's other slots across unrelated keys.
fn encode_fragment_node(slots: &[[i64; 8]; FRAGMENT_SLOTS]) -> Vec<u8> {
    let mut buf = vec![0u8; NODE_SIZE];
    for (i, slot) in slots.iter().enumerate() {
        let base = i * 64;
        for (j, word) in slot.iter().enumerate() {
            buf[base + j * 8..base + j * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
    }
    buf
}

fn decode_fragment_node(buf: &[u8]) -> Result<[[i64; 8]; FRAGMENT_SLOTS]> {
    if buf.len() < FRAGMENT_SLOTS * 64 {
        return Err(Error::BadData);
    }
    let mut slots = [[0i64; 8]; FRAGMENT_SLOTS];
    for (i, slot) in slots.iter_mut().enumerate() {
        let base = i * 64;
        for (j, word) in slot.iter_mut().enumerate() {
            *word = i64::from_le_bytes(buf[base + j * 8..base + j * 8 + 8].try_into().unwrap());
        }
    }
    Ok(slots)
}

/// The persisted tree header, a specially-shaped record at node-slot 0
/// (§4.6): magic, node-size, key-type, root-offset, free-list-head.
struct TreeHeader {
    node_size: u32,
    key_type: u8,
    allow_duplicates: u8,
    root_offset: u64,
    free_list_head: i64,
}

impl TreeHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NODE_SIZE];
        buf[0..4].copy_from_slice(&BPLUS_TREE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.node_size.to_le_bytes());
        buf[8] = self.key_type;
        buf[9] = self.allow_duplicates;
        buf[16..24].copy_from_slice(&self.root_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.free_list_head.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 32 {
            return Err(Error::BadData);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != BPLUS_TREE_MAGIC {
            return Err(Error::BadData);
        }
        let node_size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let key_type = buf[8];
        let allow_duplicates = buf[9];
        let root_offset = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let free_list_head = i64::from_le_bytes(buf[24..32].try_into().unwrap());
        Ok(TreeHeader { node_size, key_type, allow_duplicates, root_offset, free_list_head })
    }
}

fn key_type_tag(key_type: KeyType) -> u8 {
    match key_type {
        KeyType::String => HEADER_KEY_TYPE_STRING,
        KeyType::Int64 => HEADER_KEY_TYPE_INT64,
    }
}

/// Reads the persisted `(root-offset, free-list-head)` pair straight out of
/// a node store, for callers that already have one (§4.6 "Header").
pub fn read_header(store: &dyn NodeStore) -> Result<(u64, i64)> {
    let header = TreeHeader::decode(&store.read_node(0)?)?;
    Ok((header.root_offset, header.free_list_head))
}

/// Reads the header directly out of an inode's data stream, before the
/// [`NodeStore`] wrapping it has been constructed — `InodeNodeStore` needs
/// the free-list head to start from and `BPlusTree::open` needs the root
/// offset to descend from, and both need them before either object exists
/// (§4.6 "Header").
pub fn read_header_from_inode(tx: &Transaction<'_>, allocator: &crate::alloc::Allocator, inode: &crate::inode::Inode) -> Result<(u64, i64)> {
    let mut buf = vec![0u8; NODE_SIZE];
    inode.read_at(tx.cache_ref(), allocator, 0, &mut buf)?;
    let header = TreeHeader::decode(&buf)?;
    Ok((header.root_offset, header.free_list_head))
}

/// Persists the header back (§4.6 "Header"); called after any operation
/// that may have changed the root offset or the free-list head.
pub fn write_header(store: &dyn NodeStore, key_type: KeyType, allow_duplicates: bool, root_offset: u64, free_list_head: i64) -> Result<()> {
    let header = TreeHeader {
        node_size: NODE_SIZE as u32,
        key_type: key_type_tag(key_type),
        allow_duplicates: allow_duplicates as u8,
        root_offset,
        free_list_head,
    };
    store.write_node(0, &header.encode())
}

pub struct BPlusTree<'s> {
    store: &'s dyn NodeStore,
    key_type: KeyType,
    allow_duplicates: bool,
    root: u64,
    free_list: i64,
}

impl<'s> BPlusTree<'s> {
    /// Creates a fresh, empty tree: a header at node-slot 0 followed by one
    /// leaf root at node-slot 1.
    pub fn create(store: &'s dyn NodeStore, key_type: KeyType, allow_duplicates: bool) -> Result<Self> {
        let header_slot = store.alloc_node()?;
        let root = store.alloc_node()?;
        debug_assert_eq!(header_slot, 0, "the B+tree header must be the first node allocated in a fresh stream");
        store.write_node(root, &Node::new_leaf().encode())?;
        write_header(store, key_type, allow_duplicates, root, NULL_LINK)?;
        Ok(BPlusTree { store, key_type, allow_duplicates, root, free_list: NULL_LINK })
    }

    pub fn open(store: &'s dyn NodeStore, key_type: KeyType, allow_duplicates: bool, root: u64) -> Self {
        BPlusTree { store, key_type, allow_duplicates, root, free_list: NULL_LINK }
    }

    pub fn root_offset(&self) -> u64 {
        self.root
    }

    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        compare_keys(self.key_type, a, b)
    }

    /// Descends from the root to the leaf that would contain `key`,
    /// returning the path of (node-offset, node) pairs, leaf last
    /// (§4.6 "Descent").
    fn seek_down(&self, key: &[u8]) -> Result<Vec<(u64, Node)>> {
        let mut path = Vec::new();
        let mut offset = self.root;
        loop {
            let node = Node::decode(&self.store.read_node(offset)?)?;
            let leaf = node.is_leaf();
            // A separator equals the smallest key of the child to its
            // right (that's what a split naturally produces), so an exact
            // match on a separator must route right, not left: count
            // separators <= key, not < key.
            let idx = node.keys.partition_point(|k| self.cmp(k, key) != Ordering::Greater);
            let descend_to = if leaf {
                None
            } else if idx < node.values.len() {
                Some(node.values[idx] as u64)
            } else {
                Some(node.overflow_link as u64)
            };
            path.push((offset, node));
            match descend_to {
                Some(child) => offset = child,
                None => return Ok(path),
            }
        }
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<i64>>> {
        let path = self.seek_down(key)?;
        let (_, leaf) = path.last().ok_or(Error::BadData)?;
        let idx = leaf.keys.iter().position(|k| self.cmp(k, key) == Ordering::Equal);
        let Some(idx) = idx else { return Ok(None) };
        Ok(Some(self.resolve_values(leaf.values[idx])?))
    }

    fn resolve_values(&self, raw: i64) -> Result<Vec<i64>> {
        match tag_of(raw) {
            TAG_INLINE => Ok(vec![raw]),
            TAG_DUP_FRAGMENT => {
                let node_offset = dup_fragment_offset(raw);
                let slot_index = dup_fragment_slot(raw);
                let slots = decode_fragment_node(&self.store.read_node(node_offset)?)?;
                let count = slots[slot_index][0] as usize;
                Ok(slots[slot_index][1..1 + count].to_vec())
            }
            TAG_DUP_NODE => {
                let mut values = Vec::new();
                let mut offset = dup_node_offset(raw);
                loop {
                    let node = DupNode::decode(&self.store.read_node(offset)?)?;
                    values.extend(node.values.iter().copied());
                    if node.right_link == NULL_LINK {
                        break;
                    }
                    offset = node.right_link as u64;
                }
                Ok(values)
            }
            _ => Err(Error::BadData),
        }
    }

    /// Inserts `(key, value)`. Non-duplicate trees reject an existing key
    /// with `NameInUse`; duplicate-permitting trees append to the chain
    /// (§4.6 "Insert").
    pub fn insert(&mut self, _tx: &Transaction<'_>, key: &[u8], value: i64) -> Result<()> {
        let mut path = self.seek_down(key)?;
        let (leaf_offset, mut leaf) = path.pop().ok_or(Error::BadData)?;
        let existing = leaf.keys.iter().position(|k| self.cmp(k, key) == Ordering::Equal);

        if let Some(idx) = existing {
            if !self.allow_duplicates {
                return Err(Error::NameInUse);
            }
            let new_tag = self.append_duplicate(leaf.values[idx], value)?;
            leaf.values[idx] = new_tag;
            self.store.write_node(leaf_offset, &leaf.encode())?;
            return Ok(());
        }

        if leaf.fits(key.len()) {
            let idx = leaf.keys.partition_point(|k| self.cmp(k, key) == Ordering::Less);
            leaf.keys.insert(idx, key.to_vec());
            leaf.values.insert(idx, value);
            self.store.write_node(leaf_offset, &leaf.encode())?;
            return Ok(());
        }

        self.split_and_insert(path, leaf_offset, leaf, key.to_vec(), value)
    }

    /// Appends `value` to the duplicate chain currently tagged as
    /// `current` (§4.6 "Duplicate handling"): first duplicate opens a
    /// fragment slot, overflow past 7 promotes to a duplicate-node,
    /// overflow past 125 chains a new duplicate-node to the right.
    fn append_duplicate(&self, current: i64, value: i64) -> Result<i64> {
        match tag_of(current) {
            TAG_INLINE => {
                let node_offset = self.store.alloc_node()?;
                let mut slots = [[0i64; 8]; FRAGMENT_SLOTS];
                slots[0][0] = 2;
                slots[0][1] = current;
                slots[0][2] = value;
                self.store.write_node(node_offset, &encode_fragment_node(&slots))?;
                Ok(encode_tag(TAG_DUP_FRAGMENT, encode_fragment_payload(node_offset, 0)))
            }
            TAG_DUP_FRAGMENT => {
                let node_offset = dup_fragment_offset(current);
                let slot_index = dup_fragment_slot(current);
                let mut slots = decode_fragment_node(&self.store.read_node(node_offset)?)?;
                let count = slots[slot_index][0] as usize;
                if count < FRAGMENT_SLOT_CAPACITY {
                    slots[slot_index][1 + count] = value;
                    slots[slot_index][0] = (count + 1) as i64;
                    self.store.write_node(node_offset, &encode_fragment_node(&slots))?;
                    return Ok(current);
                }
                let mut values: Vec<i64> = slots[slot_index][1..1 + count].to_vec();
                values.push(value);
                self.store.free_node(node_offset)?;
                let dup_offset = self.store.alloc_node()?;
                let dup = DupNode { right_link: NULL_LINK, values };
                self.store.write_node(dup_offset, &dup.encode())?;
                Ok(encode_tag(TAG_DUP_NODE, dup_offset as i64))
            }
            TAG_DUP_NODE => {
                let mut offset = dup_node_offset(current);
                loop {
                    let mut node = DupNode::decode(&self.store.read_node(offset)?)?;
                    if node.values.len() < DUP_NODE_CAPACITY {
                        node.values.push(value);
                        self.store.write_node(offset, &node.encode())?;
                        return Ok(current);
                    }
                    if node.right_link == NULL_LINK {
                        let next = self.store.alloc_node()?;
                        node.right_link = next as i64;
                        self.store.write_node(offset, &node.encode())?;
                        let new_node = DupNode { right_link: NULL_LINK, values: vec![value] };
                        self.store.write_node(next, &new_node.encode())?;
                        return Ok(current);
                    }
                    offset = node.right_link as u64;
                }
            }
            _ => Err(Error::BadData),
        }
    }

    fn split_and_insert(&mut self, mut path: Vec<(u64, Node)>, leaf_offset: u64, mut leaf: Node, key: Vec<u8>, value: i64) -> Result<()> {
        let idx = leaf.keys.partition_point(|k| self.cmp(k, &key) == Ordering::Less);
        leaf.keys.insert(idx, key);
        leaf.values.insert(idx, value);

        let mid = leaf.keys.len() / 2;
        let right_keys = leaf.keys.split_off(mid);
        let right_values = leaf.values.split_off(mid);
        let separator = right_keys[0].clone();

        let right_offset = self.store.alloc_node()?;
        let mut right = Node { left_link: leaf_offset as i64, right_link: leaf.right_link, overflow_link: NULL_LINK, keys: right_keys, values: right_values };
        if right.right_link != NULL_LINK {
            let mut sibling = Node::decode(&self.store.read_node(right.right_link as u64)?)?;
            sibling.left_link = right_offset as i64;
            self.store.write_node(right.right_link as u64, &sibling.encode())?;
        }
        leaf.right_link = right_offset as i64;
        self.store.write_node(leaf_offset, &leaf.encode())?;
        self.store.write_node(right_offset, &right.encode())?;
        let _ = &mut right;

        self.bubble_up(path.as_mut(), leaf_offset, right_offset, separator)?;
        write_header(self.store, self.key_type, self.allow_duplicates, self.root, self.free_list)
    }

    /// Inserts `separator` into the parent of the node that just split
    /// into `left_offset`/`right_offset` (`separator` is `right_offset`'s
    /// minimum key). If the parent has no room, it splits too and the
    /// middle key is promoted further up, recursively; if there is no
    /// parent, a fresh root is allocated, bumping the tree's height
    /// (§4.6 "Insert" — root split).
    fn bubble_up(&mut self, path: &mut [(u64, Node)], left_offset: u64, right_offset: u64, separator: Vec<u8>) -> Result<()> {
        let Some(((parent_offset, parent), rest)) = path.split_last_mut() else {
            let new_root = self.store.alloc_node()?;
            let root_node = Node {
                left_link: NULL_LINK,
                right_link: NULL_LINK,
                overflow_link: right_offset as i64,
                keys: vec![separator],
                values: vec![left_offset as i64],
            };
            self.store.write_node(new_root, &root_node.encode())?;
            self.root = new_root;
            return Ok(());
        };
        let parent_offset = *parent_offset;

        // Children are `values` followed by `overflow_link`: k keys address
        // k+1 children. `left_offset` is one of those k+1; `right_offset`
        // is inserted immediately after it.
        let pos = parent.values.iter().position(|&v| v == left_offset as i64);
        let mut keys = parent.keys.clone();
        let mut children: Vec<i64> = parent.values.clone();
        children.push(parent.overflow_link);
        match pos {
            Some(p) => {
                keys.insert(p, separator);
                children.insert(p + 1, right_offset as i64);
            }
            None => {
                debug_assert_eq!(parent.overflow_link, left_offset as i64);
                keys.push(separator);
                children.push(right_offset as i64);
            }
        }

        if node_fits_keys(&keys) {
            let new_overflow = children.pop().unwrap();
            parent.keys = keys;
            parent.values = children;
            parent.overflow_link = new_overflow;
            self.store.write_node(parent_offset, &parent.encode())?;
            return Ok(());
        }

        let mid = keys.len() / 2;
        let promoted = keys[mid].clone();
        let left_keys = keys[..mid].to_vec();
        let right_keys = keys[mid + 1..].to_vec();
        let mut left_children = children[..=mid].to_vec();
        let mut right_children = children[mid + 1..].to_vec();
        let left_overflow = left_children.pop().unwrap();
        let right_overflow = right_children.pop().unwrap();

        let old_right_link = parent.right_link;
        let new_node_offset = self.store.alloc_node()?;
        let new_right = Node { left_link: parent_offset as i64, right_link: old_right_link, overflow_link: right_overflow, keys: right_keys, values: right_children };
        if old_right_link != NULL_LINK {
            let mut sibling = Node::decode(&self.store.read_node(old_right_link as u64)?)?;
            sibling.left_link = new_node_offset as i64;
            self.store.write_node(old_right_link as u64, &sibling.encode())?;
        }

        parent.keys = left_keys;
        parent.values = left_children;
        parent.overflow_link = left_overflow;
        parent.right_link = new_node_offset as i64;
        self.store.write_node(parent_offset, &parent.encode())?;
        self.store.write_node(new_node_offset, &new_right.encode())?;

        self.bubble_up(rest, parent_offset, new_node_offset, promoted)
    }

    /// Removes `(key, value)`. For a duplicate tree, removes only the
    /// matching value from the chain (§4.6 "Delete").
    pub fn remove(&mut self, _tx: &Transaction<'_>, key: &[u8], value: i64) -> Result<()> {
        let mut path = self.seek_down(key)?;
        let (leaf_offset, mut leaf) = path.pop().ok_or(Error::BadData)?;
        let idx = leaf.keys.iter().position(|k| self.cmp(k, key) == Ordering::Equal).ok_or(Error::EntryNotFound)?;

        if tag_of(leaf.values[idx]) != TAG_INLINE {
            let remaining = self.remove_duplicate(leaf.values[idx], value)?;
            match remaining {
                Some(v) => leaf.values[idx] = v,
                None => {
                    leaf.keys.remove(idx);
                    leaf.values.remove(idx);
                }
            }
        } else {
            if leaf.values[idx] != value {
                return Err(Error::EntryNotFound);
            }
            leaf.keys.remove(idx);
            leaf.values.remove(idx);
        }

        self.store.write_node(leaf_offset, &leaf.encode())?;
        if leaf.keys.is_empty() && leaf_offset != self.root {
            self.unlink_empty_leaf(leaf_offset, &leaf)?;
        } else if leaf.keys.is_empty() && leaf_offset == self.root {
            // Collapse to an empty root leaf; nothing further to do since
            // the root is already a leaf with zero keys.
        }
        write_header(self.store, self.key_type, self.allow_duplicates, self.root, self.free_list)
    }

    /// Removes `value` from the duplicate chain tagged `current`, demoting
    /// a duplicate-node back to a fragment once it shrinks to 7 or fewer
    /// values (§4.6 "Demotion").
    fn remove_duplicate(&self, current: i64, value: i64) -> Result<Option<i64>> {
        match tag_of(current) {
            TAG_DUP_FRAGMENT => {
                let node_offset = dup_fragment_offset(current);
                let slot_index = dup_fragment_slot(current);
                let mut slots = decode_fragment_node(&self.store.read_node(node_offset)?)?;
                let count = slots[slot_index][0] as usize;
                let mut values = slots[slot_index][1..1 + count].to_vec();
                let pos = values.iter().position(|&v| v == value).ok_or(Error::EntryNotFound)?;
                values.remove(pos);

                if values.len() <= 1 {
                    self.store.free_node(node_offset)?;
                    return Ok(values.first().copied());
                }
                slots[slot_index] = [0i64; 8];
                slots[slot_index][0] = values.len() as i64;
                for (i, v) in values.iter().enumerate() {
                    slots[slot_index][1 + i] = *v;
                }
                self.store.write_node(node_offset, &encode_fragment_node(&slots))?;
                Ok(Some(current))
            }
            TAG_DUP_NODE => {
                let mut offsets = Vec::new();
                let mut offset = dup_node_offset(current);
                loop {
                    offsets.push(offset);
                    let node = DupNode::decode(&self.store.read_node(offset)?)?;
                    if node.right_link == NULL_LINK {
                        break;
                    }
                    offset = node.right_link as u64;
                }
                let mut all_values = Vec::new();
                for &o in &offsets {
                    all_values.extend(DupNode::decode(&self.store.read_node(o)?)?.values);
                }
                let pos = all_values.iter().position(|&v| v == value).ok_or(Error::EntryNotFound)?;
                all_values.remove(pos);

                if all_values.len() <= 1 {
                    for &o in &offsets {
                        self.store.free_node(o)?;
                    }
                    return Ok(all_values.first().copied());
                }
                if all_values.len() <= FRAGMENT_SLOT_CAPACITY {
                    for &o in offsets.iter().skip(1) {
                        self.store.free_node(o)?;
                    }
                    let frag_offset = offsets[0];
                    let mut slots = [[0i64; 8]; FRAGMENT_SLOTS];
                    slots[0][0] = all_values.len() as i64;
                    for (i, v) in all_values.iter().enumerate() {
                        slots[0][1 + i] = *v;
                    }
                    self.store.write_node(frag_offset, &encode_fragment_node(&slots))?;
                    return Ok(Some(encode_tag(TAG_DUP_FRAGMENT, encode_fragment_payload(frag_offset, 0))));
                }

                let chunks: Vec<Vec<i64>> = all_values.chunks(DUP_NODE_CAPACITY).map(|c| c.to_vec()).collect();
                for (i, chunk) in chunks.iter().enumerate() {
                    let offset = if i < offsets.len() { offsets[i] } else { self.store.alloc_node()? };
                    let right_link = if i + 1 < chunks.len() {
                        if i + 1 < offsets.len() { offsets[i + 1] as i64 } else { self.store.alloc_node()? as i64 }
                    } else {
                        NULL_LINK
                    };
                    let node = DupNode { right_link, values: chunk.clone() };
                    self.store.write_node(offset, &node.encode())?;
                }
                for &o in offsets.iter().skip(chunks.len()) {
                    self.store.free_node(o)?;
                }
                Ok(Some(current))
            }
            _ => Err(Error::BadData),
        }
    }

    fn unlink_empty_leaf(&self, offset: u64, leaf: &Node) -> Result<()> {
        if leaf.left_link != NULL_LINK {
            let mut left = Node::decode(&self.store.read_node(leaf.left_link as u64)?)?;
            left.right_link = leaf.right_link;
            self.store.write_node(leaf.left_link as u64, &left.encode())?;
        }
        if leaf.right_link != NULL_LINK {
            let mut right = Node::decode(&self.store.read_node(leaf.right_link as u64)?)?;
            right.left_link = leaf.left_link;
            self.store.write_node(leaf.right_link as u64, &right.encode())?;
        }
        self.store.free_node(offset)
    }

    /// Ascending iteration starting at the leftmost leaf (or from `start`,
    /// if given) (§4.6 "Iterators" — a simplified, non-live version: this
    /// crate does not keep a registry of iterators to patch on concurrent
    /// mutation, see DESIGN.md).
    pub fn iter_all(&self) -> Result<Vec<(Vec<u8>, i64)>> {
        let mut offset = self.leftmost_leaf()?;
        let mut out = Vec::new();
        loop {
            let node = Node::decode(&self.store.read_node(offset)?)?;
            for (k, &v) in node.keys.iter().zip(node.values.iter()) {
                for value in self.resolve_values(v)? {
                    out.push((k.clone(), value));
                }
            }
            if node.right_link == NULL_LINK {
                break;
            }
            offset = node.right_link as u64;
        }
        Ok(out)
    }

    fn leftmost_leaf(&self) -> Result<u64> {
        let mut offset = self.root;
        loop {
            let node = Node::decode(&self.store.read_node(offset)?)?;
            if node.is_leaf() {
                return Ok(offset);
            }
            offset = node.values.first().copied().unwrap_or(node.overflow_link) as u64;
        }
    }

    /// Recursively validates link consistency, key ordering, and
    /// duplicate-chain integrity (§4.6 "Integrity check"). Returns the set
    /// of block offsets visited, for the checker's shadow-bitmap cross-check.
    pub fn validate(&self) -> Result<Vec<u64>> {
        let mut visited = Vec::new();
        self.validate_node(self.root, None, None, &mut visited)?;
        Ok(visited)
    }

    fn validate_node(&self, offset: u64, lower: Option<&[u8]>, upper: Option<&[u8]>, visited: &mut Vec<u64>) -> Result<()> {
        if visited.contains(&offset) {
            return Err(Error::BadData);
        }
        visited.push(offset);
        let node = Node::decode(&self.store.read_node(offset)?)?;
        for w in node.keys.windows(2) {
            if self.cmp(&w[0], &w[1]) != Ordering::Less {
                return Err(Error::BadData);
            }
        }
        if let Some(lower) = lower {
            if let Some(first) = node.keys.first() {
                if self.cmp(first, lower) == Ordering::Less {
                    return Err(Error::BadData);
                }
            }
        }
        if let Some(upper) = upper {
            if let Some(last) = node.keys.last() {
                if self.cmp(last, upper) != Ordering::Less {
                    return Err(Error::BadData);
                }
            }
        }
        if !node.is_leaf() {
            let mut prev_key: Option<&[u8]> = lower;
            for (i, &child) in node.values.iter().enumerate() {
                let next_key = node.keys.get(i).map(|k| k.as_slice());
                self.validate_node(child as u64, prev_key, next_key, visited)?;
                prev_key = next_key;
            }
            self.validate_node(node.overflow_link as u64, prev_key, upper, visited)?;
        }
        Ok(())
    }
}

/// Adapts an inode's data stream into a [`NodeStore`], extending the stream
/// one [`NODE_SIZE`] unit at a time and threading a simple intrusive free
/// list through freed nodes' first 8 bytes (§4.6 "backing storage").
pub struct InodeNodeStore<'t> {
    tx: &'t Transaction<'t>,
    allocator: &'t crate::alloc::Allocator,
    inode: std::cell::RefCell<crate::inode::Inode>,
    free_head: std::cell::Cell<i64>,
}

impl<'t> InodeNodeStore<'t> {
    pub fn new(tx: &'t Transaction<'t>, allocator: &'t crate::alloc::Allocator, inode: crate::inode::Inode, free_head: i64) -> Self {
        InodeNodeStore { tx, allocator, inode: std::cell::RefCell::new(inode), free_head: std::cell::Cell::new(free_head) }
    }

    pub fn free_head(&self) -> i64 {
        self.free_head.get()
    }
}

impl<'t> NodeStore for InodeNodeStore<'t> {
    fn read_node(&self, offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; NODE_SIZE];
        let inode = self.inode.borrow();
        inode.read_at(self.tx.cache_ref(), self.allocator, offset * NODE_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    fn write_node(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inode = self.inode.borrow_mut();
        inode.write_at(self.tx, self.allocator, offset * NODE_SIZE as u64, data)?;
        Ok(())
    }

    fn alloc_node(&self) -> Result<u64> {
        if self.free_head.get() != NULL_LINK {
            let offset = self.free_head.get() as u64;
            let buf = self.read_node(offset)?;
            let next = i64::from_le_bytes(buf[0..8].try_into().unwrap());
            self.free_head.set(next);
            return Ok(offset);
        }
        let mut inode = self.inode.borrow_mut();
        let size = inode.header().size;
        let offset = size / NODE_SIZE as u64;
        inode.set_file_size(self.tx, self.allocator, size + NODE_SIZE as u64)?;
        Ok(offset)
    }

    fn free_node(&self, offset: u64) -> Result<()> {
        let mut buf = vec![0u8; NODE_SIZE];
        buf[0..8].copy_from_slice(&self.free_head.get().to_le_bytes());
        let mut inode = self.inode.borrow_mut();
        inode.write_at(self.tx, self.allocator, offset * NODE_SIZE as u64, &buf)?;
        self.free_head.set(offset as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ArenaStore {
        nodes: RefCell<Vec<Option<Vec<u8>>>>,
    }

    impl ArenaStore {
        fn new() -> Self {
            ArenaStore { nodes: RefCell::new(Vec::new()) }
        }
    }

    impl NodeStore for ArenaStore {
        fn read_node(&self, offset: u64) -> Result<Vec<u8>> {
            self.nodes.borrow().get(offset as usize).and_then(|n| n.clone()).ok_or(Error::BadData)
        }
        fn write_node(&self, offset: u64, data: &[u8]) -> Result<()> {
            let mut nodes = self.nodes.borrow_mut();
            if offset as usize >= nodes.len() {
                nodes.resize(offset as usize + 1, None);
            }
            nodes[offset as usize] = Some(data.to_vec());
            Ok(())
        }
        fn alloc_node(&self) -> Result<u64> {
            let mut nodes = self.nodes.borrow_mut();
            nodes.push(Some(vec![0u8; NODE_SIZE]));
            Ok(nodes.len() as u64 - 1)
        }
        fn free_node(&self, offset: u64) -> Result<()> {
            self.nodes.borrow_mut()[offset as usize] = None;
            Ok(())
        }
    }

    fn fake_tx() -> (crate::cache::BlockCache, crate::journal::Journal) {
        let device = std::sync::Arc::new(crate::device::MemBlockDevice::new(512, 64));
        (crate::cache::BlockCache::new(device), crate::journal::Journal::new(1, 16, 0, 0))
    }

    #[test]
    fn insert_and_find_string_keys() {
        let store = ArenaStore::new();
        let mut tree = BPlusTree::create(&store, KeyType::String, false).unwrap();
        let (cache, journal) = fake_tx();
        let tx = journal.start(&cache).unwrap();
        for (i, name) in ["banana", "apple", "cherry"].iter().enumerate() {
            tree.insert(&tx, name.as_bytes(), i as i64).unwrap();
        }
        tx.done().unwrap();

        assert_eq!(tree.find(b"apple").unwrap(), Some(vec![1]));
        assert_eq!(tree.find(b"missing").unwrap(), None);
        let all = tree.iter_all().unwrap();
        let names: Vec<_> = all.iter().map(|(k, _)| String::from_utf8(k.clone()).unwrap()).collect();
        assert_eq!(names, vec!["apple", "banana", "cherry"]);
    }

    #[test]
    fn duplicate_keys_accumulate_and_shrink() {
        let store = ArenaStore::new();
        let mut tree = BPlusTree::create(&store, KeyType::String, true).unwrap();
        let (cache, journal) = fake_tx();
        let tx = journal.start(&cache).unwrap();
        for i in 0..10 {
            tree.insert(&tx, b"tag", i).unwrap();
        }
        tx.done().unwrap();
        let values = tree.find(b"tag").unwrap().unwrap();
        assert_eq!(values.len(), 10);

        let tx = journal.start(&cache).unwrap();
        for i in 0..9 {
            tree.remove(&tx, b"tag", i).unwrap();
        }
        tx.done().unwrap();
        assert_eq!(tree.find(b"tag").unwrap().unwrap(), vec![9]);
    }

    /// Exercises every duplicate-chain transition named in §4.6: inline →
    /// fragment (first duplicate) → duplicate-node (past 7) → chained
    /// duplicate-node (past 125) → demoted back to a fragment.
    #[test]
    fn duplicate_chain_crosses_fragment_node_and_chain_boundaries() {
        let store = ArenaStore::new();
        let mut tree = BPlusTree::create(&store, KeyType::String, true).unwrap();
        let (cache, journal) = fake_tx();

        let tx = journal.start(&cache).unwrap();
        for i in 0..200i64 {
            tree.insert(&tx, b"dup", i).unwrap();
        }
        tx.done().unwrap();
        let mut values = tree.find(b"dup").unwrap().unwrap();
        values.sort_unstable();
        assert_eq!(values, (0..200).collect::<Vec<_>>());

        let tx = journal.start(&cache).unwrap();
        for i in 0..195i64 {
            tree.remove(&tx, b"dup", i).unwrap();
        }
        tx.done().unwrap();
        let mut remaining = tree.find(b"dup").unwrap().unwrap();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![195, 196, 197, 198, 199]);
    }

    #[test]
    fn split_keeps_keys_sorted() {
        let store = ArenaStore::new();
        let mut tree = BPlusTree::create(&store, KeyType::Int64, false).unwrap();
        let (cache, journal) = fake_tx();
        let tx = journal.start(&cache).unwrap();
        for i in 0..200i64 {
            tree.insert(&tx, &i.to_le_bytes(), i).unwrap();
        }
        tx.done().unwrap();
        tree.validate().unwrap();
        let all = tree.iter_all().unwrap();
        assert_eq!(all.len(), 200);
        for w in all.windows(2) {
            assert!(compare_keys(KeyType::Int64, &w[0].0, &w[1].0) == Ordering::Less);
        }
    }

    /// After enough inserts split the root, reopening the tree at the
    /// header's persisted root offset (not the original node-slot 1) must
    /// still find every key (§4.6 "Header").
    #[test]
    fn reopening_after_a_root_split_uses_the_persisted_root_offset() {
        let store = ArenaStore::new();
        let (cache, journal) = fake_tx();
        {
            let mut tree = BPlusTree::create(&store, KeyType::Int64, false).unwrap();
            let tx = journal.start(&cache).unwrap();
            for i in 0..200i64 {
                tree.insert(&tx, &i.to_le_bytes(), i).unwrap();
            }
            tx.done().unwrap();
            assert_ne!(tree.root_offset(), 1, "200 int64 entries must have split the root at least once");
        }

        let (root, free_list_head) = read_header(&store).unwrap();
        assert_eq!(free_list_head, NULL_LINK);
        let reopened = BPlusTree::open(&store, KeyType::Int64, false, root);
        for i in 0..200i64 {
            assert_eq!(reopened.find(&i.to_le_bytes()).unwrap(), Some(vec![i]));
        }
    }
}
