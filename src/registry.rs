//! Index discovery by name and by id (§3, §4.10 "Index discovery").
//!
//! The registry tree (`REGISTRY_INDEX_ID`) is the only tree whose root is
//! read directly from the data-file header; everything else — including the
//! registry-key-map and fragmented-trash roots — is discovered as an
//! ordinary entry inside the registry tree under a reserved key, so opening
//! a database never needs more than the header's single `root_page_id`.

use std::sync::Arc;

use fathom_btree::{Cursor, Tree};
use fathom_common::{Error, IndexId, PageId, Result};

const TAG_NAME_ENTRY: u8 = 0x01;
const TAG_RESERVED_ROOT: u8 = 0x02;

pub const REGISTRY_KEY_MAP_ROOT_KEY: &[u8] = b"registry_key_map";
pub const FRAGMENTED_TRASH_ROOT_KEY: &[u8] = b"fragmented_trash";

fn name_entry_key(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(TAG_NAME_ENTRY);
    key.extend_from_slice(name);
    key
}

fn reserved_root_key(reserved_name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + reserved_name.len());
    key.push(TAG_RESERVED_ROOT);
    key.extend_from_slice(reserved_name);
    key
}

fn encode_name_entry(index_id: IndexId, root: PageId) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&index_id.to_le_bytes());
    out.extend_from_slice(&root.to_le_bytes());
    out
}

fn decode_name_entry(bytes: &[u8]) -> Result<(IndexId, PageId)> {
    if bytes.len() != 16 {
        return Err(Error::CorruptDatabase("malformed registry entry".into()));
    }
    let index_id = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let root = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    Ok((index_id, root))
}

/// Look up a user index by name, returning its id and root page if present.
pub fn lookup_name(registry: &Arc<Tree>, name: &[u8]) -> Result<Option<(IndexId, PageId)>> {
    let mut cursor = Cursor::new(registry.clone());
    let key = name_entry_key(name);
    if cursor.find(&key)? {
        Ok(Some(decode_name_entry(&cursor.get_value()?)?))
    } else {
        Ok(None)
    }
}

/// Record a newly created index's name/id/root in the registry tree.
pub fn register_name(registry: &Arc<Tree>, name: &[u8], index_id: IndexId, root: PageId) -> Result<()> {
    let mut cursor = Cursor::new(registry.clone());
    let key = name_entry_key(name);
    cursor.find(&key)?;
    cursor.store(Some(&encode_name_entry(index_id, root)))?;
    Ok(())
}

/// The `(key, value)` pair a name entry decodes to — used by the database
/// layer to build the redo record that makes a registry write durable
/// before it is applied, since creating an index is otherwise nothing but
/// an ordinary (untransacted) tree mutation against the registry itself.
pub fn name_entry_record(name: &[u8], index_id: IndexId, root: PageId) -> (Vec<u8>, Vec<u8>) {
    (name_entry_key(name), encode_name_entry(index_id, root))
}

pub fn reserved_root_record(reserved_name: &[u8], root: PageId) -> (Vec<u8>, Vec<u8>) {
    (reserved_root_key(reserved_name), root.to_be_bytes().to_vec())
}

pub fn id_entry_record(index_id: IndexId, name: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (index_id.to_be_bytes().to_vec(), name.to_vec())
}

/// Update a name entry's root page after the underlying tree's root moves
/// (e.g. a root split) without reassigning its id.
pub fn update_root(registry: &Arc<Tree>, name: &[u8], index_id: IndexId, root: PageId) -> Result<()> {
    register_name(registry, name, index_id, root)
}

/// Fetch the persisted root page id for one of the two reserved internal
/// trees (registry-key-map, fragmented-trash), or `None` on a fresh
/// database that has not yet created it.
pub fn lookup_reserved_root(registry: &Arc<Tree>, reserved_name: &[u8]) -> Result<Option<PageId>> {
    let mut cursor = Cursor::new(registry.clone());
    let key = reserved_root_key(reserved_name);
    if cursor.find(&key)? {
        let raw = cursor.get_value()?;
        if raw.len() != 8 {
            return Err(Error::CorruptDatabase("malformed reserved root entry".into()));
        }
        Ok(Some(u64::from_le_bytes(raw.try_into().unwrap())))
    } else {
        Ok(None)
    }
}

pub fn store_reserved_root(registry: &Arc<Tree>, reserved_name: &[u8], root: PageId) -> Result<()> {
    let mut cursor = Cursor::new(registry.clone());
    let key = reserved_root_key(reserved_name);
    cursor.find(&key)?;
    cursor.store(Some(&root.to_be_bytes()))?;
    Ok(())
}

/// Reverse lookup: index id to name, via the registry-key-map tree.
pub fn lookup_id(key_map: &Arc<Tree>, index_id: IndexId) -> Result<Option<Vec<u8>>> {
    let mut cursor = Cursor::new(key_map.clone());
    if cursor.find(&index_id.to_be_bytes())? {
        Ok(Some(cursor.get_value()?))
    } else {
        Ok(None)
    }
}

pub fn register_id(key_map: &Arc<Tree>, index_id: IndexId, name: &[u8]) -> Result<()> {
    let mut cursor = Cursor::new(key_map.clone());
    cursor.find(&index_id.to_be_bytes())?;
    cursor.store(Some(name))?;
    Ok(())
}

/// Highest index id currently present in the registry-key-map, or `None` if
/// it holds no user entries yet. There is no dedicated header field for
/// this counter, so it is recovered by reading the tree's last entry.
pub fn highest_registered_id(key_map: &Arc<Tree>) -> Result<Option<IndexId>> {
    let mut cursor = Cursor::new(key_map.clone());
    cursor.last()?;
    if cursor.is_positioned() {
        let key = cursor.get_key()?;
        if key.len() != 8 {
            return Err(Error::CorruptDatabase("malformed registry-key-map key".into()));
        }
        Ok(Some(u64::from_be_bytes(key.try_into().unwrap())))
    } else {
        Ok(None)
    }
}

/// Highest trash id currently staged in the fragmented-trash tree, or `None`
/// if it is empty. Same rationale as [`highest_registered_id`]: recovered
/// from the tree rather than a persisted counter.
pub fn highest_trash_id(trash: &Arc<Tree>) -> Result<Option<u64>> {
    let mut cursor = Cursor::new(trash.clone());
    cursor.last()?;
    if cursor.is_positioned() {
        let key = cursor.get_key()?;
        if key.len() != 8 {
            return Err(Error::CorruptDatabase("malformed fragmented-trash key".into()));
        }
        Ok(Some(u64::from_be_bytes(key.try_into().unwrap())))
    } else {
        Ok(None)
    }
}
