use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::Node;

/// Tag distinguishing tree node pages from anything else on disk
const NODE_MAGIC: u32 = 0x42_54_4E_44;

const HEADER_LEN: usize = 8;

/// Write a node into a page: magic, payload length, bincode payload
pub fn serialize_node<K: Serialize>(node: &Node<K>, page: &mut Page) -> Result<(), BTreeError> {
    let payload =
        bincode::serialize(node).map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    if HEADER_LEN + payload.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    page.data[0..4].copy_from_slice(&NODE_MAGIC.to_le_bytes());
    page.data[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    page.data[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
    Ok(())
}

/// Read a node back out of a page
pub fn deserialize_node<K: DeserializeOwned>(page: &Page) -> Result<Node<K>, BTreeError> {
    let magic = u32::from_le_bytes(page.data[0..4].try_into().unwrap());
    if magic != NODE_MAGIC {
        return Err(BTreeError::InvalidPageFormat);
    }
    let len = u32::from_le_bytes(page.data[4..8].try_into().unwrap()) as usize;
    if HEADER_LEN + len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }

    bincode::deserialize(&page.data[HEADER_LEN..HEADER_LEN + len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))
}
