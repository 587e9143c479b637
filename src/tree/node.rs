//! Tree node model and page serialization
//!
//! Nodes serialize into one page each:
//!
//! ```text
//! inner: | tag=1 (4) | size (4) | keys[N] | children[N+1] (4 each) |
//! leaf:  | tag=2 (4) | size (4) | keys[N] | values[N]              |
//! ```
//!
//! Key and value slots are fixed-width, so field offsets never move and a
//! node deserializes without scanning. `size` is validated on load; a tag
//! or size outside its range means the page is not a tree node.

use crate::storage::page_cache::PageId;
use crate::tree::key::{TreeKey, TreeValue};
use crate::{IndexError, Result};

pub const INNER_TAG: u32 = 1;
pub const LEAF_TAG: u32 = 2;

const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub enum Node<K, V> {
    Inner(InnerNode<K>),
    Leaf(LeafNode<K, V>),
}

#[derive(Debug, Clone)]
pub struct InnerNode<K> {
    pub keys: Vec<K>,
    pub children: Vec<PageId>,
}

#[derive(Debug, Clone)]
pub struct LeafNode<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
}

impl<K: TreeKey, V: TreeValue> Node<K, V> {
    pub fn empty_leaf() -> Self {
        Node::Leaf(LeafNode {
            keys: Vec::new(),
            values: Vec::new(),
        })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Serialize into a page buffer. `fanout` fixes the slot layout.
    pub fn serialize(&self, buf: &mut [u8], fanout: usize) {
        let values_off = HEADER_SIZE + fanout * K::WIDTH;

        match self {
            Node::Inner(inner) => {
                buf[..4].copy_from_slice(&INNER_TAG.to_le_bytes());
                buf[4..8].copy_from_slice(&(inner.keys.len() as u32).to_le_bytes());
                for (i, key) in inner.keys.iter().enumerate() {
                    key.write_to(&mut buf[HEADER_SIZE + i * K::WIDTH..]);
                }
                for (i, child) in inner.children.iter().enumerate() {
                    buf[values_off + i * 4..values_off + i * 4 + 4]
                        .copy_from_slice(&child.to_le_bytes());
                }
            }
            Node::Leaf(leaf) => {
                buf[..4].copy_from_slice(&LEAF_TAG.to_le_bytes());
                buf[4..8].copy_from_slice(&(leaf.keys.len() as u32).to_le_bytes());
                for (i, key) in leaf.keys.iter().enumerate() {
                    key.write_to(&mut buf[HEADER_SIZE + i * K::WIDTH..]);
                }
                for (i, value) in leaf.values.iter().enumerate() {
                    value.write_to(&mut buf[values_off + i * V::WIDTH..]);
                }
            }
        }
    }

    pub fn deserialize(buf: &[u8], fanout: usize, pid: PageId) -> Result<Self> {
        let tag = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let size = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;

        if size > fanout {
            return Err(IndexError::corrupt(format!(
                "node page {} claims {} keys (fanout {})",
                pid, size, fanout
            )));
        }

        let values_off = HEADER_SIZE + fanout * K::WIDTH;
        let mut keys = Vec::with_capacity(size);
        for i in 0..size {
            keys.push(K::read_from(&buf[HEADER_SIZE + i * K::WIDTH..]));
        }

        match tag {
            INNER_TAG => {
                if size == 0 {
                    return Err(IndexError::corrupt(format!(
                        "inner node page {} with no keys",
                        pid
                    )));
                }
                let mut children = Vec::with_capacity(size + 1);
                for i in 0..=size {
                    children.push(PageId::from_le_bytes(
                        buf[values_off + i * 4..values_off + i * 4 + 4]
                            .try_into()
                            .unwrap(),
                    ));
                }
                Ok(Node::Inner(InnerNode { keys, children }))
            }
            LEAF_TAG => {
                let mut values = Vec::with_capacity(size);
                for i in 0..size {
                    values.push(V::read_from(&buf[values_off + i * V::WIDTH..]));
                }
                Ok(Node::Leaf(LeafNode { keys, values }))
            }
            other => Err(IndexError::corrupt(format!(
                "unexpected node tag {} on page {}",
                other, pid
            ))),
        }
    }
}

/// A full node of fanout `N` must fit in one page.
pub fn node_fits<K: TreeKey, V: TreeValue>(fanout: usize, page_size: usize) -> bool {
    let keys = fanout * K::WIDTH;
    let children = (fanout + 1) * 4;
    let values = fanout * V::WIDTH;
    HEADER_SIZE + keys + children.max(values) <= page_size
}
