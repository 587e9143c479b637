//! Multi-versioned copy-on-write B+tree over the page cache
//!
//! Every mutation batch runs inside a [`Transaction`]: the transaction
//! snapshots the current root, and any node touched on the way down is
//! cloned onto a fresh page owned by the transaction. Commit writes the new
//! nodes, double-writes the meta page and publishes the new root; readers
//! keep traversing their own `(version, root)` snapshot untouched. There
//! are no parent pointers — ancestry is the recursion path.
//!
//! Duplicate keys are allowed and keep insertion order (stable upper-bound
//! insert). Published node pages are immutable; only pages allocated by an
//! uncommitted transaction are ever written.
//!
//! Meta page (page 0):
//!
//! ```text
//! | magic 0x00C0FFEE (4) | version (4) root (4) crc32 (4) | version root crc |
//! ```
//!
//! The two slots alternate on every commit. Recovery takes the valid slot
//! with the highest version, so a torn meta write falls back to the
//! previous root.

use crate::storage::page_cache::{Page, PageCache, PageId};
use crate::tree::key::{TreeKey, TreeValue};
use crate::tree::node::{node_fits, InnerNode, LeafNode, Node};
use crate::{IndexError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub type Version = u32;

const META_PAGE_ID: PageId = 0;
const META_MAGIC: u32 = 0x00C0_FFEE;
const META_SLOT_SIZE: usize = 12;

/// A pending batch of copy-on-write mutations.
pub struct Transaction<K, V> {
    old_version: Version,
    root: PageId,
    nodes: HashMap<PageId, Node<K, V>>,
}

impl<K, V> Transaction<K, V> {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct CowTree<K: TreeKey, V: TreeValue, const N: usize> {
    cache: Arc<PageCache>,
    latest_version: AtomicU32,
    roots: RwLock<HashMap<Version, PageId>>,
    /// Meta slot the next commit writes to (the one NOT holding the
    /// latest version).
    next_meta_slot: Mutex<usize>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: TreeKey, V: TreeValue, const N: usize> CowTree<K, V, N> {
    /// Open the tree on a page cache, creating an empty root when the heap
    /// file is fresh.
    pub fn open(cache: Arc<PageCache>) -> Result<Self> {
        assert!(
            node_fits::<K, V>(N, cache.page_size()),
            "tree fanout does not fit the page size"
        );

        let tree = Self {
            cache,
            latest_version: AtomicU32::new(0),
            roots: RwLock::new(HashMap::new()),
            next_meta_slot: Mutex::new(0),
            _marker: PhantomData,
        };

        if tree.cache.num_pages() == 0 {
            tree.bootstrap()?;
        } else {
            tree.read_metadata()?;
        }
        Ok(tree)
    }

    fn bootstrap(&self) -> Result<()> {
        let meta = self.cache.new_page()?;
        debug_assert_eq!(meta.id(), META_PAGE_ID);

        let root_page = self.cache.new_page()?;
        let root_pid = root_page.id();
        {
            let mut buf = root_page.write();
            Node::<K, V>::empty_leaf().serialize(&mut buf, N);
        }
        root_page.mark_dirty();

        // Seed both slots with version 1 so either survives a torn write.
        self.write_meta_slot(&meta, 0, 1, root_pid);
        self.write_meta_slot(&meta, 1, 1, root_pid);
        meta.mark_dirty();

        self.roots.write().insert(1, root_pid);
        self.latest_version.store(1, Ordering::Release);
        *self.next_meta_slot.lock() = 0;

        self.cache.flush_all()?;
        Ok(())
    }

    fn write_meta_slot(&self, meta: &Arc<Page>, slot: usize, version: Version, root: PageId) {
        let mut buf = meta.write();
        buf[..4].copy_from_slice(&META_MAGIC.to_le_bytes());

        let off = 4 + slot * META_SLOT_SIZE;
        buf[off..off + 4].copy_from_slice(&version.to_le_bytes());
        buf[off + 4..off + 8].copy_from_slice(&root.to_le_bytes());
        let crc = crc32fast::hash(&buf[off..off + 8]);
        buf[off + 8..off + 12].copy_from_slice(&crc.to_le_bytes());
    }

    fn read_metadata(&self) -> Result<()> {
        let meta = self.cache.fetch_page(META_PAGE_ID)?;
        let buf = meta.read();

        let magic = u32::from_le_bytes(buf[..4].try_into().unwrap());
        if magic != META_MAGIC {
            if buf.iter().all(|&b| b == 0) {
                drop(buf);
                drop(meta);
                return self.recover_empty_meta();
            }
            return Err(IndexError::corrupt(format!(
                "bad tree meta magic {:#010x}",
                magic
            )));
        }

        let mut latest = 0;
        let mut next_slot = 0;
        let mut roots = self.roots.write();

        for slot in 0..2 {
            let off = 4 + slot * META_SLOT_SIZE;
            let crc = crc32fast::hash(&buf[off..off + 8]);
            let stored = u32::from_le_bytes(buf[off + 8..off + 12].try_into().unwrap());
            if crc != stored {
                continue;
            }

            let version = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            let root = PageId::from_le_bytes(buf[off + 4..off + 8].try_into().unwrap());
            roots.insert(version, root);

            if version > latest {
                latest = version;
                next_slot = 1 - slot;
            }
        }

        if latest == 0 {
            return Err(IndexError::corrupt("no valid tree meta slot"));
        }

        self.latest_version.store(latest, Ordering::Release);
        *self.next_meta_slot.lock() = next_slot;
        Ok(())
    }

    /// A heap file that was extended but never flushed leaves page 0
    /// zeroed; re-initialize it in place.
    fn recover_empty_meta(&self) -> Result<()> {
        let meta = self.cache.fetch_page(META_PAGE_ID)?;

        let root_page = self.cache.new_page()?;
        let root_pid = root_page.id();
        {
            let mut buf = root_page.write();
            Node::<K, V>::empty_leaf().serialize(&mut buf, N);
        }
        root_page.mark_dirty();

        self.write_meta_slot(&meta, 0, 1, root_pid);
        self.write_meta_slot(&meta, 1, 1, root_pid);
        meta.mark_dirty();

        self.roots.write().insert(1, root_pid);
        self.latest_version.store(1, Ordering::Release);
        *self.next_meta_slot.lock() = 0;

        self.cache.flush_all()?;
        Ok(())
    }

    pub fn latest_version(&self) -> Version {
        self.latest_version.load(Ordering::Acquire)
    }

    fn root_for(&self, version: Version) -> Result<PageId> {
        self.roots
            .read()
            .get(&version)
            .copied()
            .ok_or_else(|| IndexError::corrupt(format!("unknown tree version {}", version)))
    }

    fn load_node(&self, pid: PageId) -> Result<Node<K, V>> {
        let page = self.cache.fetch_page(pid)?;
        let buf = page.read();
        Node::deserialize(&buf, N, pid)
    }

    fn alloc_node(&self, txn: &mut Transaction<K, V>, node: Node<K, V>) -> Result<PageId> {
        let page = self.cache.new_page()?;
        let pid = page.id();
        txn.nodes.insert(pid, node);
        Ok(pid)
    }

    /// Make `pid` writable inside the transaction, cloning the published
    /// node onto a fresh page on first touch.
    fn ensure_writable(&self, txn: &mut Transaction<K, V>, pid: PageId) -> Result<PageId> {
        if txn.nodes.contains_key(&pid) {
            return Ok(pid);
        }
        let node = self.load_node(pid)?;
        self.alloc_node(txn, node)
    }

    /// Begin a transaction against the latest published version.
    pub fn begin(&self) -> Result<Transaction<K, V>> {
        let version = self.latest_version();
        Ok(Transaction {
            old_version: version,
            root: self.root_for(version)?,
            nodes: HashMap::new(),
        })
    }

    /// Insert a key/value pair (duplicates allowed).
    pub fn insert(&self, key: K, value: V, txn: &mut Transaction<K, V>) -> Result<()> {
        let (new_root, split, _) = self.insert_at(txn, txn.root, key, value, false)?;
        txn.root = new_root;

        if let Some((split_key, right)) = split {
            let root = Node::Inner(InnerNode {
                keys: vec![split_key],
                children: vec![txn.root, right],
            });
            txn.root = self.alloc_node(txn, root)?;
        }
        Ok(())
    }

    /// Replace the value of an existing key. Returns whether a matching
    /// key was found.
    pub fn update(&self, key: K, value: V, txn: &mut Transaction<K, V>) -> Result<bool> {
        let (new_root, _, updated) = self.insert_at(txn, txn.root, key, value, true)?;
        txn.root = new_root;
        Ok(updated)
    }

    fn insert_at(
        &self,
        txn: &mut Transaction<K, V>,
        pid: PageId,
        key: K,
        value: V,
        update: bool,
    ) -> Result<(PageId, Option<(K, PageId)>, bool)> {
        let wpid = self.ensure_writable(txn, pid)?;

        let is_leaf = txn.nodes[&wpid].is_leaf();
        if is_leaf {
            let Some(Node::Leaf(leaf)) = txn.nodes.get_mut(&wpid) else {
                unreachable!()
            };

            if update {
                let pos = leaf.keys.partition_point(|k| k < &key);
                if pos < leaf.keys.len() && leaf.keys[pos] == key {
                    leaf.values[pos] = value;
                    return Ok((wpid, None, true));
                }
                return Ok((wpid, None, false));
            }

            let pos = leaf.keys.partition_point(|k| k <= &key);
            leaf.keys.insert(pos, key);
            leaf.values.insert(pos, value);

            if leaf.keys.len() == N {
                // Left keeps N/2; the split key is the right half's first.
                let right_keys = leaf.keys.split_off(N / 2);
                let right_values = leaf.values.split_off(N / 2);
                let split_key = right_keys[0];
                let right = self.alloc_node(
                    txn,
                    Node::Leaf(LeafNode {
                        keys: right_keys,
                        values: right_values,
                    }),
                )?;
                return Ok((wpid, Some((split_key, right)), false));
            }
            return Ok((wpid, None, false));
        }

        let (child_idx, child_pid) = {
            let Node::Inner(inner) = &txn.nodes[&wpid] else {
                unreachable!()
            };
            let idx = inner.keys.partition_point(|k| k <= &key);
            (idx, inner.children[idx])
        };

        let (new_child, child_split, updated) = self.insert_at(txn, child_pid, key, value, update)?;

        let Some(Node::Inner(inner)) = txn.nodes.get_mut(&wpid) else {
            unreachable!()
        };
        inner.children[child_idx] = new_child;

        if let Some((split_key, sibling)) = child_split {
            inner.keys.insert(child_idx, split_key);
            inner.children.insert(child_idx + 1, sibling);

            if inner.keys.len() == N {
                // Left keeps N/2 keys; keys[N/2] is promoted, the rest
                // move right along with their children.
                let right_keys = inner.keys.split_off(N / 2 + 1);
                let promoted = inner.keys.pop().expect("non-empty after split_off");
                let right_children = inner.children.split_off(N / 2 + 1);
                let right = self.alloc_node(
                    txn,
                    Node::Inner(InnerNode {
                        keys: right_keys,
                        children: right_children,
                    }),
                )?;
                return Ok((wpid, Some((promoted, right)), updated));
            }
        }

        Ok((wpid, None, updated))
    }

    /// Publish the transaction. Fails with `TransactionAborted` when
    /// another commit won the version race.
    pub fn commit(&self, txn: Transaction<K, V>) -> Result<Version> {
        if txn.nodes.is_empty() {
            return Ok(self.latest_version());
        }
        if txn.old_version != self.latest_version() {
            return Err(IndexError::TransactionAborted);
        }

        for (pid, node) in &txn.nodes {
            let page = self.cache.fetch_page(*pid)?;
            {
                let mut buf = page.write();
                node.serialize(&mut buf, N);
            }
            page.mark_dirty();
        }

        // New nodes must be durable before the meta page can name them.
        self.cache.flush_all()?;

        let new_version = txn.old_version + 1;
        {
            let meta = self.cache.fetch_page(META_PAGE_ID)?;
            let mut slot = self.next_meta_slot.lock();
            self.write_meta_slot(&meta, *slot, new_version, txn.root);
            meta.mark_dirty();
            *slot = 1 - *slot;
        }
        self.cache.flush_all()?;

        self.roots.write().insert(new_version, txn.root);
        self.latest_version.store(new_version, Ordering::Release);
        Ok(new_version)
    }

    /// All values stored under `key` in the latest version. Duplicates in
    /// one leaf are returned in insertion order.
    pub fn get_value(&self, key: K) -> Result<Vec<V>> {
        let mut pid = self.root_for(self.latest_version())?;

        loop {
            match self.load_node(pid)? {
                Node::Inner(inner) => {
                    let idx = inner.keys.partition_point(|k| k <= &key);
                    pid = inner.children[idx];
                }
                Node::Leaf(leaf) => {
                    let lo = leaf.keys.partition_point(|k| k < &key);
                    let hi = leaf.keys.partition_point(|k| k <= &key);
                    return Ok(leaf.values[lo..hi].to_vec());
                }
            }
        }
    }

    /// Forward iterator positioned at the first entry `>= key` under the
    /// latest version. The snapshot never observes later commits.
    pub fn iter_from(&self, key: K) -> Result<TreeIter<'_, K, V, N>> {
        let version = self.latest_version();
        let mut iter = TreeIter {
            tree: self,
            version,
            keys: Vec::new(),
            values: Vec::new(),
            pos: 0,
            next_key: None,
            ended: false,
        };
        iter.seek(key)?;
        Ok(iter)
    }
}

/// Forward-only snapshot iterator. Batches one leaf at a time and refetches
/// across leaf boundaries within its pinned version.
pub struct TreeIter<'a, K: TreeKey, V: TreeValue, const N: usize> {
    tree: &'a CowTree<K, V, N>,
    version: Version,
    keys: Vec<K>,
    values: Vec<V>,
    pos: usize,
    next_key: Option<K>,
    ended: bool,
}

impl<'a, K: TreeKey, V: TreeValue, const N: usize> TreeIter<'a, K, V, N> {
    fn seek(&mut self, mut key: K) -> Result<()> {
        loop {
            self.next_key = None;
            let mut pid = self.tree.root_for(self.version)?;

            loop {
                match self.tree.load_node(pid)? {
                    Node::Inner(inner) => {
                        let idx = inner.keys.partition_point(|k| k <= &key);
                        if idx < inner.keys.len() {
                            self.next_key = Some(inner.keys[idx]);
                        }
                        pid = inner.children[idx];
                    }
                    Node::Leaf(leaf) => {
                        self.keys = leaf.keys;
                        self.values = leaf.values;
                        break;
                    }
                }
            }

            self.pos = self.keys.partition_point(|k| k < &key);
            if self.pos < self.keys.len() {
                return Ok(());
            }

            // Key ordered past this leaf; follow the recorded successor.
            match self.next_key.take() {
                Some(next) if next > key => key = next,
                _ => {
                    self.ended = true;
                    return Ok(());
                }
            }
        }
    }

    /// Advance and return the next `(key, value)` entry, or `None` at the
    /// end of the tree.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        if self.ended {
            return Ok(None);
        }

        if self.pos >= self.keys.len() {
            match self.next_key.take() {
                Some(next) => {
                    self.seek(next)?;
                    if self.ended {
                        return Ok(None);
                    }
                }
                None => {
                    self.ended = true;
                    return Ok(None);
                }
            }
        }

        let entry = (self.keys[self.pos], self.values[self.pos]);
        self.pos += 1;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_cache::DEFAULT_PAGE_SIZE;
    use tempfile::TempDir;

    type TestTree = CowTree<u64, u32, 8>;

    fn open_tree(dir: &TempDir) -> (Arc<PageCache>, TestTree) {
        let cache = Arc::new(
            PageCache::open(dir.path().join("tree.db"), 256, DEFAULT_PAGE_SIZE).unwrap(),
        );
        let tree = TestTree::open(Arc::clone(&cache)).unwrap();
        (cache, tree)
    }

    #[test]
    fn test_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let (_cache, tree) = open_tree(&dir);

        let mut txn = tree.begin().unwrap();
        for i in 0..100u64 {
            tree.insert(i, (i * 10) as u32, &mut txn).unwrap();
        }
        tree.commit(txn).unwrap();

        for i in 0..100u64 {
            assert_eq!(tree.get_value(i).unwrap(), vec![(i * 10) as u32]);
        }
        assert!(tree.get_value(500).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_keys_keep_insertion_order() {
        let dir = TempDir::new().unwrap();
        let (_cache, tree) = open_tree(&dir);

        let mut txn = tree.begin().unwrap();
        for v in [1u32, 2, 3] {
            tree.insert(42, v, &mut txn).unwrap();
        }
        tree.commit(txn).unwrap();

        assert_eq!(tree.get_value(42).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_update_existing() {
        let dir = TempDir::new().unwrap();
        let (_cache, tree) = open_tree(&dir);

        let mut txn = tree.begin().unwrap();
        tree.insert(7, 70, &mut txn).unwrap();
        tree.commit(txn).unwrap();

        let mut txn = tree.begin().unwrap();
        assert!(tree.update(7, 71, &mut txn).unwrap());
        assert!(!tree.update(8, 80, &mut txn).unwrap());
        tree.commit(txn).unwrap();

        assert_eq!(tree.get_value(7).unwrap(), vec![71]);
        assert!(tree.get_value(8).unwrap().is_empty());
    }

    #[test]
    fn test_iterator_in_order_across_splits() {
        let dir = TempDir::new().unwrap();
        let (_cache, tree) = open_tree(&dir);

        // Insert shuffled to force splits at fanout 8.
        let mut keys: Vec<u64> = (0..500).collect();
        let mut txn = tree.begin().unwrap();
        keys.reverse();
        for &k in &keys {
            tree.insert(k, k as u32, &mut txn).unwrap();
        }
        tree.commit(txn).unwrap();

        let mut it = tree.iter_from(0).unwrap();
        let mut expected = 0u64;
        while let Some((k, v)) = it.next_entry().unwrap() {
            assert_eq!(k, expected);
            assert_eq!(v, expected as u32);
            expected += 1;
        }
        assert_eq!(expected, 500);

        // Mid-range positioning.
        let mut it = tree.iter_from(250).unwrap();
        assert_eq!(it.next_entry().unwrap(), Some((250, 250)));
    }

    #[test]
    fn test_snapshot_iterator_ignores_later_commit() {
        let dir = TempDir::new().unwrap();
        let (_cache, tree) = open_tree(&dir);

        let mut txn = tree.begin().unwrap();
        for i in 0..50u64 {
            tree.insert(i * 2, i as u32, &mut txn).unwrap();
        }
        tree.commit(txn).unwrap();

        let mut it = tree.iter_from(0).unwrap();
        // First advance, then commit more entries.
        assert_eq!(it.next_entry().unwrap(), Some((0, 0)));

        let mut txn = tree.begin().unwrap();
        for i in 0..50u64 {
            tree.insert(i * 2 + 1, 1000 + i as u32, &mut txn).unwrap();
        }
        tree.commit(txn).unwrap();

        let mut count = 1;
        while let Some((k, _)) = it.next_entry().unwrap() {
            assert_eq!(k % 2, 0, "snapshot saw a key from a later version");
            count += 1;
        }
        assert_eq!(count, 50);
    }

    #[test]
    fn test_commit_version_race_aborts() {
        let dir = TempDir::new().unwrap();
        let (_cache, tree) = open_tree(&dir);

        let mut txn1 = tree.begin().unwrap();
        let mut txn2 = tree.begin().unwrap();
        tree.insert(1, 1, &mut txn1).unwrap();
        tree.insert(2, 2, &mut txn2).unwrap();

        tree.commit(txn1).unwrap();
        assert!(matches!(
            tree.commit(txn2),
            Err(IndexError::TransactionAborted)
        ));
    }

    #[test]
    fn test_reopen_recovers_latest_root() {
        let dir = TempDir::new().unwrap();
        {
            let (_cache, tree) = open_tree(&dir);
            let mut txn = tree.begin().unwrap();
            for i in 0..100u64 {
                tree.insert(i, i as u32, &mut txn).unwrap();
            }
            tree.commit(txn).unwrap();

            let mut txn = tree.begin().unwrap();
            tree.insert(1000, 1000, &mut txn).unwrap();
            tree.commit(txn).unwrap();
        }

        let (_cache, tree) = open_tree(&dir);
        assert_eq!(tree.get_value(1000).unwrap(), vec![1000]);
        assert_eq!(tree.get_value(42).unwrap(), vec![42]);
    }

    #[test]
    fn test_torn_meta_slot_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.db");
        {
            let cache =
                Arc::new(PageCache::open(&path, 256, DEFAULT_PAGE_SIZE).unwrap());
            let tree = TestTree::open(Arc::clone(&cache)).unwrap();
            let mut txn = tree.begin().unwrap();
            tree.insert(1, 1, &mut txn).unwrap();
            tree.commit(txn).unwrap(); // version 2 in slot 0

            let mut txn = tree.begin().unwrap();
            tree.insert(2, 2, &mut txn).unwrap();
            tree.commit(txn).unwrap(); // version 3 in slot 1
        }

        // Corrupt the slot holding the newest version (slot 1).
        {
            use std::io::{Read, Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap();
            let mut buf = [0u8; 4];
            file.seek(SeekFrom::Start(4 + 12)).unwrap();
            file.read_exact(&mut buf).unwrap();
            buf[0] ^= 0xff;
            file.seek(SeekFrom::Start(4 + 12)).unwrap();
            file.write_all(&buf).unwrap();
        }

        let cache = Arc::new(PageCache::open(&path, 256, DEFAULT_PAGE_SIZE).unwrap());
        let tree = TestTree::open(cache).unwrap();
        // Version 2 root is authoritative: key 1 present, key 2 unseen.
        assert_eq!(tree.get_value(1).unwrap(), vec![1]);
        assert!(tree.get_value(2).unwrap().is_empty());
    }
}
