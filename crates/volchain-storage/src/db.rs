// volchain-storage/src/db.rs

use crate::{atomic::write_atomic, StorageError, StorageResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use volchain_core::{
    Block, BlockHeader, BlockHeight, ChainStore, Ledger, LedgerResult, LegacyEvent, Transaction,
};

pub const MEMPOOL_FILE: &str = "mempool.jsonl";
pub const BLOCK_INDEX_FILE: &str = "blocks.log";
pub const BLOCKS_DIR: &str = "blocks";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const EVENT_LOG_FILE: &str = "chain.log";

/// Upper bound for one history page
pub const MAX_PAGE_LIMIT: usize = 1000;

/// One newest-first page of history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back as `before` to fetch the next (older) page
    pub next_cursor: Option<u64>,
}

/// Data directory holding every persisted record. Cheap to clone; holds no
/// open handles.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create the layout if missing and re-index any block body whose
    /// header never reached the index
    pub fn open<P: AsRef<Path>>(root: P) -> StorageResult<Self> {
        let store = Self { root: root.as_ref().to_path_buf() };
        fs::create_dir_all(store.blocks_dir())?;
        store.repair_index()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mempool_path(&self) -> PathBuf {
        self.root.join(MEMPOOL_FILE)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(BLOCK_INDEX_FILE)
    }

    fn blocks_dir(&self) -> PathBuf {
        self.root.join(BLOCKS_DIR)
    }

    fn block_path(&self, height: BlockHeight) -> PathBuf {
        self.blocks_dir().join(format!("{height:08}.json"))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    fn events_path(&self) -> PathBuf {
        self.root.join(EVENT_LOG_FILE)
    }

    fn repair_index(&self) -> StorageResult<()> {
        let indexed = self.block_headers()?.last().map_or(0, |h| h.height);
        let mut heights: Vec<BlockHeight> = fs::read_dir(self.blocks_dir())?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_suffix(".json")?.parse().ok()
            })
            .filter(|h| *h > indexed)
            .collect();
        heights.sort_unstable();

        let mut expected = indexed + 1;
        for height in heights {
            if height != expected {
                break;
            }
            let block = self
                .load_block(height)?
                .ok_or_else(|| StorageError::NotFound(format!("block {height}")))?;
            append_lines(&self.index_path(), std::slice::from_ref(&block.header))?;
            info!("Re-indexed block #{} found without an index entry", height);
            expected += 1;
        }
        Ok(())
    }

    pub fn load_block(&self, height: BlockHeight) -> StorageResult<Option<Block>> {
        let path = self.block_path(height);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Indexed headers in height order. A header re-appended at a height
    /// already indexed (a retried seal after a failed index fsync) replaces
    /// the earlier entry and everything above it.
    pub fn block_headers(&self) -> StorageResult<Vec<BlockHeader>> {
        let mut headers: Vec<BlockHeader> = Vec::new();
        for header in read_lines::<BlockHeader>(&self.index_path())? {
            if headers.last().map_or(false, |last| last.height >= header.height) {
                warn!("Block #{} indexed twice; keeping the later entry", header.height);
                headers.retain(|h| h.height < header.height);
            }
            headers.push(header);
        }
        Ok(headers)
    }

    /// Newest-first block headers strictly below `before`
    pub fn blocks_page(&self, limit: usize, before: Option<BlockHeight>) -> StorageResult<Page<BlockHeader>> {
        let headers = self.block_headers()?;
        Ok(page(headers, limit, before, |h| h.height))
    }

    /// Newest-first legacy events with id strictly below `before`
    pub fn events_page(&self, limit: usize, before: Option<u64>) -> StorageResult<Page<LegacyEvent>> {
        let events: Vec<LegacyEvent> = read_lines(&self.events_path())?;
        Ok(page(events, limit, before, |e| e.id))
    }
}

fn page<T>(records: Vec<T>, limit: usize, before: Option<u64>, key: impl Fn(&T) -> u64) -> Page<T> {
    let limit = limit.clamp(1, MAX_PAGE_LIMIT);
    let mut older: Vec<T> = records
        .into_iter()
        .filter(|r| before.map_or(true, |b| key(r) < b))
        .collect();
    let has_more = older.len() > limit;
    let items: Vec<T> = older.drain(older.len().saturating_sub(limit)..).rev().collect();
    let next_cursor = if has_more { items.last().map(&key) } else { None };
    Page { items, next_cursor }
}

fn to_jsonl<T: Serialize>(items: &[T]) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Append one JSON line per item and fsync before returning
fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> StorageResult<()> {
    if items.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
    let mut buf = Vec::new();
    if !ends_with_newline(&mut file)? {
        // terminate a line torn by a crash so the new record parses
        buf.push(b'\n');
    }
    buf.extend(to_jsonl(items)?);
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Parse a JSONL file, skipping lines that do not parse (torn appends)
fn read_lines<T: DeserializeOwned>(path: &Path) -> StorageResult<Vec<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => out.push(record),
            Err(e) => warn!("Skipping unreadable line {} of {}: {}", i + 1, path.display(), e),
        }
    }
    Ok(out)
}

impl ChainStore for FileStore {
    fn load_snapshot(&self) -> LedgerResult<Option<Ledger>> {
        match fs::read(self.snapshot_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    fn write_snapshot(&self, ledger: &Ledger) -> LedgerResult<()> {
        let bytes = serde_json::to_vec_pretty(ledger)?;
        write_atomic(self.snapshot_path(), &bytes).map_err(StorageError::from)?;
        Ok(())
    }

    fn load_mempool(&self) -> LedgerResult<Vec<Transaction>> {
        Ok(read_lines(&self.mempool_path())?)
    }

    fn append_mempool(&self, txs: &[Transaction]) -> LedgerResult<()> {
        Ok(append_lines(&self.mempool_path(), txs)?)
    }

    fn rewrite_mempool(&self, txs: &[Transaction]) -> LedgerResult<()> {
        let bytes = to_jsonl(txs)?;
        write_atomic(self.mempool_path(), &bytes).map_err(StorageError::from)?;
        Ok(())
    }

    fn persist_block(&self, block: &Block) -> LedgerResult<()> {
        let bytes = serde_json::to_vec_pretty(block)?;
        let path = self.block_path(block.height());
        write_atomic(&path, &bytes).map_err(StorageError::from)?;
        if let Err(e) = append_lines(&self.index_path(), std::slice::from_ref(&block.header)) {
            // the caller requeues the batch, so the body must not be
            // re-indexed on the next open
            if let Err(rm) = fs::remove_file(&path) {
                warn!("Could not remove unindexed block body {}: {}", path.display(), rm);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn load_blocks(&self) -> LedgerResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for header in self.block_headers()? {
            let block = self
                .load_block(header.height)?
                .ok_or_else(|| StorageError::Corruption(format!("block {} body missing", header.height)))?;
            if block.header != header {
                return Err(StorageError::Corruption(format!("block {} body does not match index", header.height)).into());
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    fn append_events(&self, events: &[LegacyEvent]) -> LedgerResult<()> {
        Ok(append_lines(&self.events_path(), events)?)
    }

    fn load_events(&self) -> LedgerResult<Vec<LegacyEvent>> {
        Ok(read_lines(&self.events_path())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use volchain_core::{Chain, ChainConfig, SealOutcome};
    use volchain_crypto::KeyPair;

    fn create_test_store() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn seal_mints(store: &FileStore, count: usize) -> Chain<FileStore> {
        let mut chain = Chain::open(store.clone(), ChainConfig::default()).unwrap();
        let kp = KeyPair::generate();
        for i in 0..count {
            chain
                .enqueue(Transaction::mint(kp.public_key(), 1).unwrap().with_op_id(format!("op{i}")))
                .unwrap();
            assert!(matches!(chain.seal(10).unwrap(), SealOutcome::Sealed(_)));
        }
        chain
    }

    #[test]
    fn test_layout_after_seal() {
        let (store, dir) = create_test_store();
        seal_mints(&store, 1);
        for name in [MEMPOOL_FILE, BLOCK_INDEX_FILE, SNAPSHOT_FILE, EVENT_LOG_FILE] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
        assert!(dir.path().join("blocks/00000001.json").exists());
        assert_eq!(fs::read_to_string(store.mempool_path()).unwrap(), "");
    }

    #[test]
    fn test_store_load_blocks_and_snapshot() {
        let (store, _dir) = create_test_store();
        let chain = seal_mints(&store, 3);

        let blocks = store.load_blocks().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].header.prev_hash, Some(blocks[1].hash()));
        assert_eq!(store.load_snapshot().unwrap().as_ref(), Some(chain.ledger()));
        assert_eq!(store.load_events().unwrap().len(), 3);
    }

    #[test]
    fn test_mempool_append_and_rewrite() {
        let (store, _dir) = create_test_store();
        let kp = KeyPair::generate();
        let a = Transaction::mint(kp.public_key(), 1).unwrap().with_op_id("a");
        let b = Transaction::mint(kp.public_key(), 2).unwrap().with_op_id("b");

        store.append_mempool(&[a.clone()]).unwrap();
        store.append_mempool(&[b.clone()]).unwrap();
        assert_eq!(store.load_mempool().unwrap(), vec![a.clone(), b.clone()]);

        store.rewrite_mempool(&[b.clone()]).unwrap();
        assert_eq!(store.load_mempool().unwrap(), vec![b]);
    }

    #[test]
    fn test_torn_line_is_skipped_and_terminated() {
        let (store, _dir) = create_test_store();
        let kp = KeyPair::generate();
        fs::write(store.mempool_path(), "{\"type\":\"mi").unwrap();
        assert!(store.load_mempool().unwrap().is_empty());

        let tx = Transaction::mint(kp.public_key(), 1).unwrap();
        store.append_mempool(&[tx.clone()]).unwrap();
        assert_eq!(store.load_mempool().unwrap(), vec![tx]);
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let (store, _dir) = create_test_store();
        assert!(store.load_snapshot().unwrap().is_none());
        assert!(store.load_blocks().unwrap().is_empty());
    }

    #[test]
    fn test_blocks_page_newest_first() {
        let (store, _dir) = create_test_store();
        seal_mints(&store, 5);

        let first = store.blocks_page(2, None).unwrap();
        let heights: Vec<_> = first.items.iter().map(|h| h.height).collect();
        assert_eq!(heights, vec![5, 4]);
        assert_eq!(first.next_cursor, Some(4));

        let second = store.blocks_page(2, first.next_cursor).unwrap();
        assert_eq!(second.items.iter().map(|h| h.height).collect::<Vec<_>>(), vec![3, 2]);

        let last = store.blocks_page(2, second.next_cursor).unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_cursor, None);

        assert_eq!(store.blocks_page(0, None).unwrap().items.len(), 1);
    }

    #[test]
    fn test_events_page() {
        let (store, _dir) = create_test_store();
        seal_mints(&store, 3);
        let page = store.events_page(10, Some(3)).unwrap();
        assert_eq!(page.items.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_unindexed_body_is_reindexed_on_open() {
        let (store, dir) = create_test_store();
        seal_mints(&store, 2);
        let index = fs::read_to_string(store.index_path()).unwrap();
        let first_line = index.lines().next().unwrap();
        fs::write(store.index_path(), format!("{first_line}\n")).unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        let heights: Vec<_> = reopened.block_headers().unwrap().iter().map(|h| h.height).collect();
        assert_eq!(heights, vec![1, 2]);
        assert_eq!(reopened.load_blocks().unwrap().len(), 2);
    }

    #[test]
    fn test_reappended_header_replaces_earlier_entry() {
        let (store, _dir) = create_test_store();
        seal_mints(&store, 2);
        let headers = store.block_headers().unwrap();
        append_lines(&store.index_path(), &headers[1..]).unwrap();

        let heights: Vec<_> = store.block_headers().unwrap().iter().map(|h| h.height).collect();
        assert_eq!(heights, vec![1, 2]);
        assert_eq!(store.load_blocks().unwrap().len(), 2);
    }
}
