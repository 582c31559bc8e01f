//! Namespace and backing stores
//!
//! A [`Namespace`] translates block addressed commands into calls on a
//! [`BlockStore`]. The store only sees namespace id, LBA and block count;
//! range checks and status mapping stay here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::config::{NamespaceConfig, StoreKind};
use crate::error::{NvmeOfError, NvmeOfResult, NvmeStatus};
use crate::identify::IdentifyNamespace;

/// Namespace ID (1-based, 0 is invalid)
pub type NamespaceId = u32;

/// Block storage behind a namespace
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Read `block_count` blocks starting at `lba`
    async fn read(&self, nsid: NamespaceId, lba: u64, block_count: u32) -> NvmeOfResult<Bytes>;

    /// Write `data` (exactly `block_count` blocks) starting at `lba`
    async fn write(
        &self,
        nsid: NamespaceId,
        lba: u64,
        block_count: u32,
        data: Bytes,
    ) -> NvmeOfResult<()>;

    /// Flush pending writes
    async fn flush(&self, _nsid: NamespaceId) -> NvmeOfResult<()> {
        Ok(())
    }
}

/// Build the store selected by `kind`
pub fn store_for(kind: StoreKind, block_size: u32) -> Arc<dyn BlockStore> {
    match kind {
        StoreKind::Zero => Arc::new(ZeroStore::new(block_size)),
        StoreKind::Memory => Arc::new(MemoryStore::new(block_size)),
    }
}

/// Store that reads zeroes and discards writes
#[derive(Debug, Clone)]
pub struct ZeroStore {
    block_size: u32,
}

impl ZeroStore {
    /// Create a zero store
    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }
}

#[async_trait]
impl BlockStore for ZeroStore {
    async fn read(&self, _nsid: NamespaceId, _lba: u64, block_count: u32) -> NvmeOfResult<Bytes> {
        let len = block_count as usize * self.block_size as usize;
        Ok(BytesMut::zeroed(len).freeze())
    }

    async fn write(
        &self,
        _nsid: NamespaceId,
        _lba: u64,
        _block_count: u32,
        _data: Bytes,
    ) -> NvmeOfResult<()> {
        Ok(())
    }
}

/// Sparse in-memory store; unwritten blocks read as zeroes
#[derive(Debug)]
pub struct MemoryStore {
    block_size: u32,
    blocks: RwLock<HashMap<(NamespaceId, u64), Bytes>>,
}

impl MemoryStore {
    /// Create an empty memory store
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Number of blocks holding written data
    pub fn allocated_blocks(&self) -> usize {
        self.blocks.read().len()
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn read(&self, nsid: NamespaceId, lba: u64, block_count: u32) -> NvmeOfResult<Bytes> {
        let block_size = self.block_size as usize;
        let mut buf = BytesMut::zeroed(block_count as usize * block_size);

        let blocks = self.blocks.read();
        for i in 0..u64::from(block_count) {
            if let Some(block) = blocks.get(&(nsid, lba + i)) {
                let start = i as usize * block_size;
                buf[start..start + block_size].copy_from_slice(block);
            }
        }
        Ok(buf.freeze())
    }

    async fn write(
        &self,
        nsid: NamespaceId,
        lba: u64,
        block_count: u32,
        data: Bytes,
    ) -> NvmeOfResult<()> {
        let block_size = self.block_size as usize;
        if data.len() != block_count as usize * block_size {
            return Err(NvmeOfError::Storage(format!(
                "write of {} bytes does not cover {} blocks",
                data.len(),
                block_count
            )));
        }

        let mut blocks = self.blocks.write();
        for i in 0..block_count as usize {
            let block = data.slice(i * block_size..(i + 1) * block_size);
            blocks.insert((nsid, lba + i as u64), block);
        }
        Ok(())
    }
}

/// Namespace statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceStats {
    /// Read commands processed
    pub read_commands: u64,

    /// Write commands processed
    pub write_commands: u64,

    /// Flush commands processed
    pub flush_commands: u64,

    /// Total bytes read
    pub bytes_read: u64,

    /// Total bytes written
    pub bytes_written: u64,
}

/// The namespace exported by the subsystem
pub struct Namespace {
    nsid: NamespaceId,
    block_size: u32,
    size_blocks: u64,
    uuid: Uuid,
    store: Arc<dyn BlockStore>,
    stats: RwLock<NamespaceStats>,
}

impl Namespace {
    /// Create a namespace over `store`
    pub fn new(config: &NamespaceConfig, store: Arc<dyn BlockStore>) -> Self {
        Self {
            nsid: config.nsid,
            block_size: config.block_size,
            size_blocks: config.num_blocks(),
            uuid: config.uuid,
            store,
            stats: RwLock::new(NamespaceStats::default()),
        }
    }

    /// Get namespace ID
    pub fn nsid(&self) -> NamespaceId {
        self.nsid
    }

    /// Get block size
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Get size in blocks
    pub fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    /// Namespace UUID
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Get statistics
    pub fn stats(&self) -> NamespaceStats {
        self.stats.read().clone()
    }

    /// Generate Identify Namespace data
    pub fn identify(&self) -> IdentifyNamespace {
        let mut ns = IdentifyNamespace::new(
            self.size_blocks * u64::from(self.block_size),
            self.block_size,
        );
        ns.nguid = *self.uuid.as_bytes();
        ns
    }

    /// Check that `[slba, slba + block_count)` lies inside the namespace
    pub fn check_range(&self, slba: u64, block_count: u32) -> Result<(), NvmeStatus> {
        match slba.checked_add(u64::from(block_count)) {
            Some(end) if end <= self.size_blocks => Ok(()),
            _ => Err(NvmeStatus::LbaOutOfRange),
        }
    }

    /// Transfer length in bytes for `block_count` blocks
    pub fn transfer_len(&self, block_count: u32) -> usize {
        block_count as usize * self.block_size as usize
    }

    /// Read blocks from namespace
    pub async fn read(&self, slba: u64, block_count: u32) -> Result<Bytes, NvmeStatus> {
        self.check_range(slba, block_count)?;
        trace!(nsid = self.nsid, slba, block_count, "namespace read");

        let data = self
            .store
            .read(self.nsid, slba, block_count)
            .await
            .map_err(|e| {
                warn!(nsid = self.nsid, slba, block_count, error = %e, "store read failed");
                NvmeStatus::InternalError
            })?;

        let expected = self.transfer_len(block_count);
        if data.len() != expected {
            warn!(
                nsid = self.nsid,
                expected,
                got = data.len(),
                "store returned a short read"
            );
            return Err(NvmeStatus::InternalError);
        }

        let mut stats = self.stats.write();
        stats.read_commands += 1;
        stats.bytes_read += data.len() as u64;
        Ok(data)
    }

    /// Write blocks to namespace
    pub async fn write(&self, slba: u64, block_count: u32, data: Bytes) -> Result<(), NvmeStatus> {
        self.check_range(slba, block_count)?;
        if data.len() != self.transfer_len(block_count) {
            return Err(NvmeStatus::DataSglLengthInvalid);
        }
        trace!(nsid = self.nsid, slba, block_count, "namespace write");

        let len = data.len() as u64;
        self.store
            .write(self.nsid, slba, block_count, data)
            .await
            .map_err(|e| {
                warn!(nsid = self.nsid, slba, block_count, error = %e, "store write failed");
                NvmeStatus::InternalError
            })?;

        let mut stats = self.stats.write();
        stats.write_commands += 1;
        stats.bytes_written += len;
        Ok(())
    }

    /// Flush namespace
    pub async fn flush(&self) -> Result<(), NvmeStatus> {
        trace!(nsid = self.nsid, "namespace flush");
        self.store.flush(self.nsid).await.map_err(|e| {
            warn!(nsid = self.nsid, error = %e, "store flush failed");
            NvmeStatus::InternalError
        })?;
        self.stats.write().flush_commands += 1;
        Ok(())
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("nsid", &self.nsid)
            .field("block_size", &self.block_size)
            .field("size_blocks", &self.size_blocks)
            .field("uuid", &self.uuid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl BlockStore for FailingStore {
        async fn read(&self, _: NamespaceId, _: u64, _: u32) -> NvmeOfResult<Bytes> {
            Err(NvmeOfError::Storage("device gone".into()))
        }

        async fn write(&self, _: NamespaceId, _: u64, _: u32, _: Bytes) -> NvmeOfResult<()> {
            Err(NvmeOfError::Storage("device gone".into()))
        }
    }

    fn small_config() -> NamespaceConfig {
        NamespaceConfig {
            size_bytes: 16 * 4096,
            ..NamespaceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_zero_store_reads_zeroes() {
        let ns = Namespace::new(&small_config(), Arc::new(ZeroStore::new(4096)));
        let data = ns.read(0, 2).await.unwrap();
        assert_eq!(data.len(), 8192);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_memory_store_write_read_back() {
        let store = Arc::new(MemoryStore::new(4096));
        let ns = Namespace::new(&small_config(), store.clone());

        let mut payload = vec![0u8; 8192];
        payload[..4096].fill(0x11);
        payload[4096..].fill(0x22);
        ns.write(3, 2, Bytes::from(payload)).await.unwrap();
        assert_eq!(store.allocated_blocks(), 2);

        let data = ns.read(2, 4).await.unwrap();
        assert!(data[..4096].iter().all(|&b| b == 0));
        assert!(data[4096..8192].iter().all(|&b| b == 0x11));
        assert!(data[8192..12288].iter().all(|&b| b == 0x22));
        assert!(data[12288..].iter().all(|&b| b == 0));

        let stats = ns.stats();
        assert_eq!(stats.write_commands, 1);
        assert_eq!(stats.read_commands, 1);
        assert_eq!(stats.bytes_written, 8192);
    }

    #[tokio::test]
    async fn test_range_checks() {
        let ns = Namespace::new(&small_config(), Arc::new(ZeroStore::new(4096)));
        assert!(ns.check_range(15, 1).is_ok());
        assert_eq!(ns.check_range(15, 2), Err(NvmeStatus::LbaOutOfRange));
        assert_eq!(ns.check_range(u64::MAX, 1), Err(NvmeStatus::LbaOutOfRange));
        assert_eq!(ns.read(16, 1).await, Err(NvmeStatus::LbaOutOfRange));
    }

    #[tokio::test]
    async fn test_write_length_mismatch() {
        let ns = Namespace::new(&small_config(), Arc::new(ZeroStore::new(4096)));
        assert_eq!(
            ns.write(0, 1, Bytes::from(vec![0u8; 512])).await,
            Err(NvmeStatus::DataSglLengthInvalid)
        );
    }

    #[tokio::test]
    async fn test_store_failure_maps_to_internal_error() {
        let ns = Namespace::new(&small_config(), Arc::new(FailingStore));
        assert_eq!(ns.read(0, 1).await, Err(NvmeStatus::InternalError));
        assert_eq!(
            ns.write(0, 1, Bytes::from(vec![0u8; 4096])).await,
            Err(NvmeStatus::InternalError)
        );
        assert!(ns.flush().await.is_ok());
    }

    #[test]
    fn test_identify_uses_uuid_as_nguid() {
        let config = small_config();
        let ns = Namespace::new(&config, Arc::new(ZeroStore::new(4096)));
        let id = ns.identify();
        assert_eq!(id.nsze, 16);
        assert_eq!(id.nguid, *config.uuid.as_bytes());
    }
}
