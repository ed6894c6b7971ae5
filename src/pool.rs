//! Donated page pool backing the zero-copy datagram channel.
//!
//! When the datagram channel opens it donates a set of fixed-size memory
//! regions to the host. Requests sent over that channel are built directly
//! inside a pooled region and the host writes the reply back into the same
//! region, so completion never copies message bytes. Regions are identified
//! by a stable `u32` id; ids never change once assigned, and the pool only
//! grows (host replenish asks), never shrinks, while the channel is open.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::protocol::RegionDescriptor;

/// One donated region. The byte mutex serializes guest-side access against
/// the completion callback writing reply headers into the same memory.
pub struct Region {
    id: u32,
    bytes: Mutex<Box<[u8]>>,
}

impl Region {
    fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    /// Run `f` with exclusive access to the region bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.bytes.lock().unwrap();
        f(&mut bytes)
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> std::io::Result<()> {
        self.with_bytes(|bytes| {
            let end = offset.checked_add(data.len()).filter(|&e| e <= bytes.len());
            match end {
                Some(end) => {
                    bytes[offset..end].copy_from_slice(data);
                    Ok(())
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "write past end of pool region",
                )),
            }
        })
    }

    /// Copy `len` bytes out of the region starting at `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> std::io::Result<Vec<u8>> {
        self.with_bytes(|bytes| {
            let end = offset.checked_add(len).filter(|&e| e <= bytes.len());
            match end {
                Some(end) => Ok(bytes[offset..end].to_vec()),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "read past end of pool region",
                )),
            }
        })
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region").field("id", &self.id).finish()
    }
}

struct PoolInner {
    regions: Vec<Arc<Region>>,
    free: Vec<u32>,
}

/// Fixed-size region pool shared between the transport and the datagram
/// backend. Both sides hold an `Arc`; the donation ends when the backend
/// drops its handle at channel close.
pub struct PagePool {
    region_size: usize,
    max_regions: usize,
    inner: Mutex<PoolInner>,
}

impl PagePool {
    pub fn new(regions: usize, region_size: usize, max_regions: usize) -> Arc<Self> {
        let pool = PoolInner {
            regions: (0..regions as u32)
                .map(|id| Arc::new(Region::new(id, region_size)))
                .collect(),
            free: (0..regions as u32).rev().collect(),
        };
        Arc::new(Self {
            region_size,
            max_regions: max_regions.max(regions),
            inner: Mutex::new(pool),
        })
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Total regions currently donated.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().regions.len()
    }

    /// Regions not currently backing a request.
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Look up a donated region by id.
    pub fn region(&self, id: u32) -> Option<Arc<Region>> {
        self.inner
            .lock()
            .unwrap()
            .regions
            .get(id as usize)
            .cloned()
    }

    /// Descriptors for every donated region, in id order.
    pub fn descriptors(&self) -> Vec<RegionDescriptor> {
        self.inner
            .lock()
            .unwrap()
            .regions
            .iter()
            .map(|r| RegionDescriptor {
                region: r.id,
                len: self.region_size as u32,
            })
            .collect()
    }

    /// Take a free region for a request buffer, or `None` if exhausted.
    pub fn alloc(self: &Arc<Self>) -> Option<PoolBuf> {
        let region = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.free.pop()?;
            Arc::clone(&inner.regions[id as usize])
        };
        Some(PoolBuf {
            region,
            pool: Arc::clone(self),
        })
    }

    /// Add up to `count` fresh regions, clamped by the pool growth cap.
    ///
    /// Returns descriptors for the regions actually added so the caller can
    /// announce them to the host. May return an empty vec when the cap is
    /// already reached.
    pub fn grow(&self, count: usize) -> Vec<RegionDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        let room = self.max_regions.saturating_sub(inner.regions.len());
        let adding = count.min(room);

        let mut added = Vec::with_capacity(adding);
        for _ in 0..adding {
            let id = inner.regions.len() as u32;
            inner.regions.push(Arc::new(Region::new(id, self.region_size)));
            inner.free.push(id);
            added.push(RegionDescriptor {
                region: id,
                len: self.region_size as u32,
            });
        }
        debug!(
            target: "volume-link::pool",
            asked = count,
            added = added.len(),
            total = inner.regions.len(),
            "pool grown"
        );
        added
    }

    fn release(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.free.contains(&id));
        inner.free.push(id);
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("region_size", &self.region_size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// RAII handle to an allocated region; returns it to the free list on drop.
pub struct PoolBuf {
    region: Arc<Region>,
    pool: Arc<PagePool>,
}

impl PoolBuf {
    pub fn region_id(&self) -> u32 {
        self.region.id
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub(crate) fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.pool.region_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.pool.release(self.region.id);
    }
}

impl std::fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuf")
            .field("region", &self.region.id)
            .finish()
    }
}
