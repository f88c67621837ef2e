use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Key value requesting an auto-generated segment key.
pub const SHM_NO_KEY: i32 = -1;

/// A named shared-memory segment: a fixed-size byte buffer shared by every
/// attacher under the same key.
#[derive(Clone)]
pub struct ShmSegment {
    key: i32,
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmSegment(key={}, {} bytes)", self.key, self.len())
    }
}

impl ShmSegment {
    /// Key this segment is registered under.
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Segment size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    /// True if the segment is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes out of the segment at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let bytes = self.bytes.read();
        let end = (offset + buf.len()).min(bytes.len());
        let n = end.saturating_sub(offset);
        buf[..n].copy_from_slice(&bytes[offset..end]);
    }

    /// Copy bytes into the segment at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.write();
        let end = (offset + data.len()).min(bytes.len());
        let n = end.saturating_sub(offset);
        bytes[offset..end].copy_from_slice(&data[..n]);
    }

    /// Run `f` over the whole segment contents.
    pub fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.write())
    }
}

/// Table of named shared-memory segments.
#[derive(Default)]
pub struct ShmTable {
    segments: Mutex<HashMap<i32, ShmSegment>>,
    next_key: AtomicU32,
}

impl std::fmt::Debug for ShmTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmTable({} segments)", self.segments.lock().len())
    }
}

impl ShmTable {
    /// Attach to the segment registered under `key`, creating it at `size`
    /// bytes if absent. Returns the segment and whether it was newly
    /// created. `SHM_NO_KEY` picks a fresh auto-generated key.
    pub fn attach(&self, key: i32, size: usize) -> (ShmSegment, bool) {
        let key = if key == SHM_NO_KEY {
            0x7000_0000 + self.next_key.fetch_add(1, Ordering::Relaxed) as i32
        } else {
            key
        };

        let mut segments = self.segments.lock();
        if let Some(seg) = segments.get(&key) {
            return (seg.clone(), false);
        }

        let seg = ShmSegment {
            key,
            bytes: Arc::new(RwLock::new(vec![0u8; size])),
        };
        segments.insert(key, seg.clone());
        log::debug!("Created shm segment key={} size={}", key, size);
        (seg, true)
    }

    /// Destroy the segment registered under `key`. Attached handles keep
    /// their buffer alive until dropped; the name is released immediately.
    pub fn destroy(&self, key: i32) {
        self.segments.lock().remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_shares_bytes() {
        let table = ShmTable::default();
        let (a, created_a) = table.attach(7, 64);
        let (b, created_b) = table.attach(7, 64);
        assert!(created_a);
        assert!(!created_b);

        a.write(10, b"hello");
        let mut buf = [0u8; 5];
        b.read(10, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_auto_key_and_destroy() {
        let table = ShmTable::default();
        let (a, _) = table.attach(SHM_NO_KEY, 16);
        let (b, _) = table.attach(SHM_NO_KEY, 16);
        assert_ne!(a.key(), b.key());

        table.destroy(a.key());
        let (c, created) = table.attach(a.key(), 16);
        assert!(created);
        assert_eq!(c.len(), 16);
    }
}
