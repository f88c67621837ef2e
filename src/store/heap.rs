use crate::tools::error::{DtnError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

const HEAP_MAGIC: u64 = 0x64746e_68656170; // "dtn heap"
const JOURNAL_MAGIC: u64 = 0x64746e_6a726e6c; // "dtn jrnl"

const OFF_MAGIC: usize = 0;
const OFF_SIZE: usize = 8;
const OFF_FREE_HEAD: usize = 16;
const OFF_CATALOG: usize = 24;
const HEADER_SIZE: usize = 32;

const USED_BIT: u64 = 1;
const MIN_PAYLOAD: u64 = 8;

/// Opaque location of a byte region in the durable heap.
///
/// `Addr::NULL` (zero) never names a valid region. Locations are stable
/// across process restarts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
pub struct Addr(pub u64);

impl Addr {
    /// The reserved null location
    pub const NULL: Addr = Addr(0);

    /// True if this is the null location
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Fixed-layout record storable in the heap.
///
/// Records encode to little-endian words so that a record can be rewritten
/// in place without changing its size.
pub trait Rec: Sized {
    /// Encoded size in bytes
    const SIZE: usize;
    /// Encode into `buf`, which is exactly `SIZE` bytes
    fn encode(&self, buf: &mut [u8]);
    /// Decode from `buf`, which is exactly `SIZE` bytes
    fn decode(buf: &[u8]) -> Self;
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

struct HeapState {
    image: Vec<u8>,
}

/// A process-wide transactional durable heap.
///
/// Obtain one with [`Heap::create`] or [`Heap::open`], then mutate it
/// through [`Heap::begin`].
pub struct Heap {
    state: Mutex<HeapState>,
    file: File,
    journal_path: PathBuf,
    path: PathBuf,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Heap({:?})", self.path)
    }
}

impl Heap {
    /// Create a new heap of `heap_size` usable bytes backed by the file at
    /// `path`. Fails if the file already exists.
    pub fn create<P: AsRef<Path>>(path: P, heap_size: u64) -> Result<Heap> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(DtnError::new_kind(
                std::io::ErrorKind::AlreadyExists,
                format!("Heap file {:?} already exists", path),
            ));
        }

        let total = HEADER_SIZE as u64 + 8 + heap_size;
        let mut image = vec![0u8; total as usize];
        put_u64(&mut image, OFF_MAGIC, HEAP_MAGIC);
        put_u64(&mut image, OFF_SIZE, total);

        // The whole allocatable region starts out as one free block.
        let first_payload = HEADER_SIZE as u64 + 8;
        put_u64(&mut image, HEADER_SIZE, heap_size);
        put_u64(&mut image, first_payload as usize, 0);
        put_u64(&mut image, OFF_FREE_HEAD, first_payload);
        put_u64(&mut image, OFF_CATALOG, 0);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&image)?;
        file.sync_all()?;

        log::info!("Created heap {:?}, {} usable bytes", path, heap_size);
        Ok(Heap {
            state: Mutex::new(HeapState { image }),
            file,
            journal_path: journal_path_for(&path),
            path,
        })
    }

    /// Open an existing heap, replaying any committed journal left behind
    /// by a crash.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Heap> {
        let path = path.as_ref().to_path_buf();
        let journal_path = journal_path_for(&path);
        replay_journal(&path, &journal_path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        if image.len() < HEADER_SIZE || get_u64(&image, OFF_MAGIC) != HEAP_MAGIC {
            return Err(DtnError::new(format!("{:?} is not a heap file", path)));
        }

        if get_u64(&image, OFF_SIZE) != image.len() as u64 {
            return Err(DtnError::new(format!("Heap file {:?} is truncated", path)));
        }

        log::info!("Opened heap {:?}, {} bytes", path, image.len());
        Ok(Heap {
            state: Mutex::new(HeapState { image }),
            file,
            journal_path,
            path,
        })
    }

    /// Begin a transaction. Blocks until any concurrent writer commits or
    /// cancels; there is a single writer at a time.
    pub fn begin(&self) -> Txn<'_> {
        Txn {
            heap: self,
            state: self.state.lock(),
            undo: Vec::new(),
            dirty: Vec::new(),
            done: false,
        }
    }

    /// Best-effort read outside any transaction.
    ///
    /// Reads the last committed state from the backing file, so a reader
    /// never blocks on a writer; it may observe a value that a concurrent
    /// uncommitted transaction is about to replace.
    pub fn snap(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, addr.0)?;
        Ok(())
    }

    /// Best-effort record read outside any transaction.
    pub fn snap_rec<T: Rec>(&self, addr: Addr) -> Result<T> {
        let mut buf = vec![0u8; T::SIZE];
        self.snap(addr, &mut buf)?;
        Ok(T::decode(&buf))
    }
}

fn journal_path_for(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".jnl");
    PathBuf::from(p)
}

/// Apply a complete journal to the heap file, or discard an incomplete one.
fn replay_journal(path: &Path, journal_path: &Path) -> Result<()> {
    let mut journal = Vec::new();
    match File::open(journal_path) {
        Ok(mut f) => f.read_to_end(&mut journal)?,
        Err(_) => return Ok(()),
    };

    let complete = journal.len() >= 16
        && get_u64(&journal, 0) == JOURNAL_MAGIC
        && get_u64(&journal, journal.len() - 8) == JOURNAL_MAGIC;
    if !complete {
        log::warn!("Discarding incomplete journal {:?}", journal_path);
        std::fs::remove_file(journal_path)?;
        return Ok(());
    }

    log::warn!("Replaying journal {:?}", journal_path);
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut pos = 8;
    while pos + 16 <= journal.len() - 8 {
        let off = get_u64(&journal, pos);
        let len = get_u64(&journal, pos + 8) as usize;
        pos += 16;
        if pos + len > journal.len() - 8 {
            return Err(DtnError::new("Corrupt journal record"));
        }
        file.write_all_at(&journal[pos..pos + len], off)?;
        pos += len;
    }

    file.sync_all()?;
    std::fs::remove_file(journal_path)?;
    Ok(())
}

/// A durable-heap transaction.
///
/// All reads and writes against the heap image go through a `Txn`. Dropping
/// a `Txn` without calling [`Txn::commit`] cancels it, restoring the heap
/// to its pre-transaction state.
pub struct Txn<'a> {
    heap: &'a Heap,
    state: MutexGuard<'a, HeapState>,
    undo: Vec<(usize, Vec<u8>)>,
    dirty: Vec<(usize, usize)>,
    done: bool,
}

impl std::fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn({} dirty ranges)", self.dirty.len())
    }
}

impl<'a> Txn<'a> {
    fn check(&self, addr: Addr, len: usize) -> Result<()> {
        let end = addr.0 as usize + len;
        if addr.is_null() || end > self.state.image.len() {
            return Err(DtnError::new(format!(
                "Heap access out of bounds: {} + {}",
                addr, len
            )));
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `addr`.
    pub fn read(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.check(addr, buf.len())?;
        let start = addr.0 as usize;
        buf.copy_from_slice(&self.state.image[start..start + buf.len()]);
        Ok(())
    }

    /// Read with intent to write back. Identical view to [`Txn::read`];
    /// kept as a named operation for call sites that stage a record,
    /// mutate it, and rewrite it.
    pub fn stage(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.read(addr, buf)
    }

    /// Write `bytes` at `addr`.
    pub fn write(&mut self, addr: Addr, bytes: &[u8]) -> Result<()> {
        self.check(addr, bytes.len())?;
        let start = addr.0 as usize;
        self.undo
            .push((start, self.state.image[start..start + bytes.len()].to_vec()));
        self.dirty.push((start, bytes.len()));
        self.state.image[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn read_u64(&self, addr: Addr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn write_u64(&mut self, addr: Addr, v: u64) -> Result<()> {
        self.write(addr, &v.to_le_bytes())
    }

    /// Allocate `len` bytes; returns the location of the new region.
    pub fn malloc(&mut self, len: u64) -> Result<Addr> {
        let len = (len.max(MIN_PAYLOAD) + 7) & !7;

        // First fit over the free list.
        let mut prev = Addr::NULL;
        let mut cur = Addr(self.read_u64(Addr(OFF_FREE_HEAD as u64))?);
        while !cur.is_null() {
            let hdr = Addr(cur.0 - 8);
            let size = self.read_u64(hdr)?;
            debug_assert_eq!(size & USED_BIT, 0);
            let next = Addr(self.read_u64(cur)?);
            if size >= len {
                if size >= len + 8 + MIN_PAYLOAD {
                    // Split off the tail as a new free block.
                    let rest_payload = Addr(cur.0 + len + 8);
                    self.write_u64(Addr(rest_payload.0 - 8), size - len - 8)?;
                    self.write_u64(rest_payload, next.0)?;
                    self.unlink_free(prev, rest_payload)?;
                    self.write_u64(hdr, len | USED_BIT)?;
                } else {
                    self.unlink_free(prev, next.0.into())?;
                    self.write_u64(hdr, size | USED_BIT)?;
                }
                return Ok(cur);
            }
            prev = cur;
            cur = next;
        }

        Err(DtnError::new_kind(
            std::io::ErrorKind::OutOfMemory,
            format!("Heap exhausted allocating {} bytes", len),
        ))
    }

    fn unlink_free(&mut self, prev: Addr, next: Addr) -> Result<()> {
        if prev.is_null() {
            self.write_u64(Addr(OFF_FREE_HEAD as u64), next.0)
        } else {
            self.write_u64(prev, next.0)
        }
    }

    /// Release the region at `addr`.
    pub fn free(&mut self, addr: Addr) -> Result<()> {
        let hdr = Addr(addr.0 - 8);
        let size = self.read_u64(hdr)?;
        if size & USED_BIT == 0 {
            return Err(DtnError::new(format!("Double free at {}", addr)));
        }
        let mut size = size & !USED_BIT;

        // Coalesce with the physically-following block when it is free.
        let next_payload = Addr(addr.0 + size + 8);
        if (next_payload.0 as usize) < self.state.image.len() {
            let next_size = self.read_u64(Addr(next_payload.0 - 8))?;
            if next_size & USED_BIT == 0 {
                self.remove_from_free_list(next_payload)?;
                size += next_size + 8;
            }
        }

        let head = self.read_u64(Addr(OFF_FREE_HEAD as u64))?;
        self.write_u64(hdr, size)?;
        self.write_u64(addr, head)?;
        self.write_u64(Addr(OFF_FREE_HEAD as u64), addr.0)
    }

    fn remove_from_free_list(&mut self, payload: Addr) -> Result<()> {
        let mut prev = Addr::NULL;
        let mut cur = Addr(self.read_u64(Addr(OFF_FREE_HEAD as u64))?);
        while !cur.is_null() {
            let next = Addr(self.read_u64(cur)?);
            if cur == payload {
                return self.unlink_free(prev, next);
            }
            prev = cur;
            cur = next;
        }
        Err(DtnError::new(format!("Free block {} not on free list", payload)))
    }

    /// Size of the allocation at `addr`.
    pub fn object_len(&self, addr: Addr) -> Result<u64> {
        let size = self.read_u64(Addr(addr.0 - 8))?;
        Ok(size & !USED_BIT)
    }

    /// Decode a record stored at `addr`.
    pub fn get<T: Rec>(&self, addr: Addr) -> Result<T> {
        let mut buf = vec![0u8; T::SIZE];
        self.read(addr, &mut buf)?;
        Ok(T::decode(&buf))
    }

    /// Encode a record over the region at `addr`.
    pub fn put<T: Rec>(&mut self, addr: Addr, rec: &T) -> Result<()> {
        let mut buf = vec![0u8; T::SIZE];
        rec.encode(&mut buf);
        self.write(addr, &buf)
    }

    /// Allocate a region sized for `T` and store `rec` in it.
    pub fn alloc_rec<T: Rec>(&mut self, rec: &T) -> Result<Addr> {
        let addr = self.malloc(T::SIZE as u64)?;
        self.put(addr, rec)?;
        Ok(addr)
    }

    /// Store a string as a length-prefixed heap allocation.
    pub fn put_str(&mut self, s: &str) -> Result<Addr> {
        let bytes = s.as_bytes();
        let addr = self.malloc(8 + bytes.len() as u64)?;
        self.write_u64(addr, bytes.len() as u64)?;
        if !bytes.is_empty() {
            self.write(Addr(addr.0 + 8), bytes)?;
        }
        Ok(addr)
    }

    /// Read back a string stored with [`Txn::put_str`].
    pub fn get_str(&self, addr: Addr) -> Result<String> {
        let len = self.read_u64(addr)? as usize;
        let mut buf = vec![0u8; len];
        self.read(Addr(addr.0 + 8), &mut buf)?;
        String::from_utf8(buf).map_err(|_| DtnError::new(format!("Non-UTF8 string at {}", addr)))
    }

    /// Allocate a byte array and fill it with `bytes`.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<Addr> {
        let addr = self.malloc(bytes.len() as u64)?;
        self.write(addr, bytes)?;
        Ok(addr)
    }

    /// Store bytes as a length-prefixed heap allocation, so the exact
    /// length survives the allocator's size rounding.
    pub fn put_blob(&mut self, bytes: &[u8]) -> Result<Addr> {
        let addr = self.malloc(8 + bytes.len() as u64)?;
        self.write_u64(addr, bytes.len() as u64)?;
        if !bytes.is_empty() {
            self.write(Addr(addr.0 + 8), bytes)?;
        }
        Ok(addr)
    }

    /// Read back bytes stored with [`Txn::put_blob`].
    pub fn get_blob(&self, addr: Addr) -> Result<Vec<u8>> {
        let len = self.read_u64(addr)? as usize;
        let mut buf = vec![0u8; len];
        self.read(Addr(addr.0 + 8), &mut buf)?;
        Ok(buf)
    }

    /// Register `addr` in the catalog under `name`.
    pub fn catlg(&mut self, name: &str, addr: Addr) -> Result<()> {
        let catalog = self.catalog_list()?;
        let name_addr = self.put_str(name)?;
        let entry = self.malloc(16)?;
        self.write_u64(entry, name_addr.0)?;
        self.write_u64(Addr(entry.0 + 8), addr.0)?;
        self.list_insert_last(catalog, entry)?;
        Ok(())
    }

    /// Find the catalog entry registered under `name`.
    pub fn find(&self, name: &str) -> Result<Option<Addr>> {
        let catalog = Addr(self.read_u64(Addr(OFF_CATALOG as u64))?);
        if catalog.is_null() {
            return Ok(None);
        }

        let mut elt = self.list_first(catalog)?;
        while !elt.is_null() {
            let entry = self.list_data(elt)?;
            let name_addr = Addr(self.read_u64(entry)?);
            if self.get_str(name_addr)? == name {
                return Ok(Some(Addr(self.read_u64(Addr(entry.0 + 8))?)));
            }
            elt = self.list_next(elt)?;
        }
        Ok(None)
    }

    fn catalog_list(&mut self) -> Result<Addr> {
        let catalog = Addr(self.read_u64(Addr(OFF_CATALOG as u64))?);
        if !catalog.is_null() {
            return Ok(catalog);
        }
        let catalog = self.list_create()?;
        self.write_u64(Addr(OFF_CATALOG as u64), catalog.0)?;
        Ok(catalog)
    }

    /// Commit the transaction: all mutations become visible and durable.
    pub fn commit(mut self) -> Result<()> {
        self.dirty.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::new();
        for &(start, len) in &self.dirty {
            match merged.last_mut() {
                Some((mstart, mlen)) if start <= *mstart + *mlen => {
                    *mlen = (*mlen).max(start + len - *mstart);
                }
                _ => merged.push((start, len)),
            }
        }

        if !merged.is_empty() {
            let mut journal = Vec::new();
            journal.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
            for &(start, len) in &merged {
                journal.extend_from_slice(&(start as u64).to_le_bytes());
                journal.extend_from_slice(&(len as u64).to_le_bytes());
                journal.extend_from_slice(&self.state.image[start..start + len]);
            }
            journal.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());

            let mut jf = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.heap.journal_path)?;
            jf.write_all(&journal)?;
            jf.sync_all()?;

            for &(start, len) in &merged {
                self.heap
                    .file
                    .write_all_at(&self.state.image[start..start + len], start as u64)?;
            }
            self.heap.file.sync_all()?;
            std::fs::remove_file(&self.heap.journal_path)?;
        }

        self.done = true;
        Ok(())
    }

    /// Cancel the transaction, restoring the pre-transaction state.
    pub fn cancel(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        for (start, old) in self.undo.drain(..).rev() {
            let image = &mut self.state.image;
            image[start..start + old.len()].copy_from_slice(&old);
        }
        self.done = true;
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            log::debug!("Transaction dropped without commit, cancelling");
            self.rollback();
        }
    }
}

impl From<u64> for Addr {
    fn from(v: u64) -> Self {
        Addr(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_heap(size: u64) -> (tempfile::TempDir, Heap) {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("test.heap"), size).unwrap();
        (dir, heap)
    }

    #[test]
    fn test_malloc_free_reuse() {
        let (_dir, heap) = temp_heap(4096);
        let mut txn = heap.begin();
        let a = txn.malloc(100).unwrap();
        let b = txn.malloc(100).unwrap();
        assert_ne!(a, b);
        txn.free(a).unwrap();
        let c = txn.malloc(100).unwrap();
        assert_eq!(a, c);
        txn.commit().unwrap();
    }

    #[test]
    fn test_rollback_on_drop() {
        let (_dir, heap) = temp_heap(4096);
        let addr = {
            let mut txn = heap.begin();
            let addr = txn.malloc(32).unwrap();
            txn.write(addr, b"committed data bytes please keep").unwrap();
            txn.commit().unwrap();
            addr
        };

        {
            let mut txn = heap.begin();
            txn.write(addr, b"uncommitted scribble over bytes!").unwrap();
            // Dropped without commit.
        }

        let txn = heap.begin();
        let mut buf = [0u8; 32];
        txn.read(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"committed data bytes please keep");
    }

    #[test]
    fn test_snap_sees_committed_state_only() {
        let (_dir, heap) = temp_heap(4096);
        let mut txn = heap.begin();
        let addr = txn.malloc(8).unwrap();
        txn.write(addr, b"12345678").unwrap();
        txn.commit().unwrap();

        let mut buf = [0u8; 8];
        heap.snap(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"12345678");
    }

    #[test]
    fn test_persistence_across_open() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.heap");
        let addr;
        {
            let heap = Heap::create(&path, 4096).unwrap();
            let mut txn = heap.begin();
            addr = txn.malloc(16).unwrap();
            txn.write(addr, b"survives reopen!").unwrap();
            txn.catlg("probe", addr).unwrap();
            txn.commit().unwrap();
        }

        let heap = Heap::open(&path).unwrap();
        let txn = heap.begin();
        assert_eq!(txn.find("probe").unwrap(), Some(addr));
        let mut buf = [0u8; 16];
        txn.read(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"survives reopen!");
    }

    #[test]
    fn test_strings() {
        let (_dir, heap) = temp_heap(4096);
        let mut txn = heap.begin();
        let s = txn.put_str("ipn:5.1").unwrap();
        assert_eq!(txn.get_str(s).unwrap(), "ipn:5.1");
        let empty = txn.put_str("").unwrap();
        assert_eq!(txn.get_str(empty).unwrap(), "");
        txn.commit().unwrap();
    }

    #[test]
    fn test_exhaustion() {
        let (_dir, heap) = temp_heap(256);
        let mut txn = heap.begin();
        let r = txn.malloc(100000);
        assert!(r.is_err());
        txn.cancel();
    }
}
