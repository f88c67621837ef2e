use crate::store::{Addr, Rec, Txn};
use crate::tools::error::{DtnError, Result};
use std::os::unix::fs::MetadataExt;

/// Fill byte delivered by a reader when a referenced file has been
/// replaced or truncated underneath a ZCO.
pub const FILE_FILL_CHAR: u8 = 0x20;

const MAX_PATH_LEN: usize = 255;
const MAX_SCRIPT_LEN: usize = 255;

const DEFAULT_OCCUPANCY_CAP: u64 = 1_000_000_000_000_000_000;

/// Handle of a zero-copy object in the heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Zco(pub Addr);

impl Zco {
    /// True if this handle is null.
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// Handle of a reference-counted file descriptor in the heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FileRef(pub Addr);

/// Backing medium of a source extent.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZcoMedium {
    /// Extent bytes live in a file referenced by a [`FileRef`]
    File,
    /// Extent bytes live in a heap byte array
    Heap,
}

impl ZcoMedium {
    fn to_u64(self) -> u64 {
        match self {
            ZcoMedium::File => 0,
            ZcoMedium::Heap => 1,
        }
    }

    fn from_u64(v: u64) -> ZcoMedium {
        match v {
            0 => ZcoMedium::File,
            _ => ZcoMedium::Heap,
        }
    }
}

fn get(buf: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap())
}

fn put(buf: &mut [u8], i: usize, v: u64) {
    buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

/// Occupancy totals and caps, cataloged as `"zcodb"`.
#[derive(Debug, Default)]
struct ZcoDb {
    heap_occupancy: u64,
    max_heap_occupancy: u64,
    file_occupancy: u64,
    max_file_occupancy: u64,
}

impl Rec for ZcoDb {
    const SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.heap_occupancy);
        put(buf, 1, self.max_heap_occupancy);
        put(buf, 2, self.file_occupancy);
        put(buf, 3, self.max_file_occupancy);
    }

    fn decode(buf: &[u8]) -> Self {
        ZcoDb {
            heap_occupancy: get(buf, 0),
            max_heap_occupancy: get(buf, 1),
            file_occupancy: get(buf, 2),
            max_file_occupancy: get(buf, 3),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FileRefRec {
    pub ref_count: u64,
    pub okay_to_destroy: bool,
    pub unlink_on_destroy: bool,
    pub inode: u64,
    pub file_length: u64,
    pub xmit_progress: u64,
    pub occupancy: u64,
    pub path: Addr,
    pub cleanup_script: Addr,
}

impl Rec for FileRefRec {
    const SIZE: usize = 64;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.ref_count);
        put(
            buf,
            1,
            (self.okay_to_destroy as u64) | ((self.unlink_on_destroy as u64) << 1),
        );
        put(buf, 2, self.inode);
        put(buf, 3, self.file_length);
        put(buf, 4, self.xmit_progress);
        put(buf, 5, self.occupancy);
        put(buf, 6, self.path.0);
        put(buf, 7, self.cleanup_script.0);
    }

    fn decode(buf: &[u8]) -> Self {
        let flags = get(buf, 1);
        FileRefRec {
            ref_count: get(buf, 0),
            okay_to_destroy: flags & 1 != 0,
            unlink_on_destroy: flags & 2 != 0,
            inode: get(buf, 2),
            file_length: get(buf, 3),
            xmit_progress: get(buf, 4),
            occupancy: get(buf, 5),
            path: Addr(get(buf, 6)),
            cleanup_script: Addr(get(buf, 7)),
        }
    }
}

/// Reference-counted descriptor of a heap byte array.
#[derive(Debug, Default)]
struct HeapRefRec {
    ref_count: u64,
    obj_length: u64,
    location: Addr,
}

impl Rec for HeapRefRec {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.ref_count);
        put(buf, 1, self.obj_length);
        put(buf, 2, self.location.0);
    }

    fn decode(buf: &[u8]) -> Self {
        HeapRefRec {
            ref_count: get(buf, 0),
            obj_length: get(buf, 1),
            location: Addr(get(buf, 2)),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ExtentRec {
    pub medium: u64,
    pub location: Addr,
    pub offset: u64,
    pub length: u64,
    pub next: Addr,
}

impl ExtentRec {
    pub fn medium(&self) -> ZcoMedium {
        ZcoMedium::from_u64(self.medium)
    }
}

impl Rec for ExtentRec {
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.medium);
        put(buf, 1, self.location.0);
        put(buf, 2, self.offset);
        put(buf, 3, self.length);
        put(buf, 4, self.next.0);
    }

    fn decode(buf: &[u8]) -> Self {
        ExtentRec {
            medium: get(buf, 0),
            location: Addr(get(buf, 1)),
            offset: get(buf, 2),
            length: get(buf, 3),
            next: Addr(get(buf, 4)),
        }
    }
}

#[derive(Debug, Default)]
struct CapsuleRec {
    text: Addr,
    length: u64,
    prev: Addr,
    next: Addr,
}

impl Rec for CapsuleRec {
    const SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.text.0);
        put(buf, 1, self.length);
        put(buf, 2, self.prev.0);
        put(buf, 3, self.next.0);
    }

    fn decode(buf: &[u8]) -> Self {
        CapsuleRec {
            text: Addr(get(buf, 0)),
            length: get(buf, 1),
            prev: Addr(get(buf, 2)),
            next: Addr(get(buf, 3)),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ZcoRec {
    pub first_header: Addr,
    pub last_header: Addr,
    pub first_extent: Addr,
    pub last_extent: Addr,
    pub headers_length: u64,
    pub source_length: u64,
    pub trailers_length: u64,
    pub first_trailer: Addr,
    pub last_trailer: Addr,
    pub aggregate_capsule_length: u64,
    pub total_length: u64,
}

impl Rec for ZcoRec {
    const SIZE: usize = 88;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.first_header.0);
        put(buf, 1, self.last_header.0);
        put(buf, 2, self.first_extent.0);
        put(buf, 3, self.last_extent.0);
        put(buf, 4, self.headers_length);
        put(buf, 5, self.source_length);
        put(buf, 6, self.trailers_length);
        put(buf, 7, self.first_trailer.0);
        put(buf, 8, self.last_trailer.0);
        put(buf, 9, self.aggregate_capsule_length);
        put(buf, 10, self.total_length);
    }

    fn decode(buf: &[u8]) -> Self {
        ZcoRec {
            first_header: Addr(get(buf, 0)),
            last_header: Addr(get(buf, 1)),
            first_extent: Addr(get(buf, 2)),
            last_extent: Addr(get(buf, 3)),
            headers_length: get(buf, 4),
            source_length: get(buf, 5),
            trailers_length: get(buf, 6),
            first_trailer: Addr(get(buf, 7)),
            last_trailer: Addr(get(buf, 8)),
            aggregate_capsule_length: get(buf, 9),
            total_length: get(buf, 10),
        }
    }
}

impl ZcoRec {
    /// Total extent bytes: everything that is not an explicit capsule.
    pub fn extent_bytes(&self) -> u64 {
        self.total_length - self.aggregate_capsule_length
    }
}

fn zcodb(txn: &mut Txn) -> Result<Addr> {
    if let Some(addr) = txn.find("zcodb")? {
        return Ok(addr);
    }
    let db = ZcoDb {
        heap_occupancy: 0,
        max_heap_occupancy: DEFAULT_OCCUPANCY_CAP,
        file_occupancy: 0,
        max_file_occupancy: DEFAULT_OCCUPANCY_CAP,
    };
    let addr = txn.alloc_rec(&db)?;
    txn.catlg("zcodb", addr)?;
    Ok(addr)
}

fn increase_heap(txn: &mut Txn, n: u64) -> Result<()> {
    let addr = zcodb(txn)?;
    let mut db: ZcoDb = txn.get(addr)?;
    db.heap_occupancy += n;
    txn.put(addr, &db)
}

fn reduce_heap(txn: &mut Txn, n: u64) -> Result<()> {
    let addr = zcodb(txn)?;
    let mut db: ZcoDb = txn.get(addr)?;
    db.heap_occupancy = db.heap_occupancy.saturating_sub(n);
    txn.put(addr, &db)
}

fn increase_file(txn: &mut Txn, n: u64) -> Result<()> {
    let addr = zcodb(txn)?;
    let mut db: ZcoDb = txn.get(addr)?;
    db.file_occupancy += n;
    txn.put(addr, &db)
}

fn reduce_file(txn: &mut Txn, n: u64) -> Result<()> {
    let addr = zcodb(txn)?;
    let mut db: ZcoDb = txn.get(addr)?;
    db.file_occupancy = db.file_occupancy.saturating_sub(n);
    txn.put(addr, &db)
}

/// Current heap-bytes occupancy attributed to ZCOs.
pub fn heap_occupancy(txn: &mut Txn) -> Result<u64> {
    let addr = zcodb(txn)?;
    Ok(txn.get::<ZcoDb>(addr)?.heap_occupancy)
}

/// Current file-bytes occupancy attributed to ZCOs.
pub fn file_occupancy(txn: &mut Txn) -> Result<u64> {
    let addr = zcodb(txn)?;
    Ok(txn.get::<ZcoDb>(addr)?.file_occupancy)
}

/// Set the heap occupancy cap.
pub fn set_max_heap_occupancy(txn: &mut Txn, cap: u64) -> Result<()> {
    let addr = zcodb(txn)?;
    let mut db: ZcoDb = txn.get(addr)?;
    db.max_heap_occupancy = cap;
    txn.put(addr, &db)
}

/// Set the file occupancy cap.
pub fn set_max_file_occupancy(txn: &mut Txn, cap: u64) -> Result<()> {
    let addr = zcodb(txn)?;
    let mut db: ZcoDb = txn.get(addr)?;
    db.max_file_occupancy = cap;
    txn.put(addr, &db)
}

/// Would admitting `n` more heap bytes stay within the cap?
pub fn enough_heap_space(txn: &mut Txn, n: u64) -> Result<bool> {
    let addr = zcodb(txn)?;
    let db: ZcoDb = txn.get(addr)?;
    Ok(db.heap_occupancy + n <= db.max_heap_occupancy)
}

/// Would admitting `n` more file bytes stay within the cap?
pub fn enough_file_space(txn: &mut Txn, n: u64) -> Result<bool> {
    let addr = zcodb(txn)?;
    let db: ZcoDb = txn.get(addr)?;
    Ok(db.file_occupancy + n <= db.max_file_occupancy)
}

fn resolve_path(path: &str) -> Result<String> {
    let resolved = if path.starts_with('/') {
        path.to_owned()
    } else {
        let cwd = std::env::current_dir()?;
        cwd.join(path).to_string_lossy().into_owned()
    };
    if resolved.is_empty() || resolved.len() > MAX_PATH_LEN {
        return Err(DtnError::new(format!("Bad file path length: {}", resolved.len())));
    }
    Ok(resolved)
}

/// Create a reference-counted descriptor of the file at `path`.
///
/// `cleanup_script`: `None` for no cleanup on destruction, `Some("")` to
/// unlink the file on destruction, `Some(cmd)` to run `cmd` on destruction.
/// The file's inode is captured now so that later replacement of the file
/// can be detected by readers.
pub fn create_file_ref(txn: &mut Txn, path: &str, cleanup_script: Option<&str>) -> Result<FileRef> {
    let path = resolve_path(path)?;
    if let Some(script) = cleanup_script {
        if script.len() > MAX_SCRIPT_LEN {
            return Err(DtnError::new("Cleanup script too long"));
        }
    }

    let meta = std::fs::metadata(&path)
        .map_err(|e| DtnError::new(format!("Can't stat source file {}: {}", path, e)))?;
    std::fs::File::open(&path)
        .map_err(|e| DtnError::new(format!("Can't open source file {}: {}", path, e)))?;

    let path_addr = txn.put_str(&path)?;
    let (unlink_on_destroy, script_addr) = match cleanup_script {
        None => (false, Addr::NULL),
        Some("") => (true, Addr::NULL),
        Some(script) => (false, txn.put_str(script)?),
    };

    let rec = FileRefRec {
        ref_count: 0,
        okay_to_destroy: false,
        unlink_on_destroy,
        inode: meta.ino(),
        file_length: meta.len(),
        xmit_progress: 0,
        occupancy: 0,
        path: path_addr,
        cleanup_script: script_addr,
    };
    let addr = txn.alloc_rec(&rec)?;
    increase_heap(txn, FileRefRec::SIZE as u64)?;
    Ok(FileRef(addr))
}

/// Re-point an existing file reference at a (possibly changed) file,
/// re-capturing inode and length. The cleanup disposition is replaced.
pub fn revise_file_ref(
    txn: &mut Txn,
    file_ref: FileRef,
    path: &str,
    cleanup_script: Option<&str>,
) -> Result<()> {
    let path = resolve_path(path)?;
    if let Some(script) = cleanup_script {
        if script.len() > MAX_SCRIPT_LEN {
            return Err(DtnError::new("Cleanup script too long"));
        }
    }

    let meta = std::fs::metadata(&path)
        .map_err(|e| DtnError::new(format!("Can't stat source file {}: {}", path, e)))?;

    let mut rec: FileRefRec = txn.get(file_ref.0)?;
    txn.free(rec.path)?;
    if !rec.cleanup_script.is_null() {
        txn.free(rec.cleanup_script)?;
    }

    rec.path = txn.put_str(&path)?;
    rec.inode = meta.ino();
    rec.file_length = meta.len();
    match cleanup_script {
        None => {
            rec.unlink_on_destroy = false;
            rec.cleanup_script = Addr::NULL;
        }
        Some("") => {
            rec.unlink_on_destroy = true;
            rec.cleanup_script = Addr::NULL;
        }
        Some(script) => {
            rec.unlink_on_destroy = false;
            rec.cleanup_script = txn.put_str(script)?;
        }
    }
    txn.put(file_ref.0, &rec)
}

/// Pathname recorded in a file reference.
pub fn file_ref_path(txn: &Txn, file_ref: FileRef) -> Result<String> {
    let rec: FileRefRec = txn.get(file_ref.0)?;
    txn.get_str(rec.path)
}

/// True once transmit progress has reached the end of the file.
pub fn file_ref_xmit_eof(txn: &Txn, file_ref: FileRef) -> Result<bool> {
    let rec: FileRefRec = txn.get(file_ref.0)?;
    Ok(rec.xmit_progress == rec.file_length)
}

fn run_cleanup(txn: &Txn, rec: &FileRefRec) -> Result<()> {
    let path = txn.get_str(rec.path)?;
    if rec.unlink_on_destroy {
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("Can't unlink {}: {}", path, e);
        }
        return Ok(());
    }
    if !rec.cleanup_script.is_null() {
        let script = txn.get_str(rec.cleanup_script)?;
        match std::process::Command::new("sh").arg("-c").arg(&script).status() {
            Ok(status) if status.success() => {}
            Ok(status) => log::warn!("Cleanup script {:?} exited with {}", script, status),
            Err(e) => log::warn!("Can't run cleanup script {:?}: {}", script, e),
        }
    }
    Ok(())
}

fn destroy_file_reference(txn: &mut Txn, file_ref: FileRef, rec: &FileRefRec) -> Result<()> {
    reduce_file(txn, rec.occupancy)?;
    run_cleanup(txn, rec)?;
    txn.free(rec.path)?;
    if !rec.cleanup_script.is_null() {
        txn.free(rec.cleanup_script)?;
    }
    txn.free(file_ref.0)?;
    reduce_heap(txn, FileRefRec::SIZE as u64)
}

/// Authorize destruction of a file reference. If no extent cites it the
/// reference dies now; otherwise it dies when the last citing ZCO does.
pub fn destroy_file_ref(txn: &mut Txn, file_ref: FileRef) -> Result<()> {
    let mut rec: FileRefRec = txn.get(file_ref.0)?;
    if rec.ref_count == 0 {
        return destroy_file_reference(txn, file_ref, &rec);
    }
    rec.okay_to_destroy = true;
    txn.put(file_ref.0, &rec)
}

/// Allocate an empty zero-copy object.
pub fn create(txn: &mut Txn) -> Result<Zco> {
    let addr = txn.alloc_rec(&ZcoRec::default())?;
    increase_heap(txn, ZcoRec::SIZE as u64)?;
    Ok(Zco(addr))
}

fn append_extent_inner(
    txn: &mut Txn,
    zco: Zco,
    medium: ZcoMedium,
    cloning: bool,
    location: Addr,
    offset: u64,
    length: u64,
) -> Result<()> {
    increase_heap(txn, ExtentRec::SIZE as u64)?;

    let ext_location = match medium {
        ZcoMedium::File => {
            // The FileRef record's own size is already counted.
            let mut file_ref: FileRefRec = txn.get(location)?;
            file_ref.ref_count += 1;
            if !cloning {
                file_ref.occupancy += length;
                increase_file(txn, length)?;
            }
            txn.put(location, &file_ref)?;
            location
        }
        ZcoMedium::Heap if cloning => {
            let mut heap_ref: HeapRefRec = txn.get(location)?;
            heap_ref.ref_count += 1;
            txn.put(location, &heap_ref)?;
            location
        }
        ZcoMedium::Heap => {
            // Initial reference to a heap byte array: wrap it.
            let heap_ref = HeapRefRec {
                ref_count: 1,
                obj_length: length,
                location,
            };
            let ref_addr = txn.alloc_rec(&heap_ref)?;
            increase_heap(txn, length + HeapRefRec::SIZE as u64)?;
            ref_addr
        }
    };

    let extent = ExtentRec {
        medium: medium.to_u64(),
        location: ext_location,
        offset,
        length,
        next: Addr::NULL,
    };
    let extent_addr = txn.alloc_rec(&extent)?;

    let mut rec: ZcoRec = txn.get(zco.0)?;
    if rec.first_extent.is_null() {
        rec.first_extent = extent_addr;
    } else {
        let mut prev: ExtentRec = txn.get(rec.last_extent)?;
        prev.next = extent_addr;
        txn.put(rec.last_extent, &prev)?;
    }
    rec.last_extent = extent_addr;
    rec.source_length += length;
    rec.total_length += length;
    txn.put(zco.0, &rec)
}

/// Append one source-data extent.
///
/// For `ZcoMedium::File`, `location` is a [`FileRef`] and `offset`/`length`
/// select a region of the file. For `ZcoMedium::Heap`, `location` is a heap
/// byte array, which the ZCO system takes ownership of (it is freed when
/// the last citing ZCO is destroyed).
pub fn append_extent(
    txn: &mut Txn,
    zco: Zco,
    medium: ZcoMedium,
    location: Addr,
    offset: u64,
    length: u64,
) -> Result<()> {
    if location.is_null() || length == 0 {
        return Err(DtnError::new_kind(
            std::io::ErrorKind::InvalidInput,
            "Extent location and length must be nonzero",
        ));
    }
    append_extent_inner(txn, zco, medium, false, location, offset, length)
}

/// Attach a protocol header above all current content.
pub fn prepend_header(txn: &mut Txn, zco: Zco, text: &[u8]) -> Result<()> {
    if text.is_empty() {
        return Err(DtnError::new("Empty header"));
    }

    let text_addr = txn.put_bytes(text)?;
    let mut rec: ZcoRec = txn.get(zco.0)?;
    let capsule = CapsuleRec {
        text: text_addr,
        length: text.len() as u64,
        prev: Addr::NULL,
        next: rec.first_header,
    };
    let capsule_addr = txn.alloc_rec(&capsule)?;
    increase_heap(txn, text.len() as u64 + CapsuleRec::SIZE as u64)?;

    if rec.first_header.is_null() {
        rec.last_header = capsule_addr;
    } else {
        let mut next: CapsuleRec = txn.get(rec.first_header)?;
        next.prev = capsule_addr;
        txn.put(rec.first_header, &next)?;
    }
    rec.first_header = capsule_addr;
    rec.aggregate_capsule_length += text.len() as u64;
    rec.total_length += text.len() as u64;
    txn.put(zco.0, &rec)
}

/// Attach a protocol trailer below all current content.
pub fn append_trailer(txn: &mut Txn, zco: Zco, text: &[u8]) -> Result<()> {
    if text.is_empty() {
        return Err(DtnError::new("Empty trailer"));
    }

    let text_addr = txn.put_bytes(text)?;
    let mut rec: ZcoRec = txn.get(zco.0)?;
    let capsule = CapsuleRec {
        text: text_addr,
        length: text.len() as u64,
        prev: rec.last_trailer,
        next: Addr::NULL,
    };
    let capsule_addr = txn.alloc_rec(&capsule)?;
    increase_heap(txn, text.len() as u64 + CapsuleRec::SIZE as u64)?;

    if rec.last_trailer.is_null() {
        rec.first_trailer = capsule_addr;
    } else {
        let mut prev: CapsuleRec = txn.get(rec.last_trailer)?;
        prev.next = capsule_addr;
        txn.put(rec.last_trailer, &prev)?;
    }
    rec.last_trailer = capsule_addr;
    rec.aggregate_capsule_length += text.len() as u64;
    rec.total_length += text.len() as u64;
    txn.put(zco.0, &rec)
}

/// Unlink and free the outermost header capsule.
pub fn discard_first_header(txn: &mut Txn, zco: Zco) -> Result<()> {
    let mut rec: ZcoRec = txn.get(zco.0)?;
    if rec.first_header.is_null() {
        log::warn!("No header to discard");
        return Ok(());
    }

    let capsule: CapsuleRec = txn.get(rec.first_header)?;
    txn.free(capsule.text)?;
    txn.free(rec.first_header)?;
    reduce_heap(txn, capsule.length + CapsuleRec::SIZE as u64)?;
    rec.aggregate_capsule_length -= capsule.length;
    rec.total_length -= capsule.length;
    rec.first_header = capsule.next;
    if capsule.next.is_null() {
        rec.last_header = Addr::NULL;
    } else {
        let mut next: CapsuleRec = txn.get(capsule.next)?;
        next.prev = Addr::NULL;
        txn.put(capsule.next, &next)?;
    }
    txn.put(zco.0, &rec)
}

/// Unlink and free the outermost trailer capsule.
pub fn discard_last_trailer(txn: &mut Txn, zco: Zco) -> Result<()> {
    let mut rec: ZcoRec = txn.get(zco.0)?;
    if rec.last_trailer.is_null() {
        log::warn!("No trailer to discard");
        return Ok(());
    }

    let capsule: CapsuleRec = txn.get(rec.last_trailer)?;
    txn.free(capsule.text)?;
    txn.free(rec.last_trailer)?;
    reduce_heap(txn, capsule.length + CapsuleRec::SIZE as u64)?;
    rec.aggregate_capsule_length -= capsule.length;
    rec.total_length -= capsule.length;
    rec.last_trailer = capsule.prev;
    if capsule.prev.is_null() {
        rec.first_trailer = Addr::NULL;
    } else {
        let mut prev: CapsuleRec = txn.get(capsule.prev)?;
        prev.next = Addr::NULL;
        txn.put(capsule.prev, &prev)?;
    }
    txn.put(zco.0, &rec)
}

/// Create a new ZCO citing the same backing objects as a contiguous slice
/// `[offset, offset+length)` of the original's extent bytes. Reference
/// counts of all cited descriptors are incremented; no bytes move.
pub fn clone(txn: &mut Txn, zco: Zco, offset: u64, length: u64) -> Result<Zco> {
    if length == 0 {
        return Err(DtnError::new("Clone length must be nonzero"));
    }

    let rec: ZcoRec = txn.get(zco.0)?;
    if offset + length > rec.extent_bytes() {
        return Err(DtnError::new(format!(
            "Clone range {}+{} exceeds extent bytes {}",
            offset,
            length,
            rec.extent_bytes()
        )));
    }

    let new_zco = create(txn)?;
    let mut offset = offset;
    let mut remaining = length;
    let mut obj = rec.first_extent;
    while !obj.is_null() && remaining > 0 {
        let extent: ExtentRec = txn.get(obj)?;
        if offset >= extent.length {
            offset -= extent.length;
            obj = extent.next;
            continue;
        }

        let skip = offset;
        let take = (extent.length - skip).min(remaining);
        append_extent_inner(
            txn,
            new_zco,
            extent.medium(),
            true,
            extent.location,
            extent.offset + skip,
            take,
        )?;
        offset = 0;
        remaining -= take;
        obj = extent.next;
    }

    Ok(new_zco)
}

/// Declare how the concatenated extent bytes divide into opaque header
/// content, source content, and trailer content.
pub fn delimit_source(txn: &mut Txn, zco: Zco, offset: u64, length: u64) -> Result<()> {
    let mut rec: ZcoRec = txn.get(zco.0)?;
    let total = rec.extent_bytes();
    if offset + length > total {
        return Err(DtnError::new("Source extends beyond end of ZCO"));
    }
    rec.headers_length = offset;
    rec.source_length = length;
    rec.trailers_length = total - (offset + length);
    txn.put(zco.0, &rec)
}

fn destroy_extent_text(txn: &mut Txn, extent: &ExtentRec, occupancy: &mut u64) -> Result<()> {
    match extent.medium() {
        ZcoMedium::Heap => {
            let mut heap_ref: HeapRefRec = txn.get(extent.location)?;
            heap_ref.ref_count -= 1;
            if heap_ref.ref_count == 0 {
                *occupancy += HeapRefRec::SIZE as u64 + heap_ref.obj_length;
                txn.free(heap_ref.location)?;
                txn.free(extent.location)?;
            } else {
                txn.put(extent.location, &heap_ref)?;
            }
        }
        ZcoMedium::File => {
            let mut file_ref: FileRefRec = txn.get(extent.location)?;
            file_ref.ref_count -= 1;
            if file_ref.ref_count == 0 && file_ref.okay_to_destroy {
                destroy_file_reference(txn, FileRef(extent.location), &file_ref)?;
            } else {
                txn.put(extent.location, &file_ref)?;
            }
        }
    }
    Ok(())
}

fn destroy_first_extent(txn: &mut Txn, rec: &mut ZcoRec) -> Result<()> {
    let extent: ExtentRec = txn.get(rec.first_extent)?;

    let mut occupancy = ExtentRec::SIZE as u64;
    destroy_extent_text(txn, &extent, &mut occupancy)?;
    txn.free(rec.first_extent)?;
    reduce_heap(txn, occupancy)?;

    rec.first_extent = extent.next;
    rec.total_length -= extent.length;

    // Attribute the vanished extent bytes across the three regions.
    let mut remaining = extent.length;
    let take = remaining.min(rec.headers_length);
    rec.headers_length -= take;
    remaining -= take;
    let take = remaining.min(rec.source_length);
    rec.source_length -= take;
    remaining -= take;
    rec.trailers_length -= remaining.min(rec.trailers_length);
    Ok(())
}

/// Destroy a ZCO, dropping one reference from every cited descriptor and
/// releasing whatever hits zero.
pub fn destroy(txn: &mut Txn, zco: Zco) -> Result<()> {
    let mut rec: ZcoRec = txn.get(zco.0)?;

    while !rec.first_extent.is_null() {
        destroy_first_extent(txn, &mut rec)?;
    }

    let mut obj = rec.first_header;
    while !obj.is_null() {
        let capsule: CapsuleRec = txn.get(obj)?;
        txn.free(capsule.text)?;
        txn.free(obj)?;
        reduce_heap(txn, capsule.length + CapsuleRec::SIZE as u64)?;
        obj = capsule.next;
    }

    let mut obj = rec.first_trailer;
    while !obj.is_null() {
        let capsule: CapsuleRec = txn.get(obj)?;
        txn.free(capsule.text)?;
        txn.free(obj)?;
        reduce_heap(txn, capsule.length + CapsuleRec::SIZE as u64)?;
        obj = capsule.next;
    }

    txn.free(zco.0)?;
    reduce_heap(txn, ZcoRec::SIZE as u64)
}

/// Total length: capsules plus extent bytes.
pub fn length(txn: &Txn, zco: Zco) -> Result<u64> {
    Ok(txn.get::<ZcoRec>(zco.0)?.total_length)
}

/// Extent-byte length as partitioned by `delimit_source`: headers +
/// source + trailers.
pub fn source_data_length(txn: &Txn, zco: Zco) -> Result<u64> {
    let rec: ZcoRec = txn.get(zco.0)?;
    Ok(rec.headers_length + rec.source_length + rec.trailers_length)
}

/// Collapse the extents so that only source bytes remain, excluding the
/// regions declared as header and trailer content. Extents that become
/// empty are deleted. Intended before re-transmission by a different layer.
pub fn strip(txn: &mut Txn, zco: Zco) -> Result<()> {
    let mut rec: ZcoRec = txn.get(zco.0)?;
    let mut source_to_save = rec.source_length;
    let mut prev_extent = Addr::NULL;
    let mut obj = rec.first_extent;

    while !obj.is_null() {
        let mut extent: ExtentRec = txn.get(obj)?;
        let next = extent.next;
        let mut modified = false;

        // Strip identified header text off the front.
        let header_text = extent.length.min(rec.headers_length);
        if header_text > 0 {
            rec.headers_length -= header_text;
            rec.total_length -= header_text;
            extent.offset += header_text;
            extent.length -= header_text;
            modified = true;
        }

        // Anything beyond the source bytes must be trailer text.
        if extent.length <= source_to_save {
            source_to_save -= extent.length;
        } else {
            let trailer_text = extent.length - source_to_save;
            source_to_save = 0;
            rec.trailers_length -= trailer_text;
            rec.total_length -= trailer_text;
            extent.length -= trailer_text;
            modified = true;
        }

        if extent.length == 0 {
            // The whole extent was header or trailer text; delete it.
            let mut occupancy = ExtentRec::SIZE as u64;
            destroy_extent_text(txn, &extent, &mut occupancy)?;
            txn.free(obj)?;
            reduce_heap(txn, occupancy)?;
            if prev_extent.is_null() {
                rec.first_extent = next;
            } else {
                let mut prev: ExtentRec = txn.get(prev_extent)?;
                prev.next = next;
                txn.put(prev_extent, &prev)?;
            }
            if rec.last_extent == obj {
                rec.last_extent = prev_extent;
            }
        } else {
            if modified {
                txn.put(obj, &extent)?;
            }
            prev_extent = obj;
        }

        obj = next;
    }

    txn.put(zco.0, &rec)
}

pub(crate) fn read_rec(txn: &Txn, zco: Zco) -> Result<ZcoRec> {
    txn.get(zco.0)
}

pub(crate) fn read_extent(txn: &Txn, addr: Addr) -> Result<ExtentRec> {
    txn.get(addr)
}

pub(crate) fn read_capsule(txn: &Txn, addr: Addr) -> Result<(Addr, u64, Addr)> {
    let c: CapsuleRec = txn.get(addr)?;
    Ok((c.text, c.length, c.next))
}

pub(crate) fn heap_ref_location(txn: &Txn, addr: Addr) -> Result<(Addr, u64)> {
    let r: HeapRefRec = txn.get(addr)?;
    Ok((r.location, r.obj_length))
}

pub(crate) fn file_ref_rec(txn: &Txn, addr: Addr) -> Result<FileRefRec> {
    txn.get(addr)
}

pub(crate) fn update_xmit_progress(txn: &mut Txn, addr: Addr, progress: u64) -> Result<()> {
    let mut rec: FileRefRec = txn.get(addr)?;
    if progress > rec.xmit_progress {
        rec.xmit_progress = progress;
        txn.put(addr, &rec)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Heap;
    use crate::zco::ZcoReader;
    use std::io::Write;

    fn temp_heap() -> (tempfile::TempDir, Heap) {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("zco.heap"), 1 << 20).unwrap();
        (dir, heap)
    }

    #[test]
    fn test_total_length_accounting() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = create(&mut txn).unwrap();
        let a = txn.put_bytes(b"0123456789").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 10).unwrap();
        prepend_header(&mut txn, z, b"hdr").unwrap();
        append_trailer(&mut txn, z, b"tr").unwrap();

        // total = capsule lengths + extent lengths
        assert_eq!(length(&txn, z).unwrap(), 3 + 10 + 2);
        txn.commit().unwrap();
    }

    #[test]
    fn test_empty_extent_rejected() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = create(&mut txn).unwrap();
        assert!(append_extent(&mut txn, z, ZcoMedium::Heap, Addr::NULL, 0, 0).is_err());
        let a = txn.put_bytes(b"x").unwrap();
        assert!(append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 0).is_err());
        assert!(append_extent(&mut txn, z, ZcoMedium::Heap, Addr::NULL, 0, 1).is_err());
        txn.cancel();
    }

    #[test]
    fn test_destroy_restores_heap_occupancy() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let before = heap_occupancy(&mut txn).unwrap();

        let z = create(&mut txn).unwrap();
        let a = txn.put_bytes(b"some heap payload").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 17).unwrap();
        prepend_header(&mut txn, z, b"head").unwrap();
        append_trailer(&mut txn, z, b"tail").unwrap();
        assert!(heap_occupancy(&mut txn).unwrap() > before);

        destroy(&mut txn, z).unwrap();
        assert_eq!(heap_occupancy(&mut txn).unwrap(), before);
        txn.commit().unwrap();
    }

    #[test]
    fn test_clone_shares_backing_and_destroy_order_is_free() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = create(&mut txn).unwrap();
        let a = txn.put_bytes(b"abcdefghij").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 10).unwrap();

        let c = clone(&mut txn, z, 2, 5).unwrap();
        let mut reader = ZcoReader::new(c);
        let mut buf = [0u8; 5];
        assert_eq!(reader.transmit(&mut txn, 5, Some(&mut buf)).unwrap(), 5);
        assert_eq!(&buf, b"cdefg");

        // Destroying the original must not invalidate the clone.
        destroy(&mut txn, z).unwrap();
        let mut reader = ZcoReader::new(c);
        assert_eq!(reader.transmit(&mut txn, 5, Some(&mut buf)).unwrap(), 5);
        assert_eq!(&buf, b"cdefg");
        destroy(&mut txn, c).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_clone_bounds_checked() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = create(&mut txn).unwrap();
        let a = txn.put_bytes(b"abcdefghij").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 10).unwrap();
        assert!(clone(&mut txn, z, 6, 5).is_err());
        assert!(clone(&mut txn, z, 0, 11).is_err());
        txn.cancel();
    }

    #[test]
    fn test_prepend_then_discard_is_identity() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = create(&mut txn).unwrap();
        let a = txn.put_bytes(b"body").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 4).unwrap();
        let occupancy = heap_occupancy(&mut txn).unwrap();
        let total = length(&txn, z).unwrap();

        prepend_header(&mut txn, z, b"wrapper").unwrap();
        discard_first_header(&mut txn, z).unwrap();
        assert_eq!(length(&txn, z).unwrap(), total);
        assert_eq!(heap_occupancy(&mut txn).unwrap(), occupancy);

        let mut reader = ZcoReader::new(z);
        let mut buf = [0u8; 4];
        assert_eq!(reader.transmit(&mut txn, 4, Some(&mut buf)).unwrap(), 4);
        assert_eq!(&buf, b"body");
        txn.commit().unwrap();
    }

    #[test]
    fn test_delimit_and_strip() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = create(&mut txn).unwrap();
        let a = txn.put_bytes(b"HHHsourceTTTT").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 13).unwrap();
        delimit_source(&mut txn, z, 3, 6).unwrap();

        strip(&mut txn, z).unwrap();
        assert_eq!(length(&txn, z).unwrap(), 6);
        let mut reader = ZcoReader::new(z);
        let mut buf = [0u8; 6];
        assert_eq!(reader.transmit(&mut txn, 6, Some(&mut buf)).unwrap(), 6);
        assert_eq!(&buf, b"source");
        txn.commit().unwrap();
    }

    #[test]
    fn test_clone_strip_receive_matches_original_slice() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = create(&mut txn).unwrap();
        let a = txn.put_bytes(b"0123456789abcdef").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, a, 0, 8).unwrap();
        let b = txn.put_bytes(b"0123456789abcdef").unwrap();
        append_extent(&mut txn, z, ZcoMedium::Heap, b, 8, 8).unwrap();

        // Slice [4, 12) spans the extent boundary.
        let c = clone(&mut txn, z, 4, 8).unwrap();
        delimit_source(&mut txn, c, 0, 8).unwrap();
        strip(&mut txn, c).unwrap();
        let mut reader = ZcoReader::new(c);
        let mut got = [0u8; 8];
        assert_eq!(reader.receive_source(&mut txn, 8, Some(&mut got)).unwrap(), 8);

        let mut reader = ZcoReader::new(z);
        let mut all = [0u8; 16];
        assert_eq!(reader.receive_source(&mut txn, 16, Some(&mut all)).unwrap(), 16);
        assert_eq!(&got, &all[4..12]);
        txn.commit().unwrap();
    }

    #[test]
    fn test_file_ref_two_step_destruction() {
        let (_dir, heap) = temp_heap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adu.dat");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![7u8; 600]).unwrap();
        drop(f);

        let mut txn = heap.begin();
        let fr = create_file_ref(&mut txn, path.to_str().unwrap(), Some("")).unwrap();
        let z = create(&mut txn).unwrap();
        append_extent(&mut txn, z, ZcoMedium::File, fr.0, 0, 600).unwrap();
        assert_eq!(file_occupancy(&mut txn).unwrap(), 600);

        // Destruction is requested while an extent still cites the file.
        destroy_file_ref(&mut txn, fr).unwrap();
        assert!(path.exists());

        destroy(&mut txn, z).unwrap();
        assert!(!path.exists());
        assert_eq!(file_occupancy(&mut txn).unwrap(), 0);
        txn.commit().unwrap();
    }

    #[test]
    fn test_occupancy_caps() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        set_max_heap_occupancy(&mut txn, 1000).unwrap();
        set_max_file_occupancy(&mut txn, 500).unwrap();
        assert!(enough_heap_space(&mut txn, 900).unwrap());
        assert!(!enough_heap_space(&mut txn, 1001).unwrap());
        assert!(enough_file_space(&mut txn, 500).unwrap());
        assert!(!enough_file_space(&mut txn, 501).unwrap());
        txn.commit().unwrap();
    }
}
