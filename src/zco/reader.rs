use super::object::{self, ExtentRec, Zco, ZcoMedium, FILE_FILL_CHAR};
use crate::store::{Addr, Txn};
use crate::tools::error::Result;
use std::io::Read;
use std::io::Seek;
use std::os::unix::fs::MetadataExt;

/// A cursor over one ZCO.
///
/// A transmit reader drains headers, then extent bytes, then trailers, in
/// order; a receive reader drains only extent bytes, region by region as
/// declared by `delimit_source`. Multiple readers over one ZCO are
/// independent of each other.
#[derive(Debug, Default)]
pub struct ZcoReader {
    zco: Zco,
    length_copied: u64,
    headers_length_copied: u64,
    source_length_copied: u64,
    trailers_length_copied: u64,
    track_file_offset: bool,
}

/// Which extent-byte region a receive pass drains.
enum Region {
    Headers,
    Source,
    Trailers,
}

impl ZcoReader {
    /// Position a fresh reader over `zco`.
    pub fn new(zco: Zco) -> ZcoReader {
        ZcoReader {
            zco,
            ..Default::default()
        }
    }

    /// Record transmit progress into cited file references as file bytes
    /// are drained, so senders can tell when a file has been fully sent.
    pub fn track_file_offset(&mut self) {
        self.track_file_offset = true;
    }

    /// The ZCO this reader traverses.
    pub fn zco(&self) -> Zco {
        self.zco
    }

    /// Copy up to `length` as-yet-uncopied bytes in transmission order:
    /// header capsules, then extent bytes, then trailer capsules. A `None`
    /// buffer skips the bytes. Returns the number of bytes advanced, or 0
    /// when a cited file could no longer be read faithfully (the buffer is
    /// then filled with `0x20` for the affected range).
    pub fn transmit(&mut self, txn: &mut Txn, length: u64, mut buf: Option<&mut [u8]>) -> Result<u64> {
        if length == 0 {
            return Ok(0);
        }

        let rec = object::read_rec(txn, self.zco)?;
        let mut to_skip = self.length_copied;
        let mut to_send = length;
        let mut sent: u64 = 0;
        let mut failed = false;

        // Untransmitted header capsules first.
        let mut obj = rec.first_header;
        while !obj.is_null() && to_send > 0 {
            let (text, cap_len, next) = object::read_capsule(txn, obj)?;
            if to_skip >= cap_len {
                to_skip -= cap_len;
                obj = next;
                continue;
            }

            let avbl = (cap_len - to_skip).min(to_send);
            if let Some(out) = buf.as_deref_mut() {
                let dst = &mut out[sent as usize..(sent + avbl) as usize];
                txn.read(Addr(text.0 + to_skip), dst)?;
            }
            to_skip = 0;
            self.length_copied += avbl;
            to_send -= avbl;
            sent += avbl;
            obj = next;
        }

        // Then extent bytes.
        let mut obj = rec.first_extent;
        while !obj.is_null() && to_send > 0 {
            let extent = object::read_extent(txn, obj)?;
            if to_skip >= extent.length {
                to_skip -= extent.length;
                obj = extent.next;
                continue;
            }

            let avbl = (extent.length - to_skip).min(to_send);
            if let Some(out) = buf.as_deref_mut() {
                let dst = &mut out[sent as usize..(sent + avbl) as usize];
                if self.copy_from_source(txn, &extent, to_skip, dst)? == 0 {
                    failed = true;
                }
            }
            to_skip = 0;
            self.length_copied += avbl;
            to_send -= avbl;
            sent += avbl;
            obj = extent.next;
        }

        // Finally trailer capsules.
        let mut obj = rec.first_trailer;
        while !obj.is_null() && to_send > 0 {
            let (text, cap_len, next) = object::read_capsule(txn, obj)?;
            if to_skip >= cap_len {
                to_skip -= cap_len;
                obj = next;
                continue;
            }

            let avbl = (cap_len - to_skip).min(to_send);
            if let Some(out) = buf.as_deref_mut() {
                let dst = &mut out[sent as usize..(sent + avbl) as usize];
                txn.read(Addr(text.0 + to_skip), dst)?;
            }
            to_skip = 0;
            self.length_copied += avbl;
            to_send -= avbl;
            sent += avbl;
            obj = next;
        }

        if failed {
            return Ok(0);
        }
        Ok(sent)
    }

    /// Copy up to `length` uncopied bytes of the opaque-header region.
    pub fn receive_headers(
        &mut self,
        txn: &mut Txn,
        length: u64,
        buf: Option<&mut [u8]>,
    ) -> Result<u64> {
        self.receive_region(txn, Region::Headers, length, buf)
    }

    /// Copy up to `length` uncopied bytes of the source region.
    pub fn receive_source(
        &mut self,
        txn: &mut Txn,
        length: u64,
        buf: Option<&mut [u8]>,
    ) -> Result<u64> {
        self.receive_region(txn, Region::Source, length, buf)
    }

    /// Copy up to `length` uncopied bytes of the opaque-trailer region.
    pub fn receive_trailers(
        &mut self,
        txn: &mut Txn,
        length: u64,
        buf: Option<&mut [u8]>,
    ) -> Result<u64> {
        self.receive_region(txn, Region::Trailers, length, buf)
    }

    fn receive_region(
        &mut self,
        txn: &mut Txn,
        region: Region,
        length: u64,
        mut buf: Option<&mut [u8]>,
    ) -> Result<u64> {
        if length == 0 {
            return Ok(0);
        }

        let rec = object::read_rec(txn, self.zco)?;
        let mut to_skip = match region {
            Region::Headers => self.headers_length_copied,
            Region::Source => rec.headers_length + self.source_length_copied,
            Region::Trailers => {
                rec.headers_length + rec.source_length + self.trailers_length_copied
            }
        };
        let mut to_recv = length;
        let mut received: u64 = 0;
        let mut failed = false;

        let mut obj = rec.first_extent;
        while !obj.is_null() && to_recv > 0 {
            let extent = object::read_extent(txn, obj)?;
            if to_skip >= extent.length {
                to_skip -= extent.length;
                obj = extent.next;
                continue;
            }

            let avbl = (extent.length - to_skip).min(to_recv);
            if let Some(out) = buf.as_deref_mut() {
                let dst = &mut out[received as usize..(received + avbl) as usize];
                if self.copy_from_source(txn, &extent, to_skip, dst)? == 0 {
                    failed = true;
                }
            }
            to_skip = 0;
            match region {
                Region::Headers => self.headers_length_copied += avbl,
                Region::Source => self.source_length_copied += avbl,
                Region::Trailers => self.trailers_length_copied += avbl,
            }
            to_recv -= avbl;
            received += avbl;
            obj = extent.next;
        }

        if failed {
            return Ok(0);
        }
        Ok(received)
    }

    /// Copy `buf.len()` bytes from the extent's source, starting `skip`
    /// bytes past the extent offset. Returns the byte count on a faithful
    /// read, 0 on a degraded file read (buffer filled with `0x20`).
    fn copy_from_source(
        &self,
        txn: &mut Txn,
        extent: &ExtentRec,
        skip: u64,
        buf: &mut [u8],
    ) -> Result<u64> {
        match extent.medium() {
            ZcoMedium::Heap => {
                let (location, _len) = object::heap_ref_location(txn, extent.location)?;
                txn.read(Addr(location.0 + extent.offset + skip), buf)?;
                Ok(buf.len() as u64)
            }
            ZcoMedium::File => {
                let file_ref = object::file_ref_rec(txn, extent.location)?;
                let path = txn.get_str(file_ref.path)?;
                let read_pos = extent.offset + skip;
                match read_file_region(&path, file_ref.inode, read_pos, buf) {
                    Ok(()) => {
                        if self.track_file_offset {
                            object::update_xmit_progress(
                                txn,
                                extent.location,
                                read_pos + buf.len() as u64,
                            )?;
                        }
                        Ok(buf.len() as u64)
                    }
                    Err(reason) => {
                        // File changed or shrank underneath us; deliver
                        // fill bytes and report the degraded read.
                        log::warn!("Degraded read of {}: {}", path, reason);
                        buf.fill(FILE_FILL_CHAR);
                        Ok(0)
                    }
                }
            }
        }
    }
}

fn read_file_region(path: &str, inode: u64, pos: u64, buf: &mut [u8]) -> std::result::Result<(), String> {
    let mut file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let meta = file.metadata().map_err(|e| e.to_string())?;
    if meta.ino() != inode {
        return Err("inode changed".to_owned());
    }
    file.seek(std::io::SeekFrom::Start(pos))
        .map_err(|e| e.to_string())?;
    file.read_exact(buf).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Heap;
    use crate::zco;
    use std::io::Write;

    fn temp_heap() -> (tempfile::TempDir, Heap) {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("zco.heap"), 1 << 20).unwrap();
        (dir, heap)
    }

    fn heap_zco(txn: &mut Txn, data: &[u8]) -> Zco {
        let array = txn.put_bytes(data).unwrap();
        let z = zco::create(txn).unwrap();
        zco::append_extent(txn, z, ZcoMedium::Heap, array, 0, data.len() as u64).unwrap();
        z
    }

    #[test]
    fn test_transmit_headers_source_trailers_in_order() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = heap_zco(&mut txn, b"source");
        zco::prepend_header(&mut txn, z, b"hh").unwrap();
        zco::append_trailer(&mut txn, z, b"tt").unwrap();
        assert_eq!(zco::length(&txn, z).unwrap(), 10);

        let mut reader = ZcoReader::new(z);
        let mut buf = [0u8; 10];
        let n = reader.transmit(&mut txn, 10, Some(&mut buf)).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf, b"hhsourcett");

        // Reader is positional: nothing further to transmit.
        let n = reader.transmit(&mut txn, 4, Some(&mut buf[..4])).unwrap();
        assert_eq!(n, 0);
        txn.commit().unwrap();
    }

    #[test]
    fn test_transmit_in_pieces_and_skip() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = heap_zco(&mut txn, b"abcdefgh");

        let mut reader = ZcoReader::new(z);
        let mut buf = [0u8; 3];
        assert_eq!(reader.transmit(&mut txn, 3, Some(&mut buf)).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        // Skip two bytes with a null buffer.
        assert_eq!(reader.transmit(&mut txn, 2, None).unwrap(), 2);
        assert_eq!(reader.transmit(&mut txn, 3, Some(&mut buf)).unwrap(), 3);
        assert_eq!(&buf, b"fgh");
        txn.commit().unwrap();
    }

    #[test]
    fn test_receive_regions_independent_cursors() {
        let (_dir, heap) = temp_heap();
        let mut txn = heap.begin();
        let z = heap_zco(&mut txn, b"HHHpayloadTT");
        zco::delimit_source(&mut txn, z, 3, 7).unwrap();

        let mut reader = ZcoReader::new(z);
        let mut hdr = [0u8; 3];
        let mut src = [0u8; 7];
        let mut trl = [0u8; 2];
        assert_eq!(reader.receive_source(&mut txn, 7, Some(&mut src)).unwrap(), 7);
        assert_eq!(reader.receive_headers(&mut txn, 3, Some(&mut hdr)).unwrap(), 3);
        assert_eq!(reader.receive_trailers(&mut txn, 2, Some(&mut trl)).unwrap(), 2);
        assert_eq!(&hdr, b"HHH");
        assert_eq!(&src, b"payload");
        assert_eq!(&trl, b"TT");
        txn.commit().unwrap();
    }

    #[test]
    fn test_degraded_file_read_fills_with_space() {
        let (_dir, heap) = temp_heap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutable.dat");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);

        let mut txn = heap.begin();
        let fr = zco::create_file_ref(&mut txn, path.to_str().unwrap(), None).unwrap();
        let z = zco::create(&mut txn).unwrap();
        zco::append_extent(&mut txn, z, ZcoMedium::File, fr.0, 0, 10).unwrap();

        // Replace the file: same path, new inode.
        std::fs::remove_file(&path).unwrap();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"XXXXXXXXXX").unwrap();
        drop(f);

        let mut reader = ZcoReader::new(z);
        let mut buf = [0u8; 10];
        let n = reader.transmit(&mut txn, 10, Some(&mut buf)).unwrap();
        assert_eq!(n, 0);
        assert_eq!(&buf, &[FILE_FILL_CHAR; 10]);
        txn.commit().unwrap();
    }
}
