use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use crate::core::error::{Error, ErrorKind, Result};

/// Writable memory-mapped file that can grow and shrink. Resizing drops the
/// mapping, resizes the file and maps it again, so any address derived from
/// the old mapping is invalid afterwards.
#[derive(Debug)]
pub struct MmapFileMut {
    file: File,
    map: MmapMut,
    pub len: usize,
}

impl MmapFileMut {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("open {}: {}", path.display(), e)))?;
        let len = file
            .metadata()
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("stat {}: {}", path.display(), e)))?
            .len() as usize;
        let map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("mmap {}: {}", path.display(), e)))?;
        Ok(MmapFileMut { file, map, len })
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Unmap, resize the file and map it again.
    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        // the mapping must go away before the file shrinks under it
        let placeholder = MmapOptions::new()
            .len(1)
            .map_anon()
            .map_err(|e| Error::new(ErrorKind::IoResize, e.to_string()))?;
        drop(std::mem::replace(&mut self.map, placeholder));

        self.file
            .set_len(new_len)
            .map_err(|e| Error::new(ErrorKind::IoResize, format!("resize to {}: {}", new_len, e)))?;
        self.map = unsafe { MmapOptions::new().map_mut(&self.file) }
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("remap: {}", e)))?;
        self.len = new_len as usize;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|e| Error::new(ErrorKind::IoResize, format!("flush: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_write_resize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");
        std::fs::File::create(&path).unwrap().set_len(64).unwrap();

        let mut region = MmapFileMut::open(&path).unwrap();
        assert_eq!(region.len, 64);
        region.data_mut()[0] = 42;
        region.resize(128).unwrap();
        assert_eq!(region.len, 128);
        assert_eq!(region.data()[0], 42);
        assert_eq!(region.data()[127], 0);

        region.resize(16).unwrap();
        assert_eq!(region.data().len(), 16);
        assert_eq!(region.data()[0], 42);
    }
}
