use std::fs;
use std::path::{Path, PathBuf};
use memmap2::MmapOptions;
use crate::core::error::{Error, ErrorKind, Result};
use crate::mmap::region::MmapFileMut;

pub(crate) const FORMAT_VERSION: u64 = 1;

// Header: version, bucket count, wasted bytes, next data offset, item count,
// key count (multi-value store only). The rest up to 100 bytes is reserved.
pub(crate) const HEADER_SIZE: u64 = 100;
const OFF_VERSION: u64 = 0;
const OFF_BUCKETS: u64 = 8;
const OFF_WASTED: u64 = 16;
const OFF_NEXT_DATA: u64 = 24;
const OFF_ITEMS: u64 = 32;
const OFF_KEYS: u64 = 40;

pub(crate) const DEFAULT_TABLE_SIZE: u64 = 101;
pub(crate) const DEFAULT_CONTENT_SIZE: u64 = 1000;

pub(crate) fn read_u64_at(data: &[u8], off: u64) -> u64 {
    let i = off as usize;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[i..i + 8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn write_u64_at(data: &mut [u8], off: u64, value: u64) {
    let i = off as usize;
    data[i..i + 8].copy_from_slice(&value.to_le_bytes());
}

#[derive(Debug)]
enum Backing {
    File(MmapFileMut),
    Mem(Vec<u8>),
}

/// One hash-table file: header, bucket table, arena. Shared by both store
/// kinds; the item layouts inside the arena differ per store. A store being
/// rebuilt in RAM is backed by `Mem` instead of a mapping.
#[derive(Debug)]
pub(crate) struct StoreFile {
    pub path: PathBuf,
    backing: Backing,
    /// While locked, automatic resizing and waste reclamation are off.
    pub locked: bool,
    /// Override for the installed-RAM probe used by rebuilds.
    pub mem_limit: Option<u64>,
}

impl StoreFile {
    /// Open the file at `path`, creating a fresh one if none exists.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            Self::create_file(path, DEFAULT_TABLE_SIZE, DEFAULT_CONTENT_SIZE)?;
        }
        Ok(StoreFile {
            path: path.to_path_buf(),
            backing: Backing::File(Self::open_map(path)?),
            locked: false,
            mem_limit: None,
        })
    }

    /// Anonymous-memory store used while rebuilding; the header is
    /// initialised for `table_size` buckets and the buffer holds exactly
    /// `total_size` bytes.
    pub fn in_memory(table_size: u64, total_size: u64) -> Self {
        let mut buf = vec![0u8; total_size as usize];
        write_u64_at(&mut buf, OFF_VERSION, FORMAT_VERSION);
        write_u64_at(&mut buf, OFF_BUCKETS, table_size);
        write_u64_at(&mut buf, OFF_NEXT_DATA, HEADER_SIZE + table_size * 8);
        StoreFile {
            path: PathBuf::new(),
            backing: Backing::Mem(buf),
            locked: true,
            mem_limit: None,
        }
    }

    pub fn create_file(path: &Path, table_size: u64, content_size: u64) -> Result<()> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("create {}: {}", path.display(), e)))?;
        let total = HEADER_SIZE + table_size * 8 + content_size;
        file.set_len(total)
            .map_err(|e| Error::new(ErrorKind::IoResize, format!("size {}: {}", path.display(), e)))?;
        let mut map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("mmap {}: {}", path.display(), e)))?;
        write_u64_at(&mut map, OFF_VERSION, FORMAT_VERSION);
        write_u64_at(&mut map, OFF_BUCKETS, table_size);
        write_u64_at(&mut map, OFF_NEXT_DATA, HEADER_SIZE + table_size * 8);
        map.flush()
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("flush {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn open_map(path: &Path) -> Result<MmapFileMut> {
        let map = MmapFileMut::open(path)?;
        if (map.len as u64) < HEADER_SIZE {
            return Err(Error::new(
                ErrorKind::FormatVersion,
                format!("{}: file smaller than header", path.display()),
            ));
        }
        let version = read_u64_at(map.data(), OFF_VERSION);
        if version != FORMAT_VERSION {
            return Err(Error::new(
                ErrorKind::FormatVersion,
                format!("{}: version {} (expected {})", path.display(), version, FORMAT_VERSION),
            ));
        }
        Ok(map)
    }

    /// A missing file is fine (it will be created on open); an existing file
    /// must carry the compiled version.
    pub fn is_file_version_ok(path: &Path) -> Result<bool> {
        if !path.is_file() {
            return Ok(true);
        }
        let len = fs::metadata(path)
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("stat {}: {}", path.display(), e)))?
            .len();
        if len < HEADER_SIZE {
            return Ok(false);
        }
        let file = fs::File::open(path)
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("open {}: {}", path.display(), e)))?;
        let map = unsafe { MmapOptions::new().map(&file) }
            .map_err(|e| Error::new(ErrorKind::IoOpen, format!("mmap {}: {}", path.display(), e)))?;
        Ok(read_u64_at(&map, OFF_VERSION) == FORMAT_VERSION)
    }

    pub fn is_mem(&self) -> bool {
        matches!(self.backing, Backing::Mem(_))
    }

    pub fn into_mem_buffer(self) -> Vec<u8> {
        match self.backing {
            Backing::Mem(buf) => buf,
            Backing::File(_) => Vec::new(),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::File(map) => map.data(),
            Backing::Mem(buf) => buf,
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::File(map) => map.data_mut(),
            Backing::Mem(buf) => buf,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.data().len() as u64
    }

    pub fn num_buckets(&self) -> u64 {
        read_u64_at(self.data(), OFF_BUCKETS)
    }

    pub fn wasted(&self) -> u64 {
        read_u64_at(self.data(), OFF_WASTED)
    }

    pub fn set_wasted(&mut self, wasted: u64) {
        write_u64_at(self.data_mut(), OFF_WASTED, wasted);
    }

    pub fn next_data_offset(&self) -> u64 {
        read_u64_at(self.data(), OFF_NEXT_DATA)
    }

    pub fn set_next_data_offset(&mut self, offset: u64) {
        write_u64_at(self.data_mut(), OFF_NEXT_DATA, offset);
    }

    pub fn num_items(&self) -> u64 {
        read_u64_at(self.data(), OFF_ITEMS)
    }

    pub fn set_num_items(&mut self, num: u64) {
        write_u64_at(self.data_mut(), OFF_ITEMS, num);
    }

    pub fn num_keys(&self) -> u64 {
        read_u64_at(self.data(), OFF_KEYS)
    }

    pub fn set_num_keys(&mut self, num: u64) {
        write_u64_at(self.data_mut(), OFF_KEYS, num);
    }

    pub fn header_and_table(&self) -> u64 {
        HEADER_SIZE + self.num_buckets() * 8
    }

    pub fn table_offset(&self, bucket: u64) -> u64 {
        read_u64_at(self.data(), HEADER_SIZE + bucket * 8)
    }

    pub fn set_table_offset(&mut self, bucket: u64, offset: u64) {
        write_u64_at(self.data_mut(), HEADER_SIZE + bucket * 8, offset);
    }

    /// Grow the file so at least `additional` bytes fit past the arena end.
    /// A memory-backed store is pre-sized exactly and never grows.
    pub fn ensure_free_space(&mut self, additional: u64) -> Result<()> {
        if self.is_mem() {
            return Ok(());
        }
        let size = self.file_size();
        let min_size = self.next_data_offset() + additional;
        if min_size <= size {
            return Ok(());
        }

        let mut new_size = if size < 3_000_000 { size + 700_000 } else { size + 5_000_000 };
        if min_size > new_size {
            new_size = min_size + additional / 10;
        }
        self.resize(new_size)
    }

    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        match &mut self.backing {
            Backing::File(map) => map.resize(new_len),
            Backing::Mem(_) => Err(Error::new(
                ErrorKind::InvariantViolation,
                "cannot resize a memory-backed store".to_string(),
            )),
        }
    }

    /// Re-open the mapping from `path`, e.g. after a rebuild file was
    /// renamed over it.
    pub fn reopen(&mut self) -> Result<()> {
        self.backing = Backing::File(Self::open_map(&self.path)?);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        match &self.backing {
            Backing::File(map) => map.flush(),
            Backing::Mem(_) => Ok(()),
        }
    }

    /// Reset to an empty table of the default size.
    pub fn clear(&mut self) -> Result<()> {
        let total = HEADER_SIZE + DEFAULT_TABLE_SIZE * 8 + DEFAULT_CONTENT_SIZE;
        self.resize(total)?;
        self.data_mut().fill(0);
        let data = self.data_mut();
        write_u64_at(data, OFF_VERSION, FORMAT_VERSION);
        write_u64_at(data, OFF_BUCKETS, DEFAULT_TABLE_SIZE);
        write_u64_at(data, OFF_NEXT_DATA, HEADER_SIZE + DEFAULT_TABLE_SIZE * 8);
        Ok(())
    }

    pub fn tmp_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".tmp");
        PathBuf::from(p)
    }

    /// Byte budget a rebuild may claim as anonymous memory.
    pub fn memory_rebuild_budget(&self) -> u64 {
        if let Some(limit) = self.mem_limit {
            return limit;
        }
        let ram = installed_ram();
        (ram.saturating_sub(100_000_000) as f64 * 0.9) as u64
    }
}

/// Installed physical RAM; 0 when the probe fails, which disables in-memory
/// rebuilds.
fn installed_ram() -> u64 {
    unsafe {
        let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGE_SIZE);
        if pages <= 0 || page_size <= 0 {
            return 0;
        }
        pages as u64 * page_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.docs");

        let file = StoreFile::open(&path).unwrap();
        assert_eq!(file.num_buckets(), DEFAULT_TABLE_SIZE);
        assert_eq!(file.num_items(), 0);
        assert_eq!(file.wasted(), 0);
        assert_eq!(file.next_data_offset(), HEADER_SIZE + DEFAULT_TABLE_SIZE * 8);
        assert!(StoreFile::is_file_version_ok(&path).unwrap());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.docs");
        drop(StoreFile::open(&path).unwrap());

        // corrupt the version field
        let mut raw = fs::read(&path).unwrap();
        raw[0] = 99;
        fs::write(&path, &raw).unwrap();

        assert!(!StoreFile::is_file_version_ok(&path).unwrap());
        let err = StoreFile::open(&path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FormatVersion);
    }

    #[test]
    fn test_missing_file_version_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StoreFile::is_file_version_ok(&dir.path().join("nope")).unwrap());
    }

    #[test]
    fn test_free_space_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.docs");
        let mut file = StoreFile::open(&path).unwrap();

        let before = file.file_size();
        file.ensure_free_space(1).unwrap();
        assert_eq!(file.file_size(), before);

        file.ensure_free_space(10_000_000).unwrap();
        assert!(file.file_size() >= file.next_data_offset() + 10_000_000);
    }
}
