use std::cell::UnsafeCell;
use std::fs;
use std::io::Write;
use std::path::Path;
use crate::compression::varint;
use crate::core::error::{Error, ErrorKind, Result};
use crate::store::file::{read_u64_at, write_u64_at, StoreFile, FORMAT_VERSION, HEADER_SIZE};
use crate::store::hash::{bucket_from_hash, calc_hash};
use crate::store::importing::{ImportState, Importing, BULK_RESERVE, BULK_WASTE_LIMIT};
use crate::store::primes;

/// Hash map from bytes to a set of byte values over one memory-mapped file.
///
/// Each bucket heads a chain of key items; each key item heads a chain of
/// value items. `set` has set semantics per (key, value). The header tracks
/// both the posting count (items) and the distinct key count; table sizing
/// keys off the latter.
///
/// Same access discipline as `SingleValueStore`: `&mut self` is exclusive,
/// `&self` runs behind the indexer mutex, bulk mutators also hold the
/// importing mutex.
pub struct MultiValueStore {
    file: UnsafeCell<StoreFile>,
    importing: Option<Importing>,
}

unsafe impl Send for MultiValueStore {}
unsafe impl Sync for MultiValueStore {}

// KeyItem: next key offset (u64), first value offset (u64), key length, key.
// ValueItem: next value offset (u64), value length, value.

fn key_next(data: &[u8], off: u64) -> u64 {
    read_u64_at(data, off)
}

fn key_set_next(data: &mut [u8], off: u64, next: u64) {
    write_u64_at(data, off, next);
}

fn key_value_off(data: &[u8], off: u64) -> u64 {
    read_u64_at(data, off + 8)
}

fn key_set_value_off(data: &mut [u8], off: u64, value_off: u64) {
    write_u64_at(data, off + 8, value_off);
}

fn key_bytes(data: &[u8], off: u64) -> &[u8] {
    let mut pos = off as usize + 16;
    let len = varint::read_at(data, &mut pos) as usize;
    &data[pos..pos + len]
}

fn key_size(data: &[u8], off: u64) -> u64 {
    let mut pos = off as usize + 16;
    let len = varint::read_at(data, &mut pos) as usize;
    (pos + len) as u64 - off
}

fn encoded_key_size(key: &[u8]) -> Result<u64> {
    Ok(16 + varint::encoded_width(key.len() as u64)? as u64 + key.len() as u64)
}

fn write_key_item(data: &mut [u8], at: u64, next_key: u64, key: &[u8], first_value: u64) -> Result<u64> {
    write_u64_at(data, at, next_key);
    write_u64_at(data, at + 8, first_value);
    let mut pos = at as usize + 16;
    varint::write_at(data, &mut pos, key.len() as u64)?;
    data[pos..pos + key.len()].copy_from_slice(key);
    Ok((pos + key.len()) as u64)
}

fn value_next(data: &[u8], off: u64) -> u64 {
    read_u64_at(data, off)
}

fn value_set_next(data: &mut [u8], off: u64, next: u64) {
    write_u64_at(data, off, next);
}

fn value_bytes(data: &[u8], off: u64) -> &[u8] {
    let mut pos = off as usize + 8;
    let len = varint::read_at(data, &mut pos) as usize;
    &data[pos..pos + len]
}

fn value_size(data: &[u8], off: u64) -> u64 {
    let mut pos = off as usize + 8;
    let len = varint::read_at(data, &mut pos) as usize;
    (pos + len) as u64 - off
}

fn encoded_value_size(value: &[u8]) -> Result<u64> {
    Ok(8 + varint::encoded_width(value.len() as u64)? as u64 + value.len() as u64)
}

fn write_value_item(data: &mut [u8], at: u64, next: u64, value: &[u8]) -> Result<u64> {
    write_u64_at(data, at, next);
    let mut pos = at as usize + 8;
    varint::write_at(data, &mut pos, value.len() as u64)?;
    data[pos..pos + value.len()].copy_from_slice(value);
    Ok((pos + value.len()) as u64)
}

/// (key offset, value already present) for `key`/`value` in a bucket chain.
fn find_key_and_value(data: &[u8], head: u64, key: &[u8], value: &[u8]) -> (u64, bool) {
    let mut off = head;
    while off != 0 {
        if key_bytes(data, off) == key {
            let mut voff = key_value_off(data, off);
            while voff != 0 {
                if value_bytes(data, voff) == value {
                    return (off, true);
                }
                voff = value_next(data, voff);
            }
            return (off, false);
        }
        off = key_next(data, off);
    }
    (0, false)
}

fn set_internal(file: &mut StoreFile, bucket: u64, key: &[u8], value: &[u8]) -> Result<()> {
    let head = file.table_offset(bucket);
    let (key_offset, value_exists) = find_key_and_value(file.data(), head, key, value);
    if value_exists {
        return Ok(());
    }

    let next_value_offset = if key_offset != 0 {
        key_value_off(file.data(), key_offset)
    } else {
        0
    };

    // append the value item at the head of the key's value chain
    let value_offset = file.next_data_offset();
    let end = write_value_item(file.data_mut(), value_offset, next_value_offset, value)?;
    file.set_next_data_offset(end);
    let num = file.num_items() + 1;
    file.set_num_items(num);

    if key_offset != 0 {
        key_set_value_off(file.data_mut(), key_offset, value_offset);
    } else {
        let new_key_offset = file.next_data_offset();
        let end = write_key_item(file.data_mut(), new_key_offset, head, key, value_offset)?;
        file.set_next_data_offset(end);
        let keys = file.num_keys() + 1;
        file.set_num_keys(keys);
        file.set_table_offset(bucket, new_key_offset);
    }
    Ok(())
}

fn remove_internal(file: &mut StoreFile, bucket: u64, key: &[u8], value: &[u8]) {
    // find the key
    let mut prev_key = 0u64;
    let mut key_off = file.table_offset(bucket);
    loop {
        if key_off == 0 {
            return;
        }
        if key_bytes(file.data(), key_off) == key {
            break;
        }
        prev_key = key_off;
        key_off = key_next(file.data(), key_off);
    }

    // find the value
    let mut prev_value = 0u64;
    let mut val_off = key_value_off(file.data(), key_off);
    loop {
        if val_off == 0 {
            return;
        }
        if value_bytes(file.data(), val_off) == value {
            break;
        }
        prev_value = val_off;
        val_off = value_next(file.data(), val_off);
    }

    // unlink the value
    let next = value_next(file.data(), val_off);
    if prev_value != 0 {
        value_set_next(file.data_mut(), prev_value, next);
    } else {
        key_set_value_off(file.data_mut(), key_off, next);
    }
    let wasted = file.wasted() + value_size(file.data(), val_off);
    file.set_wasted(wasted);
    let num = file.num_items() - 1;
    file.set_num_items(num);

    // drop the key when its value list emptied
    if key_value_off(file.data(), key_off) != 0 {
        return;
    }
    let next_key = key_next(file.data(), key_off);
    if prev_key == 0 {
        file.set_table_offset(bucket, next_key);
    } else {
        key_set_next(file.data_mut(), prev_key, next_key);
    }
    let wasted = file.wasted() + key_size(file.data(), key_off);
    file.set_wasted(wasted);
    let keys = file.num_keys() - 1;
    file.set_num_keys(keys);
}

fn copy_all(dst: &mut StoreFile, src: &StoreFile) -> Result<()> {
    ensure_table_size(dst, src.num_keys())?;

    let num_dst = dst.num_buckets();
    let num_src = src.num_buckets();
    for i in 0..num_src {
        let mut key_off = src.table_offset(i);
        while key_off != 0 {
            let key = key_bytes(src.data(), key_off);
            let bucket = if num_dst == num_src {
                i
            } else {
                bucket_from_hash(calc_hash(key), num_dst)
            };
            let mut val_off = key_value_off(src.data(), key_off);
            while val_off != 0 {
                let value = value_bytes(src.data(), val_off);
                dst.ensure_free_space(encoded_key_size(key)? + encoded_value_size(value)?)?;
                set_internal(dst, bucket, key, value)?;
                val_off = value_next(src.data(), val_off);
            }
            key_off = key_next(src.data(), key_off);
        }
    }

    ensure_optimal_waste(dst)
}

fn ensure_table_size(file: &mut StoreFile, additional: u64) -> Result<()> {
    if file.locked {
        return Ok(());
    }
    let num = file.num_keys() + additional;
    let buckets = file.num_buckets();
    let load = num as f64 / buckets as f64;
    if (0.3..=1.4).contains(&load) {
        return Ok(());
    }
    if load < 1.0 && buckets <= 101 {
        return Ok(());
    }

    let table_size = if load > 1.0 {
        primes::table_size_prime_double((num as f64 * 1.8) as u64)?
    } else {
        primes::table_size_prime_double(num)?
    };
    if table_size == buckets {
        return Ok(());
    }
    let content_size = file.file_size() - HEADER_SIZE - buckets * 8;
    change_table(file, table_size, content_size)
}

fn ensure_optimal_waste(file: &mut StoreFile) -> Result<()> {
    if file.locked {
        return Ok(());
    }
    if file.wasted() < 30_000_000 {
        return Ok(());
    }
    let content_size = file.file_size() - HEADER_SIZE - file.num_buckets() * 8;
    change_table(file, file.num_buckets(), content_size)
}

fn change_table(file: &mut StoreFile, table_size: u64, content_size: u64) -> Result<()> {
    if file.is_mem() {
        return Err(Error::new(
            ErrorKind::InvariantViolation,
            "cannot rebuild a memory-backed store".to_string(),
        ));
    }

    let live = file.next_data_offset() - HEADER_SIZE - file.num_buckets() * 8 - file.wasted();
    let new_size = HEADER_SIZE + table_size * 8 + live;
    let budget = file.memory_rebuild_budget();

    if new_size < budget {
        let mut tmp = StoreFile::in_memory(table_size, new_size);
        copy_all(&mut tmp, file)?;
        let buf = tmp.into_mem_buffer();

        file.resize(HEADER_SIZE + table_size * 8 + content_size)?;
        file.data_mut()[..buf.len()].copy_from_slice(&buf);
        return Ok(());
    }

    let tmp_path = file.tmp_path();
    StoreFile::create_file(&tmp_path, table_size, content_size)?;
    {
        let mut tmp = StoreFile::open(&tmp_path)?;
        tmp.locked = true;
        copy_all(&mut tmp, file)?;
        tmp.flush()?;
    }
    fs::rename(&tmp_path, &file.path)
        .map_err(|e| Error::new(ErrorKind::IoOpen, format!("rename {}: {}", tmp_path.display(), e)))?;
    file.reopen()
}

fn bulk_enlarge(file: &mut StoreFile, state: &mut ImportState, nth_thread: usize) -> Result<()> {
    let (start, end) = state.ranges[nth_thread];
    state.wasted += end - start;
    state.ranges[nth_thread] = (0, 0);

    file.set_wasted(state.wasted);
    file.set_num_items(state.num_items);
    file.set_num_keys(state.num_keys);
    if file.wasted() > BULK_WASTE_LIMIT {
        for range in state.ranges.iter_mut() {
            let diff = range.1 - range.0;
            if diff > 0 {
                let wasted = file.wasted() + diff;
                file.set_wasted(wasted);
            }
            *range = (0, 0);
        }
        let content_size = file.next_data_offset() - HEADER_SIZE - file.num_buckets() * 8 - file.wasted();
        change_table(file, file.num_buckets(), content_size)?;
        state.wasted = file.wasted();
        debug_assert_eq!(state.num_items, file.num_items());
        debug_assert_eq!(state.num_keys, file.num_keys());
    }

    file.ensure_free_space(BULK_RESERVE)?;
    let start = file.next_data_offset();
    state.ranges[nth_thread] = (start, start + BULK_RESERVE);
    file.set_next_data_offset(start + BULK_RESERVE);
    Ok(())
}

impl MultiValueStore {
    pub const VERSION: u64 = FORMAT_VERSION;

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(MultiValueStore {
            file: UnsafeCell::new(StoreFile::open(path.as_ref())?),
            importing: None,
        })
    }

    pub fn create_file(path: impl AsRef<Path>, table_size: u64, content_size: u64) -> Result<()> {
        StoreFile::create_file(path.as_ref(), table_size, content_size)
    }

    pub fn is_file_version_ok(path: impl AsRef<Path>) -> Result<bool> {
        StoreFile::is_file_version_ok(path.as_ref())
    }

    fn file(&self) -> &StoreFile {
        unsafe { &*self.file.get() }
    }

    fn file_mut(&mut self) -> &mut StoreFile {
        self.file.get_mut()
    }

    /// Mutable access from `&self`; the caller must hold the importing
    /// mutex.
    #[allow(clippy::mut_from_ref)]
    unsafe fn file_bulk(&self) -> &mut StoreFile {
        unsafe { &mut *self.file.get() }
    }

    pub fn path(&self) -> &Path {
        &self.file().path
    }

    fn bucket(&self, key: &[u8]) -> u64 {
        bucket_from_hash(calc_hash(key), self.file().num_buckets())
    }

    /// Record `value` under `key`; a pair already present is left alone.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure_table_size(self.file_mut(), 1)?;
        let bucket = self.bucket(key);
        let size = encoded_key_size(key)? + encoded_value_size(value)?;
        let file = self.file_mut();
        file.ensure_free_space(size)?;
        set_internal(file, bucket, key, value)?;
        ensure_optimal_waste(self.file_mut())
    }

    /// All values recorded under `key`, most recently added first.
    pub fn get(&self, key: &[u8]) -> Vec<Vec<u8>> {
        let file = self.file();
        let bucket = bucket_from_hash(calc_hash(key), file.num_buckets());
        let mut off = file.table_offset(bucket);
        while off != 0 {
            if key_bytes(file.data(), off) == key {
                let mut arr = Vec::new();
                let mut voff = key_value_off(file.data(), off);
                while voff != 0 {
                    arr.push(value_bytes(file.data(), voff).to_vec());
                    voff = value_next(file.data(), voff);
                }
                return arr;
            }
            off = key_next(file.data(), off);
        }
        Vec::new()
    }

    pub fn exists(&self, key: &[u8], value: &[u8]) -> bool {
        let file = self.file();
        let bucket = bucket_from_hash(calc_hash(key), file.num_buckets());
        let (_, found) = find_key_and_value(file.data(), file.table_offset(bucket), key, value);
        found
    }

    pub fn remove(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let bucket = self.bucket(key);
        remove_internal(self.file_mut(), bucket, key, value);
        ensure_optimal_waste(self.file_mut())
    }

    pub fn all_items(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let file = self.file();
        let mut arr = Vec::with_capacity(file.num_items() as usize);
        for bucket in 0..file.num_buckets() {
            let mut key_off = file.table_offset(bucket);
            while key_off != 0 {
                let key = key_bytes(file.data(), key_off);
                let mut val_off = key_value_off(file.data(), key_off);
                while val_off != 0 {
                    arr.push((key.to_vec(), value_bytes(file.data(), val_off).to_vec()));
                    val_off = value_next(file.data(), val_off);
                }
                key_off = key_next(file.data(), key_off);
            }
        }
        arr
    }

    pub fn optimize(&mut self) -> Result<()> {
        let file = self.file_mut();
        file.locked = false;

        let load = file.num_keys() as f64 / file.num_buckets() as f64;
        if load > 1.05 || load < 0.6 {
            let table_size = primes::table_size_prime((file.num_keys() as f64 / 0.8) as u64)?;
            let content_size =
                file.next_data_offset() - HEADER_SIZE - file.num_buckets() * 8 - file.wasted();
            return change_table(file, table_size, content_size);
        }
        if file.wasted() > 500_000 {
            let content_size =
                file.next_data_offset() - HEADER_SIZE - file.num_buckets() * 8 - file.wasted();
            return change_table(file, file.num_buckets(), content_size);
        }

        let end = file.next_data_offset();
        file.resize(end)
    }

    /// Pre-size the bucket table for `n` distinct keys and freeze it until
    /// `unlock_table`.
    pub fn lock_table_for_keys(&mut self, n: u64) -> Result<()> {
        {
            let file = self.file_mut();
            file.locked = true;

            let load = n as f64 / file.num_buckets() as f64;
            if load < 0.9 && load > 0.6 {
                return Ok(());
            }
            let table_size = primes::table_size_prime((n as f64 / 0.8) as u64)?;
            let content_size =
                file.file_size() - HEADER_SIZE - file.num_buckets() * 8 - file.wasted();
            change_table(file, table_size, content_size)?;
        }
        // a rebuild rewrote the header counters; an active import context
        // must not write pre-rebuild values back on bulk_stop
        if let Some(importing) = &self.importing {
            let mut state = importing.state.lock();
            state.num_items = self.file().num_items();
            state.num_keys = self.file().num_keys();
            state.wasted = self.file().wasted();
        }
        Ok(())
    }

    pub fn unlock_table(&mut self) {
        self.file_mut().locked = false;
    }

    pub fn ensure_optimal_waste(&mut self) -> Result<()> {
        ensure_optimal_waste(self.file_mut())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.file_mut().clear()
    }

    pub fn num_items(&self) -> u64 {
        self.file().num_items()
    }

    pub fn num_keys(&self) -> u64 {
        self.file().num_keys()
    }

    pub fn num_buckets(&self) -> u64 {
        self.file().num_buckets()
    }

    pub fn wasted(&self) -> u64 {
        self.file().wasted()
    }

    pub fn next_data_offset(&self) -> u64 {
        self.file().next_data_offset()
    }

    pub fn header_and_table_size(&self) -> u64 {
        self.file().header_and_table()
    }

    pub fn file_size(&self) -> u64 {
        self.file().file_size()
    }

    pub fn set_memory_rebuild_limit(&mut self, limit: Option<u64>) {
        self.file_mut().mem_limit = limit;
    }

    pub fn bulk_start(&mut self, num_threads: usize) -> Result<()> {
        if self.importing.is_some() {
            return Err(Error::new(
                ErrorKind::InvariantViolation,
                "bulk import already running".to_string(),
            ));
        }
        let file = self.file.get_mut();
        self.importing = Some(Importing::new(
            file.num_items(),
            file.num_keys(),
            file.wasted(),
            num_threads,
        ));
        Ok(())
    }

    pub fn bulk_stop(&mut self) -> Result<()> {
        let importing = self.importing.take().ok_or_else(|| {
            Error::new(ErrorKind::InvariantViolation, "bulk import not running".to_string())
        })?;
        let state = importing.state.into_inner();
        let mut wasted = state.wasted;
        for (start, end) in &state.ranges {
            wasted += end - start;
        }
        let file = self.file.get_mut();
        file.set_num_items(state.num_items);
        file.set_num_keys(state.num_keys);
        file.set_wasted(wasted);
        Ok(())
    }

    /// Frame one record for a spill stream: key hash, key frame, value
    /// frame, each with zero link fields.
    pub fn bulk_write(out: &mut dyn Write, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = calc_hash(key);
        out.write_all(&hash.to_le_bytes())?;

        let key_len = encoded_key_size(key)?;
        let mut frame = Vec::with_capacity(key_len as usize + 2);
        varint::push(&mut frame, key_len)?;
        let start = frame.len();
        frame.resize(start + key_len as usize, 0);
        write_key_item(&mut frame, start as u64, 0, key, 0)?;
        out.write_all(&frame)?;

        let value_len = encoded_value_size(value)?;
        frame.clear();
        varint::push(&mut frame, value_len)?;
        let start = frame.len();
        frame.resize(start + value_len as usize, 0);
        write_value_item(&mut frame, start as u64, 0, value)?;
        out.write_all(&frame)?;
        Ok(())
    }

    pub fn bulk_read<'a>(data: &'a [u8], pos: &mut usize) -> Result<(u64, &'a [u8], &'a [u8])> {
        let hash = read_u64_at(data, *pos as u64);
        *pos += 8;

        let key_len = varint::read_at(data, pos) as usize;
        let key_frame = &data[*pos..*pos + key_len];
        *pos += key_len;

        let value_len = varint::read_at(data, pos) as usize;
        let value_frame = &data[*pos..*pos + value_len];
        *pos += value_len;

        Ok((hash, key_bytes(key_frame, 0), value_bytes(value_frame, 0)))
    }

    /// Insert during a bulk merge; duplicates of an existing (key, value)
    /// pair are dropped, matching the sequential path.
    pub fn bulk_insert(&self, bucket: u64, key: &[u8], value: &[u8], nth_thread: usize) -> Result<()> {
        let item_size = encoded_key_size(key)? + encoded_value_size(value)?;
        if item_size > BULK_RESERVE {
            return Err(Error::new(
                ErrorKind::BulkOversizedItem,
                format!("item of {} bytes exceeds the {} byte stripe", item_size, BULK_RESERVE),
            ));
        }
        let importing = self.importing.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvariantViolation, "bulk_insert outside bulk import".to_string())
        })?;
        let mut state = importing.state.lock();
        let file = unsafe { self.file_bulk() };

        if item_size > state.ranges[nth_thread].1 - state.ranges[nth_thread].0 {
            bulk_enlarge(file, &mut state, nth_thread)?;
        }

        let head = file.table_offset(bucket);
        let (key_offset, value_exists) = find_key_and_value(file.data(), head, key, value);
        if value_exists {
            return Ok(());
        }

        let next_value_offset = if key_offset != 0 {
            key_value_off(file.data(), key_offset)
        } else {
            0
        };

        let value_offset = state.ranges[nth_thread].0;
        let end = write_value_item(file.data_mut(), value_offset, next_value_offset, value)?;
        state.ranges[nth_thread].0 = end;
        state.num_items += 1;

        if key_offset != 0 {
            key_set_value_off(file.data_mut(), key_offset, value_offset);
        } else {
            let new_key_offset = state.ranges[nth_thread].0;
            let end = write_key_item(file.data_mut(), new_key_offset, head, key, value_offset)?;
            state.ranges[nth_thread].0 = end;
            state.num_keys += 1;
            file.set_table_offset(bucket, new_key_offset);
        }
        Ok(())
    }

    pub fn bulk_remove(&self, bucket: u64, key: &[u8], value: &[u8], _nth_thread: usize) -> Result<()> {
        let importing = self.importing.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvariantViolation, "bulk_remove outside bulk import".to_string())
        })?;
        let mut state = importing.state.lock();
        let file = unsafe { self.file_bulk() };

        // find the key
        let mut prev_key = 0u64;
        let mut key_off = file.table_offset(bucket);
        loop {
            if key_off == 0 {
                return Ok(());
            }
            if key_bytes(file.data(), key_off) == key {
                break;
            }
            prev_key = key_off;
            key_off = key_next(file.data(), key_off);
        }

        // find the value
        let mut prev_value = 0u64;
        let mut val_off = key_value_off(file.data(), key_off);
        loop {
            if val_off == 0 {
                return Ok(());
            }
            if value_bytes(file.data(), val_off) == value {
                break;
            }
            prev_value = val_off;
            val_off = value_next(file.data(), val_off);
        }

        let next = value_next(file.data(), val_off);
        if prev_value != 0 {
            value_set_next(file.data_mut(), prev_value, next);
        } else {
            key_set_value_off(file.data_mut(), key_off, next);
        }
        state.wasted += value_size(file.data(), val_off);
        state.num_items -= 1;

        if key_value_off(file.data(), key_off) != 0 {
            return Ok(());
        }
        let next_key = key_next(file.data(), key_off);
        if prev_key == 0 {
            file.set_table_offset(bucket, next_key);
        } else {
            key_set_next(file.data_mut(), prev_key, next_key);
        }
        state.wasted += key_size(file.data(), key_off);
        state.num_keys -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn open_store(dir: &tempfile::TempDir) -> MultiValueStore {
        MultiValueStore::open(dir.path().join("test.tokens")).unwrap()
    }

    fn audit(store: &MultiValueStore) {
        let items = store.all_items();
        assert_eq!(items.len() as u64, store.num_items());
        let keys: HashSet<Vec<u8>> = items.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len() as u64, store.num_keys());
        assert!(store.wasted() <= store.next_data_offset() - store.header_and_table_size());
    }

    #[test]
    fn test_set_get_order_and_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);

        store.set(b"token", b"v1").unwrap();
        store.set(b"token", b"v2").unwrap();
        store.set(b"token", b"v1").unwrap(); // duplicate pair ignored

        assert_eq!(store.get(b"token"), vec![b"v2".to_vec(), b"v1".to_vec()]);
        assert_eq!(store.num_items(), 2);
        assert_eq!(store.num_keys(), 1);
        assert!(store.exists(b"token", b"v1"));
        assert!(store.exists(b"token", b"v2"));
        assert!(!store.exists(b"token", b"v3"));
        assert!(!store.exists(b"other", b"v1"));
        assert_eq!(store.get(b"other"), Vec::<Vec<u8>>::new());
        audit(&store);
    }

    #[test]
    fn test_remove_value_then_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);

        store.set(b"token", b"v1").unwrap();
        store.set(b"token", b"v2").unwrap();
        store.set(b"token", b"v3").unwrap();

        // middle of the value chain
        store.remove(b"token", b"v2").unwrap();
        assert_eq!(store.get(b"token"), vec![b"v3".to_vec(), b"v1".to_vec()]);
        assert_eq!(store.num_items(), 2);
        assert_eq!(store.num_keys(), 1);

        store.remove(b"token", b"v3").unwrap();
        store.remove(b"token", b"v1").unwrap();
        assert_eq!(store.get(b"token"), Vec::<Vec<u8>>::new());
        assert_eq!(store.num_items(), 0);
        assert_eq!(store.num_keys(), 0);

        // removing from an empty key is a no-op
        store.remove(b"token", b"v1").unwrap();
        audit(&store);
    }

    #[test]
    fn test_many_keys_rebuild_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);

        for i in 0..400u32 {
            let key = format!("token-{}", i);
            store.set(key.as_bytes(), &i.to_le_bytes()).unwrap();
            store.set(key.as_bytes(), &(i + 1000).to_le_bytes()).unwrap();
        }
        assert!(store.num_buckets() > 101);
        assert_eq!(store.num_keys(), 400);
        assert_eq!(store.num_items(), 800);
        for i in 0..400u32 {
            let values = store.get(format!("token-{}", i).as_bytes());
            assert_eq!(values.len(), 2);
            assert!(values.contains(&i.to_le_bytes().to_vec()));
        }
        audit(&store);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tokens");
        {
            let mut store = MultiValueStore::open(&path).unwrap();
            store.set(b"k", b"v").unwrap();
        }
        let store = MultiValueStore::open(&path).unwrap();
        assert!(store.exists(b"k", b"v"));
    }

    #[test]
    fn test_optimize_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);

        for i in 0..300u32 {
            store.set(format!("k{}", i).as_bytes(), &[7u8; 32]).unwrap();
        }
        for i in 0..250u32 {
            store.remove(format!("k{}", i).as_bytes(), &[7u8; 32]).unwrap();
        }
        store.optimize().unwrap();
        assert_eq!(store.wasted(), 0);
        assert_eq!(store.num_keys(), 50);
        for i in 250..300u32 {
            assert!(store.exists(format!("k{}", i).as_bytes(), &[7u8; 32]));
        }
        audit(&store);
    }

    #[test]
    fn test_bulk_roundtrip_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.set(b"kept", b"live").unwrap();

        let mut spill = Vec::new();
        MultiValueStore::bulk_write(&mut spill, b"alpha", b"p1").unwrap();
        MultiValueStore::bulk_write(&mut spill, b"alpha", b"p2").unwrap();
        MultiValueStore::bulk_write(&mut spill, b"alpha", b"p1").unwrap(); // duplicate
        MultiValueStore::bulk_write(&mut spill, b"kept", b"live").unwrap(); // already stored

        store.lock_table_for_keys(4).unwrap();
        store.bulk_start(1).unwrap();
        let buckets = store.num_buckets();
        let mut pos = 0;
        while pos < spill.len() {
            let (hash, key, value) = MultiValueStore::bulk_read(&spill, &mut pos).unwrap();
            let bucket = bucket_from_hash(hash, buckets);
            store.bulk_insert(bucket, key, value, 0).unwrap();
        }
        store.bulk_stop().unwrap();
        store.unlock_table();

        let mut alpha = store.get(b"alpha");
        alpha.sort();
        assert_eq!(alpha, vec![b"p1".to_vec(), b"p2".to_vec()]);
        assert_eq!(store.get(b"kept"), vec![b"live".to_vec()]);
        assert_eq!(store.num_items(), 3);
        assert_eq!(store.num_keys(), 2);
        audit(&store);
    }

    #[test]
    fn test_bulk_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(&dir);
        store.set(b"tok", b"a").unwrap();
        store.set(b"tok", b"b").unwrap();

        store.bulk_start(1).unwrap();
        let buckets = store.num_buckets();
        let bucket = bucket_from_hash(calc_hash(b"tok"), buckets);
        store.bulk_remove(bucket, b"tok", b"a", 0).unwrap();
        store.bulk_stop().unwrap();

        assert_eq!(store.get(b"tok"), vec![b"b".to_vec()]);
        assert_eq!(store.num_items(), 1);
        assert_eq!(store.num_keys(), 1);
        audit(&store);
    }
}
