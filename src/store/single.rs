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

/// Hash map from bytes to bytes over one memory-mapped file.
///
/// Buckets hold file offsets of singly linked item chains; items are
/// appended to the arena and never moved, so offsets stay valid across
/// remaps. Values shrink in place; growth orphans the old item and appends a
/// new one. Orphaned bytes are tracked in the header and reclaimed by a
/// rebuild.
///
/// Access discipline: `&mut self` operations are exclusive; `&self` readers
/// and the bulk `&self` mutators may only run behind the owning indexer's
/// mutex, and the bulk mutators additionally serialize on the importing
/// mutex. That protocol is what makes the `UnsafeCell` below sound.
pub struct SingleValueStore {
    file: UnsafeCell<StoreFile>,
    importing: Option<Importing>,
}

unsafe impl Send for SingleValueStore {}
unsafe impl Sync for SingleValueStore {}

// Item: next offset (u64), key length, value length, key bytes, value bytes.

fn item_next(data: &[u8], off: u64) -> u64 {
    read_u64_at(data, off)
}

fn item_set_next(data: &mut [u8], off: u64, next: u64) {
    write_u64_at(data, off, next);
}

fn item_ranges(data: &[u8], off: u64) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let mut pos = off as usize + 8;
    let key_len = varint::read_at(data, &mut pos) as usize;
    let val_len = varint::read_at(data, &mut pos) as usize;
    let key_start = pos;
    let val_start = key_start + key_len;
    (key_start..val_start, val_start..val_start + val_len)
}

fn item_key(data: &[u8], off: u64) -> &[u8] {
    let (key, _) = item_ranges(data, off);
    &data[key]
}

fn item_value(data: &[u8], off: u64) -> &[u8] {
    let (_, value) = item_ranges(data, off);
    &data[value]
}

fn item_size(data: &[u8], off: u64) -> u64 {
    let (_, value) = item_ranges(data, off);
    value.end as u64 - off
}

fn encoded_item_size(key: &[u8], value: &[u8]) -> Result<u64> {
    Ok(8 + varint::encoded_width(key.len() as u64)? as u64
        + varint::encoded_width(value.len() as u64)? as u64
        + key.len() as u64
        + value.len() as u64)
}

fn write_item(data: &mut [u8], at: u64, next: u64, key: &[u8], value: &[u8]) -> Result<u64> {
    write_u64_at(data, at, next);
    let mut pos = at as usize + 8;
    varint::write_at(data, &mut pos, key.len() as u64)?;
    varint::write_at(data, &mut pos, value.len() as u64)?;
    data[pos..pos + key.len()].copy_from_slice(key);
    pos += key.len();
    data[pos..pos + value.len()].copy_from_slice(value);
    pos += value.len();
    Ok(pos as u64)
}

/// Rewrite the value in place. The new value must not be longer than the
/// old one; the length field keeps its encoded width so the layout does not
/// shift.
fn item_set_value(data: &mut [u8], off: u64, value: &[u8]) {
    let mut pos = off as usize + 8;
    let key_len = varint::read_at(data, &mut pos) as usize;
    let len_pos = pos;
    let width = varint::width_at(data, pos);
    varint::read_at(data, &mut pos);
    let val_start = pos + key_len;
    data[val_start..val_start + value.len()].copy_from_slice(value);
    let mut p = len_pos;
    varint::write_at_width(data, &mut p, value.len() as u64, width);
}

/// Walk a chain for `key`; returns (previous item offset, item offset),
/// zero meaning none.
fn find_in_chain(data: &[u8], head: u64, key: &[u8]) -> (u64, u64) {
    let mut prev = 0u64;
    let mut off = head;
    while off != 0 {
        if item_key(data, off) == key {
            return (prev, off);
        }
        prev = off;
        off = item_next(data, off);
    }
    (0, 0)
}

fn set_internal(file: &mut StoreFile, bucket: u64, key: &[u8], value: &[u8]) -> Result<()> {
    let (prev, found) = find_in_chain(file.data(), file.table_offset(bucket), key);

    let prev_offset;
    let next_offset;
    if found != 0 {
        let current_len = item_value(file.data(), found).len();
        if value.len() <= current_len {
            let freed = (current_len - value.len()) as u64;
            item_set_value(file.data_mut(), found, value);
            if freed != 0 {
                let wasted = file.wasted() + freed;
                file.set_wasted(wasted);
            }
            return Ok(());
        }
        let wasted = file.wasted() + current_len as u64;
        file.set_wasted(wasted);
        prev_offset = prev;
        next_offset = item_next(file.data(), found);
    } else {
        prev_offset = 0;
        next_offset = file.table_offset(bucket);
        let num = file.num_items() + 1;
        file.set_num_items(num);
    }

    let my_offset = file.next_data_offset();
    let end = write_item(file.data_mut(), my_offset, next_offset, key, value)?;
    file.set_next_data_offset(end);

    if prev_offset == 0 {
        file.set_table_offset(bucket, my_offset);
    } else {
        item_set_next(file.data_mut(), prev_offset, my_offset);
    }
    Ok(())
}

fn remove_internal(file: &mut StoreFile, bucket: u64, key: &[u8]) {
    let (prev, found) = find_in_chain(file.data(), file.table_offset(bucket), key);
    if found == 0 {
        return;
    }

    let num = file.num_items() - 1;
    file.set_num_items(num);
    let wasted = file.wasted() + item_size(file.data(), found);
    file.set_wasted(wasted);

    let next = item_next(file.data(), found);
    if prev == 0 {
        file.set_table_offset(bucket, next);
    } else {
        item_set_next(file.data_mut(), prev, next);
    }
}

/// Re-insert every item of `src` into `dst`, rehashing when the bucket
/// counts differ.
fn copy_all(dst: &mut StoreFile, src: &StoreFile) -> Result<()> {
    ensure_table_size(dst, src.num_items())?;

    let num_dst = dst.num_buckets();
    let num_src = src.num_buckets();
    for i in 0..num_src {
        let mut off = src.table_offset(i);
        while off != 0 {
            let key = item_key(src.data(), off);
            let value = item_value(src.data(), off);
            dst.ensure_free_space(encoded_item_size(key, value)?)?;
            let bucket = if num_dst == num_src {
                i
            } else {
                bucket_from_hash(calc_hash(key), num_dst)
            };
            set_internal(dst, bucket, key, value)?;
            off = item_next(src.data(), off);
        }
    }

    ensure_optimal_waste(dst)
}

fn ensure_table_size(file: &mut StoreFile, additional: u64) -> Result<()> {
    if file.locked {
        return Ok(());
    }
    let num = file.num_items() + additional;
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

    // not enough memory: rebuild into a sibling file and rename it over
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
    }

    file.ensure_free_space(BULK_RESERVE)?;
    let start = file.next_data_offset();
    state.ranges[nth_thread] = (start, start + BULK_RESERVE);
    file.set_next_data_offset(start + BULK_RESERVE);
    Ok(())
}

impl SingleValueStore {
    pub const VERSION: u64 = FORMAT_VERSION;

    /// Open the store at `path`, creating a fresh file if none exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(SingleValueStore {
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

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure_table_size(self.file_mut(), 1)?;
        let bucket = self.bucket(key);
        let size = encoded_item_size(key, value)?;
        let file = self.file_mut();
        file.ensure_free_space(size)?;
        set_internal(file, bucket, key, value)?;
        ensure_optimal_waste(self.file_mut())
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let file = self.file();
        let bucket = bucket_from_hash(calc_hash(key), file.num_buckets());
        let (_, found) = find_in_chain(file.data(), file.table_offset(bucket), key);
        if found == 0 {
            None
        } else {
            Some(item_value(file.data(), found).to_vec())
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let bucket = self.bucket(key);
        remove_internal(self.file_mut(), bucket, key);
        ensure_optimal_waste(self.file_mut())
    }

    pub fn all_items(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let file = self.file();
        let mut arr = Vec::with_capacity(file.num_items() as usize);
        for bucket in 0..file.num_buckets() {
            let mut off = file.table_offset(bucket);
            while off != 0 {
                arr.push((item_key(file.data(), off).to_vec(), item_value(file.data(), off).to_vec()));
                off = item_next(file.data(), off);
            }
        }
        arr
    }

    /// Re-bucket to the target load factor, or compact, whichever the
    /// current shape calls for.
    pub fn optimize(&mut self) -> Result<()> {
        let file = self.file_mut();
        file.locked = false;

        let load = file.num_items() as f64 / file.num_buckets() as f64;
        if load > 1.05 || load < 0.6 {
            let table_size = primes::table_size_prime((file.num_items() as f64 / 0.8) as u64)?;
            let content_size =
                file.next_data_offset() - HEADER_SIZE - file.num_buckets() * 8 - file.wasted();
            return change_table(file, table_size, content_size);
        }
        if file.wasted() > 500_000 {
            let content_size =
                file.next_data_offset() - HEADER_SIZE - file.num_buckets() * 8 - file.wasted();
            return change_table(file, file.num_buckets(), content_size);
        }

        // drop the free tail
        let end = file.next_data_offset();
        file.resize(end)
    }

    /// Pre-size the bucket table for `n` items and freeze it until
    /// `unlock_table`.
    pub fn lock_table_for_items(&mut self, n: u64) -> Result<()> {
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

    /// Override the installed-RAM probe that decides whether rebuilds run in
    /// anonymous memory. `Some(0)` forces rebuilds through a sibling file.
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
        self.importing = Some(Importing::new(file.num_items(), 0, file.wasted(), num_threads));
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
        file.set_wasted(wasted);
        Ok(())
    }

    /// Frame one record for a spill stream: key hash, frame length, item
    /// frame with a zero next pointer.
    pub fn bulk_write(out: &mut dyn Write, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = calc_hash(key);
        out.write_all(&hash.to_le_bytes())?;

        let len = encoded_item_size(key, value)?;
        let mut frame = Vec::with_capacity(len as usize + 2);
        varint::push(&mut frame, len)?;
        let item_start = frame.len();
        frame.resize(item_start + len as usize, 0);
        write_item(&mut frame, item_start as u64, 0, key, value)?;
        out.write_all(&frame)?;
        Ok(())
    }

    /// Parse one spill record and advance the cursor past it.
    pub fn bulk_read<'a>(data: &'a [u8], pos: &mut usize) -> Result<(u64, &'a [u8], &'a [u8])> {
        let hash = read_u64_at(data, *pos as u64);
        *pos += 8;
        let len = varint::read_at(data, pos) as usize;
        let start = *pos;
        let frame = &data[start..start + len];
        *pos = start + len;
        Ok((hash, item_key(frame, 0), item_value(frame, 0)))
    }

    /// Insert during a bulk merge. The caller already routed `bucket` to
    /// this thread; the importing mutex serializes stripe allocation and
    /// chain updates.
    pub fn bulk_insert(&self, bucket: u64, key: &[u8], value: &[u8], nth_thread: usize) -> Result<()> {
        let item_size = encoded_item_size(key, value)?;
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

        let (prev, found) = find_in_chain(file.data(), file.table_offset(bucket), key);
        let prev_offset;
        let next_offset;
        if found != 0 {
            let current_len = item_value(file.data(), found).len();
            if value.len() <= current_len {
                item_set_value(file.data_mut(), found, value);
                state.wasted += (current_len - value.len()) as u64;
                return Ok(());
            }
            state.wasted += current_len as u64;
            prev_offset = prev;
            next_offset = item_next(file.data(), found);
        } else {
            prev_offset = 0;
            next_offset = file.table_offset(bucket);
            state.num_items += 1;
        }

        let my_offset = state.ranges[nth_thread].0;
        write_item(file.data_mut(), my_offset, next_offset, key, value)?;
        state.ranges[nth_thread].0 += item_size;

        if prev_offset == 0 {
            file.set_table_offset(bucket, my_offset);
        } else {
            item_set_next(file.data_mut(), prev_offset, my_offset);
        }
        Ok(())
    }
}
