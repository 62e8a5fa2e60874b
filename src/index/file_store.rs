use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use crate::compression::varint;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Document, Posting};
use crate::index::store::{BulkStore, Store};
use crate::store::hash::{bucket_from_hash, bucket_is_in_thread};
use crate::store::multi::MultiValueStore;
use crate::store::single::SingleValueStore;

/// File-backed store: documents in `<path>.docs`, postings in
/// `<path>.tokens`.
///
/// The document record stored against an id is the length-prefixed
/// serialised document followed by the per-text joined-token strings; the
/// joined strings let the indexer rebuild the previous token set on update.
/// A posting is the fixed-width id followed by `'1'` (whole) or `'0'`
/// (prefix).
pub struct FileStore<D: Document> {
    path: PathBuf,
    docs: SingleValueStore,
    tokens: MultiValueStore,
    docs_import_buckets: u64,
    tokens_import_buckets: u64,
    _doc: PhantomData<D>,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.to_path_buf().into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

impl<D: Document> FileStore<D> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let docs = SingleValueStore::open(with_suffix(&path, ".docs"))?;
        let tokens = MultiValueStore::open(with_suffix(&path, ".tokens"))?;
        Ok(FileStore {
            path,
            docs,
            tokens,
            docs_import_buckets: 0,
            tokens_import_buckets: 0,
            _doc: PhantomData,
        })
    }

    pub fn is_file_version_ok(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        Ok(SingleValueStore::is_file_version_ok(with_suffix(path, ".docs"))?
            && MultiValueStore::is_file_version_ok(with_suffix(path, ".tokens"))?)
    }

    pub fn remove_files(path: impl AsRef<Path>) -> Result<()> {
        for suffix in [".docs", ".tokens"] {
            let file = with_suffix(path.as_ref(), suffix);
            if file.is_file() {
                fs::remove_file(&file)
                    .map_err(|e| Error::new(ErrorKind::IoOpen, format!("remove {}: {}", file.display(), e)))?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.docs.file_size() + self.tokens.file_size()
    }

    pub fn set_memory_rebuild_limit(&mut self, limit: Option<u64>) {
        self.docs.set_memory_rebuild_limit(limit);
        self.tokens.set_memory_rebuild_limit(limit);
    }

    fn doc_record(doc: &D, joined: &[String]) -> Result<Vec<u8>> {
        let body = doc.serialize()?;
        let mut out = Vec::with_capacity(body.len() + 16);
        varint::push(&mut out, body.len() as u64)?;
        out.extend_from_slice(&body);
        for text in joined {
            varint::push(&mut out, text.len() as u64)?;
            out.extend_from_slice(text.as_bytes());
        }
        Ok(out)
    }

    fn parse_doc_record(id: D::Id, data: &[u8]) -> Result<(D, Vec<String>)> {
        let mut pos = 0;
        let body_len = varint::read_at(data, &mut pos) as usize;
        let doc = D::deserialize(id, &data[pos..pos + body_len])?;
        pos += body_len;

        let mut joined = Vec::new();
        while pos < data.len() {
            let len = varint::read_at(data, &mut pos) as usize;
            let text = std::str::from_utf8(&data[pos..pos + len]).map_err(|e| {
                Error::new(ErrorKind::InvariantViolation, format!("joined string is not utf-8: {}", e))
            })?;
            joined.push(text.to_string());
            pos += len;
        }
        Ok((doc, joined))
    }

    fn posting_to_bytes(posting: &Posting<D::Id>) -> Vec<u8> {
        let mut out = D::serialize_id(posting.doc_id);
        out.push(if posting.is_whole { b'1' } else { b'0' });
        out
    }

    fn posting_from_bytes(data: &[u8]) -> Posting<D::Id> {
        let (id_bytes, flag) = data.split_at(data.len() - 1);
        Posting {
            doc_id: D::deserialize_id(id_bytes),
            is_whole: flag[0] == b'1',
        }
    }

    /// Every (token, posting) pair in the token store.
    pub fn all_postings(&self) -> Vec<(Vec<u8>, Posting<D::Id>)> {
        self.tokens
            .all_items()
            .into_iter()
            .map(|(key, value)| (key, Self::posting_from_bytes(&value)))
            .collect()
    }
}

impl<D: Document> Store for FileStore<D> {
    type Doc = D;

    fn add_doc(&mut self, doc: &D, joined: &[String]) -> Result<()> {
        let key = D::serialize_id(doc.id());
        let record = Self::doc_record(doc, joined)?;
        self.docs.set(&key, &record)
    }

    fn remove_doc(&mut self, id: D::Id) -> Result<()> {
        self.docs.remove(&D::serialize_id(id))
    }

    fn find_doc(&self, id: D::Id) -> Result<Option<(D, Vec<String>)>> {
        match self.docs.get(&D::serialize_id(id)) {
            Some(record) => Ok(Some(Self::parse_doc_record(id, &record)?)),
            None => Ok(None),
        }
    }

    fn all_documents(&self) -> Result<Vec<D>> {
        let items = self.docs.all_items();
        let mut arr = Vec::with_capacity(items.len());
        for (key, record) in items {
            let id = D::deserialize_id(&key);
            let (doc, _) = Self::parse_doc_record(id, &record)?;
            arr.push(doc);
        }
        Ok(arr)
    }

    fn add_token(&mut self, token: &str, posting: Posting<D::Id>) -> Result<()> {
        self.tokens.set(token.as_bytes(), &Self::posting_to_bytes(&posting))
    }

    fn remove_token(&mut self, token: &str, posting: Posting<D::Id>) -> Result<()> {
        self.tokens.remove(token.as_bytes(), &Self::posting_to_bytes(&posting))
    }

    fn find_token(&self, token: &str) -> Result<Vec<Posting<D::Id>>> {
        let values = self.tokens.get(token.as_bytes());
        Ok(values.iter().map(|v| Self::posting_from_bytes(v)).collect())
    }

    fn size_documents(&self) -> u64 {
        self.docs.num_items()
    }

    fn size_tokens(&self) -> u64 {
        self.tokens.num_keys()
    }

    fn optimize(&mut self) -> Result<()> {
        self.docs.optimize()?;
        self.tokens.optimize()
    }

    fn optimize_free_data(&mut self) -> Result<()> {
        self.docs.ensure_optimal_waste()?;
        self.tokens.ensure_optimal_waste()
    }

    fn clear(&mut self) -> Result<()> {
        self.docs.clear()?;
        self.tokens.clear()
    }
}

impl<D: Document> BulkStore for FileStore<D> {
    fn bulk_start(&mut self, num_threads: usize) -> Result<()> {
        self.docs.bulk_start(num_threads)?;
        self.tokens.bulk_start(num_threads)
    }

    fn bulk_stop(&mut self) -> Result<()> {
        self.docs.bulk_stop()?;
        self.tokens.bulk_stop()
    }

    fn bulk_doc_write(out: &mut dyn Write, doc: &D, joined: &[String]) -> Result<()> {
        let key = D::serialize_id(doc.id());
        let record = Self::doc_record(doc, joined)?;
        SingleValueStore::bulk_write(out, &key, &record)
    }

    fn bulk_tokens_write(out: &mut dyn Write, postings: &[(String, Posting<D::Id>)]) -> Result<()> {
        let mut head = Vec::new();
        varint::push(&mut head, postings.len() as u64)?;
        out.write_all(&head)?;
        for (token, posting) in postings {
            MultiValueStore::bulk_write(out, token.as_bytes(), &Self::posting_to_bytes(posting))?;
        }
        Ok(())
    }

    fn bulk_docs_read(&self, data: &[u8], pos: &mut usize, nth_thread: usize, num_threads: usize) -> Result<()> {
        let (hash, key, value) = SingleValueStore::bulk_read(data, pos)?;
        let bucket = bucket_from_hash(hash, self.docs_import_buckets);
        if !bucket_is_in_thread(bucket, nth_thread, num_threads, self.docs_import_buckets) {
            return Ok(());
        }
        self.docs.bulk_insert(bucket, key, value, nth_thread)
    }

    fn bulk_tokens_read_add(&self, data: &[u8], pos: &mut usize, nth_thread: usize, num_threads: usize) -> Result<()> {
        let count = varint::read_at(data, pos);
        for _ in 0..count {
            let (hash, key, value) = MultiValueStore::bulk_read(data, pos)?;
            let bucket = bucket_from_hash(hash, self.tokens_import_buckets);
            if !bucket_is_in_thread(bucket, nth_thread, num_threads, self.tokens_import_buckets) {
                continue;
            }
            self.tokens.bulk_insert(bucket, key, value, nth_thread)?;
        }
        Ok(())
    }

    fn bulk_tokens_read_remove(&self, data: &[u8], pos: &mut usize, nth_thread: usize, num_threads: usize) -> Result<()> {
        let count = varint::read_at(data, pos);
        for _ in 0..count {
            let (hash, key, value) = MultiValueStore::bulk_read(data, pos)?;
            let bucket = bucket_from_hash(hash, self.tokens_import_buckets);
            if !bucket_is_in_thread(bucket, nth_thread, num_threads, self.tokens_import_buckets) {
                continue;
            }
            self.tokens.bulk_remove(bucket, key, value, nth_thread)?;
        }
        Ok(())
    }

    fn bulk_docs_lock(&mut self, num_items: u64) -> Result<()> {
        self.docs.lock_table_for_items(num_items)?;
        self.docs_import_buckets = self.docs.num_buckets();
        Ok(())
    }

    fn bulk_docs_unlock(&mut self) {
        self.docs.unlock_table();
        self.docs_import_buckets = 0;
    }

    fn bulk_tokens_lock(&mut self, num_keys: u64) -> Result<()> {
        self.tokens.lock_table_for_keys(num_keys)?;
        self.tokens_import_buckets = self.tokens.num_buckets();
        Ok(())
    }

    fn bulk_tokens_unlock(&mut self) {
        self.tokens.unlock_table();
        self.tokens_import_buckets = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SimpleDoc;

    #[test]
    fn test_doc_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store: FileStore<SimpleDoc> = FileStore::open(dir.path().join("idx")).unwrap();

        let doc = SimpleDoc::new(1, "abc def");
        let joined = vec!["abc def".to_string()];
        store.add_doc(&doc, &joined).unwrap();

        let (back, back_joined) = store.find_doc(1).unwrap().unwrap();
        assert_eq!(back, doc);
        assert_eq!(back_joined, joined);
        assert_eq!(store.size_documents(), 1);

        store.remove_doc(1).unwrap();
        assert!(store.find_doc(1).unwrap().is_none());
        assert_eq!(store.size_documents(), 0);
    }

    #[test]
    fn test_token_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store: FileStore<SimpleDoc> = FileStore::open(dir.path().join("idx")).unwrap();

        store.add_token("abc", Posting::whole(1)).unwrap();
        store.add_token("abc", Posting::partial(2)).unwrap();
        // the same (token, id, flag) twice stays a single posting
        store.add_token("abc", Posting::whole(1)).unwrap();

        let mut postings = store.find_token("abc").unwrap();
        postings.sort_by_key(|p| (p.doc_id, p.is_whole));
        assert_eq!(postings, vec![Posting::whole(1), Posting::partial(2)]);
        assert_eq!(store.size_tokens(), 1);

        store.remove_token("abc", Posting::partial(2)).unwrap();
        assert_eq!(store.find_token("abc").unwrap(), vec![Posting::whole(1)]);
        store.remove_token("abc", Posting::whole(1)).unwrap();
        assert!(store.find_token("abc").unwrap().is_empty());
        assert_eq!(store.size_tokens(), 0);
    }

    #[test]
    fn test_version_check_covers_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("idx");
        drop(FileStore::<SimpleDoc>::open(&base).unwrap());
        assert!(FileStore::<SimpleDoc>::is_file_version_ok(&base).unwrap());

        // corrupt the tokens file header
        let tokens_path = with_suffix(&base, ".tokens");
        let mut raw = fs::read(&tokens_path).unwrap();
        raw[0] = 9;
        fs::write(&tokens_path, &raw).unwrap();

        assert!(!FileStore::<SimpleDoc>::is_file_version_ok(&base).unwrap());
        assert!(FileStore::<SimpleDoc>::open(&base).is_err());
    }

    #[test]
    fn test_remove_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("idx");
        drop(FileStore::<SimpleDoc>::open(&base).unwrap());
        assert!(with_suffix(&base, ".docs").is_file());

        FileStore::<SimpleDoc>::remove_files(&base).unwrap();
        assert!(!with_suffix(&base, ".docs").is_file());
        assert!(!with_suffix(&base, ".tokens").is_file());
        // removing missing files is a no-op
        FileStore::<SimpleDoc>::remove_files(&base).unwrap();
    }

    #[test]
    fn test_all_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut store: FileStore<SimpleDoc> = FileStore::open(dir.path().join("idx")).unwrap();
        for i in 0..10u32 {
            let doc = SimpleDoc::new(i, format!("text {}", i));
            store.add_doc(&doc, &[format!("text {}", i)]).unwrap();
        }
        let mut docs = store.all_documents().unwrap();
        docs.sort_by_key(|d| d.id);
        assert_eq!(docs.len(), 10);
        assert_eq!(docs[3], SimpleDoc::new(3, "text 3"));
    }
}
