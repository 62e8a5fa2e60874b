use std::collections::HashSet;
use std::io::{BufWriter, Write};
use memmap2::{Mmap, MmapOptions};
use rayon::prelude::*;
use tempfile::NamedTempFile;
use crate::analysis::tokenizer::split_tokens;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Document, Posting};
use crate::index::indexer::{document_tokens, tokens_difference, Indexer};
use crate::index::store::{BulkStore, IdOf, Store};

/// Stages documents for one ingestion thread: a docs spill stream and a
/// tokens spill stream in the system temp directory. Staging never touches
/// the live stores beyond the read needed to diff an already indexed
/// document, so any number of writers can run in parallel.
pub struct BulkWriter<'a, S: BulkStore> {
    db: &'a Indexer<S>,
    num_docs: u64,
    docs_out: BufWriter<NamedTempFile>,
    tokens_out: BufWriter<NamedTempFile>,
    /// Whole tokens staged so far; only used to estimate the distinct token
    /// count for pre-sizing.
    tokens: HashSet<String>,
}

impl<'a, S: BulkStore> BulkWriter<'a, S> {
    fn new(db: &'a Indexer<S>) -> Result<Self> {
        Ok(BulkWriter {
            db,
            num_docs: 0,
            docs_out: BufWriter::new(NamedTempFile::new()?),
            tokens_out: BufWriter::new(NamedTempFile::new()?),
            tokens: HashSet::new(),
        })
    }

    /// Stage one document: diff against the live store exactly like a
    /// sequential add, then append the record and the add/remove posting
    /// blocks to the spill streams.
    pub fn add(&mut self, doc: &S::Doc) -> Result<()> {
        let id = doc.id();
        self.num_docs += 1;

        let (mut tokens_add, joined) = document_tokens(doc);

        let mut tokens_remove = HashSet::new();
        if let Some((_, old_joined)) = self.db.store().find_doc(id)? {
            for text in &old_joined {
                tokens_remove.extend(split_tokens(text)?);
            }
            tokens_difference(&mut tokens_add, &mut tokens_remove);
        }

        S::bulk_doc_write(&mut self.docs_out, doc, &joined)?;

        let mut add_partial = HashSet::new();
        self.db.partial_tokens(&tokens_add, &mut add_partial);
        let mut remove_partial = HashSet::new();
        self.db.partial_tokens(&tokens_remove, &mut remove_partial);
        tokens_difference(&mut add_partial, &mut remove_partial);

        // the record is an "add" block followed by a "remove" block
        let mut block: Vec<(String, Posting<IdOf<S::Doc>>)> =
            Vec::with_capacity(tokens_add.len() + add_partial.len());
        for token in &tokens_add {
            block.push((token.clone(), Posting::whole(id)));
        }
        for token in &add_partial {
            block.push((token.clone(), Posting::partial(id)));
        }
        S::bulk_tokens_write(&mut self.tokens_out, &block)?;

        block.clear();
        for token in &tokens_remove {
            block.push((token.clone(), Posting::whole(id)));
        }
        for token in &remove_partial {
            block.push((token.clone(), Posting::partial(id)));
        }
        S::bulk_tokens_write(&mut self.tokens_out, &block)?;

        self.tokens.extend(tokens_add);
        Ok(())
    }

    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }
}

#[derive(Clone, Copy)]
enum MergePhase {
    Docs,
    Tokens,
}

fn map_spill_files<'a, I>(files: I) -> Result<Vec<Option<Mmap>>>
where
    I: Iterator<Item = &'a NamedTempFile>,
{
    files
        .map(|file| {
            let len = file.as_file().metadata()?.len();
            if len == 0 {
                return Ok(None);
            }
            let map = unsafe { MmapOptions::new().map(file.as_file()) }
                .map_err(|e| Error::new(ErrorKind::IoOpen, format!("mmap spill file: {}", e)))?;
            Ok(Some(map))
        })
        .collect()
}

/// Every thread scans every spill stream and applies only the records whose
/// bucket falls into its range; decode runs in parallel, mutation serializes
/// on the store's importing mutex.
fn run_merge_threads<S: BulkStore>(
    store: &S,
    datas: &[&[u8]],
    num_threads: usize,
    phase: MergePhase,
) -> Result<()> {
    let results = crossbeam::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(num_threads);
        for nth in 0..num_threads {
            handles.push(scope.spawn(move |_| -> Result<()> {
                for &data in datas {
                    let mut pos = 0;
                    while pos < data.len() {
                        match phase {
                            MergePhase::Docs => {
                                store.bulk_docs_read(data, &mut pos, nth, num_threads)?;
                            }
                            MergePhase::Tokens => {
                                store.bulk_tokens_read_add(data, &mut pos, nth, num_threads)?;
                                store.bulk_tokens_read_remove(data, &mut pos, nth, num_threads)?;
                            }
                        }
                    }
                }
                Ok(())
            }));
        }
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(Error::new(ErrorKind::InvariantViolation, "bulk merge thread panicked".to_string()))
                })
            })
            .collect::<Vec<Result<()>>>()
    })
    .map_err(|_| Error::new(ErrorKind::InvariantViolation, "bulk merge scope failed".to_string()))?;

    for result in results {
        result?;
    }
    Ok(())
}

impl<S: BulkStore> Indexer<S> {
    /// Hand out one staging writer per ingestion thread.
    pub fn bulk_writers(&self, num_threads: usize) -> Result<Vec<BulkWriter<'_, S>>> {
        (0..num_threads).map(|_| BulkWriter::new(self)).collect()
    }

    /// Merge everything the writers staged into the live stores, then
    /// reclaim waste. Holds the indexer mutex for the whole merge.
    pub fn bulk_add(&self, writers: Vec<BulkWriter<'_, S>>) -> Result<()> {
        if writers.is_empty() {
            return Ok(());
        }
        let num_threads = writers.len();
        let mut writers = writers;

        for writer in &mut writers {
            writer.docs_out.flush()?;
            writer.tokens_out.flush()?;
        }

        // estimate the distinct token count, prefixes included
        let mut num_docs = 0u64;
        let mut all_tokens: HashSet<String> = HashSet::new();
        for writer in &writers {
            num_docs += writer.num_docs;
            self.partial_tokens(&writer.tokens, &mut all_tokens);
            all_tokens.extend(writer.tokens.iter().cloned());
        }
        let num_tokens = all_tokens.len() as u64;
        drop(all_tokens);
        for writer in &mut writers {
            writer.tokens.clear();
        }
        eprintln!(
            "bulk: staging {} documents, ~{} distinct tokens from {} writers",
            num_docs, num_tokens, num_threads
        );

        let mut store = self.store.lock();
        store.bulk_start(num_threads)?;

        // documents
        let maps = map_spill_files(writers.iter().map(|w| w.docs_out.get_ref()))?;
        let datas: Vec<&[u8]> = maps.iter().map(|m| m.as_deref().unwrap_or(&[])).collect();
        let target = store.size_documents() + num_docs;
        store.bulk_docs_lock(target)?;
        run_merge_threads(&*store, &datas, num_threads, MergePhase::Docs)?;
        store.bulk_docs_unlock();
        drop(datas);
        drop(maps);
        eprintln!("bulk: documents inserted");

        // tokens
        let maps = map_spill_files(writers.iter().map(|w| w.tokens_out.get_ref()))?;
        let datas: Vec<&[u8]> = maps.iter().map(|m| m.as_deref().unwrap_or(&[])).collect();
        let target = store.size_tokens() + num_tokens;
        store.bulk_tokens_lock(target)?;
        run_merge_threads(&*store, &datas, num_threads, MergePhase::Tokens)?;
        store.bulk_tokens_unlock();
        drop(datas);
        drop(maps);
        eprintln!("bulk: tokens inserted");

        store.bulk_stop()?;
        // spill files are deleted when the writers drop
        drop(writers);
        store.optimize_free_data()?;
        Ok(())
    }

    /// Stage `docs` across parallel writers, then merge. `num_threads = 0`
    /// uses one writer per CPU.
    pub fn bulk_add_batch(&self, docs: &[S::Doc], num_threads: usize) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let num_threads = if num_threads == 0 { num_cpus::get().max(1) } else { num_threads };
        let num_threads = num_threads.min(docs.len());

        let mut writers = self.bulk_writers(num_threads)?;
        let per_writer = docs.len().div_ceil(num_threads);
        let chunks: Vec<&[S::Doc]> = docs.chunks(per_writer).collect();
        writers
            .par_iter_mut()
            .zip(chunks.par_iter())
            .try_for_each(|(writer, chunk)| chunk.iter().try_for_each(|doc| writer.add(doc)))?;
        self.bulk_add(writers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use crate::analysis::tokenizer::tokenize;
    use crate::core::types::SimpleDoc;
    use crate::index::file_store::FileStore;
    use crate::search::settings::SearchSettings;

    type FileDb = Indexer<FileStore<SimpleDoc>>;

    fn open_db(dir: &tempfile::TempDir, name: &str) -> FileDb {
        Indexer::new(FileStore::open(dir.path().join(name)).unwrap())
    }

    fn corpus() -> Vec<SimpleDoc> {
        let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta"];
        (0..60u32)
            .map(|i| {
                let a = words[i as usize % words.len()];
                let b = words[(i as usize * 3 + 1) % words.len()];
                SimpleDoc::new(i, format!("{} {} doc{}", a, b, i))
            })
            .collect()
    }

    fn postings_set(db: &FileDb) -> BTreeSet<(Vec<u8>, u32, bool)> {
        db.store()
            .all_postings()
            .into_iter()
            .map(|(token, posting)| (token, posting.doc_id, posting.is_whole))
            .collect()
    }

    fn search(db: &FileDb, query: &str) -> Vec<u32> {
        let mut settings = SearchSettings::new(query);
        settings.tokens = tokenize(query);
        let mut ids: Vec<u32> = db.find_match_all(&settings).unwrap().into_iter().collect();
        ids.sort();
        ids
    }

    fn assert_equivalent(a: &FileDb, b: &FileDb) {
        assert_eq!(postings_set(a), postings_set(b));
        let collect = |db: &FileDb| {
            let mut docs = db.store().all_documents().unwrap();
            docs.sort_by_key(|d| d.id);
            docs
        };
        assert_eq!(collect(a), collect(b));
        for query in ["alpha", "beta gamma", "doc7", "alph", "missing"] {
            assert_eq!(search(a, query), search(b, query), "query {:?}", query);
        }
    }

    #[test]
    fn test_bulk_equals_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let docs = corpus();

        let sequential = open_db(&dir, "seq");
        for doc in &docs {
            sequential.add(doc).unwrap();
        }

        // one writer
        let one = open_db(&dir, "one");
        let mut writers = one.bulk_writers(1).unwrap();
        for doc in &docs {
            writers[0].add(doc).unwrap();
        }
        one.bulk_add(writers).unwrap();
        assert_equivalent(&sequential, &one);

        // four writers, four merge threads
        let four = open_db(&dir, "four");
        let mut writers = four.bulk_writers(4).unwrap();
        for (i, doc) in docs.iter().enumerate() {
            writers[i % 4].add(doc).unwrap();
        }
        four.bulk_add(writers).unwrap();
        assert_equivalent(&sequential, &four);
    }

    #[test]
    fn test_bulk_updates_existing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir, "upd");
        db.add(&SimpleDoc::new(1, "old words here")).unwrap();
        db.add(&SimpleDoc::new(2, "untouched text")).unwrap();

        let mut writers = db.bulk_writers(2).unwrap();
        writers[0].add(&SimpleDoc::new(1, "fresh words now")).unwrap();
        writers[1].add(&SimpleDoc::new(3, "brand new doc")).unwrap();
        db.bulk_add(writers).unwrap();

        assert_eq!(search(&db, "old"), Vec::<u32>::new());
        assert_eq!(search(&db, "fresh"), vec![1]);
        assert_eq!(search(&db, "words"), vec![1]);
        assert_eq!(search(&db, "untouched"), vec![2]);
        assert_eq!(search(&db, "brand"), vec![3]);
        assert_eq!(db.store().size_documents(), 3);

        // no posting still names the removed tokens
        for (token, _) in db.store().all_postings() {
            assert_ne!(token, b"old".to_vec());
        }
    }

    #[test]
    fn test_bulk_duplicate_documents_across_writers() {
        // the same document staged by two writers must not double its
        // postings
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir, "dup");
        let doc = SimpleDoc::new(5, "twice staged");

        let mut writers = db.bulk_writers(2).unwrap();
        writers[0].add(&doc).unwrap();
        writers[1].add(&doc).unwrap();
        db.bulk_add(writers).unwrap();

        let postings = postings_set(&db);
        let whole: Vec<_> = postings.iter().filter(|(t, _, w)| t == b"twice" && *w).collect();
        assert_eq!(whole.len(), 1);
        assert_eq!(search(&db, "twice"), vec![5]);
    }

    #[test]
    fn test_bulk_add_batch() {
        let dir = tempfile::tempdir().unwrap();
        let docs = corpus();

        let sequential = open_db(&dir, "seq");
        for doc in &docs {
            sequential.add(doc).unwrap();
        }

        let batched = open_db(&dir, "batch");
        batched.bulk_add_batch(&docs, 4).unwrap();
        assert_equivalent(&sequential, &batched);
    }

    #[test]
    fn test_bulk_with_empty_writers() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir, "empty");
        let writers = db.bulk_writers(3).unwrap();
        db.bulk_add(writers).unwrap();
        assert_eq!(db.store().size_documents(), 0);

        db.bulk_add(Vec::new()).unwrap();
    }
}
