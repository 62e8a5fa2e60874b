pub mod core;
pub mod compression;
pub mod mmap;
pub mod store;
pub mod analysis;
pub mod index;
pub mod search;

/*
┌──────────────────────────────────────────────────────────────────────────┐
│                        TOKENFILE ARCHITECTURE                            │
└──────────────────────────────────────────────────────────────────────────┘

 search layer        find_many ── SearchSettings / SearchManager
                        │              Comparator (WholeMatchFirst, ...)
                        ▼
 index layer         Indexer<S: Store>          BulkWriter / bulk_add
                        │   add / remove / find_match_all
                        ▼
 store abstraction   trait Store ── FileStore<D> ── MemoryStore<D>
                                        │
 persistence         SingleValueStore (<path>.docs, bytes → bytes)
                     MultiValueStore  (<path>.tokens, bytes → set of bytes)
                        │   bucket table + linked item chains in one arena
                        ▼
 plumbing            StoreFile (header, growth, rebuild) ── MmapFileMut
                     varint length codec ── CityHash64 ── prime tables

 A document flows in through Indexer::add: its texts are tokenized, diffed
 against the previously indexed token set, and the changes land as postings
 (doc id + whole/prefix flag) in the MultiValueStore while the document
 record (serialised bytes + joined-token strings) lands in the
 SingleValueStore. Bulk ingestion stages the same operations into spill
 files and merges them with range-partitioned threads.
*/

pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{Document, Posting, SimpleDoc};
pub use crate::index::file_store::FileStore;
pub use crate::index::indexer::{IndexSettings, Indexer};
pub use crate::index::memory_store::MemoryStore;
pub use crate::index::store::{BulkStore, Store};
pub use crate::search::comparators::{Comparator, WholeMatchFirst, WordsTogetherFirst};
pub use crate::search::find_many::find_many;
pub use crate::search::settings::{SearchManager, SearchResult, SearchSettings};
pub use crate::store::multi::MultiValueStore;
pub use crate::store::single::SingleValueStore;
