use parking_lot::Mutex;

/// Stripe size each merge thread reserves from the arena.
pub(crate) const BULK_RESERVE: u64 = 1_000_000;

/// Waste level during a bulk merge that triggers a compaction rebuild.
pub(crate) const BULK_WASTE_LIMIT: u64 = 100_000_000;

/// Shadow state of a store while a bulk merge is running. Header counters
/// are kept here and written back on `bulk_stop`; each thread owns one
/// `(next, end)` stripe of the arena.
pub(crate) struct ImportState {
    pub num_items: u64,
    pub num_keys: u64,
    pub wasted: u64,
    pub ranges: Vec<(u64, u64)>,
}

pub(crate) struct Importing {
    pub state: Mutex<ImportState>,
}

impl Importing {
    pub fn new(num_items: u64, num_keys: u64, wasted: u64, num_threads: usize) -> Self {
        Importing {
            state: Mutex::new(ImportState {
                num_items,
                num_keys,
                wasted,
                ranges: vec![(0, 0); num_threads],
            }),
        }
    }
}
