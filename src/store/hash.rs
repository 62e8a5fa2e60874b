/// CityHash64 over the raw key bytes. The same input must hash identically
/// across runs: spill files carry precomputed hashes that the merge phase
/// maps onto the live bucket table.
pub fn calc_hash(key: &[u8]) -> u64 {
    cityhash_rs::cityhash_110_128(key) as u64
}

pub fn bucket_from_hash(hash: u64, num_buckets: u64) -> u64 {
    hash % num_buckets
}

/// Contiguous bucket-range partitioning for the merge threads. Buckets are
/// split into `num_threads` equal ranges; the last thread absorbs the
/// remainder.
pub fn bucket_is_in_thread(bucket: u64, nth_thread: usize, num_threads: usize, num_buckets: u64) -> bool {
    if num_threads == 1 {
        return true;
    }
    let per_thread = num_buckets / num_threads as u64;
    let start = nth_thread as u64 * per_thread;
    if bucket < start {
        return false;
    }
    if bucket < start + per_thread {
        return true;
    }
    nth_thread + 1 == num_threads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(calc_hash(b"token"), calc_hash(b"token"));
        assert_ne!(calc_hash(b"token"), calc_hash(b"tokem"));
    }

    #[test]
    fn test_partition_covers_all_buckets_once() {
        let num_buckets = 103u64;
        for threads in [1usize, 2, 3, 7, 16] {
            for bucket in 0..num_buckets {
                let owners = (0..threads)
                    .filter(|&t| bucket_is_in_thread(bucket, t, threads, num_buckets))
                    .count();
                assert_eq!(owners, 1, "bucket {} threads {}", bucket, threads);
            }
        }
    }

    #[test]
    fn test_last_thread_absorbs_remainder() {
        // 10 buckets over 4 threads: 2 per thread, last one owns 2 + 2 extra
        assert!(bucket_is_in_thread(9, 3, 4, 10));
        assert!(bucket_is_in_thread(8, 3, 4, 10));
        assert!(!bucket_is_in_thread(5, 3, 4, 10));
    }
}
