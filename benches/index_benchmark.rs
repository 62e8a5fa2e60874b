use criterion::{criterion_group, criterion_main, black_box, BenchmarkId, Criterion};
use rand::Rng;
use tokenfile::analysis::tokenizer::tokenize;
use tokenfile::{FileStore, Indexer, SearchSettings, SimpleDoc};

/// Helper to create test documents
fn create_test_document(id: u32, num_words: usize) -> SimpleDoc {
    let mut rng = rand::thread_rng();
    let words = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog"];
    let text: String = (0..num_words)
        .map(|_| words[rng.gen_range(0..words.len())])
        .collect::<Vec<_>>()
        .join(" ");
    SimpleDoc::new(id, text)
}

fn open_db(dir: &tempfile::TempDir, name: &str) -> Indexer<FileStore<SimpleDoc>> {
    Indexer::new(FileStore::open(dir.path().join(name)).unwrap())
}

/// Benchmark single document insertion
fn bench_single_add(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "add");

    c.bench_function("single_document_add", |b| {
        let mut id = 0u32;
        b.iter(|| {
            let doc = create_test_document(id, 20);
            db.add(&doc).unwrap();
            id += 1;
        });
    });
}

/// Benchmark bulk ingestion at different writer counts
fn bench_bulk_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_add");
    group.sample_size(10);

    for num_threads in [1usize, 2, 4].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            num_threads,
            |b, &num_threads| {
                let docs: Vec<SimpleDoc> =
                    (0..2000u32).map(|i| create_test_document(i, 20)).collect();
                b.iter(|| {
                    let dir = tempfile::tempdir().unwrap();
                    let db = open_db(&dir, "bulk");
                    db.bulk_add_batch(&docs, num_threads).unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark token queries against a populated index
fn bench_search(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "search");
    let docs: Vec<SimpleDoc> = (0..5000u32).map(|i| create_test_document(i, 20)).collect();
    db.bulk_add_batch(&docs, 4).unwrap();

    c.bench_function("find_match_all", |b| {
        let mut settings = SearchSettings::new("quick brown");
        settings.tokens = tokenize(&settings.query);
        b.iter(|| {
            let ids = db.find_match_all(black_box(&settings)).unwrap();
            black_box(ids);
        });
    });
}

criterion_group!(benches, bench_single_add, bench_bulk_add, bench_search);
criterion_main!(benches);
