use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use chrono::NaiveDate;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use xmlscout::search::{ChunkReader, Matcher};
use xmlscout::{MatchMode, MemoryServer, SearchConfig, SearchCoordinator, SearchRecord, SearchRequest};

fn document(lines: usize) -> Vec<u8> {
    let mut doc = String::from("<?xml version=\"1.0\"?>\n<Batch>\n");
    for n in 0..lines {
        doc.push_str(&format!(
            "  <Order no=\"{}\" status=\"accepted\"><Code>C{}</Code><Note>routine traffic</Note></Order>\n",
            n, n
        ));
    }
    doc.push_str("  <Order no=\"last\" status=\"rejected\"><Code>ERROR_CODE_42</Code></Order>\n</Batch>\n");
    doc.into_bytes()
}

fn request(keywords: &[&str], mode: MatchMode) -> SearchRequest {
    SearchRequest {
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        mode,
        ..Default::default()
    }
}

fn bench_literal_set(c: &mut Criterion) {
    let doc = document(20_000);
    let mut group = c.benchmark_group("literal_set");
    group.throughput(Throughput::Bytes(doc.len() as u64));

    for keywords in [1usize, 8, 64] {
        let mut terms: Vec<String> = (0..keywords).map(|k| format!("MISSING_{}", k)).collect();
        terms.push("ERROR_CODE_42".to_string());
        let refs: Vec<&str> = terms.iter().map(String::as_str).collect();
        let matcher = Matcher::from_request(&request(&refs, MatchMode::Literal)).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(keywords), &doc, |b, doc| {
            b.iter(|| {
                let mut reader = ChunkReader::new(&doc[..], "/bench.xml", 256 * 1024, 1024);
                let mut hits = 0;
                while let Some(chunk) = reader.next_chunk().unwrap() {
                    hits += matcher.scan_chunk(&chunk).len();
                }
                black_box(hits)
            })
        });
    }
    group.finish();
}

fn bench_pattern(c: &mut Criterion) {
    let doc = document(20_000);
    let matcher =
        Matcher::from_request(&request(&[r"ERROR_CODE_\d+", r"status=.rejected."], MatchMode::Regex))
            .unwrap();

    c.bench_function("pattern_scan", |b| {
        b.iter(|| {
            let mut reader = ChunkReader::new(&doc[..], "/bench.xml", 256 * 1024, 1024);
            let mut hits = 0;
            while let Some(chunk) = reader.next_chunk().unwrap() {
                hits += matcher.scan_chunk(&chunk).len();
            }
            black_box(hits)
        })
    });
}

fn bench_structured_query(c: &mut Criterion) {
    let server = MemoryServer::new();
    server.add_file("/SAMSUNG/20240301/Send File/orders.xml", document(5_000));

    let mut group = c.benchmark_group("structured_query");
    for (label, parse_limit) in [("tree", u64::MAX), ("streaming", 0)] {
        let mut config = SearchConfig::default();
        config.search = request(&["//Order[@status='rejected']/Code"], MatchMode::Xpath);
        config.search.start_date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        config.search.end_date = config.search.start_date;
        config.search.document_parse_limit = parse_limit;
        config.search.max_workers = NonZeroUsize::new(1).unwrap();

        group.bench_function(label, |b| {
            b.iter(|| {
                let coordinator = SearchCoordinator::new(Arc::new(server.clone()), config.clone());
                black_box(coordinator.run(|_: SearchRecord| {}))
            })
        });
    }
    group.finish();
}

fn bench_worker_scaling(c: &mut Criterion) {
    let server = MemoryServer::new();
    for i in 0..64 {
        server.add_file(
            &format!("/SAMSUNG/20240301/Send File/f{:03}.xml", i),
            document(200),
        );
    }
    server.set_read_delay(Duration::from_micros(200));

    let mut group = c.benchmark_group("worker_scaling");
    group.sample_size(10);
    for workers in [1usize, 4, 8] {
        let mut config = SearchConfig::default();
        config.search = request(&["ERROR_CODE_42"], MatchMode::Literal);
        config.search.start_date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        config.search.end_date = config.search.start_date;
        config.search.max_workers = NonZeroUsize::new(workers).unwrap();
        config.pool.size = NonZeroUsize::new(workers).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(workers), &config, |b, config| {
            b.iter(|| {
                let coordinator = SearchCoordinator::new(Arc::new(server.clone()), config.clone());
                black_box(coordinator.run(|_: SearchRecord| {}))
            })
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = bench_literal_set, bench_pattern, bench_structured_query, bench_worker_scaling
}

criterion_main!(benches);
