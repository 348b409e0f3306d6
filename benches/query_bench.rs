//! Micro-benchmarks for the hot pure paths: query building and cursor codec.

use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use tracewatch::search::query::{root_span_search, ResourceFilter, RootSpanQuery, SortOrder};
use tracewatch::traces::cursor::PaginationCursor;

fn bench_root_span_search(c: &mut Criterion) {
    let query = RootSpanQuery {
        filter: ResourceFilter {
            component_uid: "comp-b7f3".into(),
            environment_uid: "env-prod".into(),
        },
        range: Some((
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
        )),
        limit: 100,
        order: SortOrder::Desc,
        search_after: Some(("2024-01-04T12:00:00.000000000Z".into(), "a1b2c3".into())),
    };

    c.bench_function("root_span_search_body", |b| {
        b.iter(|| root_span_search(std::hint::black_box(&query)))
    });
}

fn bench_cursor_codec(c: &mut Criterion) {
    let cursor = PaginationCursor::new("2024-01-04T12:00:00.000000000Z", "a1b2c3d4e5f60718");
    c.bench_function("cursor_encode_decode", |b| {
        b.iter(|| {
            let token = std::hint::black_box(&cursor).encode();
            PaginationCursor::decode(&token).unwrap()
        })
    });
}

criterion_group!(benches, bench_root_span_search, bench_cursor_codec);
criterion_main!(benches);
