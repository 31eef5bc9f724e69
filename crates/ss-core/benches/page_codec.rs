//! Criterion benchmarks for the page-stream hot paths.
//!
//! Everything runs against the simulated address space and in-memory
//! buffers, so results do not depend on the machine's memory layout.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flate2::Compress;
use ss_core::codec::{ContentWriter, TagReader, TagWriter};
use ss_core::page::{is_zero_page, PageKind, PAGE_SIZE};
use ss_core::space::SimulatedAddressSpace;
use ss_core::storage::snapshot_compression;
use ss_core::Protection;

const BASE: usize = 0x10_0000;
const PAGES: usize = 256;

fn populated_space() -> SimulatedAddressSpace {
    let mut space = SimulatedAddressSpace::new();
    space.map_anonymous(BASE, PAGES * PAGE_SIZE, Protection::READ | Protection::WRITE);
    for page in 0..PAGES {
        // Mostly repetitive text with a varying prefix, like a typical heap.
        let addr = BASE + page * PAGE_SIZE;
        space.fill(addr, PAGE_SIZE, b'a' + (page % 26) as u8);
        space.poke(addr, &(page as u64).to_le_bytes());
    }
    space
}

fn bench_zero_scan(c: &mut Criterion) {
    let zero = vec![0u8; PAGE_SIZE];
    let mut late = vec![0u8; PAGE_SIZE];
    late[PAGE_SIZE - 1] = 1;

    let mut group = c.benchmark_group("page_codec/is_zero_page");
    group.throughput(Throughput::Bytes(PAGE_SIZE as u64));
    group.bench_function("all_zero", |b| b.iter(|| is_zero_page(black_box(&zero))));
    group.bench_function("last_byte_set", |b| b.iter(|| is_zero_page(black_box(&late))));
    group.finish();
}

fn bench_tags(c: &mut Criterion) {
    let kinds = [PageKind::FullPage, PageKind::ZeroPage, PageKind::BasePage, PageKind::NoPage];
    let count = 64 * 1024;

    let mut group = c.benchmark_group("page_codec/tags");
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("write", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(count);
            let mut writer = TagWriter::new();
            for i in 0..count {
                writer.push(&mut out, kinds[i % kinds.len()]).unwrap();
            }
            writer.flush(&mut out).unwrap();
            black_box(out)
        })
    });

    let mut stream = Vec::with_capacity(count);
    let mut writer = TagWriter::new();
    for i in 0..count {
        writer.push(&mut stream, kinds[i % kinds.len()]).unwrap();
    }
    writer.flush(&mut stream).unwrap();
    group.bench_function("read", |b| {
        b.iter(|| {
            let mut reader = TagReader::new();
            reader.begin(0, count as u64);
            let mut sum = 0u64;
            while let Some(byte) = reader.next_byte(&stream).unwrap() {
                sum += u64::from(byte);
            }
            black_box(sum)
        })
    });
    group.finish();
}

fn bench_content(c: &mut Criterion) {
    let space = populated_space();
    let mut group = c.benchmark_group("page_codec/content");
    group.throughput(Throughput::Bytes((PAGES * PAGE_SIZE) as u64));

    for compressed in [false, true] {
        let label = if compressed { "compressed" } else { "raw" };
        group.bench_with_input(BenchmarkId::new("store", label), &compressed, |b, &compressed| {
            let mut compressor = Compress::new(snapshot_compression(), false);
            b.iter(|| {
                let mut out = Vec::with_capacity(PAGES * PAGE_SIZE);
                let mut writer = ContentWriter::new(&mut out, compressed.then_some(&mut compressor));
                for page in 0..PAGES {
                    writer.store_page(&space, BASE + page * PAGE_SIZE).unwrap();
                }
                writer.flush(&space).unwrap();
                black_box(writer.position())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_zero_scan, bench_tags, bench_content);
criterion_main!(benches);
