//! Criterion benchmarks for chunk reads through the engine.
//!
//! Run with:
//!   cargo bench --bench resolve
//!
//! Each iteration resolves every chunk of a freshly written container and
//! drains the completions, so the numbers cover the whole service loop:
//! queueing, physical reads, decode and scatter.

use std::path::Path;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use iostore::codec::CompressionMethod;
use iostore::config::KB;
use iostore::{ChunkId, ContainerWriter, Engine, EngineConfig, IoRequest, Scheduling, WriterSettings};

const CHUNKS: u64 = 32;
const CHUNK_SIZE: usize = 48 * 1024;

fn payload(seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_SIZE);
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    while out.len() < CHUNK_SIZE {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        // Small alphabet so the compressed variants have something to do.
        out.push(b'a' + (state % 8) as u8);
    }
    out
}

fn write_container(dir: &Path, method: CompressionMethod) -> std::path::PathBuf {
    let settings = WriterSettings::default().with_block_size(16 * KB as u32).with_method(method);
    let mut writer = ContainerWriter::new(settings).unwrap();
    for n in 0..CHUNKS {
        writer.add_chunk(ChunkId::from_u64(n, 0), payload(n)).unwrap();
    }
    writer.write(&dir.join(method.name())).unwrap()
}

fn read_everything(engine: &Engine) {
    for n in 0..CHUNKS {
        engine.resolve(IoRequest::new(ChunkId::from_u64(n, 0))).unwrap();
    }
    let mut done = 0;
    while done < CHUNKS as usize {
        engine.flush_reads();
        for completed in engine.get_completed_requests() {
            assert!(completed.is_ok());
            done += 1;
        }
    }
}

fn bench_resolve(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut group = c.benchmark_group("resolve_all_chunks");
    group.throughput(Throughput::Bytes(CHUNKS * CHUNK_SIZE as u64));

    for method in [CompressionMethod::None, CompressionMethod::Lz4, CompressionMethod::Zlib] {
        let base = write_container(dir.path(), method);

        // ── cooperative: everything on the calling thread ───────────────────
        let config = EngineConfig { read_buffer_size: 64 * KB, ..EngineConfig::cooperative() };
        let engine = Engine::new(config).unwrap();
        engine.mount(&base, 0).unwrap();
        group.bench_function(BenchmarkId::new("cooperative", method.name()), |b| {
            b.iter(|| read_everything(&engine))
        });

        // ── threaded: service thread plus decode workers ────────────────────
        let config = EngineConfig {
            read_buffer_size: 64 * KB,
            scheduling: Scheduling::Threaded { decompression_workers: 4 },
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        engine.mount(&base, 0).unwrap();
        group.bench_function(BenchmarkId::new("threaded", method.name()), |b| {
            b.iter(|| read_everything(&engine))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_resolve);
criterion_main!(benches);
