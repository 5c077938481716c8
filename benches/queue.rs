//! Throughput of the chunk queue under a producer/consumer pair

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;

use nexus_audio::AudioQueue;

const CHUNKS: usize = 1_000;

fn bench_put_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("audio_queue");
    group.throughput(Throughput::Elements(CHUNKS as u64));

    for chunk_bytes in [320usize, 3_200] {
        let chunk = Bytes::from(vec![0u8; chunk_bytes]);

        group.bench_with_input(
            BenchmarkId::new("single_thread", chunk_bytes),
            &chunk,
            |b, chunk| {
                let queue = AudioQueue::new();
                b.iter(|| {
                    for _ in 0..CHUNKS {
                        queue.put(chunk.clone()).unwrap();
                    }
                    for _ in 0..CHUNKS {
                        queue.take().unwrap();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("cross_thread", chunk_bytes),
            &chunk,
            |b, chunk| {
                b.iter(|| {
                    let queue = Arc::new(AudioQueue::new());
                    let producer = {
                        let queue = queue.clone();
                        let chunk = chunk.clone();
                        thread::spawn(move || {
                            for _ in 0..CHUNKS {
                                queue.put(chunk.clone()).unwrap();
                            }
                        })
                    };
                    for _ in 0..CHUNKS {
                        queue.take().unwrap();
                    }
                    producer.join().unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_put_take);
criterion_main!(benches);
