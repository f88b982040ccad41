use criterion::{criterion_group, criterion_main, Criterion};

use lockstep::backoff::Backoff;
use lockstep::bitmap::Bitmap;
use lockstep::hp_stack::HpStack;
use lockstep::ring::MpmcRing;
use lockstep::rwlock::RwLock;
use lockstep::spinlock::{FasLock, TicketLock};

fn bench_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("locks-uncontended");

    let fas = FasLock::new(0u64);
    group.bench_function("fas-lock", |b| {
        b.iter(|| {
            let mut g = fas.lock();
            *g += 1;
        })
    });

    let ticket = TicketLock::new(0u64);
    group.bench_function("ticket-lock", |b| {
        b.iter(|| {
            let mut g = ticket.lock();
            *g += 1;
        })
    });

    let rw = RwLock::new(0u64);
    group.bench_function("rwlock-read", |b| {
        b.iter(|| {
            let g = rw.read();
            criterion::black_box(*g);
        })
    });

    group.finish();
}

fn bench_containers(c: &mut Criterion) {
    let mut group = c.benchmark_group("containers");

    let stack = HpStack::new();
    let handle = stack.register();
    group.bench_function("hp-stack-push-pop", |b| {
        b.iter(|| {
            handle.push(1u64);
            criterion::black_box(handle.pop());
        })
    });
    handle.flush();

    let ring: MpmcRing<u64> = MpmcRing::new(256);
    group.bench_function("mpmc-ring-enqueue-dequeue", |b| {
        b.iter(|| {
            ring.enqueue(1).unwrap();
            criterion::black_box(ring.dequeue());
        })
    });

    group.finish();
}

fn bench_misc(c: &mut Criterion) {
    let mut group = c.benchmark_group("misc");

    let bitmap = Bitmap::new(4096);
    group.bench_function("bitmap-bts", |b| {
        let mut n = 0;
        b.iter(|| {
            criterion::black_box(bitmap.bts(n & 4095));
            n += 1;
        })
    });

    group.bench_function("backoff-spin", |b| {
        b.iter(|| {
            let mut backoff = Backoff::with_ceiling(1024);
            backoff.spin();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_locks, bench_containers, bench_misc);
criterion_main!(benches);
