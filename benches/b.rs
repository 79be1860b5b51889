use criterion::{black_box, criterion_group, criterion_main, Criterion};

use callgraph_rcu::CallGraph;

/// `n` writer threads each add `count` distinct external symbols and a call
/// edge from a shared root, while `m` reader threads repeatedly walk the
/// root's callee set to completion.
fn build_and_read(writers: usize, per_writer: usize, readers: usize) {
    let g = std::sync::Arc::new(CallGraph::new());
    let h0 = g.register();
    let root = g.add_external(&h0, "root");
    g.set_defined(&h0, root);

    let reader_threads: Vec<_> = (0..readers)
        .map(|_| {
            let g = g.clone();
            std::thread::spawn(move || {
                let h = g.register();
                for _ in 0..8 {
                    let region = h.region();
                    let _: usize = g.get_callees(&region, root).count();
                }
            })
        })
        .collect();

    let writer_threads: Vec<_> = (0..writers)
        .map(|t| {
            let g = g.clone();
            std::thread::spawn(move || {
                let h = g.register();
                for i in 0..per_writer {
                    let name = format!("fn::{t}::{i}");
                    let child = g.add_external(&h, &name);
                    g.set_defined(&h, child);
                    g.add_edge(&h, root, child, true);
                }
            })
        })
        .collect();

    for t in writer_threads {
        t.join().unwrap();
    }
    for t in reader_threads {
        t.join().unwrap();
    }
}

fn w4_c250_r4(c: &mut Criterion) {
    c.bench_function("w4_c250_r4", |b| {
        b.iter(|| build_and_read(black_box(4), 250, 4))
    });
}

fn w2_c100_r8(c: &mut Criterion) {
    c.bench_function("w2_c100_r8", |b| {
        b.iter(|| build_and_read(black_box(2), 100, 8))
    });
}

criterion_group!(benches, w2_c100_r8, w4_c250_r4);
criterion_main!(benches);
