use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vimpy::convert::{lines_from_foreign, lines_to_foreign, to_foreign, to_host};
use vimpy::foreign::stub::StubRuntime;
use vimpy::host::value::{Dict, List, Value};

fn make_lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("line {i}: the quick brown fox\njumps")).collect()
}

/// A dictionary of `n` entries, each a short list of mixed scalars.
fn make_tree(n: usize) -> Value {
    let pairs = (0..n).map(|i| {
        let items = vec![Value::Number(i as i64), Value::Float(i as f64 / 2.0), Value::from(format!("v{i}"))];
        (format!("k{i}"), Value::List(List::from_vec(items)))
    });
    Value::Dict(Dict::from_pairs(pairs))
}

fn bench_lines(c: &mut Criterion) {
    let rt = StubRuntime::new();
    let mut g = c.benchmark_group("buffer_lines");

    for n in [100, 10_000] {
        let lines = make_lines(n);
        let foreign = lines_to_foreign(&rt, &lines).unwrap();
        g.bench_function(format!("to_foreign_{n}"), |b| {
            b.iter(|| lines_to_foreign(black_box(&rt), black_box(&lines)).unwrap())
        });
        g.bench_function(format!("from_foreign_{n}"), |b| {
            b.iter(|| lines_from_foreign(black_box(&rt), black_box(&foreign)).unwrap())
        });
    }

    g.finish();
}

fn bench_values(c: &mut Criterion) {
    let rt = StubRuntime::new();
    let mut g = c.benchmark_group("values");

    for n in [10, 1_000] {
        let tree = make_tree(n);
        let foreign = to_foreign(&rt, &tree).unwrap();
        g.bench_function(format!("copy_{n}"), |b| b.iter(|| to_foreign(black_box(&rt), black_box(&tree)).unwrap()));
        g.bench_function(format!("to_host_{n}"), |b| b.iter(|| to_host(black_box(&rt), black_box(&foreign)).unwrap()));
    }

    g.finish();
}

criterion_group!(benches, bench_lines, bench_values);
criterion_main!(benches);
