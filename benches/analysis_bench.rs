// Benchmark for g-code summary analysis
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use preprint_service::gcode::analyze_reader;
use std::io::Cursor;

fn bench_analyze_sliced_output(c: &mut Criterion) {
    let mut gcode = String::from("; generated by PrusaSlicer\nG28\n");
    for i in 0..100_000 {
        gcode.push_str(&format!("G1 X{} Y{} E0.0{} F1500\n", i % 200, i % 180, i % 9));
    }
    gcode.push_str("; filament used = 5306.2mm (12.76cm3)\n");
    gcode.push_str("; estimated printing time (normal mode) = 1d 2h 3m 4s\n");

    c.bench_function("analyze 100k motion lines", |b| {
        b.iter(|| {
            let analysis = analyze_reader(Cursor::new(gcode.as_bytes())).unwrap();
            assert_eq!(analysis.filament_length_mm(), 5306.2);
        });
    });
}

criterion_group!(benches, bench_analyze_sliced_output);
criterion_main!(benches);
