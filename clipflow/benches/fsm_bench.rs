//! Benchmarks for FSM transitions and best-of selection.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use clipflow::core::{FsmEvent, HistoryKind, QualityVerdict, Run, Stage};
use clipflow::fsm::FsmEngine;
use clipflow::qa::{attempt_artifact_name, best_attempt};

fn happy_path(c: &mut Criterion) {
    let engine = FsmEngine::new();
    c.bench_function("fsm_happy_path", |b| {
        b.iter(|| {
            let mut run = Run::new("bench", "yt:bench", 3);
            while !run.is_terminal() {
                let event = if run.current_stage.is_gated() {
                    FsmEvent::QaPass
                } else {
                    FsmEvent::StageComplete
                };
                engine.apply(&mut run, event).ok();
            }
            black_box(run)
        });
    });
}

fn consistency_check(c: &mut Criterion) {
    let engine = FsmEngine::new();
    let mut run = Run::new("bench", "yt:bench", 3);
    while run.current_stage != Stage::Delivery {
        let event = if run.current_stage.is_gated() {
            FsmEvent::QaPass
        } else {
            FsmEvent::StageComplete
        };
        if engine.apply(&mut run, event).is_err() {
            break;
        }
    }
    c.bench_function("fsm_is_consistent", |b| {
        b.iter(|| black_box(engine.is_consistent(black_box(&run))));
    });
}

fn best_of(c: &mut Criterion) {
    let mut run = Run::new("bench", "yt:bench", 16);
    for attempt in 1..=16u32 {
        run.record(HistoryKind::Verdict {
            stage: Stage::Content,
            verdict: QualityVerdict::rework("content_gate", attempt, f64::from(attempt % 7) * 10.0),
            artifact_key: Some(attempt_artifact_name(Stage::Content, 0, attempt)),
        });
    }
    c.bench_function("best_attempt", |b| {
        b.iter(|| black_box(best_attempt(black_box(&run), Stage::Content)));
    });
}

criterion_group!(benches, happy_path, consistency_check, best_of);
criterion_main!(benches);
