use answer_gate_core::{
    build_context_pack, AnswerGate, CandidatePassage, ChunkMetadata, ContextPolicy, GateConfig,
    GateRequest, InMemoryAuditSink, LiteralJudge, PregeneratedAnswer, QueryId,
};
use criterion::{criterion_group, criterion_main, Criterion};
use time::OffsetDateTime;

fn mk_passage(index: usize) -> CandidatePassage {
    let text = match index % 5 {
        0 => format!("Refunds for order batch {index} are processed within five business days."),
        1 => "Copyright 2024 Example Corp. All rights reserved.".to_string(),
        2 => format!("Section {index}"),
        3 => format!("Standard shipping for region {index} takes three to five days after dispatch."),
        _ => String::new(),
    };
    CandidatePassage {
        chunk_id: format!("chunk-{index}"),
        text,
        distance: Some(f64::from(u32::try_from(index % 97).unwrap_or(0)) / 100.0),
        metadata: ChunkMetadata {
            doc_id: Some(format!("doc-{}", index / 10)),
            chunk_index: Some(i64::try_from(index % 10).unwrap_or(0)),
            ..ChunkMetadata::default()
        },
    }
}

fn bench_admission(c: &mut Criterion) {
    let candidates = (0..1_000).map(mk_passage).collect::<Vec<_>>();
    let policy = ContextPolicy { max_chunks: 20, max_chars: 4_000, expand_neighbors: true, ..ContextPolicy::default() };

    c.bench_function("context_admission_1000_candidates", |b| {
        b.iter(|| {
            let pack = build_context_pack("how long do refunds take?", candidates.clone(), &policy);
            if let Err(err) = pack {
                panic!("admission benchmark failed: {err}");
            }
        });
    });
}

fn bench_gate(c: &mut Criterion) {
    let candidates = (0..200).map(mk_passage).collect::<Vec<_>>();
    let gate = match AnswerGate::new(GateConfig::default(), Box::new(LiteralJudge)) {
        Ok(gate) => gate,
        Err(err) => panic!("gate benchmark setup failed: {err}"),
    };
    let generator = PregeneratedAnswer::new(
        "Refunds for order batch 0 are processed within five business days [chunk-0]. \
         Standard shipping for region 3 takes three to five days after dispatch [chunk-3].",
    );
    let sink = InMemoryAuditSink::new();

    c.bench_function("gate_run_200_candidates", |b| {
        b.iter(|| {
            let request = GateRequest {
                query_id: QueryId::new(),
                query: "how long do refunds take?".to_string(),
                candidates: candidates.clone(),
                as_of: Some(OffsetDateTime::UNIX_EPOCH),
            };
            if let Err(err) = gate.run(request, &generator, &sink) {
                panic!("gate benchmark failed: {err}");
            }
            sink.clear();
        });
    });
}

criterion_group!(gate_benches, bench_admission, bench_gate);
criterion_main!(gate_benches);
