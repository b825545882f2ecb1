use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weave_compiler::{parse, Compiler, CompilerConfig};

const WORKFLOW: &str = r#"model main = "anthropic/claude-sonnet"
model fast = "openai/gpt-4o-mini":
    temperature: 0.2

schema Review:
    approved: bool
    issues: list[string]

retry patient = 3 times, exponential backoff

prompt review_code expecting Review: "Review: $input"
prompt summarize using model fast: "Summarize $input"

agent reviewer:
    instruction review_code
    retry patient

agent writer:
    instruction summarize

flow main $files:
    $notes = []
    for $file in $files do
        parallel do
            $review = run agent reviewer with $file
            $summary = run agent writer with $file
        end
        push {review: $review, summary: $summary} to $notes
    end
    $rejected = filter $notes where .review.approved == false
    if $rejected == [] do
        return $notes
    end
    return $rejected

on output do
    mask pii
end
"#;

/// A larger source made of `n` copies of a small agent/flow pair.
fn generated_workflow(n: usize) -> String {
    let mut source = String::from("model main = \"anthropic/claude\"\nprompt p: \"x $input\"\n");
    for i in 0..n {
        source.push_str(&format!(
            "agent a{i}:\n    instruction p\nflow f{i}:\n    $r = run agent a{i} with $input\n    return $r\n"
        ));
    }
    source
}

fn benchmark_parse(c: &mut Criterion) {
    c.bench_function("parse_review_workflow", |b| {
        b.iter(|| parse(black_box(WORKFLOW)))
    });

    let large = generated_workflow(50);
    c.bench_function("parse_50_agents", |b| b.iter(|| parse(black_box(&large))));
}

fn benchmark_compile(c: &mut Criterion) {
    c.bench_function("compile_cold", |b| {
        b.iter(|| {
            // capacity 1 and a fresh compiler: every iteration misses
            let compiler = Compiler::new(CompilerConfig {
                cache_capacity: 1,
                ..CompilerConfig::default()
            });
            compiler.compile(black_box(WORKFLOW), "bench.wv")
        })
    });

    let compiler = Compiler::default();
    let _ = compiler.compile(WORKFLOW, "bench.wv");
    c.bench_function("compile_cached", |b| {
        b.iter(|| compiler.compile(black_box(WORKFLOW), "bench.wv"))
    });
}

criterion_group!(benches, benchmark_parse, benchmark_compile);
criterion_main!(benches);
