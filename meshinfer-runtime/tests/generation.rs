//! End-to-end generation on a simulated mesh with a tiny synthetic Llama.
//!
//! The model is f32 and every run is deterministic, so the tests compare
//! whole token streams between configurations that must agree.

mod test_helpers;

use meshinfer::{ErrorKind, MeshControl, Model, SamplingParams, TensorIo};
use meshinfer_runtime::{
    DecodeOutput, GenerationOutput, Generator, GeneratorConfig, Orchestrator, OrchestratorOptions,
};
use meshinfer_sim::SimBackend;

use test_helpers::{greedy_config, open_mesh, prompts, tiny_model, Llama, MAX_SEQ_LEN};

fn run(rows: usize, cols: usize, config: GeneratorConfig) -> GenerationOutput {
    let mesh = open_mesh(rows, cols);
    let model = tiny_model(&mesh, config.batch_size);
    let prompts = prompts(config.batch_size);
    let mut generator = Generator::new(model, config).unwrap();
    generator.generate(&prompts).unwrap()
}

fn completions(output: &GenerationOutput) -> Vec<Vec<u32>> {
    (0..output.tokens.len())
        .map(|user| output.completion(user).to_vec())
        .collect()
}

/// Every K and V slab of `generator`'s cache, read back to the host.
fn kv_contents(generator: &Generator<Llama>) -> Vec<Vec<f32>> {
    generator
        .kv_cache()
        .per_layer_handles()
        .iter()
        .flat_map(|layer| [&layer.k, &layer.v])
        .map(|slab| SimBackend::to_host(slab).unwrap().into_f32().unwrap())
        .collect()
}

#[test]
fn single_user_generates_budget() {
    let output = run(1, 1, greedy_config(1, 6));
    let completion = output.completion(0);
    assert_eq!(completion.len(), 6);
    assert_eq!(output.records.len(), 1);
    assert_eq!(output.records[0].len(), 5);
    assert!(completion.iter().all(|&t| (t as usize) < 264));

    let report = &output.reports[0];
    assert_eq!(report.batch_size, 1);
    assert_eq!(report.decode_iterations, 4);
    assert!(report.compile_prefill > 0.0);
    assert!(report.total_compile >= report.compile_prefill);
}

#[test]
fn device_and_host_argmax_agree() {
    let device = run(1, 2, greedy_config(1, 8));
    let host = run(
        1,
        2,
        GeneratorConfig {
            argmax_on_device: Some(false),
            ..greedy_config(1, 8)
        },
    );
    assert_eq!(completions(&device), completions(&host));
}

#[test]
fn paged_and_contiguous_cache_agree() {
    let paged = run(1, 2, greedy_config(2, 6));
    let contiguous = run(
        1,
        2,
        GeneratorConfig {
            paged_attention: false,
            ..greedy_config(2, 6)
        },
    );
    assert_eq!(completions(&paged), completions(&contiguous));
}

#[test]
fn repeat_batches_are_identical() {
    let output = run(
        1,
        2,
        GeneratorConfig {
            repeat_batches: 2,
            sampling: SamplingParams {
                temperature: 0.8,
                top_p: 0.9,
                seed: 7,
            },
            ..greedy_config(2, 6)
        },
    );
    assert_eq!(output.reports.len(), 2);
    assert_eq!(output.records.len(), 2);
    let tokens = |batch: usize| -> Vec<Vec<u32>> {
        output.records[batch].iter().map(|r| r.tokens.clone()).collect()
    };
    assert_eq!(tokens(0), tokens(1));
}

#[test]
fn one_and_two_queues_agree_with_position_check() {
    let checked = |queues: usize| GeneratorConfig {
        num_command_queues: queues,
        check_positions: true,
        ..greedy_config(2, 6)
    };
    let one = run(1, 1, checked(1));
    let two = run(1, 1, checked(2));
    assert_eq!(completions(&one), completions(&two));

    let positions: Vec<Vec<i32>> = two.records[0].iter().map(|r| r.positions.clone()).collect();
    for pair in positions.windows(2) {
        for (before, after) in pair[0].iter().zip(&pair[1]) {
            assert_eq!(after - before, 1);
        }
    }
}

#[test]
fn eos_latches_each_user() {
    let free = run(1, 1, greedy_config(2, 8));
    let stop = *free.completion(0).last().unwrap();

    let stopped = run(
        1,
        1,
        GeneratorConfig {
            eos_token_ids: vec![stop],
            ..greedy_config(2, 8)
        },
    );
    for user in 0..2 {
        let full = free.completion(user);
        let expected = match full.iter().position(|&t| t == stop) {
            Some(0) => vec![stop],
            Some(k) => full[..k].to_vec(),
            None => full.to_vec(),
        };
        assert_eq!(stopped.completion(user), expected.as_slice(), "user {user}");
    }
}

#[test]
fn decode_clamped_by_kv_room() {
    let mesh = open_mesh(1, 1);
    let model = tiny_model(&mesh, 1);
    let mut long = prompts(1);
    long[0].resize(MAX_SEQ_LEN - 3, 200);
    let mut generator = Generator::new(model, greedy_config(1, 50)).unwrap();
    assert_eq!(generator.decode_iterations(&[long[0].len()]), 3);
    let output = generator.generate(&long).unwrap();
    assert_eq!(output.completion(0).len(), 4);
}

#[test]
fn replays_and_readouts_alternate() {
    let mesh = open_mesh(1, 1);
    let model = tiny_model(&mesh, 2);
    let mut generator = Generator::new(model, greedy_config(2, 5)).unwrap();
    mesh.clear_command_log();
    let output = generator.generate(&prompts(2)).unwrap();

    let log = mesh.command_log();
    let replays: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("cq0 replay trace"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(replays.len(), output.records[0].len());
    for (n, &at) in replays.iter().enumerate() {
        let next_replay = replays.get(n + 1).copied().unwrap_or(log.len());
        let read = log[at..]
            .iter()
            .position(|line| line == "cq1 read")
            .map(|offset| at + offset)
            .unwrap();
        assert!(read < next_replay, "readout of replay {n} ran after the next replay");
    }
}

#[test]
fn wrong_prompt_count_is_config_error() {
    let mesh = open_mesh(1, 1);
    let model = tiny_model(&mesh, 2);
    let mut generator = Generator::new(model, greedy_config(2, 4)).unwrap();
    let err = generator.generate(&prompts(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn traced_step_matches_eager_step() {
    let prompt = prompts(1);
    let pos = [i32::try_from(prompt[0].len()).unwrap()];

    let eager_mesh = open_mesh(1, 2);
    let mut eager = Generator::new(tiny_model(&eager_mesh, 1), greedy_config(1, 4)).unwrap();
    let first = eager.prefill_forward_text(&prompt).unwrap().argmax(0);
    let DecodeOutput::Logits(logits) = eager.decode_forward_text(&[first], &pos, false, false).unwrap() else {
        panic!("eager host step returned tokens");
    };

    let traced_mesh = open_mesh(1, 2);
    let mut traced = Generator::new(tiny_model(&traced_mesh, 1), greedy_config(1, 4)).unwrap();
    assert_eq!(traced.prefill_forward_text(&prompt).unwrap().argmax(0), first);
    let DecodeOutput::Tokens(tokens) = traced.decode_forward_text(&[first], &pos, true, true).unwrap() else {
        panic!("traced argmax step returned logits");
    };
    assert_eq!(tokens, vec![logits.argmax(0)]);

    let region = traced_mesh.trace_region_used();
    traced
        .decode_forward_text(&tokens, &[pos[0] + 1], true, true)
        .unwrap();
    assert_eq!(traced_mesh.trace_region_used(), region);
    traced.release_trace().unwrap();
    assert_eq!(traced_mesh.trace_region_used(), 0);
}

#[test]
fn async_collectives_match_sync() {
    let sync = run(1, 2, greedy_config(2, 5));

    let mesh = open_mesh(1, 2);
    let mut orchestrator = Orchestrator::new(mesh.clone(), OrchestratorOptions::default()).unwrap();
    let ccl = orchestrator.collectives();
    let model = tiny_model(&mesh, 2).with_collectives(ccl.clone());
    assert_eq!(model.mesh().shape().num_devices(), 2);
    let mut generator = Generator::new(model, greedy_config(2, 5))
        .unwrap()
        .with_collectives(ccl);
    let output = generator.generate(&prompts(2)).unwrap();
    orchestrator.synchronize().unwrap();
    drop(generator);
    orchestrator.teardown().unwrap();

    assert_eq!(completions(&output), completions(&sync));
    assert!(!mesh.fabric_enabled());
}

#[test]
fn token_stream_moves_between_steps() {
    let output = run(1, 1, greedy_config(2, 6));
    for user in 0..2 {
        let completion = output.completion(user);
        assert!(
            completion.windows(2).any(|w| w[0] != w[1]),
            "user {user} repeats one token: {completion:?}"
        );
    }
}

#[test]
fn pipeline_matches_eager_reference_loop() {
    const BATCH: usize = 2;
    const MAX_GEN: usize = 6;
    let prompts = prompts(BATCH);

    let traced = run(
        1,
        2,
        GeneratorConfig {
            argmax_on_device: Some(false),
            check_positions: true,
            ..greedy_config(BATCH, MAX_GEN)
        },
    );
    let mut traced_steps = vec![(0..BATCH).map(|u| traced.completion(u)[0]).collect::<Vec<u32>>()];
    traced_steps.extend(traced.records[0].iter().map(|r| r.tokens.clone()));

    // Feed each step's argmax back by hand, one eager forward at a time.
    let mesh = open_mesh(1, 2);
    let mut eager = Generator::new(tiny_model(&mesh, BATCH), greedy_config(BATCH, MAX_GEN)).unwrap();
    let first = eager.prefill_forward_text(&prompts).unwrap();
    let mut tokens: Vec<u32> = (0..BATCH).map(|u| first.argmax(u)).collect();
    let mut pos: Vec<i32> = prompts.iter().map(|p| i32::try_from(p.len()).unwrap()).collect();
    let mut eager_steps = vec![tokens.clone()];
    for _ in 1..MAX_GEN {
        let DecodeOutput::Logits(logits) = eager.decode_forward_text(&tokens, &pos, false, false).unwrap() else {
            panic!("eager host step returned tokens");
        };
        tokens = (0..BATCH).map(|u| logits.argmax(u)).collect();
        for p in &mut pos {
            *p += 1;
        }
        eager_steps.push(tokens.clone());
    }

    assert_eq!(traced_steps, eager_steps);
    let last = traced.records[0].last().unwrap();
    assert_eq!(last.positions, pos);
}

#[test]
fn reused_generator_starts_from_clean_cache() {
    let short = prompts(2);
    let long: Vec<Vec<u32>> = short
        .iter()
        .map(|p| {
            let mut p = p.clone();
            p.resize(150, 77);
            p
        })
        .collect();

    let mesh = open_mesh(1, 1);
    let mut reused = Generator::new(tiny_model(&mesh, 2), greedy_config(2, 4)).unwrap();
    reused.generate(&long).unwrap();
    let second = reused.generate(&short).unwrap();

    let fresh_mesh = open_mesh(1, 1);
    let mut fresh = Generator::new(tiny_model(&fresh_mesh, 2), greedy_config(2, 4)).unwrap();
    let clean = fresh.generate(&short).unwrap();

    assert_eq!(completions(&second), completions(&clean));
    // The long prompts filled slot positions the short ones never reach.
    assert_eq!(kv_contents(&reused), kv_contents(&fresh));
}
