use ndarray::IxDyn;
use rand::rngs::StdRng;
use rand::SeedableRng;

use revstack::layers::{CumulativeMemory, FeedForward, Linear, Transform, Zero, STATES_ARG};
use revstack::learning::{finite_difference_input_grad, random_direction, vjp_consistency};
use revstack::routing::RouteMode;
use revstack::runtime::pipeline::{ChunkedRunner, EngineConfig};
use revstack::tensor::{max_abs_diff, randn};
use revstack::{
    route, ArgBundle, ArgValue, EngineError, ExecuteType, Recombine, ReversibleSequence, RouteSpec,
    RouteTarget, StackedState, StateMap, StoredExecutor, Tensor, Traversal,
};

type Pair = (Box<dyn Transform>, Box<dyn Transform>);

fn pair(f: impl Transform + 'static, g: impl Transform + 'static) -> Pair {
    (Box::new(f), Box::new(g))
}

fn dense(n: usize, d: usize, dropout: f32) -> ReversibleSequence {
    let pairs = (0..n as u64)
        .map(|i| pair(Linear::new(d, d, dropout, i), FeedForward::new(d, 2 * d, dropout, 100 + i)))
        .collect();
    ReversibleSequence::from_pairs(pairs, RouteSpec::new())
}

#[test]
fn zero_stack_is_identity_with_gradient_passthrough() {
    let seq = ReversibleSequence::from_pairs(vec![pair(Zero, Zero), pair(Zero, Zero)], RouteSpec::new());
    let mut rng = StdRng::seed_from_u64(0);
    let x = randn(&[1, 4, 8], 1.0, &mut rng);
    let (out, trace) = seq.run_forward(&x, &ArgBundle::new(), &mut rng).unwrap();
    assert_eq!(out.output, x);

    let dy = randn(&[1, 4, 8], 1.0, &mut rng);
    let back = seq.run_backward(trace, &dy).unwrap();
    assert_eq!(back.grad_input, dy);
    assert_eq!(back.reconstructed_input, x);
}

#[test]
fn input_gradient_matches_finite_differences() {
    let seq = dense(2, 2, 0.0);
    let mut rng = StdRng::seed_from_u64(1);
    let x = randn(&[1, 2, 2], 0.5, &mut rng);
    let probe = randn(&[1, 2, 2], 1.0, &mut rng);

    let (_, trace) = seq.run_forward(&x, &ArgBundle::new(), &mut rng).unwrap();
    let analytic = seq.run_backward(trace, &probe).unwrap().grad_input;

    let numeric = finite_difference_input_grad(
        |t| Ok(seq.run_forward(t, &ArgBundle::new(), &mut StdRng::seed_from_u64(0))?.0.output),
        &x,
        &probe,
        1e-2,
    )
    .unwrap();
    assert!(max_abs_diff(&analytic, &numeric) < 1e-2, "{:?} vs {:?}", analytic, numeric);
}

#[test]
fn parameter_gradient_matches_finite_differences() {
    let d = 2;
    let build = |w: ndarray::Array2<f32>| {
        let f = Linear::from_weights(w, ndarray::Array1::zeros(d));
        ReversibleSequence::from_pairs(
            vec![pair(f, FeedForward::new(d, 3, 0.0, 7))],
            RouteSpec::new(),
        )
    };
    let w = ndarray::arr2(&[[0.3, -0.2], [0.5, 0.1]]);
    let mut rng = StdRng::seed_from_u64(5);
    let x = randn(&[1, 3, d], 1.0, &mut rng);
    let probe = randn(&[1, 3, d], 1.0, &mut rng);

    let seq = build(w.clone());
    let (_, trace) = seq.run_forward(&x, &ArgBundle::new(), &mut rng).unwrap();
    let grads = seq.run_backward(trace, &probe).unwrap().param_grads;
    let analytic = grads.get("blocks.0.f.weight").unwrap()[[0, 1]];

    let eps = 1e-2;
    let loss = |w: ndarray::Array2<f32>| -> f32 {
        let seq = build(w);
        let out = seq.infer(&x, &ArgBundle::new(), &mut StdRng::seed_from_u64(0)).unwrap();
        (&out.output * &probe).sum()
    };
    let mut plus = w.clone();
    plus[[0, 1]] += eps;
    let mut minus = w.clone();
    minus[[0, 1]] -= eps;
    let numeric = (loss(plus) - loss(minus)) / (2.0 * eps);
    assert!((analytic - numeric).abs() < 1e-2, "{} vs {}", analytic, numeric);
}

#[test]
fn dropout_gradients_check_along_a_direction() {
    let seq = dense(3, 4, 0.3);
    let mut rng = StdRng::seed_from_u64(9);
    let x = randn(&[2, 3, 4], 1.0, &mut rng);
    let probe = randn(&[2, 3, 4], 1.0, &mut rng);
    let v = random_direction(&[2, 3, 4], &mut rng);

    let seed = 1234;
    let (_, trace) = seq
        .run_forward(&x, &ArgBundle::new(), &mut StdRng::seed_from_u64(seed))
        .unwrap();
    let grad = seq.run_backward(trace, &probe).unwrap().grad_input;

    let check = vjp_consistency(
        |t| Ok(seq.run_forward(t, &ArgBundle::new(), &mut StdRng::seed_from_u64(seed))?.0.output),
        &x,
        &probe,
        &grad,
        &v,
        1e-2,
    )
    .unwrap();
    assert!(check.rel_error() < 1e-2, "{:?}", check);
}

#[test]
fn repeated_calls_with_same_seed_give_identical_gradients() {
    let seq = dense(3, 4, 0.5);
    let mut rng = StdRng::seed_from_u64(2);
    let x = randn(&[1, 5, 4], 1.0, &mut rng);
    let dy = randn(&[1, 5, 4], 1.0, &mut rng);

    let run = || {
        let (_, trace) = seq
            .run_forward(&x, &ArgBundle::new(), &mut StdRng::seed_from_u64(77))
            .unwrap();
        seq.run_backward(trace, &dy).unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.grad_input, b.grad_input);
    assert_eq!(a.param_grads, b.param_grads);
}

#[test]
fn reversible_trace_holds_one_activation_for_any_depth() {
    let mut rng = StdRng::seed_from_u64(0);
    let x = randn(&[1, 2, 4], 1.0, &mut rng);
    // Duplicated activation: [1, 2, 8].
    let width = 2 * x.len();
    for n in [1, 4, 16] {
        let seq = dense(n, 4, 0.0);
        let (_, rev) = seq.forward_traversal(&x, &ArgBundle::new(), &mut rng).unwrap();
        assert_eq!(ReversibleSequence::retained_activations(&rev), 1);
        assert_eq!(rev.retained_elements(), width);

        let stored = StoredExecutor::new(&seq);
        let (_, st) = stored.forward_traversal(&x, &ArgBundle::new(), &mut rng).unwrap();
        assert_eq!(StoredExecutor::retained_activations(&st), n + 1);
        assert_eq!(st.retained_elements(), (n + 1) * width);
    }
}

#[test]
fn reversible_and_stored_gradients_agree() {
    let seq = dense(4, 4, 0.2).with_recombine(Recombine::Sum);
    let mut rng = StdRng::seed_from_u64(3);
    let x = randn(&[2, 3, 4], 1.0, &mut rng);
    let dy = randn(&[2, 3, 4], 1.0, &mut rng);

    let (_, rev_trace) = seq.run_forward(&x, &ArgBundle::new(), &mut StdRng::seed_from_u64(5)).unwrap();
    let rev = seq.run_backward(rev_trace, &dy).unwrap();

    let stored = StoredExecutor::new(&seq);
    let (_, st_trace) = stored.run_forward(&x, &ArgBundle::new(), &mut StdRng::seed_from_u64(5)).unwrap();
    let st = stored.run_backward(st_trace, &dy).unwrap();

    assert!(max_abs_diff(&rev.grad_input, &st.grad_input) < 1e-4);
    assert_eq!(rev.param_grads.len(), st.param_grads.len());
}

#[test]
fn routing_shared_and_per_layer() {
    let spec = RouteSpec::new()
        .shared("causal", RouteTarget::BOTH)
        .per_layer("scale", RouteTarget::F);

    let per_layer: Vec<ArgValue> = (0..4).map(|i| ArgValue::Scalar(i as f32)).collect();
    let kwargs = ArgBundle::new()
        .with("causal", true)
        .with("scale", ArgValue::PerLayer(per_layer));
    let layers = route(&kwargs, &spec, 4).unwrap();
    assert_eq!(layers.len(), 4);
    for (i, l) in layers.iter().enumerate() {
        assert_eq!(l.f.flag("causal"), Some(true));
        assert_eq!(l.g.flag("causal"), Some(true));
        assert_eq!(l.f.scalar("scale"), Some(i as f32));
        assert_eq!(l.g.scalar("scale"), None);
    }

    let three: Vec<ArgValue> = (0..3).map(|i| ArgValue::Scalar(i as f32)).collect();
    let short = ArgBundle::new().with("scale", ArgValue::PerLayer(three));
    assert!(matches!(
        route(&short, &spec, 4),
        Err(EngineError::RouteSpecMismatch { .. })
    ));

    let unknown = ArgBundle::new().with("temperature", 0.5f32);
    assert!(matches!(
        route(&unknown, &spec, 4),
        Err(EngineError::RouteSpecMismatch { .. })
    ));
    assert_eq!(spec.get("scale").unwrap().mode, RouteMode::PerLayer);
}

#[test]
fn state_from_one_layer_stacks_and_slices_back() {
    let z = Tensor::from_shape_vec(IxDyn(&[2]), vec![3.0, 4.0]).unwrap();
    let per_layer = vec![
        StateMap::new(),
        StateMap::from([("Z".to_string(), z.clone())]),
        StateMap::new(),
    ];
    let stacked = StackedState::stack(&per_layer).unwrap();
    assert_eq!(stacked.field("Z").unwrap().shape(), &[2, 3]);
    assert_eq!(stacked.slice_layer(1).unwrap()["Z"], z);
    assert!(stacked.slice_layer(0).unwrap()["Z"].iter().all(|&v| v == 0.0));
    assert!(stacked.slice_layer(2).unwrap()["Z"].iter().all(|&v| v == 0.0));
}

#[test]
fn chunked_inference_matches_whole_sequence_for_memory_stack() {
    // Memory F and zero G: every layer is causal, so chunking is exact.
    let pairs = (0..3u64).map(|i| pair(CumulativeMemory::new(4, i), Zero)).collect();
    let seq = ReversibleSequence::from_pairs(pairs, RouteSpec::new().layer_slice(STATES_ARG, RouteTarget::F));
    let mut rng = StdRng::seed_from_u64(4);
    let x = randn(&[2, 8, 4], 1.0, &mut rng);

    let whole = seq.infer(&x, &ArgBundle::new(), &mut rng).unwrap();
    let mut runner = ChunkedRunner::new(&seq);
    let chunked = runner.run(&x, 4, &mut rng).unwrap();
    assert!(max_abs_diff(&whole.output, &chunked) < 1e-4);
    assert!(max_abs_diff(whole.state.field("S").unwrap(), runner.state().unwrap().field("S").unwrap()) < 1e-4);
}

#[test]
fn backward_with_prior_chunk_state_reconstructs_and_matches_gradients() {
    let pairs = (0..2u64)
        .map(|i| pair(CumulativeMemory::new(2, i), FeedForward::new(2, 4, 0.0, 10 + i)))
        .collect();
    let seq = ReversibleSequence::from_pairs(pairs, RouteSpec::new().layer_slice(STATES_ARG, RouteTarget::F));
    let mut rng = StdRng::seed_from_u64(12);
    let earlier = randn(&[1, 3, 2], 1.0, &mut rng);
    let prior = seq.infer(&earlier, &ArgBundle::new(), &mut rng).unwrap().state;
    assert_eq!(prior.field("S").unwrap().shape(), &[1, 2, 2]);

    let kwargs = ArgBundle::new().with(STATES_ARG, prior);
    let x = randn(&[1, 2, 2], 0.5, &mut rng);
    let dy = randn(&[1, 2, 2], 1.0, &mut rng);

    let (out, trace) = seq.run_forward(&x, &kwargs, &mut StdRng::seed_from_u64(0)).unwrap();
    let without_prior = seq.infer(&x, &ArgBundle::new(), &mut StdRng::seed_from_u64(0)).unwrap();
    assert!(max_abs_diff(&out.output, &without_prior.output) > 1e-6);

    let back = seq.run_backward(trace, &dy).unwrap();
    assert!(max_abs_diff(&back.reconstructed_input, &x) < 1e-4);

    let numeric = finite_difference_input_grad(
        |t| Ok(seq.run_forward(t, &kwargs, &mut StdRng::seed_from_u64(0))?.0.output),
        &x,
        &dy,
        1e-2,
    )
    .unwrap();
    assert!(max_abs_diff(&back.grad_input, &numeric) < 1e-2, "{:?} vs {:?}", back.grad_input, numeric);

    let stored = StoredExecutor::new(&seq);
    let (st_out, st_trace) = stored.run_forward(&x, &kwargs, &mut StdRng::seed_from_u64(0)).unwrap();
    assert!(max_abs_diff(&st_out.output, &out.output) < 1e-5);
    let st = stored.run_backward(st_trace, &dy).unwrap();
    assert!(max_abs_diff(&st.grad_input, &back.grad_input) < 1e-4);
}

#[test]
fn stacked_state_survives_a_file_round_trip() {
    let seq = EngineConfig {
        d_model: 4,
        n_layers: 2,
        hidden: 4,
        dropout: 0.0,
        ..Default::default()
    }
    .build_demo_sequence()
    .unwrap();
    let mut rng = StdRng::seed_from_u64(6);
    let x = randn(&[1, 3, 4], 1.0, &mut rng);
    let out = seq.infer(&x, &ArgBundle::new(), &mut rng).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunk.state");
    out.state.save(&path).unwrap();
    assert_eq!(StackedState::load(&path).unwrap(), out.state);

    let bytes = seq.route_spec().to_bytes().unwrap();
    assert_eq!(&RouteSpec::from_bytes(&bytes).unwrap(), seq.route_spec());
}

#[test]
fn parallel_forward_matches_sequential() {
    let seq = dense(2, 4, 0.4);
    let mut rng = StdRng::seed_from_u64(8);
    let inputs: Vec<Tensor> = (0..6).map(|_| randn(&[1, 2, 4], 1.0, &mut rng)).collect();
    let results = seq.forward_many(&inputs, &ArgBundle::new(), 50).unwrap();
    assert_eq!(results.len(), 6);
    for (i, (x, (out, trace))) in inputs.iter().zip(results).enumerate() {
        let (expected, _) = seq
            .run_forward(x, &ArgBundle::new(), &mut StdRng::seed_from_u64(50 + i as u64))
            .unwrap();
        assert_eq!(out, expected);
        let back = seq.run_backward(trace, &Tensor::ones(x.raw_dim())).unwrap();
        assert!(max_abs_diff(&back.reconstructed_input, x) < 1e-4);
    }
}

#[test]
fn odd_width_and_default_config() {
    let seq = dense(1, 3, 0.0);
    let x = Tensor::ones(IxDyn(&[1, 1, 3]));
    // Duplicated width 6 splits fine; F sees width 3.
    assert!(seq.infer(&x, &ArgBundle::new(), &mut StdRng::seed_from_u64(0)).is_ok());

    let config = EngineConfig::default();
    assert_eq!(config.execute_type, ExecuteType::Reversible);
    assert!(config.build_demo_sequence().is_ok());
}
