//! 学習ループの結合テスト

use ndarray::{Axis, IxDyn, array};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rshogi_nn::{
    Activation, ChainNetwork, FiniteDifference, Graph, Mode, Network, NnError, NodeId, NodeKind,
    OptimizerPolicy, RegularizationRules, Result, Tensor, train, train_from,
};

fn cyclic() -> OptimizerPolicy {
    OptimizerPolicy::CyclicMomentum {
        lr_base: 1e-3,
        lr_high: 1e-2,
        lr_low: 1e-4,
        momentum_high: 0.95,
        momentum_low: 0.85,
    }
}

fn regression_net(seed: u64) -> ChainNetwork<&'static str> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut g = Graph::new();
    let d1 = g.dense(&mut rng, 3, 6, true);
    let act = g.activation(Activation::Tanh);
    let d2 = g.dense(&mut rng, 6, 1, true);
    let root = g.chain(vec![d1, act, d2]).unwrap();
    ChainNetwork::new("regression", g, root).unwrap()
}

/// y = x0 - 0.5 x1 + 0.25 x2
fn target_batch() -> (Tensor, Tensor) {
    let x = array![
        [0.5f32, -0.2, 0.1],
        [-0.3, 0.8, 0.4],
        [0.9, 0.1, -0.7],
        [-0.6, -0.5, 0.2]
    ]
    .into_dyn();
    let y = Tensor::from_shape_fn(IxDyn(&[4, 1]), |d| {
        x[[d[0], 0]] - 0.5 * x[[d[0], 1]] + 0.25 * x[[d[0], 2]]
    });
    (x, y)
}

fn mse(net: &ChainNetwork<&'static str>, batch: &(Tensor, Tensor)) -> Result<f32> {
    let y = net.forward(&batch.0)?;
    Ok((&y - &batch.1).mapv(|e| e * e).mean().unwrap_or(0.0))
}

#[test]
fn test_callback_once_per_batch_from_one() {
    let mut net = regression_net(1);
    let data = vec![target_batch(); 4];
    let mut indices = Vec::new();
    let report = net
        .train(
            &FiniteDifference::default(),
            &OptimizerPolicy::default(),
            mse,
            data,
            100,
            |i, _| {
                indices.push(i);
                Ok(())
            },
        )
        .unwrap();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    assert_eq!(report.steps, 4);
    assert!(report.final_loss.is_some());
}

#[test]
fn test_adam_reduces_loss() {
    let mut net = regression_net(2);
    let before = mse(&net, &target_batch()).unwrap();
    let report = net
        .train(
            &FiniteDifference::default(),
            &OptimizerPolicy::FixedAdaptive { lr: 0.05 },
            mse,
            std::iter::repeat_with(target_batch),
            150,
            |_, _| Ok(()),
        )
        .unwrap();
    assert_eq!(report.steps, 150);
    let after = mse(&net, &target_batch()).unwrap();
    assert!(after < before * 0.5, "before={before} after={after}");
}

#[test]
fn test_cyclic_policy_reduces_loss() {
    let mut net = regression_net(3);
    let before = mse(&net, &target_batch()).unwrap();
    let policy = OptimizerPolicy::CyclicMomentum {
        lr_base: 0.01,
        lr_high: 0.05,
        lr_low: 0.001,
        momentum_high: 0.9,
        momentum_low: 0.8,
    };
    net.train(
        &FiniteDifference::default(),
        &policy,
        mse,
        std::iter::repeat_with(target_batch),
        120,
        |_, _| Ok(()),
    )
    .unwrap();
    let after = mse(&net, &target_batch()).unwrap();
    assert!(after < before, "before={before} after={after}");
}

#[test]
fn test_cyclic_zero_steps_fails_before_any_step() {
    let mut net = regression_net(4);
    let snapshot = net.copy();
    let mut calls = 0;
    let err = net
        .train(
            &FiniteDifference::default(),
            &cyclic(),
            mse,
            vec![target_batch()],
            0,
            |_, _| {
                calls += 1;
                Ok(())
            },
        )
        .unwrap_err();
    assert!(matches!(err, NnError::InvalidConfiguration(_)));
    assert_eq!(calls, 0);
    let p = net.params().unwrap()[0];
    assert_eq!(net.graph().param(p).unwrap(), snapshot.graph().param(p).unwrap());
}

#[test]
fn test_numerical_failure_propagates() {
    let mut net = regression_net(5);
    let mut calls = 0;
    let mut loss_calls = 0;
    let err = net
        .train(
            &FiniteDifference::default(),
            &OptimizerPolicy::default(),
            |n: &ChainNetwork<&'static str>, b: &(Tensor, Tensor)| {
                loss_calls += 1;
                let l = mse(n, b)?;
                Ok(if loss_calls > 1 { f32::INFINITY } else { l })
            },
            std::iter::repeat_with(target_batch),
            10,
            |_, _| {
                calls += 1;
                Ok(())
            },
        )
        .unwrap_err();
    assert!(matches!(err, NnError::NumericalFailure { .. }));
    assert_eq!(calls, 0);
    // 失敗後もモードは元に戻る
    assert_eq!(net.mode(), Mode::Eval);
}

#[test]
fn test_schedule_position_follows_each_update() {
    // 1ステップずつ継続し、更新に使われた値と更新後に有効な値を記録する
    let n = 10;
    let mut g = Graph::new();
    let w = g.add_param(array![[0.0f32]].into_dyn());
    let d = g
        .add_node(NodeKind::Dense { weight: w, bias: None }, vec![])
        .unwrap();
    let mut net = ChainNetwork::new((), g, d).unwrap();
    let backend = FiniteDifference::default();
    let one = array![[1.0f32]].into_dyn();

    let mut state = cyclic().start(n).unwrap();
    let mut used = Vec::new();
    let mut after = Vec::new();
    for _ in 0..n {
        used.push(state.hyper());
        let (report, next) = train_from(
            &mut net,
            &backend,
            state,
            |n: &ChainNetwork<()>, x: &Tensor| Ok(n.forward(x)?.sum()),
            std::iter::once(one.clone()),
            1,
            |_, _| Ok(()),
        )
        .unwrap();
        assert_eq!(report.steps, 1);
        after.push(next.hyper());
        state = next;
    }
    assert_eq!(state.steps_taken(), n as u64);

    // 最初の更新は lr_base, momentum_high
    assert!((used[0].lr - 1e-3).abs() < 1e-9);
    assert!((used[0].momentum - 0.95).abs() < 1e-6);
    // ステップ n/2 の時点で lr_high, momentum_low
    assert!((after[n / 2 - 1].lr - 1e-2).abs() < 1e-8);
    assert!((after[n / 2 - 1].momentum - 0.85).abs() < 1e-6);
    // 最後の更新は lr_low, momentum_high で、以降も張り付く
    assert!((used[n - 1].lr - 1e-4).abs() < 1e-9);
    assert!((used[n - 1].momentum - 0.95).abs() < 1e-6);
    assert_eq!(after[n - 1], used[n - 1]);
}

#[test]
fn test_peak_in_effect_at_half_of_run() {
    let n = 8;
    let mut net = regression_net(8);
    let mut seen = Vec::new();
    let (report, state) = train_from(
        &mut net,
        &FiniteDifference::default(),
        cyclic().start(n).unwrap(),
        mse,
        std::iter::repeat_with(target_batch),
        n / 2,
        |i, _| {
            seen.push(i);
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(report.steps, n / 2);
    assert_eq!(seen.last(), Some(&(n / 2)));
    let h = state.hyper();
    assert!((h.lr - 1e-2).abs() < 1e-8, "lr = {}", h.lr);
    assert!((h.momentum - 0.85).abs() < 1e-6, "momentum = {}", h.momentum);
}

#[test]
fn test_first_update_uses_base_rate() {
    // v = 0 から勾配 1 で1ステップ: Δw = -(1 + ρ) η = -(1.95)(1e-3)
    let mut g = Graph::new();
    let w = g.add_param(array![[0.0f32]].into_dyn());
    let d = g
        .add_node(NodeKind::Dense { weight: w, bias: None }, vec![])
        .unwrap();
    let mut net = ChainNetwork::new((), g, d).unwrap();
    let one = array![[1.0f32]].into_dyn();

    let report = net
        .train(
            &FiniteDifference::default(),
            &cyclic(),
            |n: &ChainNetwork<()>, x: &Tensor| Ok(n.forward(x)?.sum()),
            vec![one],
            5,
            |_, _| Ok(()),
        )
        .unwrap();
    assert_eq!(report.steps, 1);
    let value = net.graph().param(w).unwrap()[[0, 0]];
    assert!((value + 1.95e-3).abs() < 1e-5, "w = {value}");
}

#[test]
fn test_continuation_resumes_schedule() {
    let n = 6;
    let mut net = regression_net(6);
    let backend = FiniteDifference::default();
    let state = cyclic().start(n).unwrap();
    let (first, state) = train_from(
        &mut net,
        &backend,
        state,
        mse,
        std::iter::repeat_with(target_batch),
        3,
        |_, _| Ok(()),
    )
    .unwrap();
    assert_eq!(first.steps, 3);
    let (second, state) = train_from(
        &mut net,
        &backend,
        state,
        mse,
        std::iter::repeat_with(target_batch),
        3,
        |_, _| Ok(()),
    )
    .unwrap();
    assert_eq!(second.steps, 3);
    assert_eq!(state.steps_taken(), 6);
    assert!((state.hyper().lr - 1e-4).abs() < 1e-9);
}

#[test]
fn test_weight_decay_through_regularized_params() {
    let mut net = regression_net(7);
    let rules = RegularizationRules::default();
    let regs = net.regularized_params(&rules).unwrap();
    let start = regs.sum_of_squares(net.graph()).unwrap();
    // 正則化項のみを最小化すると重みが縮む
    let loss = |n: &ChainNetwork<&'static str>, _: &()| regs.sum_of_squares(n.graph());
    train(
        &mut net,
        &FiniteDifference::default(),
        &OptimizerPolicy::FixedAdaptive { lr: 0.01 },
        loss,
        std::iter::repeat_n((), 20),
        20,
        |_, _| Ok(()),
    )
    .unwrap();
    assert!(regs.sum_of_squares(net.graph()).unwrap() < start);
}

/// 固定の全結合 (2→2) の後に BatchNorm。戻り値は (ネットワーク, 全結合, BatchNorm)
fn normalized_net() -> (ChainNetwork<&'static str>, NodeId, NodeId) {
    let mut g = Graph::new();
    let w = g.add_param(array![[1.0f32, 0.5], [-0.5, 1.0]].into_dyn());
    let b = g.add_param(array![0.5f32, -1.0].into_dyn());
    let d = g
        .add_node(NodeKind::Dense { weight: w, bias: Some(b) }, vec![])
        .unwrap();
    let bn = g.batch_norm(2);
    let root = g.chain(vec![d, bn]).unwrap();
    (ChainNetwork::new("normalized", g, root).unwrap(), d, bn)
}

/// 平均が 0 から大きくずれた入力
fn offset_batch() -> (Tensor, Tensor) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
    let x = Tensor::from_shape_fn(IxDyn(&[32, 2]), |_| 3.0 + rng.random_range(-2.0f32..2.0));
    let y = Tensor::zeros(IxDyn(&[32, 2]));
    (x, y)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b).iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

#[test]
fn test_training_maintains_batch_norm_statistics() {
    let (mut net, dense, bn) = normalized_net();
    let batch = offset_batch();
    let train_mode_output = |n: &ChainNetwork<&'static str>| {
        let mut copy = n.copy();
        copy.set_mode(Mode::Train);
        copy.forward(&batch.0).unwrap()
    };

    // 学習前は移動統計が初期値 (0, 1) のため推論出力と学習モード出力が大きく異なる
    let gap_before = max_abs_diff(&net.forward(&batch.0).unwrap(), &train_mode_output(&net));
    assert!(gap_before > 1.0, "gap before = {gap_before}");

    net.train(
        &FiniteDifference::default(),
        &OptimizerPolicy::FixedAdaptive { lr: 5e-4 },
        mse,
        std::iter::repeat_n(batch.clone(), 100),
        100,
        |_, _| Ok(()),
    )
    .unwrap();
    assert_eq!(net.mode(), Mode::Eval);

    // 移動平均は全結合出力のバッチ平均に追従している
    let NodeKind::BatchNorm { mean, .. } = net.graph().node(bn).unwrap().kind().clone() else {
        panic!("expected batch norm");
    };
    let hidden = net.graph().forward(dense, &batch.0).unwrap();
    let batch_mean = hidden.mean_axis(Axis(0)).unwrap();
    let running_mean = net.graph().param(mean).unwrap();
    assert!(
        max_abs_diff(running_mean, &batch_mean) < 0.1,
        "running = {running_mean}, batch = {batch_mean}"
    );

    // 推論出力は学習モード出力に一致する（移動分散の不偏補正分の差のみ）
    let gap_after = max_abs_diff(&net.forward(&batch.0).unwrap(), &train_mode_output(&net));
    assert!(gap_after < 0.1, "gap after = {gap_after}");
}
