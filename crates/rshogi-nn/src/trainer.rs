//! 学習ループ
//!
//! 1ステップ（`i` は1始まり）の処理:
//!
//! 1. バックエンドで損失と勾配を計算
//! 2. オプティマイザの更新を適用し、スケジュール付き方針なら位置 `i` の学習率・モメンタムを設定
//! 3. バッチが入力を持てば、更新後の重みで BatchNorm の移動統計を更新
//! 4. `callback(i, loss)` を呼ぶ
//!
//! データが `n_steps` より先に尽きた場合はそこで正常終了する。
//! 数値エラーとコールバックのエラーはそのまま呼び出し元へ返す。

use crate::backend::Backend;
use crate::error::Result;
use crate::graph::{Mode, Tensor};
use crate::network::Network;
use crate::optim::{OptimizerPolicy, RunningOptimizerState};

/// 学習データの1バッチ
///
/// [`TrainingBatch::input`] が `Some` のバッチでは、各ステップの更新後に
/// その入力で [`Network::track_statistics`] を呼ぶ。
pub trait TrainingBatch {
    fn input(&self) -> Option<&Tensor> {
        None
    }
}

impl TrainingBatch for () {}

impl TrainingBatch for Tensor {
    fn input(&self) -> Option<&Tensor> {
        Some(self)
    }
}

/// (入力, 教師) の組
impl<T> TrainingBatch for (Tensor, T) {
    fn input(&self) -> Option<&Tensor> {
        Some(&self.0)
    }
}

/// 学習結果の要約
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrainReport {
    /// 実行したステップ数
    pub steps: usize,
    pub final_loss: Option<f32>,
    pub mean_loss: Option<f32>,
}

/// `policy` から新しいオプティマイザ状態を作って学習する
///
/// スケジュール付き方針で `n_steps == 0` は [`crate::NnError::InvalidConfiguration`]。
pub fn train<N, B, D, I, F, C>(
    network: &mut N,
    backend: &B,
    policy: &OptimizerPolicy,
    loss: F,
    data: I,
    n_steps: usize,
    callback: C,
) -> Result<TrainReport>
where
    N: Network,
    B: Backend,
    D: TrainingBatch,
    I: IntoIterator<Item = D>,
    F: FnMut(&N, &D) -> Result<f32>,
    C: FnMut(usize, f32) -> Result<()>,
{
    let state = policy.start(n_steps)?;
    log::info!("Optimizer: {policy}");
    let (report, _) = train_from(network, backend, state, loss, data, n_steps, callback)?;
    Ok(report)
}

/// 既存のオプティマイザ状態から学習を続け、更新後の状態も返す
///
/// モーメントと通算ステップ数は引き継がれる。コールバックの `i` はこの呼び出し内で1から数える。
pub fn train_from<N, B, D, I, F, C>(
    network: &mut N,
    backend: &B,
    state: RunningOptimizerState,
    loss: F,
    data: I,
    n_steps: usize,
    callback: C,
) -> Result<(TrainReport, RunningOptimizerState)>
where
    N: Network,
    B: Backend,
    D: TrainingBatch,
    I: IntoIterator<Item = D>,
    F: FnMut(&N, &D) -> Result<f32>,
    C: FnMut(usize, f32) -> Result<()>,
{
    let previous = network.mode();
    network.set_mode(Mode::Train);
    let result = run(network, backend, state, loss, data, n_steps, callback);
    network.set_mode(previous);
    result
}

fn run<N, B, D, I, F, C>(
    network: &mut N,
    backend: &B,
    mut state: RunningOptimizerState,
    mut loss: F,
    data: I,
    n_steps: usize,
    mut callback: C,
) -> Result<(TrainReport, RunningOptimizerState)>
where
    N: Network,
    B: Backend,
    D: TrainingBatch,
    I: IntoIterator<Item = D>,
    F: FnMut(&N, &D) -> Result<f32>,
    C: FnMut(usize, f32) -> Result<()>,
{
    let params = network.params()?;
    log::info!(
        "Training {n_steps} steps with {}: {} tensors, {} parameters",
        state.kind(),
        params.len(),
        network.num_parameters()?
    );

    let mut steps = 0usize;
    let mut total = 0.0f64;
    let mut last = None;

    for (i, batch) in (1..).zip(data.into_iter().take(n_steps)) {
        let (value, grads) = backend.value_and_grad(network, &params, &batch, &mut loss)?;
        state = state.step(network.graph_mut(), &grads)?;
        if let Some(x) = batch.input() {
            network.track_statistics(x)?;
        }

        let hyper = state.hyper();
        log::debug!(
            "step {i}: loss={value:.6}, next lr={:.3e}, momentum={:.4}, |g|={:.4e}",
            hyper.lr,
            hyper.momentum,
            grads.norm()
        );

        steps = i;
        total += value as f64;
        last = Some(value);
        callback(i, value)?;
    }

    if steps < n_steps {
        log::info!("Data exhausted after {steps} of {n_steps} steps");
    }

    let report = TrainReport {
        steps,
        final_loss: last,
        mean_loss: (steps > 0).then(|| (total / steps as f64) as f32),
    };
    match report.mean_loss {
        Some(mean) => log::info!(
            "Training finished: {steps} steps, mean loss {mean:.6}, final loss {:.6}",
            report.final_loss.unwrap_or(mean)
        ),
        None => log::info!("Training finished without any step"),
    }
    Ok((report, state))
}
