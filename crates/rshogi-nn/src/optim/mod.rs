//! オプティマイザ方針と実行状態
//!
//! [`OptimizerPolicy`] は不変の設定値で、振る舞いを持たない。
//! 学習呼び出しごとに [`OptimizerPolicy::start`] で新しい [`RunningOptimizerState`] を作り、
//! 各ステップでは状態を所有権ごと渡して更新後の状態を受け取る。
//!
//! スケジュール付き方針では、ステップ `i`（1始まり）の更新を適用した後に
//! スケジュール位置 `i` の学習率・モメンタムを設定する（最終位置で張り付く）。
//! 開始時点の状態は位置 0 の値を持つので、最初の更新は `lr_base` / `momentum_high` で行われ、
//! ステップ `n/2` の直後には `lr_high` / `momentum_low` が有効になる。

mod adam;
mod nesterov;

pub use adam::AdamState;
pub use nesterov::NesterovState;

use crate::backend::Gradients;
use crate::error::{NnError, Result};
use crate::graph::Graph;
use crate::schedule::CyclicSchedule;
use serde::{Deserialize, Serialize};
use std::fmt;

/// オプティマイザ方針
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerPolicy {
    /// 固定学習率の Adam
    FixedAdaptive { lr: f32 },
    /// 学習率 `lr_base → lr_high → lr_low`、
    /// モメンタム `momentum_high → momentum_low → momentum_high` の Nesterov
    CyclicMomentum {
        lr_base: f32,
        lr_high: f32,
        lr_low: f32,
        momentum_high: f32,
        momentum_low: f32,
    },
}

impl Default for OptimizerPolicy {
    fn default() -> Self {
        OptimizerPolicy::FixedAdaptive { lr: 1e-3 }
    }
}

impl fmt::Display for OptimizerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerPolicy::FixedAdaptive { lr } => write!(f, "adam(lr={lr})"),
            OptimizerPolicy::CyclicMomentum {
                lr_base,
                lr_high,
                lr_low,
                momentum_high,
                momentum_low,
            } => write!(
                f,
                "cyclic-nesterov(lr={lr_base}->{lr_high}->{lr_low}, \
                 momentum={momentum_high}->{momentum_low}->{momentum_high})"
            ),
        }
    }
}

fn check_rate(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(NnError::invalid(format!(
            "{name} must be finite and positive, got {value}"
        )))
    }
}

fn check_momentum(name: &str, value: f32) -> Result<()> {
    if (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(NnError::invalid(format!(
            "{name} must be in [0, 1), got {value}"
        )))
    }
}

impl OptimizerPolicy {
    /// 値の範囲を検証する
    pub fn validate(&self) -> Result<()> {
        match *self {
            OptimizerPolicy::FixedAdaptive { lr } => check_rate("lr", lr),
            OptimizerPolicy::CyclicMomentum {
                lr_base,
                lr_high,
                lr_low,
                momentum_high,
                momentum_low,
            } => {
                check_rate("lr_base", lr_base)?;
                check_rate("lr_high", lr_high)?;
                check_rate("lr_low", lr_low)?;
                check_momentum("momentum_high", momentum_high)?;
                check_momentum("momentum_low", momentum_low)
            }
        }
    }

    /// スケジュールに従う方針か
    pub fn is_scheduled(&self) -> bool {
        matches!(self, OptimizerPolicy::CyclicMomentum { .. })
    }

    /// `n_steps` ステップの学習用に新しい実行状態を作る
    ///
    /// スケジュール付き方針で `n_steps == 0` の場合は設定エラー。
    pub fn start(&self, n_steps: usize) -> Result<RunningOptimizerState> {
        self.validate()?;
        match *self {
            OptimizerPolicy::FixedAdaptive { lr } => {
                Ok(RunningOptimizerState::Adam(AdamState::new(lr)))
            }
            OptimizerPolicy::CyclicMomentum {
                lr_base,
                lr_high,
                lr_low,
                momentum_high,
                momentum_low,
            } => {
                if n_steps == 0 {
                    return Err(NnError::invalid(
                        "cyclic momentum policy requires at least one training step",
                    ));
                }
                let lr = CyclicSchedule::new(lr_base, lr_high, lr_low, n_steps)?;
                let momentum =
                    CyclicSchedule::new(momentum_high, momentum_low, momentum_high, n_steps)?;
                Ok(RunningOptimizerState::Nesterov {
                    inner: NesterovState::new(lr.get(0), momentum.get(0)),
                    lr,
                    momentum,
                })
            }
        }
    }
}

/// 現在有効な（次の更新で使われる）ハイパーパラメータ
///
/// Adam の `momentum` は β₁。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepHyper {
    pub lr: f32,
    pub momentum: f32,
}

/// オプティマイザの実行状態
///
/// 1回の学習呼び出しが排他的に所有する。
#[derive(Clone, Debug)]
pub enum RunningOptimizerState {
    Adam(AdamState),
    Nesterov {
        inner: NesterovState,
        lr: CyclicSchedule,
        momentum: CyclicSchedule,
    },
}

impl RunningOptimizerState {
    /// 適用済みステップ数
    pub fn steps_taken(&self) -> u64 {
        match self {
            RunningOptimizerState::Adam(s) => s.steps(),
            RunningOptimizerState::Nesterov { inner, .. } => inner.steps(),
        }
    }

    pub fn hyper(&self) -> StepHyper {
        match self {
            RunningOptimizerState::Adam(s) => StepHyper {
                lr: s.lr(),
                momentum: s.beta1(),
            },
            RunningOptimizerState::Nesterov { inner, .. } => StepHyper {
                lr: inner.lr(),
                momentum: inner.momentum(),
            },
        }
    }

    /// `completed` ステップ完了後に有効なハイパーパラメータ（スケジュール位置 `completed`）を設定する
    ///
    /// スケジュール長を超えた位置は最後の値に張り付く。
    pub fn prepare(self, completed: u64) -> Self {
        match self {
            RunningOptimizerState::Nesterov {
                inner,
                lr,
                momentum,
            } => {
                let pos = completed.min(usize::MAX as u64) as usize;
                let inner = inner.with_hyper(lr.get(pos), momentum.get(pos));
                RunningOptimizerState::Nesterov {
                    inner,
                    lr,
                    momentum,
                }
            }
            adam @ RunningOptimizerState::Adam(_) => adam,
        }
    }

    /// 勾配で1ステップ更新する
    pub fn apply(self, graph: &mut Graph, grads: &Gradients) -> Result<Self> {
        match self {
            RunningOptimizerState::Adam(s) => Ok(RunningOptimizerState::Adam(s.update(graph, grads)?)),
            RunningOptimizerState::Nesterov {
                inner,
                lr,
                momentum,
            } => Ok(RunningOptimizerState::Nesterov {
                inner: inner.update(graph, grads)?,
                lr,
                momentum,
            }),
        }
    }

    /// 現在のハイパーパラメータで更新し、次の位置のスケジュール値を設定する
    pub fn step(self, graph: &mut Graph, grads: &Gradients) -> Result<Self> {
        let next = self.apply(graph, grads)?;
        let completed = next.steps_taken();
        Ok(next.prepare(completed))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunningOptimizerState::Adam(_) => "adam",
            RunningOptimizerState::Nesterov { .. } => "nesterov",
        }
    }
}
