//! Nesterov モメンタム
//!
//! `v' = ρ·v − η·g`, `x' = x + ρ²·v − (1+ρ)·η·g`
//!
//! 学習率 η とモメンタム ρ はステップごとに外から書き換えられる。

use crate::backend::Gradients;
use crate::error::{NnError, Result};
use crate::graph::{Graph, ParamId, Tensor};
use ndarray::Zip;
use std::collections::HashMap;

/// Nesterov の実行状態
#[derive(Clone, Debug)]
pub struct NesterovState {
    lr: f32,
    momentum: f32,
    steps: u64,
    velocity: HashMap<ParamId, Tensor>,
}

impl NesterovState {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            steps: 0,
            velocity: HashMap::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// 学習率とモメンタムを書き換えた状態を返す
    pub fn with_hyper(self, lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            ..self
        }
    }

    /// 1ステップ分の更新を適用し、更新後の状態を返す
    pub fn update(mut self, graph: &mut Graph, grads: &Gradients) -> Result<Self> {
        let (lr, rho) = (self.lr, self.momentum);
        for (id, g) in grads.iter() {
            let x = graph.param_mut(id)?;
            if x.shape() != g.shape() {
                return Err(NnError::ShapeMismatch {
                    context: "nesterov gradient",
                    expected: x.shape().to_vec(),
                    actual: g.shape().to_vec(),
                });
            }
            let v = self
                .velocity
                .entry(id)
                .or_insert_with(|| Tensor::zeros(x.raw_dim()));
            Zip::from(x).and(v).and(g).for_each(|x, v, &g| {
                let d = rho * rho * *v - (1.0 + rho) * lr * g;
                *v = rho * *v - lr * g;
                *x += d;
            });
        }
        self.steps += 1;
        Ok(self)
    }
}
