//! Adam（固定学習率の適応的モーメント推定）

use crate::backend::Gradients;
use crate::error::{NnError, Result};
use crate::graph::{Graph, ParamId, Tensor};
use ndarray::Zip;
use std::collections::HashMap;

#[derive(Clone, Debug)]
struct Moments {
    m: Tensor,
    v: Tensor,
}

/// Adam の実行状態
///
/// パラメータごとの1次・2次モーメントは初回の勾配到着時にゼロで確保する。
#[derive(Clone, Debug)]
pub struct AdamState {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    /// 適用済みステップ数（バイアス補正に使う）
    t: u64,
    moments: HashMap<ParamId, Moments>,
}

impl AdamState {
    pub const DEFAULT_BETA1: f32 = 0.9;
    pub const DEFAULT_BETA2: f32 = 0.999;
    pub const DEFAULT_EPSILON: f32 = 1e-8;

    pub fn new(lr: f32) -> Self {
        Self::with_betas(lr, Self::DEFAULT_BETA1, Self::DEFAULT_BETA2, Self::DEFAULT_EPSILON)
    }

    pub fn with_betas(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            t: 0,
            moments: HashMap::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn beta1(&self) -> f32 {
        self.beta1
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    /// 1ステップ分の更新を適用し、更新後の状態を返す
    pub fn update(mut self, graph: &mut Graph, grads: &Gradients) -> Result<Self> {
        self.t += 1;
        let t = self.t.min(i32::MAX as u64) as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);
        let (lr, beta1, beta2, eps) = (self.lr, self.beta1, self.beta2, self.epsilon);

        for (id, g) in grads.iter() {
            let x = graph.param_mut(id)?;
            if x.shape() != g.shape() {
                return Err(NnError::ShapeMismatch {
                    context: "adam gradient",
                    expected: x.shape().to_vec(),
                    actual: g.shape().to_vec(),
                });
            }
            let mo = self.moments.entry(id).or_insert_with(|| Moments {
                m: Tensor::zeros(x.raw_dim()),
                v: Tensor::zeros(x.raw_dim()),
            });
            Zip::from(x)
                .and(&mut mo.m)
                .and(&mut mo.v)
                .and(g)
                .for_each(|x, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *x -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(self)
    }
}
