//! 微分バックエンド
//!
//! 学習ループが要求するのは「損失値とパラメータごとの勾配」を返す能力だけ。
//! [`FiniteDifference`] は中心差分による参照実装で、小規模ネットワークの学習と
//! テストに使う。

use crate::error::{NnError, Result};
use crate::graph::{ParamId, Tensor};
use crate::network::Network;
use std::collections::BTreeMap;

/// パラメータごとの勾配
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    grads: BTreeMap<ParamId, Tensor>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ParamId, grad: Tensor) {
        self.grads.insert(id, grad);
    }

    pub fn get(&self, id: ParamId) -> Option<&Tensor> {
        self.grads.get(&id)
    }

    /// ParamId 昇順で走査
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Tensor)> + '_ {
        self.grads.iter().map(|(&id, g)| (id, g))
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// 全勾配の L2 ノルム
    pub fn norm(&self) -> f32 {
        self.grads
            .values()
            .flat_map(|g| g.iter())
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt()
    }
}

/// 損失と勾配を計算する能力
pub trait Backend {
    /// `params` に関する `loss(network, batch)` の値と勾配
    ///
    /// 戻る時点でネットワークのパラメータは呼び出し前と同じ値でなければならない。
    /// 損失・勾配が有限でなければ [`NnError::NumericalFailure`]。
    fn value_and_grad<N, D, F>(
        &self,
        network: &mut N,
        params: &[ParamId],
        batch: &D,
        loss: &mut F,
    ) -> Result<(f32, Gradients)>
    where
        N: Network,
        F: FnMut(&N, &D) -> Result<f32>;
}

/// 中心差分 `(L(w+ε) - L(w-ε)) / 2ε` による勾配
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FiniteDifference {
    epsilon: f32,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self { epsilon: 1e-3 }
    }
}

impl FiniteDifference {
    pub fn new(epsilon: f32) -> Result<Self> {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(NnError::invalid(format!(
                "finite difference epsilon must be finite and positive, got {epsilon}"
            )));
        }
        Ok(Self { epsilon })
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }
}

fn checked_loss(value: f32, context: &str) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(NnError::numerical(format!("loss is {value} ({context})")))
    }
}

impl Backend for FiniteDifference {
    fn value_and_grad<N, D, F>(
        &self,
        network: &mut N,
        params: &[ParamId],
        batch: &D,
        loss: &mut F,
    ) -> Result<(f32, Gradients)>
    where
        N: Network,
        F: FnMut(&N, &D) -> Result<f32>,
    {
        let value = checked_loss(loss(&*network, batch)?, "forward")?;
        let eps = self.epsilon;
        let mut grads = Gradients::new();

        for &id in params {
            {
                let p = network.graph_mut().param_mut(id)?;
                if !p.is_standard_layout() {
                    *p = p.as_standard_layout().into_owned();
                }
            }
            let len = network.graph().param(id)?.len();
            let mut grad = vec![0.0f32; len];

            for (i, slot) in grad.iter_mut().enumerate() {
                let original = scalar(network, id, i)?;

                set_scalar(network, id, i, original + eps)?;
                let plus = loss(&*network, batch);
                set_scalar(network, id, i, original - eps)?;
                let minus = loss(&*network, batch);
                set_scalar(network, id, i, original)?;

                let plus = checked_loss(plus?, "perturbed forward")?;
                let minus = checked_loss(minus?, "perturbed forward")?;
                let g = (plus - minus) / (2.0 * eps);
                if !g.is_finite() {
                    return Err(NnError::numerical(format!(
                        "gradient of {id:?}[{i}] is {g}"
                    )));
                }
                *slot = g;
            }

            let shape = network.graph().param(id)?.raw_dim();
            grads.insert(id, Tensor::from_shape_vec(shape, grad)?);
        }

        Ok((value, grads))
    }
}

fn scalar<N: Network>(network: &N, id: ParamId, i: usize) -> Result<f32> {
    network
        .graph()
        .param(id)?
        .as_slice()
        .and_then(|s| s.get(i).copied())
        .ok_or(NnError::UnknownParam(id))
}

fn set_scalar<N: Network>(network: &mut N, id: ParamId, i: usize, value: f32) -> Result<()> {
    let slot = network
        .graph_mut()
        .param_mut(id)?
        .as_slice_mut()
        .and_then(|s| s.get_mut(i))
        .ok_or(NnError::UnknownParam(id))?;
    *slot = value;
    Ok(())
}
