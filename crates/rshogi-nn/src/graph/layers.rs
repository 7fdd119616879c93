//! ノード種別ごとの順伝播
//!
//! - `Dense`: `x · Wᵀ + b`（入力 `[batch, in]`）
//! - `Conv`: stride 1 / same padding の2次元畳み込み（入力 `[N, C, H, W]`）
//! - `BatchNorm`: axis 1 で正規化。学習モードはバッチ統計、推論モードは移動統計。
//! - `Activation`: 要素ごとの活性化（Softmax は最終軸）
//! - `Flatten`: `[N, ...]` → `[N, -1]`
//! - `Chain`: 子を順に適用
//! - `Leaf`: 恒等
//!
//! `Chain` 以外のノードが子を持つ場合は、子を順に適用してから自身の規則を適用する。

use super::{Graph, Mode, NodeId, NodeKind, ParamId, Tensor};
use crate::error::{NnError, Result};
use ndarray::{Array4, Axis, Ix1, Ix2, Ix4};

/// 活性化関数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
    Sigmoid,
    /// 最終軸で正規化
    Softmax,
}

impl Graph {
    /// `root` を起点に順伝播する。BatchNorm の移動統計は更新しない。
    pub fn forward(&self, root: NodeId, input: &Tensor) -> Result<Tensor> {
        let mut pass = Pass::new(self, false);
        pass.eval(root, input.clone())
    }

    /// 順伝播し、学習モードなら BatchNorm の移動統計を更新する
    pub fn forward_tracking(&mut self, root: NodeId, input: &Tensor) -> Result<Tensor> {
        let track = self.mode == Mode::Train;
        let (output, updates) = {
            let mut pass = Pass::new(self, track);
            let output = pass.eval(root, input.clone())?;
            (output, pass.updates)
        };
        for (id, value) in updates {
            *self.param_mut(id)? = value;
        }
        Ok(output)
    }
}

/// 1回分の順伝播の作業領域
struct Pass<'a> {
    graph: &'a Graph,
    /// 評価中のノード（再突入検出用）
    on_stack: Vec<bool>,
    track: bool,
    updates: Vec<(ParamId, Tensor)>,
}

impl<'a> Pass<'a> {
    fn new(graph: &'a Graph, track: bool) -> Self {
        Self {
            graph,
            on_stack: vec![false; graph.node_count()],
            track,
            updates: Vec::new(),
        }
    }

    fn eval(&mut self, id: NodeId, mut x: Tensor) -> Result<Tensor> {
        let graph = self.graph;
        let node = graph.node(id)?;
        if self.on_stack[id.index()] {
            return Err(NnError::CyclicGraph(id));
        }
        self.on_stack[id.index()] = true;

        for &child in node.children() {
            x = self.eval(child, x)?;
        }

        let y = match node.kind() {
            NodeKind::Leaf { .. } | NodeKind::Chain => x,
            NodeKind::Dense { weight, bias } => dense(
                &x,
                graph.param(*weight)?,
                bias.map(|b| graph.param(b)).transpose()?,
            )?,
            NodeKind::Conv { weight, bias } => conv2d(
                &x,
                graph.param(*weight)?,
                bias.map(|b| graph.param(b)).transpose()?,
            )?,
            NodeKind::BatchNorm {
                gamma,
                beta,
                mean,
                var,
                eps,
                momentum,
            } => {
                let train = graph.mode() == Mode::Train;
                let (y, stats) = batch_norm(
                    x,
                    BatchNormParams {
                        gamma: graph.param(*gamma)?,
                        beta: graph.param(*beta)?,
                        mean: graph.param(*mean)?,
                        var: graph.param(*var)?,
                        eps: *eps,
                        momentum: *momentum,
                    },
                    train,
                )?;
                if self.track {
                    if let Some((m, v)) = stats {
                        self.updates.push((*mean, m));
                        self.updates.push((*var, v));
                    }
                }
                y
            }
            NodeKind::Activation(a) => activate(x, *a),
            NodeKind::Flatten => flatten(x)?,
        };

        self.on_stack[id.index()] = false;
        Ok(y)
    }
}

fn dense(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let x = x.view().into_dimensionality::<Ix2>()?;
    let w = weight.view().into_dimensionality::<Ix2>()?;
    if x.ncols() != w.ncols() {
        return Err(NnError::ShapeMismatch {
            context: "dense input",
            expected: vec![x.nrows(), w.ncols()],
            actual: x.shape().to_vec(),
        });
    }
    let mut y = x.dot(&w.t());
    if let Some(b) = bias {
        let b = b.view().into_dimensionality::<Ix1>()?;
        y += &b;
    }
    Ok(y.into_dyn())
}

fn conv2d(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let x = x.view().into_dimensionality::<Ix4>()?;
    let w = weight.view().into_dimensionality::<Ix4>()?;
    let (n, c, h, wd) = x.dim();
    let (o, wc, k, _) = w.dim();
    if c != wc {
        return Err(NnError::ShapeMismatch {
            context: "conv input channels",
            expected: vec![n, wc, h, wd],
            actual: x.shape().to_vec(),
        });
    }
    let bias = bias
        .map(|b| b.view().into_dimensionality::<Ix1>())
        .transpose()?;
    let pad = (k / 2) as isize;

    let mut out = Array4::<f32>::zeros((n, o, h, wd));
    for b in 0..n {
        for oc in 0..o {
            let b0 = bias.as_ref().map_or(0.0, |bv| bv[oc]);
            for y in 0..h {
                for xx in 0..wd {
                    let mut acc = b0;
                    for ic in 0..c {
                        for ky in 0..k {
                            let iy = y as isize + ky as isize - pad;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let ix = xx as isize + kx as isize - pad;
                                if ix < 0 || ix >= wd as isize {
                                    continue;
                                }
                                acc += x[[b, ic, iy as usize, ix as usize]] * w[[oc, ic, ky, kx]];
                            }
                        }
                    }
                    out[[b, oc, y, xx]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

struct BatchNormParams<'p> {
    gamma: &'p Tensor,
    beta: &'p Tensor,
    mean: &'p Tensor,
    var: &'p Tensor,
    eps: f32,
    momentum: f32,
}

/// 戻り値の第2要素は学習モード時の更新後移動統計 (mean, var)
fn batch_norm(
    mut x: Tensor,
    p: BatchNormParams<'_>,
    train: bool,
) -> Result<(Tensor, Option<(Tensor, Tensor)>)> {
    if x.ndim() < 2 || x.shape()[1] != p.gamma.len() {
        return Err(NnError::ShapeMismatch {
            context: "batch norm channels",
            expected: vec![x.shape().first().copied().unwrap_or(0), p.gamma.len()],
            actual: x.shape().to_vec(),
        });
    }
    let channels = p.gamma.len();
    let mut running = None;

    let (mean, var) = if train {
        let mut mean = Tensor::zeros(p.mean.raw_dim());
        let mut var = Tensor::zeros(p.var.raw_dim());
        let count = x.len().checked_div(channels).unwrap_or(0);
        for (ch, lane) in x.axis_iter(Axis(1)).enumerate() {
            let m = lane.mean().unwrap_or(0.0);
            let v = lane.mapv(|e| (e - m) * (e - m)).mean().unwrap_or(0.0);
            mean[[ch]] = m;
            var[[ch]] = v;
        }
        // 移動分散は不偏推定量で更新
        let unbias = if count > 1 {
            count as f32 / (count - 1) as f32
        } else {
            1.0
        };
        let new_mean = p.mean * (1.0 - p.momentum) + &mean * p.momentum;
        let new_var = p.var * (1.0 - p.momentum) + &var * (p.momentum * unbias);
        running = Some((new_mean, new_var));
        (mean, var)
    } else {
        (p.mean.clone(), p.var.clone())
    };

    for (ch, mut lane) in x.axis_iter_mut(Axis(1)).enumerate() {
        let scale = p.gamma[[ch]] / (var[[ch]] + p.eps).sqrt();
        let shift = p.beta[[ch]] - mean[[ch]] * scale;
        lane.mapv_inplace(|e| e * scale + shift);
    }
    Ok((x, running))
}

fn activate(mut x: Tensor, activation: Activation) -> Tensor {
    match activation {
        Activation::Identity => {}
        Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
        Activation::Tanh => x.mapv_inplace(f32::tanh),
        Activation::Sigmoid => x.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
        Activation::Softmax => {
            if x.ndim() > 0 {
                let last = Axis(x.ndim() - 1);
                for mut lane in x.lanes_mut(last) {
                    let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    lane.mapv_inplace(|v| (v - max).exp());
                    let sum = lane.sum();
                    lane.mapv_inplace(|v| v / sum);
                }
            }
        }
    }
    x
}

fn flatten(x: Tensor) -> Result<Tensor> {
    let Some(&batch) = x.shape().first() else {
        return Err(NnError::ShapeMismatch {
            context: "flatten input",
            expected: vec![0, 0],
            actual: Vec::new(),
        });
    };
    let rest: usize = x.shape()[1..].iter().product();
    let x = if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().into_owned()
    };
    Ok(x.into_shape_with_order((batch, rest))?.into_dyn())
}
