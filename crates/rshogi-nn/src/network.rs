//! ネットワークの共通インターフェース
//!
//! 具体的なアーキテクチャは順伝播・ハイパーパラメータ・グラフへのアクセス・
//! 再構築規則だけを実装する。コピー、デバイス転送、モード切り替え、
//! 正則化対象の抽出、学習は [`Network`] の既定実装で提供される。

use crate::backend::Backend;
use crate::device::{Device, DeviceContext};
use crate::error::Result;
use crate::graph::{Graph, Mode, NodeId, ParamId, Tensor};
use crate::optim::OptimizerPolicy;
use crate::regularize::{RegularizationRules, RegularizedParams};
use crate::trainer::{self, TrainReport, TrainingBatch};
use std::fmt::Debug;

/// 呼び出し境界で出力をホストへ戻す変換
pub trait HostTransfer: Sized {
    fn to_host(self, ctx: &DeviceContext, device: Device) -> Self;
}

impl HostTransfer for Tensor {
    fn to_host(self, ctx: &DeviceContext, device: Device) -> Self {
        ctx.convert_output(device, self)
    }
}

/// ネットワーク
pub trait Network: Sized {
    /// 構築時に付与され、あらゆる構造変換を通して保存されるハイパーパラメータ
    type Hyper: Clone + Debug;
    type Output: HostTransfer;

    fn hyperparams(&self) -> &Self::Hyper;

    fn graph(&self) -> &Graph;

    fn graph_mut(&mut self) -> &mut Graph;

    /// パラメータ集合・正則化対象の起点となるノード
    fn roots(&self) -> Vec<NodeId>;

    /// 順伝播。BatchNorm の移動統計は更新しない。
    fn forward(&self, input: &Tensor) -> Result<Self::Output>;

    /// 順伝播し、学習モードなら BatchNorm の移動統計を更新する
    fn forward_tracking(&mut self, input: &Tensor) -> Result<Self::Output>;

    /// 同じハイパーパラメータと同じノード構成で、`graph` を持つネットワークを作る
    fn rebuild(&self, graph: Graph) -> Self;

    fn device(&self) -> Device {
        self.graph().device()
    }

    fn on_accelerator(&self) -> bool {
        self.device().is_accelerator()
    }

    /// 独立したストレージを持つ複製
    fn copy(&self) -> Self {
        self.rebuild(self.graph().clone())
    }

    /// `device` に配置した複製。利用できなければ CPU にフォールバックする。
    fn to_device(&self, ctx: &DeviceContext, device: Device) -> Self {
        let placed = ctx.resolve(device).device();
        self.rebuild(self.graph().transferred(placed))
    }

    fn to_cpu(&self, ctx: &DeviceContext) -> Self {
        self.to_device(ctx, Device::Cpu)
    }

    fn mode(&self) -> Mode {
        self.graph().mode()
    }

    fn set_mode(&mut self, mode: Mode) {
        self.graph_mut().set_mode(mode);
    }

    /// 学習ループが各ステップの更新後に呼ぶ統計更新
    fn track_statistics(&mut self, input: &Tensor) -> Result<()> {
        self.forward_tracking(input).map(|_| ())
    }

    /// `device` に配置し `mode` を設定した複製
    fn copy_with(&self, ctx: &DeviceContext, device: Device, mode: Mode) -> Self {
        let mut net = self.to_device(ctx, device);
        net.set_mode(mode);
        net
    }

    /// ホストのテンソルを受け取り、ホストの出力を返す順伝播
    fn forward_on(&self, ctx: &DeviceContext, input: &Tensor) -> Result<Self::Output> {
        let device = self.device();
        let x = ctx.convert_input(device, input);
        Ok(self.forward(&x)?.to_host(ctx, device))
    }

    /// 学習対象パラメータ（重複なし）
    fn params(&self) -> Result<Vec<ParamId>> {
        self.graph().reachable_params(&self.roots())
    }

    fn regularized_params(&self, rules: &RegularizationRules) -> Result<RegularizedParams> {
        rules.collect(self.graph(), &self.roots())
    }

    /// 学習対象パラメータのスカラー数
    fn num_parameters(&self) -> Result<usize> {
        let graph = self.graph();
        self.params()?
            .into_iter()
            .map(|p| graph.param(p).map(|t| t.len()))
            .sum()
    }

    fn num_regularized_parameters(&self, rules: &RegularizationRules) -> Result<usize> {
        self.regularized_params(rules)?.num_scalars(self.graph())
    }

    /// 正則化対象の重みの絶対値平均
    fn mean_weight(&self, rules: &RegularizationRules) -> Result<f32> {
        self.regularized_params(rules)?.mean_abs(self.graph())
    }

    /// 新しいオプティマイザ状態で `n_steps` ステップまで学習する
    ///
    /// 詳細は [`trainer::train`]。
    fn train<B, D, I, F, C>(
        &mut self,
        backend: &B,
        policy: &OptimizerPolicy,
        loss: F,
        data: I,
        n_steps: usize,
        callback: C,
    ) -> Result<TrainReport>
    where
        B: Backend,
        D: TrainingBatch,
        I: IntoIterator<Item = D>,
        F: FnMut(&Self, &D) -> Result<f32>,
        C: FnMut(usize, f32) -> Result<()>,
    {
        trainer::train(self, backend, policy, loss, data, n_steps, callback)
    }
}

/// 単一の出力を持つネットワーク（`root` の順伝播結果を返す）
#[derive(Clone, Debug)]
pub struct ChainNetwork<H> {
    hyper: H,
    graph: Graph,
    root: NodeId,
}

impl<H: Clone + Debug> ChainNetwork<H> {
    pub fn new(hyper: H, graph: Graph, root: NodeId) -> Result<Self> {
        graph.node(root)?;
        Ok(Self { hyper, graph, root })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }
}

impl<H: Clone + Debug> Network for ChainNetwork<H> {
    type Hyper = H;
    type Output = Tensor;

    fn hyperparams(&self) -> &H {
        &self.hyper
    }

    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    fn roots(&self) -> Vec<NodeId> {
        vec![self.root]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.graph.forward(self.root, input)
    }

    fn forward_tracking(&mut self, input: &Tensor) -> Result<Tensor> {
        self.graph.forward_tracking(self.root, input)
    }

    fn rebuild(&self, graph: Graph) -> Self {
        Self {
            hyper: self.hyper.clone(),
            graph,
            root: self.root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Activation;
    use ndarray::IxDyn;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[derive(Clone, Debug, PartialEq)]
    struct Hyper {
        width: usize,
    }

    fn mlp() -> ChainNetwork<Hyper> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let mut g = Graph::new();
        let d1 = g.dense(&mut rng, 4, 8, true);
        let act = g.activation(Activation::Tanh);
        let d2 = g.dense(&mut rng, 8, 2, true);
        let root = g.chain(vec![d1, act, d2]).unwrap();
        ChainNetwork::new(Hyper { width: 8 }, g, root).unwrap()
    }

    #[test]
    fn test_parameter_counts() {
        let net = mlp();
        let rules = RegularizationRules::default();
        assert_eq!(net.num_parameters().unwrap(), 4 * 8 + 8 + 8 * 2 + 2);
        assert_eq!(net.num_regularized_parameters(&rules).unwrap(), 4 * 8 + 8 * 2);
        assert!(net.mean_weight(&rules).unwrap() > 0.0);
    }

    #[test]
    fn test_copy_has_independent_storage() {
        let net = mlp();
        let mut copy = net.copy();
        let p = copy.params().unwrap()[0];
        copy.graph_mut().param_mut(p).unwrap().fill(0.0);
        assert!(net.graph().param(p).unwrap().iter().any(|&v| v != 0.0));
        assert_eq!(copy.hyperparams(), net.hyperparams());
        assert_eq!(copy.hyperparams().width, 8);
    }

    #[test]
    fn test_transfer_falls_back_and_preserves_output() {
        let net = mlp();
        let ctx = DeviceContext::cpu_only();
        let moved = net.to_device(&ctx, Device::Accelerator(0));
        assert_eq!(moved.device(), Device::Cpu);
        assert!(!moved.on_accelerator());

        let x = Tensor::from_shape_fn(IxDyn(&[3, 4]), |d| (d[0] + d[1]) as f32 * 0.1);
        assert_eq!(net.forward(&x).unwrap(), moved.forward_on(&ctx, &x).unwrap());
    }

    #[test]
    fn test_transfer_to_available_accelerator() {
        let ctx = DeviceContext::with_accelerators(1);
        let moved = mlp().copy_with(&ctx, Device::Accelerator(0), Mode::Train);
        assert!(moved.on_accelerator());
        assert_eq!(moved.mode(), Mode::Train);
        assert_eq!(moved.to_cpu(&ctx).device(), Device::Cpu);
    }

    #[test]
    fn test_unknown_root_rejected() {
        let mut g = Graph::new();
        let n = g.flatten();
        let other = Graph::new();
        assert!(ChainNetwork::new((), other, n).is_err());
    }
}
