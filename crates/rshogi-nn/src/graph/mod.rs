//! ネットワーク構造のアリーナ表現
//!
//! ノードとパラメータは整数インデックス（[`NodeId`] / [`ParamId`]）で参照する。
//! 同じノードを複数の親から参照する共有構造や、祖先を子に持つ循環構造も表現できる。
//! 同一性はインデックスの一致で判定するので、走査の重複排除は
//! アリーナと同じ大きさのビットセットで済む（[`Graph::walk`]）。

mod layers;

pub use layers::Activation;

use crate::device::Device;
use crate::error::{NnError, Result};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;

/// ネットワークが扱うテンソル（ホストメモリ上の f32 多次元配列）
pub type Tensor = ArrayD<f32>;

/// ノードの識別子（アリーナ内のインデックス）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// パラメータの識別子（アリーナ内のインデックス）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u32);

impl ParamId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// 学習モード / 推論モード
///
/// 学習時のみ挙動が変わる層（BatchNorm の統計量）に影響する。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Eval,
    Train,
}

/// ノード種別
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// 生のパラメータのみを持つ葉。子を持たず、順伝播では入力をそのまま返す。
    Leaf { params: Vec<ParamId> },
    /// 子を順に適用する
    Chain,
    /// 全結合層。weight: `[out, in]`, bias: `[out]`
    Dense {
        weight: ParamId,
        bias: Option<ParamId>,
    },
    /// 2次元畳み込み（stride 1, same padding）。weight: `[out, in, k, k]`, bias: `[out]`
    Conv {
        weight: ParamId,
        bias: Option<ParamId>,
    },
    /// チャネル軸（axis 1）のバッチ正規化。mean / var は学習対象外のバッファ。
    BatchNorm {
        gamma: ParamId,
        beta: ParamId,
        mean: ParamId,
        var: ParamId,
        eps: f32,
        momentum: f32,
    },
    Activation(Activation),
    /// `[N, ...]` を `[N, -1]` に平坦化
    Flatten,
}

/// 正規化ルール表のキーとなるノード種別タグ
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KindTag {
    Leaf,
    Chain,
    Dense,
    Conv,
    BatchNorm,
    Activation,
    Flatten,
}

impl NodeKind {
    pub fn tag(&self) -> KindTag {
        match self {
            NodeKind::Leaf { .. } => KindTag::Leaf,
            NodeKind::Chain => KindTag::Chain,
            NodeKind::Dense { .. } => KindTag::Dense,
            NodeKind::Conv { .. } => KindTag::Conv,
            NodeKind::BatchNorm { .. } => KindTag::BatchNorm,
            NodeKind::Activation(_) => KindTag::Activation,
            NodeKind::Flatten => KindTag::Flatten,
        }
    }

    /// ノード自身が保持するパラメータ（バッファを含む）
    pub fn own_params(&self) -> Vec<ParamId> {
        match self {
            NodeKind::Leaf { params } => params.clone(),
            NodeKind::Dense { weight, bias } | NodeKind::Conv { weight, bias } => {
                std::iter::once(*weight).chain(*bias).collect()
            }
            NodeKind::BatchNorm {
                gamma,
                beta,
                mean,
                var,
                ..
            } => vec![*gamma, *beta, *mean, *var],
            NodeKind::Chain | NodeKind::Activation(_) | NodeKind::Flatten => Vec::new(),
        }
    }
}

/// アリーナ内のノード
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    kind: NodeKind,
    children: Vec<NodeId>,
}

impl Node {
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }
}

#[derive(Clone, Debug)]
struct ParamSlot {
    value: Tensor,
    trainable: bool,
}

/// ノードとパラメータのアリーナ
///
/// 配置デバイスとモードもここで保持する。`Clone` は独立したストレージを持つ深いコピー。
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    params: Vec<ParamSlot>,
    device: Device,
    mode: Mode,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // パラメータ
    // ------------------------------------------------------------------

    /// 学習対象のパラメータを追加
    pub fn add_param(&mut self, value: Tensor) -> ParamId {
        self.push_param(value, true)
    }

    /// 学習対象外のバッファ（BatchNorm の移動統計など）を追加
    pub fn add_buffer(&mut self, value: Tensor) -> ParamId {
        self.push_param(value, false)
    }

    fn push_param(&mut self, value: Tensor, trainable: bool) -> ParamId {
        let id = ParamId(self.params.len() as u32);
        self.params.push(ParamSlot { value, trainable });
        id
    }

    pub fn param(&self, id: ParamId) -> Result<&Tensor> {
        self.params
            .get(id.index())
            .map(|slot| &slot.value)
            .ok_or(NnError::UnknownParam(id))
    }

    pub fn param_mut(&mut self, id: ParamId) -> Result<&mut Tensor> {
        self.params
            .get_mut(id.index())
            .map(|slot| &mut slot.value)
            .ok_or(NnError::UnknownParam(id))
    }

    pub fn is_trainable(&self, id: ParamId) -> Result<bool> {
        self.params
            .get(id.index())
            .map(|slot| slot.trainable)
            .ok_or(NnError::UnknownParam(id))
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    // ------------------------------------------------------------------
    // ノード
    // ------------------------------------------------------------------

    /// ノードを追加
    ///
    /// 参照するパラメータと子ノードが存在しない場合はエラー。葉は子を持てない。
    pub fn add_node(&mut self, kind: NodeKind, children: Vec<NodeId>) -> Result<NodeId> {
        for p in kind.own_params() {
            self.param(p)?;
        }
        for &c in &children {
            self.node(c)?;
        }
        if matches!(kind, NodeKind::Leaf { .. }) && !children.is_empty() {
            return Err(NnError::invalid("leaf nodes cannot have children"));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, children });
        Ok(id)
    }

    /// 既存ノードに子を追加する。祖先を追加すれば循環構造になる。
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.node(child)?;
        let node = self
            .nodes
            .get_mut(parent.index())
            .ok_or(NnError::UnknownNode(parent))?;
        if node.is_leaf() {
            return Err(NnError::invalid(format!(
                "leaf node {parent:?} cannot have children"
            )));
        }
        node.children.push(child);
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.index()).ok_or(NnError::UnknownNode(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ------------------------------------------------------------------
    // 配置・モード
    // ------------------------------------------------------------------

    pub fn device(&self) -> Device {
        self.device
    }

    /// 指定デバイスに構造を写したコピーを返す（ノード ID・パラメータ ID は保存される）
    pub(crate) fn transferred(&self, device: Device) -> Self {
        Self {
            nodes: self.nodes.clone(),
            params: self.params.clone(),
            device,
            mode: self.mode,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    // ------------------------------------------------------------------
    // 走査
    // ------------------------------------------------------------------

    /// `roots` から到達可能な各ノードをちょうど1回ずつ訪問する（深さ優先・前順）
    ///
    /// 訪問済み集合はアリーナと同じ大きさのビットセット。共有ノードは最初の経路でのみ
    /// 訪問され、循環があっても停止する。葉の子は展開しない。戻り値は訪問ノード数。
    pub fn walk<F>(&self, roots: &[NodeId], mut visit: F) -> Result<usize>
    where
        F: FnMut(NodeId, &Node),
    {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = roots.iter().rev().copied().collect();
        let mut visited = 0;

        while let Some(id) = stack.pop() {
            let node = self.node(id)?;
            if seen[id.index()] {
                continue;
            }
            seen[id.index()] = true;
            visited += 1;
            visit(id, node);
            if !node.is_leaf() {
                stack.extend(node.children.iter().rev());
            }
        }

        Ok(visited)
    }

    /// `roots` から到達可能な学習対象パラメータ（重複なし・初出順）
    pub fn reachable_params(&self, roots: &[NodeId]) -> Result<Vec<ParamId>> {
        let mut taken = vec![false; self.params.len()];
        let mut out = Vec::new();
        let mut unknown = None;
        self.walk(roots, |_, node| {
            for p in node.kind.own_params() {
                match (self.params.get(p.index()), taken.get_mut(p.index())) {
                    (Some(slot), Some(seen)) if slot.trainable && !*seen => {
                        *seen = true;
                        out.push(p);
                    }
                    (Some(_), Some(_)) => {}
                    _ => unknown = unknown.or(Some(p)),
                }
            }
        })?;
        if let Some(p) = unknown {
            return Err(NnError::UnknownParam(p));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // 組み立て用ヘルパー
    // ------------------------------------------------------------------

    /// Glorot 一様分布で初期化した全結合層を追加
    pub fn dense<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        input: usize,
        output: usize,
        with_bias: bool,
    ) -> NodeId {
        let limit = (6.0 / (input + output) as f32).sqrt();
        let weight = self.add_param(glorot(rng, &[output, input], limit));
        let bias = with_bias.then(|| self.add_param(Tensor::zeros(IxDyn(&[output]))));
        self.push_node(NodeKind::Dense { weight, bias }, Vec::new())
    }

    /// Glorot 一様分布で初期化した畳み込み層を追加（カーネルは奇数）
    pub fn conv<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    ) -> Result<NodeId> {
        if kernel % 2 == 0 {
            return Err(NnError::invalid(format!(
                "convolution kernel must be odd for same padding, got {kernel}"
            )));
        }
        let receptive = kernel * kernel;
        let limit = (6.0 / ((in_channels + out_channels) * receptive) as f32).sqrt();
        let weight = self.add_param(glorot(
            rng,
            &[out_channels, in_channels, kernel, kernel],
            limit,
        ));
        let bias = Some(self.add_param(Tensor::zeros(IxDyn(&[out_channels]))));
        Ok(self.push_node(NodeKind::Conv { weight, bias }, Vec::new()))
    }

    /// BatchNorm 層を追加（gamma=1, beta=0, 移動平均 0, 移動分散 1）
    pub fn batch_norm(&mut self, channels: usize) -> NodeId {
        let gamma = self.add_param(Tensor::ones(IxDyn(&[channels])));
        let beta = self.add_param(Tensor::zeros(IxDyn(&[channels])));
        let mean = self.add_buffer(Tensor::zeros(IxDyn(&[channels])));
        let var = self.add_buffer(Tensor::ones(IxDyn(&[channels])));
        self.push_node(
            NodeKind::BatchNorm {
                gamma,
                beta,
                mean,
                var,
                eps: 1e-5,
                momentum: 0.1,
            },
            Vec::new(),
        )
    }

    pub fn activation(&mut self, activation: Activation) -> NodeId {
        self.push_node(NodeKind::Activation(activation), Vec::new())
    }

    pub fn flatten(&mut self) -> NodeId {
        self.push_node(NodeKind::Flatten, Vec::new())
    }

    pub fn chain(&mut self, children: Vec<NodeId>) -> Result<NodeId> {
        self.add_node(NodeKind::Chain, children)
    }

    pub fn leaf(&mut self, params: Vec<ParamId>) -> Result<NodeId> {
        self.add_node(NodeKind::Leaf { params }, Vec::new())
    }

    fn push_node(&mut self, kind: NodeKind, children: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, children });
        id
    }
}

fn glorot<R: Rng + ?Sized>(rng: &mut R, shape: &[usize], limit: f32) -> Tensor {
    Tensor::from_shape_fn(IxDyn(shape), |_| rng.random_range(-limit..limit))
}
