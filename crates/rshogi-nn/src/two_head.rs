//! 胴体 + 価値ヘッド + 方策ヘッド
//!
//! `common = trunk(x)`, `value = value_head(common)`, `policy = policy_head(common)`。
//! 3つの部品は同じ [`Graph`] 上のノードで、ヘッド同士や胴体との間でノードを共有してもよい。

use crate::device::{Device, DeviceContext};
use crate::error::Result;
use crate::graph::{Graph, NodeId, Tensor};
use crate::network::{HostTransfer, Network};
use std::fmt::Debug;

/// 2ヘッドネットワークを構成する部品
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TwoHeadParts {
    pub trunk: NodeId,
    pub value_head: NodeId,
    pub policy_head: NodeId,
}

/// 順伝播の出力
#[derive(Clone, Debug, PartialEq)]
pub struct TwoHeadOutput {
    pub policy: Tensor,
    pub value: Tensor,
}

impl HostTransfer for TwoHeadOutput {
    fn to_host(self, ctx: &DeviceContext, device: Device) -> Self {
        Self {
            policy: ctx.convert_output(device, self.policy),
            value: ctx.convert_output(device, self.value),
        }
    }
}

/// 胴体を共有する方策・価値ネットワーク
#[derive(Clone, Debug)]
pub struct TwoHeadNetwork<H> {
    hyper: H,
    graph: Graph,
    parts: TwoHeadParts,
}

impl<H: Clone + Debug> TwoHeadNetwork<H> {
    /// 部品のノードが `graph` に存在することを確認して構築する
    pub fn new(hyper: H, graph: Graph, parts: TwoHeadParts) -> Result<Self> {
        graph.node(parts.trunk)?;
        graph.node(parts.value_head)?;
        graph.node(parts.policy_head)?;
        Ok(Self::from_parts(hyper, graph, parts))
    }

    /// 再構築規則: ハイパーパラメータと新しい部品から組み立て直す
    ///
    /// コピーとデバイス転送はこの規則を経由する。部品の存在確認は行わない。
    pub fn from_parts(hyper: H, graph: Graph, parts: TwoHeadParts) -> Self {
        Self {
            hyper,
            graph,
            parts,
        }
    }

    pub fn parts(&self) -> TwoHeadParts {
        self.parts
    }
}

impl<H: Clone + Debug> Network for TwoHeadNetwork<H> {
    type Hyper = H;
    type Output = TwoHeadOutput;

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
        vec![
            self.parts.trunk,
            self.parts.value_head,
            self.parts.policy_head,
        ]
    }

    fn forward(&self, input: &Tensor) -> Result<TwoHeadOutput> {
        let common = self.graph.forward(self.parts.trunk, input)?;
        let value = self.graph.forward(self.parts.value_head, &common)?;
        let policy = self.graph.forward(self.parts.policy_head, &common)?;
        Ok(TwoHeadOutput { policy, value })
    }

    fn forward_tracking(&mut self, input: &Tensor) -> Result<TwoHeadOutput> {
        let common = self.graph.forward_tracking(self.parts.trunk, input)?;
        let value = self.graph.forward_tracking(self.parts.value_head, &common)?;
        let policy = self.graph.forward_tracking(self.parts.policy_head, &common)?;
        Ok(TwoHeadOutput { policy, value })
    }

    fn rebuild(&self, graph: Graph) -> Self {
        Self::from_parts(self.hyper.clone(), graph, self.parts)
    }
}
