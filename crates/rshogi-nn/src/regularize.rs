//! 正則化対象パラメータの選択
//!
//! ネットワークのグラフを各ノード1回ずつ走査し、ノード種別ごとのルールが
//! 「正則化対象」と宣言したパラメータを集める。
//!
//! - 葉は展開せず、ルールも適用しない
//! - 訪問済みノードは再訪しない（共有構造・循環構造でも停止する）
//! - 同じパラメータは複数のノードから参照されていても1回だけ含める
//! - ルール未登録の種別は表の既定エントリ（空リスト）に解決される。
//!   BatchNorm やバイアスを誤って正則化しないための default-deny。

use crate::error::{NnError, Result};
use crate::graph::{Graph, KindTag, Node, NodeId, NodeKind, ParamId};
use std::collections::HashMap;

/// ノード種別ごとの正則化ルール
pub type RegularizableFn = fn(&NodeKind) -> Vec<ParamId>;

/// 既定エントリ: 何も寄与しない
fn contributes_nothing(_: &NodeKind) -> Vec<ParamId> {
    Vec::new()
}

/// 全結合・畳み込みの重みのみ（バイアスは含めない）
pub fn weight_only(kind: &NodeKind) -> Vec<ParamId> {
    match kind {
        NodeKind::Dense { weight, .. } | NodeKind::Conv { weight, .. } => vec![*weight],
        _ => Vec::new(),
    }
}

/// ノード種別 → 正則化ルールのディスパッチ表
#[derive(Clone)]
pub struct RegularizationRules {
    table: HashMap<KindTag, RegularizableFn>,
    fallback: RegularizableFn,
}

impl std::fmt::Debug for RegularizationRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.table.keys().map(|k| format!("{k:?}")).collect();
        kinds.sort();
        f.debug_struct("RegularizationRules")
            .field("registered", &kinds)
            .finish_non_exhaustive()
    }
}

impl Default for RegularizationRules {
    /// 全結合・畳み込みの重みを対象とする標準ルール
    fn default() -> Self {
        let mut table: HashMap<KindTag, RegularizableFn> = HashMap::new();
        table.insert(KindTag::Dense, weight_only);
        table.insert(KindTag::Conv, weight_only);
        Self {
            table,
            fallback: contributes_nothing,
        }
    }
}

impl RegularizationRules {
    /// ルールを1つも持たない表（すべて既定エントリに解決される）
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
            fallback: contributes_nothing,
        }
    }

    /// 種別にルールを登録する（既存のルールは置き換える）
    ///
    /// 葉にはルールを適用しないので、`KindTag::Leaf` への登録は設定エラー。
    pub fn register(&mut self, tag: KindTag, rule: RegularizableFn) -> Result<()> {
        if tag == KindTag::Leaf {
            return Err(NnError::invalid(
                "leaf nodes never contribute regularized parameters",
            ));
        }
        self.table.insert(tag, rule);
        Ok(())
    }

    /// 種別のルール。未登録なら既定エントリ。
    pub fn rule_for(&self, tag: KindTag) -> RegularizableFn {
        self.table.get(&tag).copied().unwrap_or(self.fallback)
    }

    /// 明示的に登録されたルールを要求する。未登録なら設定エラー。
    pub fn require(&self, tag: KindTag) -> Result<RegularizableFn> {
        self.table.get(&tag).copied().ok_or_else(|| {
            NnError::invalid(format!(
                "no regularization rule registered for node kind {tag:?}"
            ))
        })
    }

    pub fn is_registered(&self, tag: KindTag) -> bool {
        self.table.contains_key(&tag)
    }

    /// ノードが宣言する正則化対象パラメータ
    pub fn regularizable_of(&self, node: &Node) -> Vec<ParamId> {
        (self.rule_for(node.kind().tag()))(node.kind())
    }

    /// `roots` から到達可能な正則化対象パラメータを集める
    pub fn collect(&self, graph: &Graph, roots: &[NodeId]) -> Result<RegularizedParams> {
        let mut taken = vec![false; graph.param_count()];
        let mut params = Vec::new();
        let mut unknown = None;

        let visited = graph.walk(roots, |_, node| {
            if node.is_leaf() {
                return;
            }
            for p in self.regularizable_of(node) {
                match taken.get_mut(p.index()) {
                    Some(seen) if !*seen => {
                        *seen = true;
                        params.push(p);
                    }
                    Some(_) => {}
                    None => unknown = unknown.or(Some(p)),
                }
            }
        })?;

        if let Some(p) = unknown {
            return Err(NnError::UnknownParam(p));
        }
        log::debug!(
            "Collected {} regularized parameter tensors from {visited} nodes",
            params.len()
        );
        Ok(RegularizedParams { params })
    }
}

/// `root` から到達可能な正則化対象パラメータを集める
pub fn collect_regularized(
    graph: &Graph,
    root: NodeId,
    rules: &RegularizationRules,
) -> Result<RegularizedParams> {
    rules.collect(graph, &[root])
}

/// 正則化対象パラメータの集合（同一性で重複排除済み・初出順）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegularizedParams {
    params: Vec<ParamId>,
}

impl RegularizedParams {
    pub fn as_slice(&self) -> &[ParamId] {
        &self.params
    }

    pub fn iter(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.params.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.params.contains(&id)
    }

    /// 含まれるスカラー数の合計
    pub fn num_scalars(&self, graph: &Graph) -> Result<usize> {
        self.iter().map(|p| graph.param(p).map(|t| t.len())).sum()
    }

    /// L2 正則化項 `Σ w²`
    pub fn sum_of_squares(&self, graph: &Graph) -> Result<f32> {
        self.iter()
            .map(|p| graph.param(p).map(|t| t.iter().map(|w| w * w).sum::<f32>()))
            .sum()
    }

    /// 重みの絶対値の平均
    pub fn mean_abs(&self, graph: &Graph) -> Result<f32> {
        let mut total = 0.0f64;
        let mut count = 0usize;
        for p in self.iter() {
            let t = graph.param(p)?;
            total += t.iter().map(|w| w.abs() as f64).sum::<f64>();
            count += t.len();
        }
        Ok(if count > 0 {
            (total / count as f64) as f32
        } else {
            0.0
        })
    }
}
