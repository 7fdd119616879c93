//! エラー型
//!
//! 設定エラーは構築時に即座に返し、数値エラーは学習ループの呼び出し元まで伝播させる。
//! アクセラレータ不在はエラーにしない（[`crate::device::DeviceResolution`] を参照）。

use crate::graph::{NodeId, ParamId};

/// rshogi-nn のエラー
#[derive(thiserror::Error, Debug)]
pub enum NnError {
    /// 不正な設定（長さ 0 のスケジュール、未登録ノード種別の明示要求など）
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// 損失・勾配が有限でない
    #[error("Numerical failure: {what}")]
    NumericalFailure { what: String },

    /// グラフに存在しないノード
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    /// グラフに存在しないパラメータ
    #[error("Unknown parameter {0:?}")]
    UnknownParam(ParamId),

    /// 順伝播中に評価中のノードへ再突入した
    #[error("Cyclic graph: node {0:?} re-entered during forward")]
    CyclicGraph(NodeId),

    /// テンソル形状の不一致
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// ndarray の形状変換エラー
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    /// TOML 設定の読み込みエラー
    #[error(transparent)]
    Config(#[from] toml::de::Error),

    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// コールバックが学習の中断を要求した
    #[error("Training aborted by callback: {0}")]
    Callback(String),
}

impl NnError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub(crate) fn numerical(what: impl Into<String>) -> Self {
        Self::NumericalFailure { what: what.into() }
    }
}

/// Result type for rshogi-nn operations
pub type Result<T> = std::result::Result<T, NnError>;
