//! # rshogi-nn
//!
//! 対局エージェント向けのニューラルネットワーク基盤。
//!
//! ## モジュール構成
//!
//! - `graph`: ノードとパラメータのアリーナ、順伝播
//! - `regularize`: 正則化対象パラメータの選択（各ノード1回の走査）
//! - `schedule`: 三角形の周期スケジュール
//! - `optim`: オプティマイザ方針（Adam / 周期 Nesterov）と実行状態
//! - `backend`: 損失・勾配の計算（中心差分の参照実装）
//! - `trainer`: 学習ループ
//! - `network`: ネットワーク共通インターフェース
//! - `two_head`: 胴体 + 価値・方策ヘッド
//! - `device`: デバイス配置とフォールバック
//! - `config`: TOML 設定

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod network;
pub mod optim;
pub mod regularize;
pub mod schedule;
pub mod trainer;
pub mod two_head;

pub use backend::{Backend, FiniteDifference, Gradients};
pub use config::TrainerConfig;
pub use device::{Device, DeviceContext, DeviceResolution};
pub use error::{NnError, Result};
pub use graph::{Activation, Graph, KindTag, Mode, NodeId, NodeKind, ParamId, Tensor};
pub use network::{ChainNetwork, HostTransfer, Network};
pub use optim::{OptimizerPolicy, RunningOptimizerState, StepHyper};
pub use regularize::{RegularizationRules, RegularizedParams, collect_regularized};
pub use schedule::{CyclicSchedule, schedule};
pub use trainer::{TrainReport, TrainingBatch, train, train_from};
pub use two_head::{TwoHeadNetwork, TwoHeadOutput, TwoHeadParts};
