//! デバイス配置
//!
//! アクセラレータの有無はプロセス起動時に一度だけ [`DeviceContext`] として解決し、
//! 配置が必要な処理へ明示的に渡す。要求したアクセラレータが無い場合は
//! エラーにせず既定デバイス（CPU）へフォールバックする。

use crate::graph::Tensor;
use serde::{Deserialize, Serialize};

/// 配置先デバイス
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    /// アクセラレータ（序数）
    Accelerator(u32),
}

impl Device {
    #[inline]
    pub fn is_accelerator(self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

/// 配置要求の解決結果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceResolution {
    /// 要求どおりに配置できた
    Placed(Device),
    /// 要求したアクセラレータが無く CPU にフォールバックした
    FellBack { requested: Device },
}

impl DeviceResolution {
    /// 実際に使うデバイス
    pub fn device(self) -> Device {
        match self {
            DeviceResolution::Placed(d) => d,
            DeviceResolution::FellBack { .. } => Device::Cpu,
        }
    }
}

/// プロセス単位で解決済みのデバイス構成
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceContext {
    accelerators: u32,
}

impl DeviceContext {
    /// 利用可能なアクセラレータ数を指定する環境変数
    pub const ENV_VAR: &'static str = "RSHOGI_NN_ACCELERATORS";

    /// CPU のみ
    pub fn cpu_only() -> Self {
        Self { accelerators: 0 }
    }

    /// `count` 個のアクセラレータが利用可能
    pub fn with_accelerators(count: u32) -> Self {
        Self {
            accelerators: count,
        }
    }

    /// 環境変数 `RSHOGI_NN_ACCELERATORS` から解決
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(Self::ENV_VAR).ok().as_deref())
    }

    /// 環境変数の値から解決する。未設定・解釈不能なら CPU のみ。
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => Self::cpu_only(),
            Some(v) => match v.parse::<u32>() {
                Ok(n) => Self::with_accelerators(n),
                Err(e) => {
                    log::warn!("Ignoring {}={v:?}: {e}", Self::ENV_VAR);
                    Self::cpu_only()
                }
            },
        }
    }

    pub fn accelerators(&self) -> u32 {
        self.accelerators
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerators > 0
    }

    /// 既定の配置先。アクセラレータ優先かつ利用可能なら 0 番。
    pub fn default_device(&self, prefer_accelerator: bool) -> Device {
        if prefer_accelerator && self.has_accelerator() {
            Device::Accelerator(0)
        } else {
            Device::Cpu
        }
    }

    /// 配置要求を解決する
    pub fn resolve(&self, requested: Device) -> DeviceResolution {
        match requested {
            Device::Cpu => DeviceResolution::Placed(Device::Cpu),
            Device::Accelerator(ordinal) if ordinal < self.accelerators => {
                DeviceResolution::Placed(requested)
            }
            Device::Accelerator(ordinal) => {
                log::info!(
                    "Accelerator {ordinal} unavailable ({} present), falling back to CPU",
                    self.accelerators
                );
                DeviceResolution::FellBack { requested }
            }
        }
    }

    /// 呼び出し境界での入力変換（ホスト → 配置先）
    ///
    /// 本クレートのテンソルは常にホストメモリ上にあるため、配置先に依らず複製を返す。
    pub fn convert_input(&self, _device: Device, x: &Tensor) -> Tensor {
        x.clone()
    }

    /// 呼び出し境界での出力変換（配置先 → ホスト）
    pub fn convert_output(&self, _device: Device, y: Tensor) -> Tensor {
        y
    }

    /// アクセラレータメモリの回収フック
    ///
    /// 呼び出し元が明示的に呼ぶ。自動では呼ばれない。CPU のみの構成では何もしない。
    pub fn reclaim_memory(&self) {
        if self.has_accelerator() {
            log::debug!(
                "Reclaiming accelerator memory on {} device(s)",
                self.accelerators
            );
        }
    }
}
