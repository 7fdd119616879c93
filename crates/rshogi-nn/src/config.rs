//! 学習設定（TOML）
//!
//! ```toml
//! steps = 200
//! seed = 42
//! weight_decay = 1e-4
//! log_interval = 20
//!
//! [optimizer]
//! type = "cyclic_momentum"
//! lr_base = 1e-3
//! lr_high = 1e-2
//! lr_low = 1e-4
//! momentum_high = 0.95
//! momentum_low = 0.85
//!
//! [device]
//! accelerators = 0
//! prefer_accelerator = true
//!
//! [backend]
//! epsilon = 1e-3
//! ```

use crate::backend::FiniteDifference;
use crate::device::DeviceContext;
use crate::error::{NnError, Result};
use crate::optim::OptimizerPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_steps() -> usize {
    200
}

fn default_seed() -> u64 {
    42
}

fn default_weight_decay() -> f32 {
    1e-4
}

fn default_log_interval() -> usize {
    20
}

fn default_epsilon() -> f32 {
    1e-3
}

/// 学習全体の設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// L2 正則化の係数
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    /// 進捗ログを出すステップ間隔
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default)]
    pub optimizer: OptimizerPolicy,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            seed: default_seed(),
            weight_decay: default_weight_decay(),
            log_interval: default_log_interval(),
            optimizer: OptimizerPolicy::default(),
            device: DeviceConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

/// デバイス設定
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// 利用可能なアクセラレータ数。未指定なら環境変数から解決する。
    #[serde(default)]
    pub accelerators: Option<u32>,
    #[serde(default)]
    pub prefer_accelerator: bool,
}

impl DeviceConfig {
    /// プロセスで使うデバイス構成を解決する
    pub fn resolve(&self) -> DeviceContext {
        match self.accelerators {
            Some(n) => DeviceContext::with_accelerators(n),
            None => DeviceContext::from_env(),
        }
    }
}

/// 勾配計算の設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
        }
    }
}

impl TrainerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&data)?;
        log::info!("Loaded trainer config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        if self.optimizer.is_scheduled() && self.steps == 0 {
            return Err(NnError::invalid(
                "steps must be positive for a scheduled optimizer",
            ));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(NnError::invalid(format!(
                "weight_decay must be finite and non-negative, got {}",
                self.weight_decay
            )));
        }
        if self.log_interval == 0 {
            return Err(NnError::invalid("log_interval must be positive"));
        }
        self.backend().map(|_| ())
    }

    pub fn backend(&self) -> Result<FiniteDifference> {
        FiniteDifference::new(self.backend.epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = TrainerConfig::from_toml_str("").unwrap();
        assert_eq!(config, TrainerConfig::default());
        assert_eq!(config.optimizer, OptimizerPolicy::FixedAdaptive { lr: 1e-3 });
    }

    #[test]
    fn test_full_document() {
        let config = TrainerConfig::from_toml_str(
            r#"
            steps = 10
            seed = 7
            weight_decay = 0.0

            [optimizer]
            type = "cyclic_momentum"
            lr_base = 0.001
            lr_high = 0.01
            lr_low = 0.0001
            momentum_high = 0.95
            momentum_low = 0.85

            [device]
            accelerators = 2
            prefer_accelerator = true

            [backend]
            epsilon = 0.01
            "#,
        )
        .unwrap();
        assert_eq!(config.steps, 10);
        assert!(config.optimizer.is_scheduled());
        assert_eq!(config.device.resolve().accelerators(), 2);
        assert!((config.backend().unwrap().epsilon() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = TrainerConfig::from_toml_str("stepz = 3").unwrap_err();
        assert!(matches!(err, NnError::Config(_)));
    }

    #[test]
    fn test_validation_fails_fast() {
        let err = TrainerConfig::from_toml_str(
            r#"
            steps = 0
            [optimizer]
            type = "cyclic_momentum"
            lr_base = 0.001
            lr_high = 0.01
            lr_low = 0.0001
            momentum_high = 0.95
            momentum_low = 0.85
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, NnError::InvalidConfiguration(_)));

        let err = TrainerConfig::from_toml_str("weight_decay = -1.0").unwrap_err();
        assert!(matches!(err, NnError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_policy_json_tag() {
        let json = serde_json::to_value(OptimizerPolicy::FixedAdaptive { lr: 0.5 }).unwrap();
        assert_eq!(json["type"], "fixed_adaptive");
        assert_eq!(json["lr"], 0.5);
    }
}
