//! 三角形（1サイクル）スケジュール
//!
//! `start → peak → end` を2区間の線形補間でつなぐ数列を前計算する。
//! 状態を持たないので、同じ入力からは常に同じ数列が得られ、任意の位置から再開できる。
//!
//! - 前半 `0..=mid`: `start → peak`
//! - 後半 `mid..n`: `peak → end`
//!
//! `mid` は通常 `n / 2`。ただし `n >= 2` のとき末尾が必ず `end` になるよう
//! `n - 2` で頭打ちにする（`n = 2` は `[start, end]`）。

use crate::error::{NnError, Result};

/// 前計算済みの三角形スケジュール
#[derive(Clone, Debug, PartialEq)]
pub struct CyclicSchedule {
    values: Vec<f32>,
    mid: usize,
}

impl CyclicSchedule {
    /// 新しいスケジュールを作成
    ///
    /// `n == 0` は設定エラー。制御点が有限でない場合もエラーにする。
    pub fn new(start: f32, peak: f32, end: f32, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(NnError::invalid("schedule length must be at least 1"));
        }
        if !(start.is_finite() && peak.is_finite() && end.is_finite()) {
            return Err(NnError::invalid(format!(
                "schedule control points must be finite: start={start}, peak={peak}, end={end}"
            )));
        }

        let mid = peak_position(n);
        let values = (0..n)
            .map(|i| {
                if i <= mid {
                    if mid == 0 {
                        start
                    } else {
                        let t = i as f32 / mid as f32;
                        start + (peak - start) * t
                    }
                } else {
                    // i > mid なので n - 1 > mid が保証される
                    let t = (i - mid) as f32 / (n - 1 - mid) as f32;
                    peak + (end - peak) * t
                }
            })
            .collect();

        Ok(Self { values, mid })
    }

    /// 位置 `i`（0始まり）の値。範囲外は最後の値に張り付く。
    #[inline]
    pub fn get(&self, i: usize) -> f32 {
        let last = self.values.len() - 1;
        self.values[i.min(last)]
    }

    /// ピーク位置
    pub fn peak_index(&self) -> usize {
        self.mid
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// `start → peak → end` の三角形スケジュールを長さ `n` で生成
pub fn schedule(start: f32, peak: f32, end: f32, n: usize) -> Result<Vec<f32>> {
    CyclicSchedule::new(start, peak, end, n).map(|s| s.values)
}

#[inline]
fn peak_position(n: usize) -> usize {
    if n >= 2 { (n / 2).min(n - 2) } else { 0 }
}
