//! NaN detection (spec §4.8, §7 error kind 3): fatal for the batch, and
//! must be checked before any slot is committed, matching
//! `_detect_nan_if_needed` in the source worker.

use candle_core::Tensor;

use crate::error::{Result, WorkerError};

/// Checks `logits` for NaNs when `enabled`. No-op otherwise (NaN
/// detection is opt-in per `speculative_worker_config.enable_nan_detection`
/// since the check itself costs a host sync on real device tensors).
pub fn detect_nan(logits: &Tensor, enabled: bool) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let has_nan = logits
        .to_dtype(candle_core::DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| WorkerError::Numeric(format!("failed to inspect logits for NaN: {e}")))?
        .iter()
        .any(|v| v.is_nan());

    if has_nan {
        return Err(WorkerError::Numeric(
            "detected errors during sampling: NaN in the logits".into(),
        )
        .log());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn passes_on_finite_logits() {
        let t = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        assert!(detect_nan(&t, true).is_ok());
    }

    #[test]
    fn rejects_nan_when_enabled() {
        let t = Tensor::new(&[1.0f32, f32::NAN, 3.0], &Device::Cpu).unwrap();
        assert!(detect_nan(&t, true).is_err());
    }

    #[test]
    fn skips_check_when_disabled() {
        let t = Tensor::new(&[f32::NAN], &Device::Cpu).unwrap();
        assert!(detect_nan(&t, false).is_ok());
    }
}
