use async_trait::async_trait;
use tracing::debug;

use super::coordinator::Validator;
use super::weights::decode_f32_le;
use crate::error::{AgoraError, Result};

/// Scores an aggregate by its magnitude: `1 - min(‖w‖₂ / max_norm, 1)`
///
/// Used when no external evaluation harness is attached. An exploding
/// aggregate scores 0; an empty or non-finite one is an error.
#[derive(Debug, Clone, Copy)]
pub struct NormValidator {
    max_norm: f64,
}

impl NormValidator {
    pub fn new(max_norm: f64) -> Self {
        Self {
            max_norm: if max_norm.is_finite() && max_norm > 0.0 {
                max_norm
            } else {
                1.0
            },
        }
    }
}

impl Default for NormValidator {
    fn default() -> Self {
        Self::new(10.0)
    }
}

#[async_trait]
impl Validator for NormValidator {
    async fn validate(&self, cycle_id: u64, candidate: &[u8]) -> Result<f64> {
        let weights = decode_f32_le(candidate)?;
        if weights.is_empty() {
            return Err(AgoraError::Validation(format!(
                "cycle {} aggregate is empty",
                cycle_id
            )));
        }
        let norm = weights
            .iter()
            .map(|w| f64::from(*w).powi(2))
            .sum::<f64>()
            .sqrt();
        if !norm.is_finite() {
            return Err(AgoraError::Validation(format!(
                "cycle {} aggregate has non-finite weights",
                cycle_id
            )));
        }
        let score = 1.0 - (norm / self.max_norm).min(1.0);
        debug!("Cycle {} aggregate norm {:.4}, score {:.4}", cycle_id, norm, score);
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::weights::encode_f32_le;

    #[tokio::test]
    async fn test_score_falls_with_norm() {
        let validator = NormValidator::new(10.0);
        let small = validator.validate(1, &encode_f32_le(&[3.0, 4.0])).await.unwrap();
        let huge = validator.validate(1, &encode_f32_le(&[300.0, 400.0])).await.unwrap();
        assert!((small - 0.5).abs() < 1e-9);
        assert_eq!(huge, 0.0);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_non_finite() {
        let validator = NormValidator::default();
        assert!(validator.validate(1, &[]).await.is_err());
        assert!(validator
            .validate(1, &encode_f32_le(&[f32::INFINITY]))
            .await
            .is_err());
    }
}
