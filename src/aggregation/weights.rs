//! Quality-weighted averaging of learning deltas
//!
//! Deltas are little-endian `f32` vectors. Producers with a non-positive (or
//! non-finite) quality score, an unreadable blob, or a dimension that differs
//! from the reference update are left out of the sum and of the
//! normalization.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::domain::{EntityId, LearningUpdate};
use crate::error::{AgoraError, Result};

/// Decode a little-endian `f32` blob
pub fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AgoraError::Validation(format!(
            "delta length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_f32_le(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Hex SHA-256 of a blob
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Result of averaging one cycle's updates
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedAggregate {
    pub weights: Vec<f32>,
    /// producer -> normalized weight, over contributors only
    pub normalized: BTreeMap<EntityId, f64>,
    pub excluded: Vec<EntityId>,
}

impl WeightedAggregate {
    pub fn contributors(&self) -> Vec<EntityId> {
        self.normalized.keys().cloned().collect()
    }

    pub fn encoded(&self) -> Vec<u8> {
        encode_f32_le(&self.weights)
    }
}

/// `Σ (q_i / Σ q_j) · delta_i` over producers with `q_i > 0`
///
/// Fails with `NoValidUpdates` when every update is excluded.
pub fn weighted_average<'a>(
    cycle_id: u64,
    updates: impl IntoIterator<Item = &'a LearningUpdate>,
) -> Result<WeightedAggregate> {
    let mut updates: Vec<&LearningUpdate> = updates.into_iter().collect();
    updates.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));

    let mut excluded = Vec::new();
    let mut valid: Vec<(&LearningUpdate, Vec<f32>)> = Vec::with_capacity(updates.len());
    for update in updates {
        if !(update.quality_score.is_finite() && update.quality_score > 0.0) {
            excluded.push(update.producer_id.clone());
            continue;
        }
        match decode_f32_le(&update.delta_weights) {
            Ok(delta) if !delta.is_empty() => valid.push((update, delta)),
            _ => excluded.push(update.producer_id.clone()),
        }
    }

    // Reference dimension: highest-quality update, ties to the lowest id
    let dimension = valid
        .iter()
        .fold(None::<(f64, usize)>, |best, (u, d)| match best {
            Some((q, _)) if q >= u.quality_score => best,
            _ => Some((u.quality_score, d.len())),
        })
        .map(|(_, len)| len);
    let Some(dimension) = dimension else {
        return Err(AgoraError::NoValidUpdates { cycle_id });
    };

    valid.retain(|(u, d)| {
        let keep = d.len() == dimension;
        if !keep {
            excluded.push(u.producer_id.clone());
        }
        keep
    });

    let total: f64 = valid.iter().map(|(u, _)| u.quality_score).sum();
    let mut sum = vec![0f64; dimension];
    let mut normalized = BTreeMap::new();
    for (update, delta) in &valid {
        let weight = update.quality_score / total;
        for (acc, value) in sum.iter_mut().zip(delta) {
            *acc += weight * f64::from(*value);
        }
        normalized.insert(update.producer_id.clone(), weight);
    }

    excluded.sort();
    Ok(WeightedAggregate {
        weights: sum.into_iter().map(|v| v as f32).collect(),
        normalized,
        excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(producer: &str, delta: &[f32], quality: f64) -> LearningUpdate {
        LearningUpdate::new(producer, 1, encode_f32_le(delta), quality)
    }

    fn close(a: f32, b: f64) -> bool {
        (f64::from(a) - b).abs() < 1e-5
    }

    #[test]
    fn test_zero_quality_is_excluded_not_zero_weighted() {
        let updates = vec![
            update("a", &[1.0, 2.0], 0.8),
            update("b", &[3.0, -1.0], 0.6),
            update("c", &[100.0, 100.0], 0.0),
        ];
        let aggregate = weighted_average(1, &updates).unwrap();

        assert!(close(aggregate.weights[0], 0.8 / 1.4 * 1.0 + 0.6 / 1.4 * 3.0));
        assert!(close(aggregate.weights[1], 0.8 / 1.4 * 2.0 + 0.6 / 1.4 * -1.0));
        assert_eq!(aggregate.excluded, vec!["c".to_string()]);
        assert_eq!(aggregate.contributors(), vec!["a".to_string(), "b".to_string()]);

        let weight_sum: f64 = aggregate.normalized.values().sum();
        assert!((weight_sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_all_excluded_is_no_valid_updates() {
        let updates = vec![update("a", &[1.0], 0.0), update("b", &[1.0], -0.3)];
        assert!(matches!(
            weighted_average(7, &updates),
            Err(AgoraError::NoValidUpdates { cycle_id: 7 })
        ));
    }

    #[test]
    fn test_malformed_and_mismatched_deltas_are_excluded() {
        let mut torn = update("b", &[1.0, 1.0], 0.5);
        torn.delta_weights.pop();
        let updates = vec![
            update("a", &[2.0, 4.0], 0.9),
            torn,
            update("c", &[1.0, 1.0, 1.0], 0.4),
        ];
        let aggregate = weighted_average(1, &updates).unwrap();
        assert_eq!(aggregate.weights, vec![2.0, 4.0]);
        assert_eq!(aggregate.excluded, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(decode_f32_le(&encode_f32_le(&[0.5, -2.0])).unwrap(), vec![0.5, -2.0]);
    }
}
