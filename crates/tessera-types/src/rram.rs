use serde::{Deserialize, Serialize};

/// Sub-phase of a compute-in-memory op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RramPhase {
    /// Activation alignment / DAC staging.
    Stage,
    /// Pulse train + ADC sampling.
    Execute,
    /// Digital postprocess (dequantization).
    Post,
    /// Whole-op composite when the command does not split phases.
    Unknown,
}

/// Identity of a resident weight chunk: `(tile, array, tag)`.
///
/// Tags compare case-insensitively; construction lowercases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightKey {
    pub tile_id: u32,
    pub array_id: u32,
    pub tag: String,
}

impl WeightKey {
    pub fn new(tile_id: u32, array_id: u32, tag: &str) -> Self {
        Self {
            tile_id,
            array_id,
            tag: tag.to_ascii_lowercase(),
        }
    }
}

/// Problem description handed from the platform driver to an RRAM chiplet.
#[derive(Debug, Clone, PartialEq)]
pub struct RramTaskSpec {
    pub activation_bits: u32,
    pub slice_bits: u32,
    pub pulse_count: u64,
    pub adc_samples: u64,
    pub pre_cycles: u64,
    pub post_cycles: u64,
    pub i_sum: i64,
    pub p_sum: i64,
    pub a_sum: f64,
    pub max_exponent: i32,
    pub scale: f64,
    pub zero_point: f64,
    pub rows: u64,
    pub cols: u64,
    pub depth: u64,
    pub activation_size: u64,
    pub weight_size: u64,
    pub output_size: u64,
    pub weight: WeightKey,
    pub phase: RramPhase,
    pub expected: Option<f64>,
}

impl Default for RramTaskSpec {
    fn default() -> Self {
        Self {
            activation_bits: 16,
            slice_bits: 4,
            pulse_count: 0,
            adc_samples: 0,
            pre_cycles: 0,
            post_cycles: 0,
            i_sum: 0,
            p_sum: 0,
            a_sum: 0.0,
            max_exponent: 0,
            scale: 1.0,
            zero_point: 0.0,
            rows: 0,
            cols: 0,
            depth: 0,
            activation_size: 0,
            weight_size: 0,
            output_size: 0,
            weight: WeightKey::new(0, 0, ""),
            phase: RramPhase::Unknown,
            expected: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_key_tag_is_case_insensitive() {
        assert_eq!(WeightKey::new(1, 2, "Expert0"), WeightKey::new(1, 2, "expert0"));
    }
}
