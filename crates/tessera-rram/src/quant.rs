//! Analog-domain quantization helpers: activation alignment before the pulse
//! train, and dequantization of the integrated ADC sums afterwards.

use tessera_types::RramTaskSpec;

use crate::fp16::f32_to_f16;

/// Output of aligning a batch of fp16-decomposed activations to the shared
/// exponent the DAC drivers use.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedActivations {
    pub aligned: Vec<i32>,
    pub max_exponent: i32,
    pub p_sum: i64,
    pub a_sum: f64,
}

/// Align sign/exponent/mantissa triples to the maximum exponent.
///
/// Mantissas are the 10 stored bits; the implicit leading one is restored
/// before shifting. Values shifted 16 or more places collapse to zero.
pub fn align_activations(signs: &[u8], exponents: &[i32], mantissas: &[u32]) -> AlignedActivations {
    debug_assert_eq!(signs.len(), exponents.len());
    debug_assert_eq!(signs.len(), mantissas.len());

    let max_exponent = exponents.iter().copied().max().unwrap_or(0);
    let mut aligned = Vec::with_capacity(signs.len());
    let mut p_sum = 0i64;
    let mut a_sum = 0f64;
    for ((&sign, &exponent), &mantissa) in signs.iter().zip(exponents).zip(mantissas) {
        let full = 0x400 | (mantissa & 0x3FF);
        let shift = max_exponent - exponent;
        let magnitude = if shift >= 16 { 0 } else { full >> shift };
        let value = if sign == 0 {
            magnitude as i32
        } else {
            -(magnitude as i32)
        };
        aligned.push(value);
        p_sum += i64::from(value);
        a_sum += f64::from(value) * 2f64.powi(exponent - max_exponent);
    }
    AlignedActivations {
        aligned,
        max_exponent,
        p_sum,
        a_sum,
    }
}

/// Decompose f32 activations through their fp16 representation and align
/// them. This is the path real workloads take: the driver hands the stage
/// phase raw activation values and the DAC sees aligned mantissas.
pub fn align_fp16_values(values: &[f32]) -> AlignedActivations {
    let mut signs = Vec::with_capacity(values.len());
    let mut exponents = Vec::with_capacity(values.len());
    let mut mantissas = Vec::with_capacity(values.len());
    for &v in values {
        let bits = f32_to_f16(v);
        signs.push((bits >> 15) as u8);
        exponents.push(i32::from((bits >> 10) & 0x1F));
        mantissas.push(u32::from(bits & 0x3FF));
    }
    align_activations(&signs, &exponents, &mantissas)
}

/// Result of dequantizing one CIM op.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultSummary {
    /// Integrated mantissa sum before exponent scaling.
    pub raw_om: i64,
    pub final_value: f64,
    /// Present when the task spec supplied an expected value.
    pub reference: Option<f64>,
    pub scale: f64,
    pub zero_point: f64,
}

/// Dequantize the integrated sums of a finished op.
pub fn finalize_result(
    i_sum: i64,
    p_sum: i64,
    max_exponent: i32,
    spec: &RramTaskSpec,
    a_sum: f64,
) -> ResultSummary {
    let o_m = i_sum - p_sum * 8;
    let o_e = max_exponent - 10;
    let actual_exp = o_e - 15;
    let o = o_m as f64 * 2f64.powi(actual_exp);
    let final_value = o * spec.scale - a_sum * spec.zero_point * spec.scale;
    ResultSummary {
        raw_om: o_m,
        final_value,
        reference: spec.expected,
        scale: spec.scale,
        zero_point: spec.zero_point,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_shifts_against_the_max_exponent() {
        let out = align_activations(&[0, 0], &[15, 13], &[0, 0]);
        assert_eq!(out.max_exponent, 15);
        // 0x400 unshifted, 0x400 >> 2.
        assert_eq!(out.aligned, vec![0x400, 0x100]);
        assert_eq!(out.p_sum, 0x500);
        let expect_a = f64::from(0x400u32) + f64::from(0x100u32) * 0.25;
        assert!((out.a_sum - expect_a).abs() < 1e-9);
    }

    #[test]
    fn negative_signs_subtract() {
        let out = align_activations(&[1], &[10], &[0x3FF]);
        assert_eq!(out.aligned, vec![-0x7FF]);
        assert_eq!(out.p_sum, -0x7FF);
    }

    #[test]
    fn deep_shift_collapses_to_zero() {
        let out = align_activations(&[0, 0], &[20, 2], &[5, 5]);
        assert_eq!(out.aligned[1], 0);
    }

    #[test]
    fn dequantization_formula() {
        let spec = RramTaskSpec {
            scale: 0.5,
            zero_point: 2.0,
            expected: Some(1.0),
            ..Default::default()
        };
        let summary = finalize_result(100, 4, 25, &spec, 3.0);
        assert_eq!(summary.raw_om, 100 - 32);
        // o_e = 15, actual_exp = 0, o = 68.
        assert!((summary.final_value - (68.0 * 0.5 - 3.0 * 2.0 * 0.5)).abs() < 1e-12);
        assert_eq!(summary.reference, Some(1.0));
    }

    #[test]
    fn fp16_value_alignment_matches_manual_decomposition() {
        // 1.0 = 0x3C00 (exp 15, mant 0); 0.25 = 0x3400 (exp 13, mant 0).
        let out = align_fp16_values(&[1.0, 0.25]);
        assert_eq!(out.max_exponent, 15);
        assert_eq!(out.aligned, vec![0x400, 0x100]);
    }

    #[test]
    fn reference_is_omitted_without_expected() {
        let spec = RramTaskSpec::default();
        let summary = finalize_result(1, 0, 25, &spec, 0.0);
        assert!(summary.reference.is_none());
    }
}
