/// Platinum RTD temperature conversion (Callendar–Van Dusen)
///
/// The sensor reports the raw 15-bit ADC code of a ratiometric measurement
/// against a reference resistor. At or above R0 the full quadratic relation
/// `R = R0 (1 + A t + B t²)` is solved for `t`; below R0 a fitted quadratic
/// is used instead.
const CVD_A: f64 = 3.9083e-3;
const CVD_B: f64 = -5.775e-7;

// Fitted quadratic for a platinum element below R0, normalised to R0.
const PT_FIT: [f64; 3] = [-6.1414e-7, 3.907359803e-3, 0.9999979];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveBranch {
    Full,
    Approximation,
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("negative discriminant converting {resistance:.2} Ω ({branch:?} branch)")]
pub struct ConversionError {
    pub resistance: f64,
    pub branch: CurveBranch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtdCurve {
    pub adc_full_scale: f64,
    pub reference_ohms: f64,
    pub nominal_ohms: f64,
    /// `[a, b, c]` of `R / R0 = a t² + b t + c`, used below R0.
    pub fit: [f64; 3],
}

impl Default for RtdCurve {
    /// PT1000 against a 1.5 kΩ reference, 15-bit ADC.
    fn default() -> Self {
        RtdCurve {
            adc_full_scale: 32767.0,
            reference_ohms: 1500.0,
            nominal_ohms: 1000.0,
            fit: PT_FIT,
        }
    }
}

impl RtdCurve {
    pub fn resistance(&self, code: u16) -> f64 {
        f64::from(code) / self.adc_full_scale * self.reference_ohms
    }

    pub fn branch(&self, resistance: f64) -> CurveBranch {
        if resistance >= self.nominal_ohms {
            CurveBranch::Full
        } else {
            CurveBranch::Approximation
        }
    }

    /// Degrees Celsius for an ADC code.
    pub fn celsius(&self, code: u16) -> Result<f64, ConversionError> {
        self.celsius_from_resistance(self.resistance(code))
    }

    pub fn celsius_from_resistance(&self, resistance: f64) -> Result<f64, ConversionError> {
        let branch = self.branch(resistance);
        let r0 = self.nominal_ohms;
        let root = match branch {
            CurveBranch::Full => positive_root(CVD_B, CVD_A, 1.0 - resistance / r0),
            CurveBranch::Approximation => {
                let [a, b, c] = self.fit;
                positive_root(a * r0, b * r0, c * r0 - resistance)
            }
        };
        root.ok_or(ConversionError { resistance, branch })
    }
}

/// `(-b + √(b² − 4ac)) / 2a`, or `None` when the discriminant is negative.
fn positive_root(a: f64, b: f64, c: f64) -> Option<f64> {
    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 || !discriminant.is_finite() {
        return None;
    }
    Some((-b + discriminant.sqrt()) / (2.0 * a))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One ohm per ADC count makes resistances easy to hit exactly.
    fn unit_curve() -> RtdCurve {
        RtdCurve {
            adc_full_scale: 1.0,
            reference_ohms: 1.0,
            ..RtdCurve::default()
        }
    }

    #[test]
    fn test_branch_boundary() {
        let curve = unit_curve();
        assert_eq!(curve.resistance(1000), 1000.0);
        assert_eq!(curve.branch(curve.resistance(1000)), CurveBranch::Full);
        assert_eq!(curve.branch(curve.resistance(999)), CurveBranch::Approximation);
    }

    #[test]
    fn test_zero_celsius_at_nominal() {
        let t = unit_curve().celsius(1000).unwrap();
        assert!(t.abs() < 1e-9, "got {}", t);
    }

    #[test]
    fn test_branches_agree_near_nominal() {
        let curve = unit_curve();
        let below = curve.celsius(999).unwrap();
        // about -0.256 °C for a PT1000
        assert!((below + 0.256).abs() < 0.01, "got {}", below);
        let above = curve.celsius(1100).unwrap();
        assert!((above - 25.68).abs() < 0.05, "got {}", above);
    }

    #[test]
    fn test_default_curve_room_temperature() {
        let curve = RtdCurve::default();
        // 1097.35 Ω is roughly 25 °C
        let code = (1097.35 / 1500.0 * 32767.0_f64).round() as u16;
        let t = curve.celsius(code).unwrap();
        assert!((t - 25.0).abs() < 0.1, "got {}", t);
    }

    #[test]
    fn test_full_branch_negative_discriminant() {
        // a PT100 read through this front end saturates far past the curve
        let curve = RtdCurve {
            nominal_ohms: 100.0,
            ..RtdCurve::default()
        };
        let err = curve.celsius(u16::MAX).unwrap_err();
        assert_eq!(err.branch, CurveBranch::Full);
    }

    #[test]
    fn test_approximation_negative_discriminant() {
        // a fit opening upwards has no root far below its vertex
        let curve = RtdCurve {
            fit: [1e-3, 1e-3, 1.0],
            ..unit_curve()
        };
        let err = curve.celsius(500).unwrap_err();
        assert_eq!(err.branch, CurveBranch::Approximation);
        assert_eq!(err.resistance, 500.0);
    }

    #[test]
    fn test_nan_resistance_fails_cleanly() {
        assert!(RtdCurve::default().celsius_from_resistance(f64::NAN).is_err());
    }
}
