//! Usage index (`indice_u`) to floor-area ratio (`ibus`) conversion.
//!
//! The calculator only sees [`IbusConversion`]; the jurisdiction table is
//! swappable.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMethod {
    /// Input matched a table point.
    Exact,
    /// Linear interpolation between two table points.
    Interpolated,
    /// Input outside the table domain; `max(u * 1.333, 0.5)`.
    OutOfDomainFormula,
}

impl ConversionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Interpolated => "interpolated",
            Self::OutOfDomainFormula => "out_of_domain_formula",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub value: f64,
    pub method: ConversionMethod,
}

pub trait IbusConversion: Send + Sync {
    fn convert(&self, indice_u: f64) -> Conversion;

    /// Short label recorded in calculation details.
    fn name(&self) -> &str;
}

// ── Valais reference table ────────────────────────────────────

const EXACT_TOLERANCE: f64 = 0.001;
const OUT_OF_DOMAIN_FACTOR: f64 = 1.333;
const OUT_OF_DOMAIN_FLOOR: f64 = 0.5;

const VALAIS_TABLE: [(f64, f64); 11] = [
    (0.35, 0.50),
    (0.40, 0.53),
    (0.45, 0.60),
    (0.50, 0.67),
    (0.55, 0.73),
    (0.60, 0.80),
    (0.65, 0.87),
    (0.70, 0.93),
    (0.75, 1.00),
    (0.80, 1.07),
    (0.85, 1.13),
];

/// Piecewise-linear table over ascending, strictly increasing points.
#[derive(Debug, Clone, PartialEq)]
pub struct ValaisConversionTable {
    points: Vec<(f64, f64)>,
}

impl Default for ValaisConversionTable {
    fn default() -> Self {
        Self {
            points: VALAIS_TABLE.to_vec(),
        }
    }
}

impl ValaisConversionTable {
    /// Custom table. Points are sorted by index; non-finite points are dropped.
    pub fn with_points(mut points: Vec<(f64, f64)>) -> Self {
        points.retain(|(u, i)| u.is_finite() && i.is_finite());
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }
}

impl IbusConversion for ValaisConversionTable {
    fn convert(&self, indice_u: f64) -> Conversion {
        if let Some(&(_, ibus)) = self
            .points
            .iter()
            .find(|(u, _)| (u - indice_u).abs() < EXACT_TOLERANCE)
        {
            return Conversion {
                value: ibus,
                method: ConversionMethod::Exact,
            };
        }

        for pair in self.points.windows(2) {
            let (u1, i1) = pair[0];
            let (u2, i2) = pair[1];
            if indice_u >= u1 && indice_u <= u2 {
                let ratio = (indice_u - u1) / (u2 - u1);
                return Conversion {
                    value: i1 + ratio * (i2 - i1),
                    method: ConversionMethod::Interpolated,
                };
            }
        }

        Conversion {
            value: (indice_u * OUT_OF_DOMAIN_FACTOR).max(OUT_OF_DOMAIN_FLOOR),
            method: ConversionMethod::OutOfDomainFormula,
        }
    }

    fn name(&self) -> &str {
        "valais_indice_u_to_ibus"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ValaisConversionTable {
        ValaisConversionTable::default()
    }

    #[test]
    fn test_exact_point() {
        let c = table().convert(0.5);
        assert_eq!(c.value, 0.67);
        assert_eq!(c.method, ConversionMethod::Exact);
    }

    #[test]
    fn test_exact_within_tolerance() {
        let c = table().convert(0.7004);
        assert_eq!(c.value, 0.93);
        assert_eq!(c.method, ConversionMethod::Exact);
    }

    #[test]
    fn test_interpolated_midpoint() {
        let c = table().convert(0.525);
        assert_eq!(c.method, ConversionMethod::Interpolated);
        assert!((c.value - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_domain_high() {
        let c = table().convert(1.2);
        assert_eq!(c.method, ConversionMethod::OutOfDomainFormula);
        assert!((c.value - 1.5996).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_domain_low_is_floored() {
        let c = table().convert(0.2);
        assert_eq!(c.method, ConversionMethod::OutOfDomainFormula);
        assert_eq!(c.value, 0.5);
    }

    #[test]
    fn test_monotonic_over_domain() {
        let t = table();
        let mut prev = t.convert(0.35).value;
        let mut u = 0.35;
        while u <= 0.85 {
            let v = t.convert(u).value;
            assert!(v + 1e-12 >= prev, "not monotonic at {u}");
            prev = v;
            u += 0.0137;
        }
    }

    #[test]
    fn test_custom_table_sorted() {
        let t = ValaisConversionTable::with_points(vec![(1.0, 2.0), (0.0, 0.0), (f64::NAN, 1.0)]);
        assert_eq!(t.points(), &[(0.0, 0.0), (1.0, 2.0)]);
        assert!((t.convert(0.5).value - 1.0).abs() < 1e-12);
    }
}
