//! Base weights of annotations.
//!
//! Every annotation on an (item, field, concept) contributes one base
//! weight; the aggregator multiplies it by the field weight.
//!
//! | Annotation | Base weight |
//! |------------|-------------|
//! | direct, preferred name | `preferred_name_da` |
//! | direct, synonym | `synonym_da` |
//! | direct, reported | `preferred_name_da` |
//! | is-a expansion at level L | [`IsaWeighting::weight`] |
//! | mapping expansion | `mapping_ea` (mapping type ignored) |

use serde::{Deserialize, Serialize};

use crate::models::{DirectSource, Expansion};

/// How the weight of an is-a expansion decays with its level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum IsaWeighting {
    /// L<2→8, L<3→7, L<5→6, L<7→5, L<15→3, else 1.
    #[default]
    Stepwise,
    /// `L div 30`.
    Linear,
    /// `floor(10·e^(−factor·L) + 1)`.
    Exponential { factor: f64 },
}

impl IsaWeighting {
    pub fn weight(&self, level: u32) -> f64 {
        match *self {
            IsaWeighting::Stepwise => stepwise(level),
            IsaWeighting::Linear => f64::from(level / 30),
            IsaWeighting::Exponential { factor } => {
                (10.0 * (-factor * f64::from(level)).exp() + 1.0).floor()
            }
        }
    }

    /// Reject parameters outside their domain.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            IsaWeighting::Exponential { factor } if !(factor > 0.0 && factor < 1.0) => Err(
                format!("exponential is-a factor must be in (0, 1), got {}", factor),
            ),
            _ => Ok(()),
        }
    }
}

fn stepwise(level: u32) -> f64 {
    match level {
        0..=1 => 8.0,
        2 => 7.0,
        3..=4 => 6.0,
        5..=6 => 5.0,
        7..=14 => 3.0,
        _ => 1.0,
    }
}

/// Scoring constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    #[serde(default = "default_preferred_name_da")]
    pub preferred_name_da: f64,
    #[serde(default = "default_synonym_da")]
    pub synonym_da: f64,
    #[serde(default)]
    pub isa: IsaWeighting,
    #[serde(default = "default_mapping_ea")]
    pub mapping_ea: f64,
}

fn default_preferred_name_da() -> f64 {
    10.0
}
fn default_synonym_da() -> f64 {
    8.0
}
fn default_mapping_ea() -> f64 {
    7.0
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            preferred_name_da: default_preferred_name_da(),
            synonym_da: default_synonym_da(),
            isa: IsaWeighting::default(),
            mapping_ea: default_mapping_ea(),
        }
    }
}

impl Weights {
    pub fn direct(&self, source: &DirectSource) -> f64 {
        match source {
            DirectSource::Matcher {
                preferred: true, ..
            } => self.preferred_name_da,
            DirectSource::Matcher {
                preferred: false, ..
            } => self.synonym_da,
            DirectSource::Reported => self.preferred_name_da,
        }
    }

    pub fn expanded(&self, expansion: &Expansion) -> f64 {
        match expansion {
            Expansion::Isa { level } => self.isa.weight(*level),
            Expansion::Mapping { .. } => self.mapping_ea,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("preferred_name_da", self.preferred_name_da),
            ("synonym_da", self.synonym_da),
            ("mapping_ea", self.mapping_ea),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("weights.{} must be a non-negative number", name));
            }
        }
        self.isa.validate()
    }
}
