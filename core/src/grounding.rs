//! Filter grounding
//!
//! Maps free-form user filter terms to the canonical feature and usage-limit
//! names declared in the pricing catalog. Nothing leaves this layer unless
//! every name exists in the authoritative YAML, so downstream solver calls
//! never see hallucinated identifiers.
//!
//! Matching pipeline: exact → case-insensitive → normalized (strip
//! non-alphanumerics, lowercase) → Levenshtein tie-break with a distance
//! cap. The pipeline is a policy toggle; `Exact` disables the fuzzy steps.
//!
//! A usage-limit key may carry an explicit measurement unit as a trailing
//! parenthesis, e.g. `"Seats (user)": 200`. The unit is compared verbatim
//! against the catalog's declared `unit` (modulo case and plural); there is
//! no unit conversion, a different unit is rejected as `UnitMismatch`.
//! Value-type coercion (boolean limits take 0/1, text limits take no
//! number) is a separate check and applies whether or not a unit is given.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{HarveyError, Result};
use crate::pricing::catalog::{PricingCatalog, ValueType};

/// Name-matching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Only exact names are accepted
    Exact,
    /// Full pipeline with a Levenshtein distance cap
    Fuzzy { max_distance: usize },
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::Fuzzy { max_distance: 3 }
    }
}

/// Filter object accepted by the solver-facing tools.
///
/// `usageLimits` is a list of single-key objects, each mapping a usage-limit
/// name to a minimum threshold (1 requires a boolean limit to be present).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usage_limits: Vec<BTreeMap<String, f64>>,
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        self.min_price.is_none()
            && self.max_price.is_none()
            && self.features.is_empty()
            && self.usage_limits.is_empty()
    }
}

/// Ground a filter object against the catalog, rewriting every name to its
/// canonical form. Price bounds pass through unchanged after range checks.
pub fn ground_filters(
    catalog: &PricingCatalog,
    filters: &FilterCriteria,
    policy: MatchPolicy,
) -> Result<FilterCriteria> {
    check_price_range(filters)?;

    let mut features = Vec::new();
    for requested in &filters.features {
        let candidates: Vec<&str> = catalog.feature_names().collect();
        let canonical = match_name(requested, &candidates, policy)
            .ok_or_else(|| HarveyError::UnknownFeature {
                name: requested.clone(),
            })?;
        if !features.contains(&canonical) {
            features.push(canonical);
        }
    }

    let mut usage_limits = Vec::new();
    for entry in &filters.usage_limits {
        for (requested, value) in entry {
            let candidates: Vec<&str> = catalog.usage_limit_names().collect();

            // A parenthesised suffix is an explicit unit, unless the whole
            // string is itself a declared limit name.
            let (canonical, provided_unit) = match split_unit_suffix(requested) {
                (bare, Some(unit)) if !candidates.contains(&requested.as_str()) => {
                    let canonical = match_name(bare, &candidates, policy).ok_or_else(|| {
                        HarveyError::UnknownUsageLimit {
                            name: requested.clone(),
                        }
                    })?;
                    (canonical, Some(unit))
                }
                _ => {
                    let canonical = match_name(requested, &candidates, policy).ok_or_else(
                        || HarveyError::UnknownUsageLimit {
                            name: requested.clone(),
                        },
                    )?;
                    (canonical, None)
                }
            };

            let def = catalog.usage_limit(&canonical).ok_or_else(|| {
                HarveyError::internal(format!("matched usage limit '{canonical}' missing from catalog"))
            })?;

            if let Some(provided) = provided_unit {
                match &def.unit {
                    Some(expected) if units_match(expected, provided) => {}
                    Some(expected) => {
                        return Err(HarveyError::UnitMismatch {
                            name: canonical.clone(),
                            expected: expected.clone(),
                            provided: provided.to_string(),
                        });
                    }
                    None => {
                        return Err(HarveyError::UnitMismatch {
                            name: canonical.clone(),
                            expected: "no declared unit".into(),
                            provided: provided.to_string(),
                        });
                    }
                }
            }
            match def.value_type {
                ValueType::Numeric => {
                    if *value < 0.0 {
                        return Err(HarveyError::InvalidRange {
                            message: format!(
                                "usage limit '{canonical}' threshold must be non-negative, got {value}"
                            ),
                        });
                    }
                }
                ValueType::Boolean => {
                    if *value != 0.0 && *value != 1.0 {
                        return Err(HarveyError::UnitMismatch {
                            name: canonical.clone(),
                            expected: "boolean flag (0 or 1)".into(),
                            provided: value.to_string(),
                        });
                    }
                }
                ValueType::Text => {
                    return Err(HarveyError::UnitMismatch {
                        name: canonical.clone(),
                        expected: "text".into(),
                        provided: format!("number {value}"),
                    });
                }
            }

            let mut grounded = BTreeMap::new();
            grounded.insert(canonical, *value);
            usage_limits.push(grounded);
        }
    }

    Ok(FilterCriteria {
        min_price: filters.min_price,
        max_price: filters.max_price,
        features,
        usage_limits,
    })
}

fn check_price_range(filters: &FilterCriteria) -> Result<()> {
    if let Some(min) = filters.min_price {
        if min < 0.0 {
            return Err(HarveyError::InvalidRange {
                message: format!("minPrice must be non-negative, got {min}"),
            });
        }
    }
    if let Some(max) = filters.max_price {
        if max < 0.0 {
            return Err(HarveyError::InvalidRange {
                message: format!("maxPrice must be non-negative, got {max}"),
            });
        }
    }
    if let (Some(min), Some(max)) = (filters.min_price, filters.max_price) {
        if min > max {
            return Err(HarveyError::InvalidRange {
                message: format!("minPrice {min} exceeds maxPrice {max}"),
            });
        }
    }
    Ok(())
}

/// Resolve one requested name against the candidate list.
fn match_name(requested: &str, candidates: &[&str], policy: MatchPolicy) -> Option<String> {
    if candidates.iter().any(|c| *c == requested) {
        return Some(requested.to_string());
    }
    let MatchPolicy::Fuzzy { max_distance } = policy else {
        return None;
    };

    let requested_lower = requested.to_lowercase();
    if let Some(found) = candidates
        .iter()
        .find(|c| c.to_lowercase() == requested_lower)
    {
        return Some(found.to_string());
    }

    let requested_norm = normalize(requested);
    if let Some(found) = candidates.iter().find(|c| normalize(c) == requested_norm) {
        return Some(found.to_string());
    }

    // Last resort: closest candidate by edit distance over normalized forms.
    candidates
        .iter()
        .map(|c| (strsim::levenshtein(&normalize(c), &requested_norm), *c))
        .filter(|(distance, _)| *distance <= max_distance)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, c)| c.to_string())
}

/// Strip non-alphanumerics and lowercase
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Split a trailing parenthesised unit off a usage-limit key:
/// `"Seats (user)"` → `("Seats", Some("user"))`.
fn split_unit_suffix(raw: &str) -> (&str, Option<&str>) {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_suffix(')') {
        if let Some(open) = stripped.rfind('(') {
            let unit = stripped[open + 1..].trim();
            let name = stripped[..open].trim();
            if !unit.is_empty() && !name.is_empty() {
                return (name, Some(unit));
            }
        }
    }
    (trimmed, None)
}

/// Units compare verbatim modulo case, punctuation and a plural `s`; no
/// conversion between different units.
fn units_match(expected: &str, provided: &str) -> bool {
    canonical_unit(expected) == canonical_unit(provided)
}

fn canonical_unit(unit: &str) -> String {
    let normalized = normalize(unit);
    match normalized.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => normalized,
    }
}
