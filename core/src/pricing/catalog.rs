//! Pricing2Yaml catalog
//!
//! Parses an iPricing document into the canonical names and value types the
//! grounding layer matches against. The grammar is treated as opaque beyond
//! the sections needed here: `features`, `usageLimits`, `plans`, `addOns`,
//! and the top-level `currency`.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::{HarveyError, Result};

/// Declared value type of a feature or usage limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Numeric,
    Text,
}

impl ValueType {
    fn parse(raw: Option<&Value>, default_value: Option<&Value>) -> Self {
        if let Some(Value::String(s)) = raw {
            return match s.to_uppercase().as_str() {
                "BOOLEAN" => Self::Boolean,
                "NUMERIC" => Self::Numeric,
                _ => Self::Text,
            };
        }
        // No declared type: infer from the default value.
        match default_value {
            Some(Value::Bool(_)) => Self::Boolean,
            Some(Value::Number(_)) => Self::Numeric,
            _ => Self::Text,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Numeric => "numeric",
            Self::Text => "text",
        }
    }
}

/// A feature declared in the catalog
#[derive(Debug, Clone)]
pub struct FeatureDef {
    pub name: String,
    pub value_type: ValueType,
}

/// A usage limit declared in the catalog
#[derive(Debug, Clone)]
pub struct UsageLimitDef {
    pub name: String,
    pub value_type: ValueType,
    pub unit: Option<String>,
}

/// Canonical view of one Pricing2Yaml document
#[derive(Debug, Clone)]
pub struct PricingCatalog {
    pub saas_name: Option<String>,
    pub currency: Option<String>,
    features: BTreeMap<String, FeatureDef>,
    usage_limits: BTreeMap<String, UsageLimitDef>,
    plans: Vec<String>,
    add_ons: Vec<String>,
}

impl PricingCatalog {
    /// Parse a Pricing2Yaml document.
    pub fn parse(yaml: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml).map_err(|e| HarveyError::SchemaMismatch {
            path: "$".into(),
            reason: format!("not valid YAML: {e}"),
        })?;
        let mapping = root.as_mapping().ok_or_else(|| HarveyError::SchemaMismatch {
            path: "$".into(),
            reason: "pricing document must be a mapping".into(),
        })?;

        let mut features = BTreeMap::new();
        if let Some(section) = mapping.get("features").and_then(Value::as_mapping) {
            for (key, spec) in section {
                let Some(name) = key.as_str() else { continue };
                let value_type = ValueType::parse(
                    spec.get("valueType"),
                    spec.get("defaultValue"),
                );
                features.insert(
                    name.to_string(),
                    FeatureDef {
                        name: name.to_string(),
                        value_type,
                    },
                );
            }
        }

        let mut usage_limits = BTreeMap::new();
        if let Some(section) = mapping
            .get("usageLimits")
            .and_then(Value::as_mapping)
        {
            for (key, spec) in section {
                let Some(name) = key.as_str() else { continue };
                let value_type = ValueType::parse(
                    spec.get("valueType"),
                    spec.get("defaultValue"),
                );
                let unit = spec
                    .get("unit")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                usage_limits.insert(
                    name.to_string(),
                    UsageLimitDef {
                        name: name.to_string(),
                        value_type,
                        unit,
                    },
                );
            }
        }

        let plans = section_names(mapping, "plans");
        let add_ons = section_names(mapping, "addOns");

        Ok(PricingCatalog {
            saas_name: mapping
                .get("saasName")
                .and_then(Value::as_str)
                .map(str::to_string),
            currency: mapping
                .get("currency")
                .and_then(Value::as_str)
                .map(str::to_string),
            features,
            usage_limits,
            plans,
            add_ons,
        })
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureDef> {
        self.features.get(name)
    }

    pub fn usage_limit(&self, name: &str) -> Option<&UsageLimitDef> {
        self.usage_limits.get(name)
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn usage_limit_names(&self) -> impl Iterator<Item = &str> {
        self.usage_limits.keys().map(String::as_str)
    }

    pub fn plans(&self) -> &[String] {
        &self.plans
    }

    pub fn add_ons(&self) -> &[String] {
        &self.add_ons
    }
}

fn section_names(mapping: &serde_yaml::Mapping, key: &str) -> Vec<String> {
    mapping
        .get(key)
        .and_then(Value::as_mapping)
        .map(|section| {
            section
                .keys()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) const SAMPLE_PRICING_YAML: &str = r#"
saasName: ExampleCRM
currency: USD
features:
  SSO:
    valueType: BOOLEAN
    defaultValue: false
  Audit logs:
    valueType: BOOLEAN
    defaultValue: false
  Support tier:
    valueType: TEXT
    defaultValue: community
usageLimits:
  Seats:
    valueType: NUMERIC
    defaultValue: 1
    unit: user
  API requests per day:
    valueType: NUMERIC
    defaultValue: 1000
    unit: request
  Priority routing:
    valueType: BOOLEAN
    defaultValue: false
plans:
  FREE:
    price: 0
  PRO:
    price: 35.0
  ENTERPRISE:
    price: 90.0
addOns:
  ExtraSeats:
    price: 5.0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_value_types() {
        let catalog = PricingCatalog::parse(SAMPLE_PRICING_YAML).unwrap();
        assert_eq!(catalog.saas_name.as_deref(), Some("ExampleCRM"));
        assert_eq!(catalog.currency.as_deref(), Some("USD"));

        let sso = catalog.feature("SSO").unwrap();
        assert_eq!(sso.value_type, ValueType::Boolean);

        let seats = catalog.usage_limit("Seats").unwrap();
        assert_eq!(seats.value_type, ValueType::Numeric);
        assert_eq!(seats.unit.as_deref(), Some("user"));

        assert_eq!(catalog.plans().len(), 3);
        assert_eq!(catalog.add_ons(), &["ExtraSeats".to_string()]);
    }

    #[test]
    fn value_type_inferred_from_default_when_undeclared() {
        let yaml = "features:\n  Beta access:\n    defaultValue: true\n";
        let catalog = PricingCatalog::parse(yaml).unwrap();
        assert_eq!(
            catalog.feature("Beta access").unwrap().value_type,
            ValueType::Boolean
        );
    }

    #[test]
    fn rejects_non_mapping_documents() {
        assert!(PricingCatalog::parse("- just\n- a\n- list\n").is_err());
        assert!(PricingCatalog::parse(": bad : yaml :").is_err());
    }

    #[test]
    fn missing_sections_yield_empty_catalog() {
        let catalog = PricingCatalog::parse("saasName: Empty\n").unwrap();
        assert_eq!(catalog.feature_names().count(), 0);
        assert_eq!(catalog.usage_limit_names().count(), 0);
    }
}
