//! Pricing-context working set
//!
//! Items placed into a session's context by the user, the UI, or the agent
//! itself. Items are held in an append-only arena keyed by opaque ids;
//! nothing ever mutates an item's kind or origin after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarveyError, Result};

/// What a context item holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Url,
    Yaml,
}

/// Who put the item into the working set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOrigin {
    User,
    Detected,
    Preset,
    Agent,
    Sphere,
}

/// Transformation lifecycle of a url item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state", content = "cause")]
pub enum TransformState {
    NotStarted,
    Pending,
    Done,
    Failed(String),
}

/// One entry in the agent's working set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingContextItem {
    pub id: Uuid,
    pub kind: ItemKind,
    pub origin: ItemOrigin,
    /// Raw YAML text for yaml items, the canonical URL string for url items
    pub value: String,
    pub transform: TransformState,
    /// Reference to the transformed YAML (blob id or cache key) once done
    pub artifact_ref: Option<String>,
    pub label: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl PricingContextItem {
    pub fn url(origin: ItemOrigin, canonical: &CanonicalUrl) -> Self {
        PricingContextItem {
            id: Uuid::new_v4(),
            kind: ItemKind::Url,
            origin,
            value: canonical.as_str().to_string(),
            transform: TransformState::NotStarted,
            artifact_ref: None,
            label: None,
            uploaded_at: Utc::now(),
        }
    }

    pub fn yaml(origin: ItemOrigin, content: String, label: Option<String>) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(HarveyError::BadRequest {
                message: "yaml context item must not be empty".into(),
            });
        }
        Ok(PricingContextItem {
            id: Uuid::new_v4(),
            kind: ItemKind::Yaml,
            origin,
            value: content,
            transform: TransformState::Done,
            artifact_ref: None,
            label,
            uploaded_at: Utc::now(),
        })
    }

    /// Record a completed transformation; only meaningful for url items.
    pub fn mark_done(&mut self, artifact_ref: String) {
        self.transform = TransformState::Done;
        self.artifact_ref = Some(artifact_ref);
    }

    pub fn mark_failed(&mut self, cause: impl Into<String>) {
        self.transform = TransformState::Failed(cause.into());
    }
}

/// Append-only arena of context items
#[derive(Debug, Default)]
pub struct ContextArena {
    items: Vec<PricingContextItem>,
}

impl ContextArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item, enforcing id uniqueness.
    pub fn insert(&mut self, item: PricingContextItem) -> Result<Uuid> {
        if self.items.iter().any(|existing| existing.id == item.id) {
            return Err(HarveyError::internal(format!(
                "duplicate context item id {}",
                item.id
            )));
        }
        let id = item.id;
        self.items.push(item);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<&PricingContextItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut PricingContextItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PricingContextItem> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PricingContextItem> {
        self.items.iter_mut()
    }

    /// Find a url item by its canonical URL string.
    pub fn find_url(&self, canonical: &str) -> Option<&PricingContextItem> {
        self.items
            .iter()
            .find(|item| item.kind == ItemKind::Url && item.value == canonical)
    }

    /// Build the alias map for uploaded YAML content: a single upload gets
    /// the canonical alias, multiple uploads get numbered aliases.
    pub fn yaml_alias_map(&self) -> Vec<(String, String)> {
        let yamls: Vec<&PricingContextItem> = self
            .items
            .iter()
            .filter(|item| item.kind == ItemKind::Yaml)
            .collect();
        match yamls.len() {
            0 => Vec::new(),
            1 => vec![("uploaded://pricing".to_string(), yamls[0].value.clone())],
            _ => yamls
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    (format!("uploaded://pricing/{}", index + 1), item.value.clone())
                })
                .collect(),
        }
    }
}

/// Canonical form of a pricing URL: lowercased scheme and host, default port
/// stripped, fragment removed, trailing slash trimmed (except for the root
/// path). Two raw strings with the same canonical form share a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| HarveyError::BadRequest {
                message: format!("'{trimmed}' is not an absolute URL"),
            })?;
        let scheme = scheme.to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HarveyError::BadRequest {
                message: format!("unsupported URL scheme '{scheme}'"),
            });
        }

        // Drop the fragment before splitting anything else.
        let rest = rest.split('#').next().unwrap_or(rest);
        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(HarveyError::BadRequest {
                message: format!("'{trimmed}' has no host"),
            });
        }

        let mut host = authority.to_lowercase();
        let default_port = match scheme.as_str() {
            "http" => ":80",
            _ => ":443",
        };
        if let Some(stripped) = host.strip_suffix(default_port) {
            host = stripped.to_string();
        }

        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };
        let mut path = path.to_string();
        if path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        if path.is_empty() {
            path.push('/');
        }

        let mut canonical = format!("{scheme}://{host}{path}");
        if let Some(query) = query {
            if !query.is_empty() {
                canonical.push('?');
                canonical.push_str(query);
            }
        }
        Ok(CanonicalUrl(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_normalises_case_port_and_fragment() {
        let a = CanonicalUrl::parse("HTTPS://Example.COM:443/Pricing#plans").unwrap();
        let b = CanonicalUrl::parse("https://example.com/Pricing").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com/Pricing");
    }

    #[test]
    fn canonical_url_keeps_non_default_ports_and_query() {
        let url = CanonicalUrl::parse("http://example.com:8080/pricing?tier=pro").unwrap();
        assert_eq!(url.as_str(), "http://example.com:8080/pricing?tier=pro");
    }

    #[test]
    fn canonical_url_trims_trailing_slash_except_root() {
        assert_eq!(
            CanonicalUrl::parse("https://example.com/pricing/").unwrap().as_str(),
            "https://example.com/pricing"
        );
        assert_eq!(
            CanonicalUrl::parse("https://example.com").unwrap().as_str(),
            "https://example.com/"
        );
    }

    #[test]
    fn canonical_url_rejects_relative_and_odd_schemes() {
        assert!(CanonicalUrl::parse("example.com/pricing").is_err());
        assert!(CanonicalUrl::parse("ftp://example.com/pricing").is_err());
    }

    #[test]
    fn yaml_items_require_content() {
        assert!(PricingContextItem::yaml(ItemOrigin::User, "  ".into(), None).is_err());
        let item =
            PricingContextItem::yaml(ItemOrigin::User, "saasName: X".into(), None).unwrap();
        assert_eq!(item.kind, ItemKind::Yaml);
        assert_eq!(item.transform, TransformState::Done);
    }

    #[test]
    fn arena_rejects_duplicate_ids() {
        let mut arena = ContextArena::new();
        let url = CanonicalUrl::parse("https://example.com/pricing").unwrap();
        let item = PricingContextItem::url(ItemOrigin::User, &url);
        let dup = item.clone();
        arena.insert(item).unwrap();
        assert!(arena.insert(dup).is_err());
    }

    #[test]
    fn alias_map_uses_single_then_numbered_aliases() {
        let mut arena = ContextArena::new();
        arena
            .insert(PricingContextItem::yaml(ItemOrigin::User, "a: 1".into(), None).unwrap())
            .unwrap();
        assert_eq!(
            arena.yaml_alias_map(),
            vec![("uploaded://pricing".to_string(), "a: 1".to_string())]
        );

        arena
            .insert(PricingContextItem::yaml(ItemOrigin::User, "b: 2".into(), None).unwrap())
            .unwrap();
        let aliases = arena.yaml_alias_map();
        assert_eq!(aliases[0].0, "uploaded://pricing/1");
        assert_eq!(aliases[1].0, "uploaded://pricing/2");
    }
}
