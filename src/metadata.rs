//! `SERVICE_*` metadata extraction.
//!
//! Containers describe their services through environment variables and
//! labels such as `SERVICE_NAME=web`, `SERVICE_443_NAME=web-tls` or
//! `SERVICE_TAGS_IPV6=v6only`.  Declarations are scanned left to right,
//! environment before labels, and every attribute keeps the value of the
//! most specific declaration seen for it:
//!
//! 1. port-qualified and family-specific (`SERVICE_80_NAME_IPV4`)
//! 2. port-qualified (`SERVICE_80_NAME`)
//! 3. family-specific (`SERVICE_NAME_IPV4`)
//! 4. global (`SERVICE_NAME`)
//!
//! Declarations of the same tier overwrite each other in scan order.  Label
//! maps carry no order of their own, so two labels of the same tier naming
//! the same attribute resolve in whatever order the map yields them.

use std::collections::BTreeMap;

use crate::types::{Container, Family};

const PREFIX: &str = "SERVICE_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Global,
    GlobalFamily,
    Port,
    PortFamily,
}

impl Tier {
    fn new(port_qualified: bool, family_specific: bool) -> Self {
        match (port_qualified, family_specific) {
            (false, false) => Tier::Global,
            (false, true) => Tier::GlobalFamily,
            (true, false) => Tier::Port,
            (true, true) => Tier::PortFamily,
        }
    }

    fn is_port_qualified(self) -> bool {
        matches!(self, Tier::Port | Tier::PortFamily)
    }
}

/// Attributes resolved for one port and address family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    attrs: BTreeMap<String, (String, Tier)>,
}

impl Metadata {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|(value, _)| value.as_str())
    }

    /// Whether `name` was set by a port-qualified declaration.
    pub fn from_port(&self, name: &str) -> bool {
        self.attrs
            .get(name)
            .is_some_and(|(_, tier)| tier.is_port_qualified())
    }

    /// A non-empty `ignore` attribute drops the port entirely.
    pub fn is_ignored(&self) -> bool {
        self.get("ignore").is_some_and(|v| !v.is_empty())
    }

    /// Removes `name` and returns its value.
    pub fn take(&mut self, name: &str) -> Option<String> {
        self.attrs.remove(name).map(|(value, _)| value)
    }

    pub fn into_attrs(self) -> BTreeMap<String, String> {
        self.attrs
            .into_iter()
            .map(|(name, (value, _))| (name, value))
            .collect()
    }

    fn record(&mut self, name: &str, value: &str, tier: Tier) {
        if let Some((_, current)) = self.attrs.get(name) {
            if *current > tier {
                return;
            }
        }
        self.attrs
            .insert(name.to_string(), (value.to_string(), tier));
    }
}

/// Environment entries followed by label entries, as `(key, value)` pairs.
///
/// Environment entries without `=` carry no value and are dropped.
pub fn declarations(container: &Container) -> Vec<(&str, &str)> {
    container
        .env
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .chain(
            container
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .collect()
}

/// Resolves the `SERVICE_*` declarations that apply to `port` under `family`.
pub fn extract<'a, I>(declarations: I, port: u16, family: Family) -> Metadata
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let port = port.to_string();
    let mut metadata = Metadata::default();

    for (key, value) in declarations {
        let (key, family_specific) = match split_family(key) {
            Some((key, Some(f))) if f == family => (key, true),
            Some((_, Some(_))) => continue,
            Some((key, None)) => (key, false),
            None => continue,
        };
        let key = key.to_lowercase();

        let (name, port_qualified) = match key.split_once('_') {
            Some((lead, rest)) if lead.parse::<i64>().is_ok() => {
                if lead != port {
                    continue;
                }
                (rest, true)
            }
            _ => (key.as_str(), false),
        };
        if name.is_empty() {
            continue;
        }

        metadata.record(name, value, Tier::new(port_qualified, family_specific));
    }

    metadata
}

/// Strips the `SERVICE_` prefix and any `_IPV4`/`_IPV6` suffix.
fn split_family(key: &str) -> Option<(&str, Option<Family>)> {
    let key = key.strip_prefix(PREFIX)?;
    if let Some(key) = key.strip_suffix("_IPV4") {
        return Some((key, Some(Family::V4)));
    }
    if let Some(key) = key.strip_suffix("_IPV6") {
        return Some((key, Some(Family::V6)));
    }
    Some((key, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(decls: &[(&'static str, &'static str)], port: u16, family: Family) -> Metadata {
        extract(decls.iter().copied(), port, family)
    }

    #[test]
    fn test_only_service_prefix_is_considered() {
        let decls = [
            ("PATH", "/usr/bin"),
            ("SERVICE_NAME", "web"),
            ("service_tags", "x"),
        ];
        let md = run(&decls, 80, Family::V4);
        assert_eq!(md.get("name"), Some("web"));
        assert_eq!(md.get("tags"), None);
        assert_eq!(md.into_attrs().len(), 1);
    }

    #[test]
    fn test_port_qualified_beats_global() {
        let decls = [("SERVICE_NAME", "a"), ("SERVICE_80_NAME", "b")];
        let md = run(&decls, 80, Family::V4);
        assert_eq!(md.get("name"), Some("b"));
        assert!(md.from_port("name"));

        let md = run(&decls, 443, Family::V4);
        assert_eq!(md.get("name"), Some("a"));
        assert!(!md.from_port("name"));
    }

    #[test]
    fn test_global_after_port_qualified_is_ignored() {
        let decls = [("SERVICE_80_NAME", "b"), ("SERVICE_NAME", "a")];
        let md = run(&decls, 80, Family::V4);
        assert_eq!(md.get("name"), Some("b"));
    }

    #[test]
    fn test_family_override() {
        let decls = [
            ("SERVICE_NAME", "a"),
            ("SERVICE_NAME_IPV4", "x"),
            ("SERVICE_NAME_IPV6", "y"),
        ];
        assert_eq!(run(&decls, 80, Family::V4).get("name"), Some("x"));
        assert_eq!(run(&decls, 80, Family::V6).get("name"), Some("y"));
    }

    #[test]
    fn test_full_precedence_order() {
        let decls = [
            ("SERVICE_80_NAME_IPV4", "port-family"),
            ("SERVICE_80_NAME", "port"),
            ("SERVICE_NAME_IPV4", "family"),
            ("SERVICE_NAME", "global"),
        ];
        assert_eq!(run(&decls, 80, Family::V4).get("name"), Some("port-family"));
        assert_eq!(run(&decls, 80, Family::V6).get("name"), Some("port"));
        assert_eq!(run(&decls, 81, Family::V4).get("name"), Some("family"));
        assert_eq!(run(&decls, 81, Family::V6).get("name"), Some("global"));
    }

    #[test]
    fn test_same_tier_last_wins() {
        let decls = [("SERVICE_TAGS", "a"), ("SERVICE_TAGS", "b")];
        let md = run(&decls, 80, Family::V4);
        assert_eq!(md.get("tags"), Some("b"));
    }

    #[test]
    fn test_bare_port_key_is_global() {
        let md = run(&[("SERVICE_80", "x")], 443, Family::V4);
        assert_eq!(md.get("80"), Some("x"));
    }

    #[test]
    fn test_ignore() {
        let ignored = |key, value, port| run(&[(key, value)], port, Family::V4).is_ignored();
        assert!(ignored("SERVICE_IGNORE", "true", 80));
        assert!(!ignored("SERVICE_IGNORE", "", 80));
        assert!(ignored("SERVICE_80_IGNORE", "1", 80));
        assert!(!ignored("SERVICE_80_IGNORE", "1", 81));
    }

    #[test]
    fn test_env_precedes_labels() {
        let mut container = Container {
            env: vec![
                "SERVICE_NAME=from-env".into(),
                "SERVICE_CHECK_HTTP".into(),
                "SERVICE_REGION=a=b".into(),
            ],
            ..Default::default()
        };
        container
            .labels
            .insert("SERVICE_NAME".into(), "from-label".into());
        let decls = declarations(&container);
        assert_eq!(decls[0], ("SERVICE_NAME", "from-env"));
        assert_eq!(decls[1], ("SERVICE_REGION", "a=b"));
        assert_eq!(decls[2], ("SERVICE_NAME", "from-label"));

        let md = extract(decls, 80, Family::V4);
        assert_eq!(md.get("name"), Some("from-label"));
        assert_eq!(md.get("region"), Some("a=b"));
        assert_eq!(md.get("check_http"), None);
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let mut container = Container {
            env: vec!["SERVICE_NAME=web".into(), "SERVICE_80_TAGS=a,b".into()],
            ..Default::default()
        };
        container.labels.insert("SERVICE_ZONE".into(), "z1".into());
        container.labels.insert("SERVICE_TIER".into(), "t1".into());
        let decls = declarations(&container);
        let first = extract(decls.clone(), 80, Family::V4).into_attrs();
        let second = extract(decls, 80, Family::V4).into_attrs();
        assert_eq!(first, second);
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }

    #[test]
    fn test_take_removes_attribute() {
        let decls = [("SERVICE_ID", "x"), ("SERVICE_ZONE", "z")];
        let mut md = run(&decls, 80, Family::V4);
        assert_eq!(md.take("id"), Some("x".to_string()));
        assert_eq!(md.take("id"), None);
        let attrs = md.into_attrs();
        assert_eq!(attrs.get("zone").map(String::as_str), Some("z"));
    }
}
