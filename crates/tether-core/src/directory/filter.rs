//! Capability filters declared by providers.

use crate::descriptor::Descriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What descriptors a provider accepts.
///
/// Matching follows the usual intent-filter rules:
/// - the descriptor's action must be listed (a descriptor without an action
///   matches any filter that lists at least one);
/// - every category on the descriptor must be declared;
/// - with no declared schemes only data-less descriptors match, otherwise the
///   data scheme must be declared, and the scheme-specific part too when any
///   are declared. A declared part ending in `*` matches by prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFilter {
    #[serde(default)]
    pub actions: BTreeSet<String>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub data_schemes: BTreeSet<String>,
    #[serde(default)]
    pub data_ssps: BTreeSet<String>,
}

impl CapabilityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions.insert(action.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }

    pub fn with_data_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.data_schemes.insert(scheme.into());
        self
    }

    pub fn with_data_ssp(mut self, ssp: impl Into<String>) -> Self {
        self.data_ssps.insert(ssp.into());
        self
    }

    pub fn matches(&self, descriptor: &Descriptor) -> bool {
        self.matches_action(descriptor) && self.matches_categories(descriptor) && self.matches_data(descriptor)
    }

    fn matches_action(&self, descriptor: &Descriptor) -> bool {
        match &descriptor.action {
            Some(action) => self.actions.contains(action),
            None => !self.actions.is_empty(),
        }
    }

    fn matches_categories(&self, descriptor: &Descriptor) -> bool {
        descriptor.categories.is_subset(&self.categories)
    }

    fn matches_data(&self, descriptor: &Descriptor) -> bool {
        let scheme = descriptor.data_scheme();
        if self.data_schemes.is_empty() {
            return scheme.is_none();
        }
        let Some(scheme) = scheme else {
            return false;
        };
        if !self.data_schemes.contains(scheme) {
            return false;
        }
        if self.data_ssps.is_empty() {
            return true;
        }
        let ssp = descriptor.data_ssp().unwrap_or_default();
        self.data_ssps.iter().any(|declared| match declared.strip_suffix('*') {
            Some(prefix) => ssp.starts_with(prefix),
            None => declared == ssp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_must_be_listed() {
        let filter = CapabilityFilter::new().with_action("a1");
        assert!(filter.matches(&Descriptor::new().with_action("a1")));
        assert!(!filter.matches(&Descriptor::new().with_action("a2")));
        assert!(filter.matches(&Descriptor::new()));
        assert!(!CapabilityFilter::new().matches(&Descriptor::new()));
    }

    #[test]
    fn test_requested_categories_must_be_declared() {
        let filter = CapabilityFilter::new().with_action("a").with_category("c1");
        assert!(filter.matches(&Descriptor::new().with_action("a").with_category("c1")));
        assert!(!filter.matches(&Descriptor::new().with_action("a").with_category("c2")));
    }

    #[test]
    fn test_data_scheme_and_ssp() {
        let filter = CapabilityFilter::new()
            .with_action("a")
            .with_data_scheme("content")
            .with_data_ssp("//media/*");

        let ok = Descriptor::new().with_action("a").with_data("content://media/1");
        let wrong_ssp = Descriptor::new().with_action("a").with_data("content://other/1");
        let no_data = Descriptor::new().with_action("a");

        assert!(filter.matches(&ok));
        assert!(!filter.matches(&wrong_ssp));
        assert!(!filter.matches(&no_data));
    }

    #[test]
    fn test_schemeless_filter_rejects_data() {
        let filter = CapabilityFilter::new().with_action("a");
        assert!(!filter.matches(&Descriptor::new().with_action("a").with_data("https://x")));
    }

    #[test]
    fn test_json_defaults_missing_sets() {
        let filter: CapabilityFilter = serde_json::from_str(r#"{"actions":["a"]}"#).unwrap();
        assert_eq!(filter, CapabilityFilter::new().with_action("a"));
    }
}
