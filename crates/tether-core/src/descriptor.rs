//! Target descriptors and their `intent:` text form.
//!
//! ```text
//! intent:<data-part>#Intent;key=value;key=value;...;end
//! ```
//!
//! Recognized keys are `action`, `category` (repeatable), `scheme`,
//! `component`, `package` and the typed extras `S.` (string), `i.` (int),
//! `l.` (long) and `B.` (bool). Values are percent-encoded. Any other key is
//! an error.

use crate::config::ResolverConfig;
use crate::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use url::Url;

/// Concrete provider identity: `package/class`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Parse `pkg/cls`. A class starting with `.` is relative to the package.
    pub fn parse(text: &str) -> Option<Self> {
        let (package, class) = text.split_once('/')?;
        if package.is_empty() || class.is_empty() {
            return None;
        }
        let class = if class.starts_with('.') {
            format!("{}{}", package, class)
        } else {
            class.to_string()
        };
        Some(Self::new(package, class))
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

/// Typed extra value carried by a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Extra {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
}

impl Extra {
    fn prefix(&self) -> &'static str {
        match self {
            Extra::String(_) => "S.",
            Extra::Int(_) => "i.",
            Extra::Long(_) => "l.",
            Extra::Bool(_) => "B.",
        }
    }

    fn value_text(&self) -> String {
        match self {
            Extra::String(s) => s.clone(),
            Extra::Int(v) => v.to_string(),
            Extra::Long(v) => v.to_string(),
            Extra::Bool(v) => v.to_string(),
        }
    }
}

/// A declarative request for "something that can serve this".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Descriptor {
    pub action: Option<String>,
    pub data: Option<String>,
    pub categories: BTreeSet<String>,
    pub component: Option<ComponentName>,
    pub package: Option<String>,
    pub extras: BTreeMap<String, Extra>,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_component(mut self, component: ComponentName) -> Self {
        self.component = Some(component);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Extra) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// Scheme of the data URI, if any.
    pub fn data_scheme(&self) -> Option<&str> {
        self.data.as_deref()?.split_once(':').map(|(scheme, _)| scheme)
    }

    /// Scheme-specific part of the data URI, if any.
    pub fn data_ssp(&self) -> Option<&str> {
        self.data.as_deref()?.split_once(':').map(|(_, ssp)| ssp)
    }

    /// Only the parts a capability filter matches on: action, data and categories.
    pub fn filter_copy(&self) -> Self {
        Self {
            action: self.action.clone(),
            data: self.data.clone(),
            categories: self.categories.clone(),
            ..Default::default()
        }
    }

    /// Parse the `intent:` text form.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |message: String| TetherError::InvalidDescriptor {
            uri: uri.to_string(),
            message,
        };

        let parsed = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
        if parsed.scheme() != ResolverConfig::INTENT_SCHEME {
            return Err(invalid(format!("scheme '{}' is not intent", parsed.scheme())));
        }

        // Split the raw text; `Url` normalizes the pieces we need verbatim.
        let rest = uri
            .split_once(':')
            .map(|(_, rest)| rest)
            .ok_or_else(|| invalid("missing scheme separator".to_string()))?;
        let (data_part, fragment) = rest
            .split_once('#')
            .ok_or_else(|| invalid("missing #Intent; section".to_string()))?;
        let body = fragment
            .strip_prefix("Intent;")
            .ok_or_else(|| invalid("fragment does not start with Intent;".to_string()))?;

        let mut descriptor = Descriptor::new();
        let mut scheme: Option<String> = None;
        let mut component: Option<String> = None;
        let mut ended = false;

        for token in body.split(';') {
            if ended {
                if token.is_empty() {
                    continue;
                }
                return Err(invalid(format!("unexpected '{}' after end", token)));
            }
            if token == "end" {
                ended = true;
                continue;
            }
            let (key, raw) = token
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed pair '{}'", token)))?;
            let value = urlencoding::decode(raw)
                .map_err(|e| invalid(format!("bad encoding in '{}': {}", key, e)))?
                .into_owned();

            match key {
                "action" => descriptor.action = Some(value),
                "category" => {
                    descriptor.categories.insert(value);
                }
                "scheme" => scheme = Some(value),
                "component" => component = Some(value),
                "package" => descriptor.package = Some(value),
                _ => {
                    let (name, extra) = parse_extra(key, &value)
                        .ok_or_else(|| invalid(format!("unknown key '{}'", key)))?;
                    descriptor.extras.insert(name, extra);
                }
            }
        }

        if !ended {
            return Err(invalid("missing end".to_string()));
        }

        let data_part = urlencoding::decode(data_part)
            .map_err(|e| invalid(format!("bad encoding in data: {}", e)))?
            .into_owned();
        descriptor.data = match scheme {
            Some(scheme) => Some(format!("{}:{}", scheme, data_part)),
            None if data_part.is_empty() => None,
            None => Some(data_part),
        };

        if let Some(text) = component {
            let name = ComponentName::parse(&text)
                .ok_or_else(|| invalid(format!("bad component '{}'", text)))?;
            descriptor.component = Some(name);
        }

        Ok(descriptor)
    }

    /// Write the `intent:` text form accepted by [`Descriptor::parse`].
    pub fn to_uri(&self) -> String {
        let (scheme, data_part) = match self.data.as_deref() {
            Some(data) => match data.split_once(':') {
                Some((scheme, ssp)) => (Some(scheme), ssp),
                None => (None, data),
            },
            None => (None, ""),
        };

        let mut uri = format!(
            "{}:{}#Intent;",
            ResolverConfig::INTENT_SCHEME,
            encode_data(data_part)
        );
        if let Some(action) = &self.action {
            push_pair(&mut uri, "action", action);
        }
        for category in &self.categories {
            push_pair(&mut uri, "category", category);
        }
        if let Some(scheme) = scheme {
            push_pair(&mut uri, "scheme", scheme);
        }
        if let Some(component) = &self.component {
            push_pair(&mut uri, "component", &component.to_string());
        }
        if let Some(package) = &self.package {
            push_pair(&mut uri, "package", package);
        }
        for (name, extra) in &self.extras {
            push_pair(&mut uri, &format!("{}{}", extra.prefix(), name), &extra.value_text());
        }
        uri.push_str("end");
        uri
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

fn parse_extra(key: &str, value: &str) -> Option<(String, Extra)> {
    let (prefix, name) = (key.get(..2)?, key.get(2..)?);
    if name.is_empty() {
        return None;
    }
    let extra = match prefix {
        "S." => Extra::String(value.to_string()),
        "i." => Extra::Int(value.parse().ok()?),
        "l." => Extra::Long(value.parse().ok()?),
        "B." => Extra::Bool(value.parse().ok()?),
        _ => return None,
    };
    Some((name.to_string(), extra))
}

fn push_pair(uri: &mut String, key: &str, value: &str) {
    uri.push_str(key);
    uri.push('=');
    uri.push_str(&urlencoding::encode(value));
    uri.push(';');
}

/// Encode the data part, keeping the path separators readable.
fn encode_data(data: &str) -> String {
    urlencoding::encode(data).replace("%2F", "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_parse_full_descriptor() {
        let d = Descriptor::parse(
            "intent://example.com/svc#Intent;action=com.example.BIND;category=DEFAULT;\
             scheme=https;component=com.example/.EchoService;S.mode=fast%20path;i.level=3;end",
        )
        .unwrap();

        assert_eq!(d.action.as_deref(), Some("com.example.BIND"));
        assert_eq!(d.data.as_deref(), Some("https://example.com/svc"));
        assert_eq!(d.data_scheme(), Some("https"));
        assert!(d.categories.contains("DEFAULT"));
        assert_eq!(
            d.component,
            Some(ComponentName::new("com.example", "com.example.EchoService"))
        );
        assert_eq!(d.extras["mode"], Extra::String("fast path".to_string()));
        assert_eq!(d.extras["level"], Extra::Int(3));
    }

    #[test]
    fn test_parse_action_only() {
        let d = Descriptor::parse("intent:#Intent;action=action1;end").unwrap();
        assert_eq!(d, Descriptor::new().with_action("action1"));
    }

    #[test]
    fn test_unknown_extra_is_invalid_argument() {
        let err = Descriptor::parse("intent:xxx#Intent;e.x=1;end;").unwrap_err();
        assert!(matches!(err, TetherError::InvalidDescriptor { .. }));
        assert_eq!(err.status_code(), Code::InvalidArgument);
    }

    #[test]
    fn test_malformed_text_is_rejected() {
        for bad in [
            "not a uri",
            "http://example.com#Intent;action=a;end",
            "intent:xxx",
            "intent:xxx#Other;end",
            "intent:xxx#Intent;action=a",
            "intent:xxx#Intent;action;end",
            "intent:xxx#Intent;end;action=a",
            "intent:xxx#Intent;i.n=notanumber;end",
            "intent:xxx#Intent;component=nopackage;end",
        ] {
            assert!(Descriptor::parse(bad).is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_to_uri_parses_back() {
        let d = Descriptor::new()
            .with_action("com.example.BIND")
            .with_data("content://authority/a b")
            .with_category("DEFAULT")
            .with_package("com.example")
            .with_component(ComponentName::new("com.example", "com.example.Echo"))
            .with_extra("flag", Extra::Bool(true));

        assert_eq!(Descriptor::parse(&d.to_uri()).unwrap(), d);
    }

    #[test]
    fn test_filter_copy_drops_identity() {
        let d = Descriptor::new()
            .with_action("a")
            .with_package("p")
            .with_component(ComponentName::new("p", "p.C"));
        let filtered = d.filter_copy();
        assert_eq!(filtered.action.as_deref(), Some("a"));
        assert!(filtered.package.is_none());
        assert!(filtered.component.is_none());
    }

    #[test]
    fn test_component_name_parse() {
        assert_eq!(
            ComponentName::parse("pkg/.Svc"),
            Some(ComponentName::new("pkg", "pkg.Svc"))
        );
        assert_eq!(
            ComponentName::parse("pkg/other.Svc").unwrap().to_string(),
            "pkg/other.Svc"
        );
        assert!(ComponentName::parse("/Svc").is_none());
    }
}
