//! Resolved server addresses.

use crate::descriptor::{ComponentName, Descriptor};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Free-form key/value attributes attached to groups, transports and streams.
pub type Attributes = BTreeMap<String, String>;

/// Address of one bindable component: the descriptor a client binds with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ComponentAddress {
    bind_descriptor: Descriptor,
}

impl ComponentAddress {
    pub fn for_bind_descriptor(bind_descriptor: Descriptor) -> Self {
        Self { bind_descriptor }
    }

    /// Address that names the component and nothing else.
    pub fn for_component(component: ComponentName) -> Self {
        Self::for_bind_descriptor(Descriptor::new().with_component(component))
    }

    pub fn bind_descriptor(&self) -> &Descriptor {
        &self.bind_descriptor
    }

    pub fn component(&self) -> Option<&ComponentName> {
        self.bind_descriptor.component.as_ref()
    }

    /// Package hosting the server.
    pub fn package_name(&self) -> Option<&str> {
        self.component()
            .map(|c| c.package.as_str())
            .or(self.bind_descriptor.package.as_deref())
    }
}

impl fmt::Display for ComponentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentAddress[{}]", self.bind_descriptor)
    }
}

/// Mutually equivalent addresses of one logical server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressGroup {
    addresses: Vec<ComponentAddress>,
    attributes: Attributes,
}

impl AddressGroup {
    pub fn new(addresses: Vec<ComponentAddress>, attributes: Attributes) -> Self {
        Self {
            addresses,
            attributes,
        }
    }

    pub fn single(address: ComponentAddress) -> Self {
        Self::new(vec![address], Attributes::new())
    }

    pub fn addresses(&self) -> &[ComponentAddress] {
        &self.addresses
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_compare_structurally() {
        let component = ComponentName::new("pkg", "pkg.Svc");
        let a = ComponentAddress::for_bind_descriptor(
            Descriptor::new().with_action("act").with_component(component.clone()),
        );
        let b = ComponentAddress::for_bind_descriptor(
            Descriptor::new().with_action("act").with_component(component.clone()),
        );
        assert_eq!(a, b);
        assert_ne!(a, ComponentAddress::for_component(component));
        assert_eq!(a.package_name(), Some("pkg"));
    }
}
