//! Plugin identity and ordering

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::proto::plugins::Plugin as PluginProto;

/// Identity of an activated plugin
///
/// Ordering compares `name` first and `version` second, both as raw bytes.
/// Versions are therefore ordered literally rather than as semver:
/// `v1 < v1alpha1 < v1alpha2 < v1beta1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginDescriptor {
    name: String,
    version: String,
}

impl PluginDescriptor {
    /// Create a descriptor from a plugin name and version
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Plugin name (e.g. "fluxv2.packages")
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin API version (e.g. "v1alpha1")
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Ord for PluginDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .as_bytes()
            .cmp(other.name.as_bytes())
            .then_with(|| self.version.as_bytes().cmp(other.version.as_bytes()))
    }
}

impl PartialOrd for PluginDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

impl From<PluginDescriptor> for PluginProto {
    fn from(descriptor: PluginDescriptor) -> Self {
        Self {
            name: descriptor.name,
            version: descriptor.version,
        }
    }
}

impl From<PluginProto> for PluginDescriptor {
    fn from(plugin: PluginProto) -> Self {
        Self::new(plugin.name, plugin.version)
    }
}

/// Sort plugins in place by name, then version
///
/// The sort is stable, so duplicate descriptors keep their relative order.
pub fn sort_plugins(plugins: &mut [PluginDescriptor]) {
    plugins.sort();
}
