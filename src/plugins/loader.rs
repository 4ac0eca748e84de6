//! Plugin loader - turn discovered artifacts into activated plugins

use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};

use libloading::Library;

use super::{PLUGIN_ENTRY_SYMBOL, Plugin, PluginDescriptor, PluginFactory};
use crate::gateway::GatewayContext;
use crate::rpc::ServiceRegistrar;
use crate::{Error, Result};

/// Where a plugin comes from
pub enum PluginSource {
    /// Plugin compiled into the gateway binary (or a test)
    Builtin(Box<dyn Plugin>),

    /// Shared library found by discovery
    Artifact(PathBuf),
}

impl std::fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(plugin) => f
                .debug_tuple("Builtin")
                .field(&plugin.descriptor().to_string())
                .finish(),
            Self::Artifact(path) => f.debug_tuple("Artifact").field(path).finish(),
        }
    }
}

/// A plugin produced by a shared library, together with the library itself
pub struct LoadedPlugin {
    plugin: Box<dyn Plugin>,
    path: PathBuf,
    // Plugin code can outlive the plugin value (spawned tasks, vtables held by
    // the router), so the library stays mapped until the process exits.
    _library: ManuallyDrop<Library>,
}

impl LoadedPlugin {
    /// The plugin created by the library's factory
    #[must_use]
    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    /// Path the library was loaded from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("plugin", &self.plugin.descriptor().to_string())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Load a plugin artifact and call its factory
///
/// # Errors
///
/// Returns [`Error::PluginLoad`] if the file is not a loadable library and
/// [`Error::MissingEntryPoint`] if it does not export the plugin factory
#[allow(unsafe_code)]
pub fn load_plugin(path: &Path) -> Result<LoadedPlugin> {
    // SAFETY: loading runs the library's initializers. Plugin directories are
    // operator-controlled and their contents are trusted like the binary itself.
    let library = unsafe { Library::new(path) }.map_err(|source| Error::PluginLoad {
        path: path.to_path_buf(),
        source,
    })?;

    let plugin = {
        // SAFETY: `export_plugin!` pins the exported symbol to `PluginFactory`
        let factory = unsafe { library.get::<PluginFactory>(PLUGIN_ENTRY_SYMBOL.as_bytes()) }
            .map_err(|source| Error::MissingEntryPoint {
                path: path.to_path_buf(),
                symbol: PLUGIN_ENTRY_SYMBOL,
                source,
            })?;
        (*factory)()
    };

    Ok(LoadedPlugin {
        plugin,
        path: path.to_path_buf(),
        _library: ManuallyDrop::new(library),
    })
}

/// Plugins that completed registration, in activation order
#[derive(Default)]
pub struct ActivatedPlugins {
    descriptors: Vec<PluginDescriptor>,
    builtins: Vec<Box<dyn Plugin>>,
    loaded: Vec<LoadedPlugin>,
}

impl ActivatedPlugins {
    /// Descriptors of every activated plugin, in activation order
    #[must_use]
    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    /// Number of activated plugins
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no plugin was activated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Libraries that were loaded from disk
    pub fn loaded(&self) -> impl Iterator<Item = &LoadedPlugin> {
        self.loaded.iter()
    }

    /// Number of plugins compiled into the gateway
    #[must_use]
    pub fn builtin_count(&self) -> usize {
        self.builtins.len()
    }
}

impl std::fmt::Debug for ActivatedPlugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivatedPlugins")
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

/// Activates plugins against the shared registries
///
/// Sources are activated strictly in order. The first failure stops
/// activation; later sources are never loaded.
pub struct PluginActivator<'s, 'g> {
    server: &'s mut ServiceRegistrar,
    gateway: &'s mut GatewayContext<'g>,
    activated: ActivatedPlugins,
}

impl<'s, 'g> PluginActivator<'s, 'g> {
    /// Create an activator writing into the given registries
    pub fn new(server: &'s mut ServiceRegistrar, gateway: &'s mut GatewayContext<'g>) -> Self {
        Self {
            server,
            gateway,
            activated: ActivatedPlugins::default(),
        }
    }

    /// Activate a single plugin source
    ///
    /// # Errors
    ///
    /// Returns error if the artifact cannot be loaded or the plugin's
    /// registration fails
    pub fn activate(&mut self, source: PluginSource) -> Result<PluginDescriptor> {
        match source {
            PluginSource::Builtin(plugin) => {
                let descriptor = self.register(plugin.as_ref(), None)?;
                self.activated.builtins.push(plugin);
                Ok(descriptor)
            }
            PluginSource::Artifact(path) => {
                let loaded = load_plugin(&path)?;
                let descriptor = self.register(loaded.plugin(), Some(&path))?;
                self.activated.loaded.push(loaded);
                Ok(descriptor)
            }
        }
    }

    /// Activate every source in order, stopping at the first failure
    ///
    /// # Errors
    ///
    /// Returns the first load or registration error
    pub fn activate_all(
        mut self,
        sources: impl IntoIterator<Item = PluginSource>,
    ) -> Result<ActivatedPlugins> {
        for source in sources {
            self.activate(source)?;
        }
        Ok(self.finish())
    }

    /// Stop activating and hand back what succeeded
    #[must_use]
    pub fn finish(self) -> ActivatedPlugins {
        self.activated
    }

    fn register(&mut self, plugin: &dyn Plugin, path: Option<&Path>) -> Result<PluginDescriptor> {
        let descriptor = plugin.descriptor();

        plugin
            .register(self.server, self.gateway)
            .map_err(|source| Error::Activation {
                plugin: path.map_or_else(
                    || descriptor.to_string(),
                    |p| format!("{descriptor} ({})", p.display()),
                ),
                source,
            })?;

        if self.activated.descriptors.contains(&descriptor) {
            tracing::warn!(plugin = %descriptor, "plugin activated more than once");
        }

        tracing::info!(
            plugin = %descriptor,
            path = ?path,
            "activated plugin"
        );

        self.activated.descriptors.push(descriptor.clone());
        Ok(descriptor)
    }
}
