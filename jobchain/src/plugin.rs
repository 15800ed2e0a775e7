//! Plugin-contributed operations and their startup validation.
//!
//! A plugin declares operations by offset; the absolute code is
//! `range.start + offset`, where the range comes from configuration. All
//! declarations are validated together before anything is installed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RegistryError};
use crate::job::OperationCode;
use crate::operation::{CUSTOM_BAND, JobHandler, OperationFlags, PLUGIN_BAND};

/// One operation declared by a plugin.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PluginOperation {
    pub offset: u32,
    pub function_name: String,
}

impl PluginOperation {
    pub fn new(offset: u32, function_name: impl Into<String>) -> Self {
        Self {
            offset,
            function_name: function_name.into(),
        }
    }
}

/// Everything a plugin tells the scheduler about its operations.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PluginDeclaration {
    pub plugin_id: String,
    pub module_reference: String,
    pub operations: BTreeMap<String, PluginOperation>,
    #[serde(default)]
    pub hidden: Vec<String>,
    #[serde(default)]
    pub cancelable: Vec<String>,
    #[serde(default)]
    pub parallelizable: Vec<String>,
    #[serde(default)]
    pub downloadable: Vec<String>,
}

impl PluginDeclaration {
    pub fn new(
        plugin_id: impl Into<String>,
        module_reference: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            module_reference: module_reference.into(),
            ..Default::default()
        }
    }

    pub fn with_operation(
        mut self,
        name: impl Into<String>,
        offset: u32,
        function_name: impl Into<String>,
    ) -> Self {
        self.operations
            .insert(name.into(), PluginOperation::new(offset, function_name));
        self
    }

    pub fn hidden(mut self, name: impl Into<String>) -> Self {
        self.hidden.push(name.into());
        self
    }

    pub fn cancelable(mut self, name: impl Into<String>) -> Self {
        self.cancelable.push(name.into());
        self
    }

    pub fn parallelizable(mut self, name: impl Into<String>) -> Self {
        self.parallelizable.push(name.into());
        self
    }

    pub fn downloadable(mut self, name: impl Into<String>) -> Self {
        self.downloadable.push(name.into());
        self
    }

    fn flags_for(&self, name: &str) -> OperationFlags {
        let listed = |list: &[String]| list.iter().any(|entry| entry == name);
        OperationFlags {
            hidden: listed(&self.hidden),
            cancelable: listed(&self.cancelable),
            parallelizable: listed(&self.parallelizable),
            downloadable: listed(&self.downloadable),
        }
    }

    fn flagged_names(&self) -> impl Iterator<Item = &String> {
        self.hidden
            .iter()
            .chain(&self.cancelable)
            .chain(&self.parallelizable)
            .chain(&self.downloadable)
    }
}

/// Inclusive operation code range assigned to a plugin by configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PluginRange {
    pub start: u32,
    pub end: u32,
}

impl PluginRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, code: u32) -> bool {
        (self.start..=self.end).contains(&code)
    }

    pub fn intersects(&self, other: &PluginRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// A plugin: its declaration plus the handlers its functions resolve to.
pub trait JobPlugin: Send + Sync {
    fn declaration(&self) -> &PluginDeclaration;

    /// Resolves a declared `function_name` to its handler.
    fn handler(&self, function_name: &str) -> Option<Arc<dyn JobHandler>>;
}

/// Plugins registered with this process, keyed by plugin id.
#[derive(Default)]
pub struct PluginCatalog {
    plugins: BTreeMap<String, Arc<dyn JobPlugin>>,
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin. A second registration of the same id fails and leaves
    /// the first one in place.
    pub fn register(
        &mut self,
        plugin: Arc<dyn JobPlugin>,
    ) -> Result<(), RegistryError> {
        let plugin_id = plugin.declaration().plugin_id.clone();
        if self.plugins.contains_key(&plugin_id) {
            return Err(RegistryError::PluginAlreadyRegistered { plugin_id });
        }
        tracing::debug!(%plugin_id, "plugin registered");
        self.plugins.insert(plugin_id, plugin);
        Ok(())
    }

    pub fn get(&self, plugin_id: &str) -> Option<&Arc<dyn JobPlugin>> {
        self.plugins.get(plugin_id)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn declarations(&self) -> impl Iterator<Item = &PluginDeclaration> {
        self.plugins.values().map(|plugin| plugin.declaration())
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn JobPlugin>> {
        self.plugins.values()
    }

    pub fn validate(
        &self,
        ranges: &BTreeMap<String, PluginRange>,
    ) -> Result<Vec<ResolvedOperation>, ConfigError> {
        validate_plugins(self.declarations(), ranges)
    }
}

/// A plugin operation with its absolute code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedOperation {
    pub code: OperationCode,
    pub plugin_id: String,
    pub name: String,
    pub function_name: String,
    pub flags: OperationFlags,
}

/// Checks every declaration against the configured ranges and resolves
/// absolute operation codes. Fails on the first problem found.
pub fn validate_plugins<'a>(
    declarations: impl IntoIterator<Item = &'a PluginDeclaration>,
    ranges: &BTreeMap<String, PluginRange>,
) -> Result<Vec<ResolvedOperation>, ConfigError> {
    let mut declarations: Vec<&PluginDeclaration> =
        declarations.into_iter().collect();
    declarations.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));

    let mut assigned: Vec<(&str, PluginRange)> =
        Vec::with_capacity(declarations.len());
    for declaration in &declarations {
        let plugin_id = declaration.plugin_id.as_str();
        let range = *ranges.get(plugin_id).ok_or_else(|| {
            ConfigError::MissingRange {
                plugin_id: plugin_id.to_string(),
            }
        })?;
        check_range(plugin_id, range)?;

        if let Some((other, _)) =
            assigned.iter().find(|(_, other)| other.intersects(&range))
        {
            return Err(ConfigError::OverlappingRanges {
                first: (*other).to_string(),
                second: plugin_id.to_string(),
            });
        }
        assigned.push((plugin_id, range));
    }

    let declared: BTreeSet<&str> =
        declarations.iter().map(|d| d.plugin_id.as_str()).collect();
    let unused = ranges.keys().filter(|id| !declared.contains(id.as_str()));
    for plugin_id in unused {
        tracing::warn!(
            %plugin_id,
            "operation range configured for a plugin that is not registered"
        );
    }

    let mut owners: HashMap<u32, String> = HashMap::new();
    let mut resolved = Vec::new();
    for (declaration, (_, range)) in declarations.iter().zip(&assigned) {
        let plugin_id = &declaration.plugin_id;

        if let Some(name) = declaration
            .flagged_names()
            .find(|name| !declaration.operations.contains_key(name.as_str()))
        {
            return Err(ConfigError::UnknownFlaggedOperation {
                plugin_id: plugin_id.clone(),
                operation: name.clone(),
            });
        }

        for (name, operation) in &declaration.operations {
            let code = range
                .start
                .checked_add(operation.offset)
                .filter(|code| range.contains(*code))
                .ok_or_else(|| ConfigError::OffsetOutOfRange {
                    plugin_id: plugin_id.clone(),
                    operation: name.clone(),
                    offset: operation.offset,
                })?;

            let label = format!("{plugin_id}.{name}");
            if let Some(first) = owners.get(&code) {
                return Err(ConfigError::CodeCollision {
                    code,
                    first: first.clone(),
                    second: label,
                });
            }
            owners.insert(code, label);

            resolved.push(ResolvedOperation {
                code: OperationCode(code),
                plugin_id: plugin_id.clone(),
                name: name.clone(),
                function_name: operation.function_name.clone(),
                flags: declaration.flags_for(name),
            });
        }
    }

    resolved.sort_by_key(|operation| operation.code);
    Ok(resolved)
}

fn check_range(plugin_id: &str, range: PluginRange) -> Result<(), ConfigError> {
    let PluginRange { start, end } = range;
    if start > end {
        return Err(ConfigError::InvertedRange {
            plugin_id: plugin_id.to_string(),
            start,
            end,
        });
    }
    if start <= *CUSTOM_BAND.end() {
        return Err(ConfigError::ReservedBandOverlap {
            plugin_id: plugin_id.to_string(),
            start,
            end,
        });
    }
    if end > *PLUGIN_BAND.end() {
        return Err(ConfigError::OutsidePluginBand {
            plugin_id: plugin_id.to_string(),
            start,
            end,
        });
    }
    Ok(())
}
