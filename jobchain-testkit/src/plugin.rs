use std::collections::HashMap;
use std::sync::Arc;

use jobchain::*;

use crate::MockHandler;

/// Plugin declaring `reindex` (offset 0, parallelizable) and `purge`
/// (offset 1, cancelable, hidden), both backed by [`MockHandler`]s.
pub struct SamplePlugin {
    declaration: PluginDeclaration,
    handlers: HashMap<String, MockHandler>,
}

impl SamplePlugin {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        let declaration = PluginDeclaration::new(plugin_id, "sample::jobs")
            .with_operation("reindex", 0, "run_reindex")
            .with_operation("purge", 1, "run_purge")
            .parallelizable("reindex")
            .cancelable("purge")
            .hidden("purge");
        let handlers = ["run_reindex", "run_purge"]
            .into_iter()
            .map(|name| (name.to_string(), MockHandler::new()))
            .collect();
        Self {
            declaration,
            handlers,
        }
    }

    /// Replaces the declaration, keeping the mock handlers.
    pub fn with_declaration(mut self, declaration: PluginDeclaration) -> Self {
        self.declaration = declaration;
        self
    }

    pub fn mock(&self, function_name: &str) -> Option<&MockHandler> {
        self.handlers.get(function_name)
    }
}

impl JobPlugin for SamplePlugin {
    fn declaration(&self) -> &PluginDeclaration {
        &self.declaration
    }

    fn handler(&self, function_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(function_name).map(MockHandler::shared)
    }
}
