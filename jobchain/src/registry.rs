use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ConfigError, RegistryError};
use crate::job::OperationCode;
use crate::operation::{
    CUSTOM_BAND, JobHandler, OperationFlags, OperationInfo, OperationOrigin,
    core_operations,
};
use crate::plugin::{PluginCatalog, PluginRange};

/// Operation code to definition and handler, shared by the dispatcher and
/// the service.
///
/// Definitions and handlers are tracked separately: a job may be created for
/// a defined operation before its handler is registered, and dispatch only
/// requires the handler at run time.
pub struct OperationRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    operations: BTreeMap<OperationCode, OperationInfo>,
    handlers: HashMap<OperationCode, Arc<dyn JobHandler>>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("OperationRegistry")
            .field("operations", &inner.operations.len())
            .field("handlers", &inner.handlers.len())
            .finish()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_core_operations()
    }
}

impl OperationRegistry {
    /// A registry with no operations at all.
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// A registry preloaded with the core operation table and no handlers.
    pub fn with_core_operations() -> Self {
        let operations = core_operations()
            .iter()
            .map(|info| (info.code, info.clone()))
            .collect();
        Self {
            inner: RwLock::new(RegistryInner {
                operations,
                handlers: HashMap::new(),
            }),
        }
    }

    pub fn info(&self, code: OperationCode) -> Option<OperationInfo> {
        self.inner.read().operations.get(&code).cloned()
    }

    pub fn is_known(&self, code: OperationCode) -> bool {
        self.inner.read().operations.contains_key(&code)
    }

    pub fn flags(&self, code: OperationCode) -> Option<OperationFlags> {
        self.inner.read().operations.get(&code).map(|info| info.flags)
    }

    pub fn is_parallelizable(&self, code: OperationCode) -> bool {
        self.flags(code).is_some_and(|flags| flags.parallelizable)
    }

    pub fn is_cancelable(&self, code: OperationCode) -> bool {
        self.flags(code).is_some_and(|flags| flags.cancelable)
    }

    pub fn is_hidden(&self, code: OperationCode) -> bool {
        self.flags(code).is_some_and(|flags| flags.hidden)
    }

    pub fn is_downloadable(&self, code: OperationCode) -> bool {
        self.flags(code).is_some_and(|flags| flags.downloadable)
    }

    pub fn operations(&self) -> Vec<OperationInfo> {
        self.inner.read().operations.values().cloned().collect()
    }

    pub fn hidden_codes(&self) -> Vec<OperationCode> {
        self.inner
            .read()
            .operations
            .values()
            .filter(|info| info.flags.hidden)
            .map(|info| info.code)
            .collect()
    }

    /// Binds a handler to a defined operation. Each code takes one handler.
    pub fn register(
        &self,
        code: OperationCode,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if !inner.operations.contains_key(&code) {
            return Err(RegistryError::UnknownOperation(code));
        }
        if inner.handlers.contains_key(&code) {
            return Err(RegistryError::HandlerAlreadyRegistered(code));
        }
        inner.handlers.insert(code, handler);
        tracing::debug!(operation = %code, "handler registered");
        Ok(())
    }

    /// Defines a legacy custom-view operation (codes 100-199) and binds its
    /// handler.
    pub fn register_custom(
        &self,
        code: OperationCode,
        name: impl Into<String>,
        flags: OperationFlags,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        if !CUSTOM_BAND.contains(&code.get()) {
            return Err(RegistryError::OutsideCustomBand(code));
        }
        let mut inner = self.inner.write();
        if inner.operations.contains_key(&code) {
            return Err(RegistryError::DuplicateOperation(code));
        }
        inner.operations.insert(
            code,
            OperationInfo {
                code,
                name: Cow::Owned(name.into()),
                flags,
                origin: OperationOrigin::Custom,
            },
        );
        inner.handlers.insert(code, handler);
        Ok(())
    }

    pub fn handler_for(
        &self,
        code: OperationCode,
    ) -> Option<Arc<dyn JobHandler>> {
        self.inner.read().handlers.get(&code).cloned()
    }

    /// Validates every plugin in `catalog` against `ranges` and installs their
    /// operations and handlers. Nothing is installed unless all of them pass.
    pub fn install_plugins(
        &self,
        catalog: &PluginCatalog,
        ranges: &BTreeMap<String, PluginRange>,
    ) -> Result<Vec<OperationInfo>, ConfigError> {
        let resolved = catalog.validate(ranges)?;

        let mut staged = Vec::with_capacity(resolved.len());
        for operation in resolved {
            let handler = catalog
                .get(&operation.plugin_id)
                .and_then(|plugin| plugin.handler(&operation.function_name))
                .ok_or_else(|| ConfigError::MissingPluginHandler {
                    plugin_id: operation.plugin_id.clone(),
                    function_name: operation.function_name.clone(),
                })?;
            let info = OperationInfo {
                code: operation.code,
                name: Cow::Owned(operation.name),
                flags: operation.flags,
                origin: OperationOrigin::Plugin {
                    plugin_id: operation.plugin_id,
                },
            };
            staged.push((info, handler));
        }

        let mut inner = self.inner.write();
        if let Some((info, _)) = staged
            .iter()
            .find(|(info, _)| inner.operations.contains_key(&info.code))
        {
            return Err(RegistryError::DuplicateOperation(info.code).into());
        }

        let installed: Vec<OperationInfo> =
            staged.iter().map(|(info, _)| info.clone()).collect();
        for (info, handler) in staged {
            inner.handlers.insert(info.code, handler);
            inner.operations.insert(info.code, info);
        }
        tracing::info!(
            plugins = catalog.len(),
            operations = installed.len(),
            "plugin operations installed"
        );
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{JobOutcome, codes, handler_fn};

    fn noop() -> Arc<dyn JobHandler> {
        handler_fn(|_ctx| async { Ok(JobOutcome::Done) })
    }

    #[test]
    fn test_core_operations_have_no_handlers_until_registered() {
        let registry = OperationRegistry::with_core_operations();
        assert!(registry.is_known(codes::EDIT_ENTRY));
        assert!(registry.handler_for(codes::EDIT_ENTRY).is_none());

        registry.register(codes::EDIT_ENTRY, noop()).unwrap();
        assert!(registry.handler_for(codes::EDIT_ENTRY).is_some());
    }

    #[test]
    fn test_second_handler_is_rejected() {
        let registry = OperationRegistry::with_core_operations();
        registry.register(codes::EDIT_ENTRY, noop()).unwrap();
        assert_eq!(
            registry.register(codes::EDIT_ENTRY, noop()).unwrap_err(),
            RegistryError::HandlerAlreadyRegistered(codes::EDIT_ENTRY)
        );
    }

    #[test]
    fn test_undefined_code_is_rejected() {
        let registry = OperationRegistry::with_core_operations();
        assert_eq!(
            registry.register(OperationCode(77), noop()).unwrap_err(),
            RegistryError::UnknownOperation(OperationCode(77))
        );
    }

    #[test]
    fn test_custom_band_is_enforced() {
        let registry = OperationRegistry::with_core_operations();
        let none = OperationFlags::NONE;
        registry
            .register_custom(OperationCode(150), "custom_view", none, noop())
            .unwrap();
        assert!(registry.is_known(OperationCode(150)));
        assert_eq!(
            registry.info(OperationCode(150)).unwrap().origin,
            OperationOrigin::Custom
        );

        assert_eq!(
            registry
                .register_custom(OperationCode(250), "x", none, noop())
                .unwrap_err(),
            RegistryError::OutsideCustomBand(OperationCode(250))
        );
        assert_eq!(
            registry
                .register_custom(OperationCode(150), "again", none, noop())
                .unwrap_err(),
            RegistryError::DuplicateOperation(OperationCode(150))
        );
    }

    #[test]
    fn test_hidden_codes() {
        let registry = OperationRegistry::with_core_operations();
        let hidden = registry.hidden_codes();
        assert!(hidden.contains(&codes::REGISTER_REFERRALS));
        assert!(hidden.contains(&codes::NOTIFY_DELETE_ENTRY));
        assert!(!hidden.contains(&codes::EXPORT_ENTRY));
    }
}
