use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::RangeInclusive;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::JobContext;
use crate::job::OperationCode;

/// Codes 1-99 are hardcoded core operations.
pub const CORE_BAND: RangeInclusive<u32> = 1..=99;
/// Codes 100-199 belong to the legacy custom-view extension point.
pub const CUSTOM_BAND: RangeInclusive<u32> = 100..=199;
/// Codes 200-9999 are allocated to plugins through configured ranges.
pub const PLUGIN_BAND: RangeInclusive<u32> = 200..=9999;

/// Well-known core operation codes.
pub mod codes {
    use crate::job::OperationCode;

    pub const CREATE_ENTRY: OperationCode = OperationCode::new(1);
    pub const EDIT_ENTRY: OperationCode = OperationCode::new(2);
    pub const DELETE_ENTRY: OperationCode = OperationCode::new(3);
    pub const COPY_ENTRY: OperationCode = OperationCode::new(4);
    pub const IMPORT_ENTRY: OperationCode = OperationCode::new(5);
    pub const EXPORT_ENTRY: OperationCode = OperationCode::new(6);
    pub const RESTORE_ENTRY: OperationCode = OperationCode::new(7);
    pub const EXPORT_SEARCH_RESULT: OperationCode = OperationCode::new(8);
    pub const REGISTER_REFERRALS: OperationCode = OperationCode::new(9);
    pub const CREATE_ENTITY: OperationCode = OperationCode::new(10);
    pub const EDIT_ENTITY: OperationCode = OperationCode::new(11);
    pub const DELETE_ENTITY: OperationCode = OperationCode::new(12);
    pub const DO_COPY_ENTRY: OperationCode = OperationCode::new(13);
    pub const IMPORT_ENTRY_V2: OperationCode = OperationCode::new(14);
    pub const GROUP_REGISTER_REFERRAL: OperationCode = OperationCode::new(15);
    pub const ROLE_REGISTER_REFERRAL: OperationCode = OperationCode::new(16);
    pub const EXPORT_ENTRY_V2: OperationCode = OperationCode::new(17);
    pub const UPDATE_DOCUMENT: OperationCode = OperationCode::new(18);
    pub const EXPORT_SEARCH_RESULT_V2: OperationCode = OperationCode::new(19);
    pub const MAY_INVOKE_TRIGGER: OperationCode = OperationCode::new(20);
    pub const NOTIFY_CREATE_ENTRY: OperationCode = OperationCode::new(21);
    pub const NOTIFY_UPDATE_ENTRY: OperationCode = OperationCode::new(22);
    pub const NOTIFY_DELETE_ENTRY: OperationCode = OperationCode::new(23);
}

/// Behavioral flags of an operation.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct OperationFlags {
    /// Excluded from user-facing job listings.
    pub hidden: bool,
    /// Accepts external cancel requests.
    pub cancelable: bool,
    /// Exempt from per-target dependency chaining.
    pub parallelizable: bool,
    /// Produces a blob in the result cache.
    pub downloadable: bool,
}

impl OperationFlags {
    pub const NONE: Self = Self {
        hidden: false,
        cancelable: false,
        parallelizable: false,
        downloadable: false,
    };

    pub const fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub const fn cancelable(mut self) -> Self {
        self.cancelable = true;
        self
    }

    pub const fn parallelizable(mut self) -> Self {
        self.parallelizable = true;
        self
    }

    pub const fn downloadable(mut self) -> Self {
        self.downloadable = true;
        self
    }
}

/// Where an operation definition came from.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OperationOrigin {
    Core,
    Custom,
    Plugin { plugin_id: String },
}

/// Static description of an operation, independent of its handler.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OperationInfo {
    pub code: OperationCode,
    pub name: Cow<'static, str>,
    pub flags: OperationFlags,
    pub origin: OperationOrigin,
}

impl OperationInfo {
    const fn core(
        code: OperationCode,
        name: &'static str,
        flags: OperationFlags,
    ) -> Self {
        Self {
            code,
            name: Cow::Borrowed(name),
            flags,
            origin: OperationOrigin::Core,
        }
    }
}

static CORE_OPERATIONS: LazyLock<Vec<OperationInfo>> = LazyLock::new(|| {
    use codes::*;

    let c = OperationFlags::NONE.cancelable();
    let export = c.parallelizable().downloadable();
    let h = OperationFlags::NONE.hidden();
    let notify = h.parallelizable();
    let op = OperationInfo::core;

    vec![
        op(CREATE_ENTRY, "create_entry", c),
        op(EDIT_ENTRY, "edit_entry", c),
        op(DELETE_ENTRY, "delete_entry", c),
        op(COPY_ENTRY, "copy_entry", c),
        op(IMPORT_ENTRY, "import_entry", c),
        op(EXPORT_ENTRY, "export_entry", export),
        op(RESTORE_ENTRY, "restore_entry", c),
        op(EXPORT_SEARCH_RESULT, "export_search_result", export),
        op(REGISTER_REFERRALS, "register_referrals", h),
        op(CREATE_ENTITY, "create_entity", c),
        op(EDIT_ENTITY, "edit_entity", c),
        op(DELETE_ENTITY, "delete_entity", c),
        op(DO_COPY_ENTRY, "do_copy_entry", notify.cancelable()),
        op(IMPORT_ENTRY_V2, "import_entry_v2", c),
        op(GROUP_REGISTER_REFERRAL, "group_register_referral", h),
        op(ROLE_REGISTER_REFERRAL, "role_register_referral", h),
        op(EXPORT_ENTRY_V2, "export_entry_v2", export),
        op(UPDATE_DOCUMENT, "update_document", h),
        op(EXPORT_SEARCH_RESULT_V2, "export_search_result_v2", export),
        op(MAY_INVOKE_TRIGGER, "may_invoke_trigger", h),
        op(NOTIFY_CREATE_ENTRY, "notify_create_entry", notify),
        op(NOTIFY_UPDATE_ENTRY, "notify_update_entry", notify),
        op(NOTIFY_DELETE_ENTRY, "notify_delete_entry", notify),
    ]
});

/// The hardcoded core operation table, built once per process.
pub fn core_operations() -> &'static [OperationInfo] {
    &CORE_OPERATIONS
}

/// How a handler finished when it did not fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    Done,
    /// Finished with a caveat; the message is appended to the job text.
    Warning(String),
    /// Stopped early after observing a cancel request.
    Canceled,
}

/// Body of an operation. Returning an error moves the job to `error`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutcome>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> fmt::Debug for FnHandler<F, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("fn", &std::any::type_name::<F>())
            .finish()
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        (self.f)(ctx).await
    }
}

/// Wraps a closure as a shareable handler.
///
/// ```ignore
/// registry.register(codes::EDIT_ENTRY, handler_fn(|ctx| async move {
///     ctx.set_text("indexed").await?;
///     Ok(JobOutcome::Done)
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_core_table_is_dense_and_inside_core_band() {
        let table = core_operations();
        assert_eq!(table.len(), 23);
        let codes: HashSet<u32> =
            table.iter().map(|info| info.code.get()).collect();
        assert_eq!(codes.len(), table.len());
        assert!(codes.iter().all(|code| CORE_BAND.contains(code)));
    }

    #[test]
    fn test_core_flags() {
        let by_code = |code: OperationCode| {
            core_operations()
                .iter()
                .find(|info| info.code == code)
                .map(|info| info.flags)
                .unwrap()
        };

        let edit = by_code(codes::EDIT_ENTRY);
        assert!(edit.cancelable && !edit.parallelizable && !edit.hidden);

        let export = by_code(codes::EXPORT_ENTRY_V2);
        assert!(export.parallelizable && export.downloadable);

        let notify = by_code(codes::NOTIFY_UPDATE_ENTRY);
        assert!(notify.hidden && notify.parallelizable && !notify.cancelable);

        assert_eq!(
            by_code(codes::REGISTER_REFERRALS),
            OperationFlags::NONE.hidden()
        );
    }

    #[test]
    fn test_bands_do_not_overlap() {
        assert!(CORE_BAND.end() < CUSTOM_BAND.start());
        assert!(CUSTOM_BAND.end() < PLUGIN_BAND.start());
    }
}
