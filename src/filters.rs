//! Action filters: named, prioritized hooks bound to controller actions.
//!
//! Every controller **instance** owns its own [`FilterRegistry`] — there is
//! no module-level or global filter table. Two requests dispatched to
//! different instances (or to fresh instances of the same controller, the
//! common case) can never observe or overwrite each other's registrations.
//!
//! Registration is fail-soft: invalid arguments are logged and refused,
//! never panicked on. A controller with one bad `register_before` call
//! still boots with its remaining filters intact.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::context::Context;
use crate::error::Error;
use crate::handler::BoxFuture;

/// Default per-filter deadline. Override per instance with
/// [`FilterRegistry::set_timeout`].
pub const DEFAULT_FILTER_TIMEOUT: Duration = Duration::from_millis(5000);

// ── FilterKind ───────────────────────────────────────────────────────────────

/// Which side of the action a filter runs on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FilterKind {
    Before,
    After,
}

impl FilterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── FilterDescriptor ─────────────────────────────────────────────────────────

pub(crate) type FilterFn = Arc<dyn Fn(Context) -> BoxFuture<Result<(), Error>> + Send + Sync>;

/// One registered filter: the callback plus everything needed to match,
/// order, and report on it.
///
/// The callback is an `Arc`'d async closure; whatever receiver state it
/// needs (usually an `Arc` of the controller's innards) is captured at
/// registration, making the `(receiver, function)` pair explicit.
#[derive(Clone)]
pub struct FilterDescriptor {
    pub(crate) owner: String,
    pub(crate) actions: HashSet<String>,
    pub(crate) callback: FilterFn,
    pub(crate) priority: i32,
    pub(crate) enabled: bool,
    pub(crate) label: String,
    pub(crate) registered_at: Instant,
    pub(crate) seq: u64,
}

impl FilterDescriptor {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn matches_action(&self, action: &str) -> bool {
        self.actions.contains(action.trim())
    }
}

impl fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDescriptor")
            .field("owner", &self.owner)
            .field("label", &self.label)
            .field("actions", &self.actions)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

// ── Registration inputs ──────────────────────────────────────────────────────

/// Action names accepted by registration: one name or a list.
pub struct ActionNames(Vec<String>);

impl From<&str> for ActionNames {
    fn from(name: &str) -> Self {
        Self(vec![name.to_owned()])
    }
}

impl From<String> for ActionNames {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl<const N: usize> From<[&str; N]> for ActionNames {
    fn from(names: [&str; N]) -> Self {
        Self(names.iter().map(|s| (*s).to_owned()).collect())
    }
}

impl From<Vec<String>> for ActionNames {
    fn from(names: Vec<String>) -> Self {
        Self(names)
    }
}

impl From<Vec<&str>> for ActionNames {
    fn from(names: Vec<&str>) -> Self {
        Self(names.iter().map(|s| (*s).to_owned()).collect())
    }
}

/// Optional registration settings.
#[derive(Default)]
pub struct FilterOptions {
    /// Higher runs earlier. Defaults to 0.
    pub priority: i32,
    /// Display label. Rust closures are nameless, so without this the
    /// filter is listed as `"anonymous"`.
    pub name: Option<String>,
}

impl FilterOptions {
    pub fn priority(priority: i32) -> Self {
        Self { priority, name: None }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { priority: 0, name: Some(name.into()) }
    }

    pub fn named_priority(name: impl Into<String>, priority: i32) -> Self {
        Self { priority, name: Some(name.into()) }
    }
}

// ── FilterRegistry ───────────────────────────────────────────────────────────

/// Ordered before/after filter collections for one controller instance.
///
/// Both lists are kept sorted by descending priority immediately after any
/// insertion; ties preserve registration order. Mutating methods take
/// `&mut self`, so the borrow checker rules out restructuring mid-dispatch.
pub struct FilterRegistry {
    owner: String,
    before: Vec<FilterDescriptor>,
    after: Vec<FilterDescriptor>,
    timeout: Duration,
    next_seq: u64,
}

impl FilterRegistry {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            before: Vec::new(),
            after: Vec::new(),
            timeout: DEFAULT_FILTER_TIMEOUT,
            next_seq: 0,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Per-filter deadline used by the executor for this instance.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Registers a before-filter for `actions`. Returns `true` when the
    /// registration was accepted.
    pub fn register_before<F, Fut>(
        &mut self,
        actions: impl Into<ActionNames>,
        callback: F,
        options: FilterOptions,
    ) -> bool
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.register(FilterKind::Before, actions.into(), callback, options)
    }

    /// Registers an after-filter for `actions`. Returns `true` when the
    /// registration was accepted.
    pub fn register_after<F, Fut>(
        &mut self,
        actions: impl Into<ActionNames>,
        callback: F,
        options: FilterOptions,
    ) -> bool
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.register(FilterKind::After, actions.into(), callback, options)
    }

    fn register<F, Fut>(
        &mut self,
        kind: FilterKind,
        actions: ActionNames,
        callback: F,
        options: FilterOptions,
    ) -> bool
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let label = options.name.unwrap_or_else(|| "anonymous".to_owned());
        if let Err(refusal) = self.validate(&actions) {
            // Fail-soft: one bad controller must not abort application boot.
            warn!(
                owner = %self.owner,
                %kind,
                %label,
                error = %refusal,
                "filter registration refused"
            );
            return false;
        }

        let descriptor = FilterDescriptor {
            owner: self.owner.clone(),
            actions: actions.0.iter().map(|a| a.trim().to_owned()).collect(),
            callback: Arc::new(move |ctx| Box::pin(callback(ctx))),
            priority: options.priority,
            enabled: true,
            label,
            registered_at: Instant::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let list = self.list_mut(kind);
        list.push(descriptor);
        // Stable on equal priorities: seq preserves registration order.
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        true
    }

    fn validate(&self, actions: &ActionNames) -> Result<(), Error> {
        if self.owner.trim().is_empty() {
            return Err(Error::Registration("owner identity is blank".to_owned()));
        }
        if actions.0.is_empty() {
            return Err(Error::Registration("no action names given".to_owned()));
        }
        if actions.0.iter().any(|a| a.trim().is_empty()) {
            return Err(Error::Registration("blank action name".to_owned()));
        }
        Ok(())
    }

    /// Removes every before-filter with `label`. Returns how many were
    /// dropped.
    pub fn remove_before(&mut self, label: &str) -> usize {
        Self::remove(&mut self.before, label)
    }

    /// Removes every after-filter with `label`. Returns how many were
    /// dropped.
    pub fn remove_after(&mut self, label: &str) -> usize {
        Self::remove(&mut self.after, label)
    }

    fn remove(list: &mut Vec<FilterDescriptor>, label: &str) -> usize {
        let before = list.len();
        list.retain(|d| d.label != label);
        before - list.len()
    }

    /// Lists registered filters in execution order. `kind = None` lists
    /// before-filters followed by after-filters.
    pub fn list(&self, kind: Option<FilterKind>) -> Vec<&FilterDescriptor> {
        match kind {
            Some(FilterKind::Before) => self.before.iter().collect(),
            Some(FilterKind::After) => self.after.iter().collect(),
            None => self.before.iter().chain(self.after.iter()).collect(),
        }
    }

    /// Whether any filter of `kind` is registered for `action`, optionally
    /// narrowed to a specific label.
    pub fn is_registered(&self, kind: FilterKind, action: &str, label: Option<&str>) -> bool {
        self.list_ref(kind).iter().any(|d| {
            d.matches_action(action) && label.is_none_or(|l| d.label == l)
        })
    }

    /// Enables or disables every filter of `kind` carrying `label`.
    /// Returns `true` when at least one filter was touched.
    pub fn set_enabled(&mut self, kind: FilterKind, label: &str, enabled: bool) -> bool {
        let mut touched = false;
        for descriptor in self.list_mut(kind).iter_mut().filter(|d| d.label == label) {
            descriptor.enabled = enabled;
            touched = true;
        }
        touched
    }

    /// Drops filters of `kind`, or all filters when `kind` is `None`.
    pub fn clear(&mut self, kind: Option<FilterKind>) {
        match kind {
            Some(FilterKind::Before) => self.before.clear(),
            Some(FilterKind::After) => self.after.clear(),
            None => {
                self.before.clear();
                self.after.clear();
            }
        }
    }

    /// Every enabled filter of `kind` whose owner matches and whose action
    /// set contains the trimmed `action`, in execution order. The lists are
    /// already priority-sorted, so this is a plain scan.
    pub(crate) fn matching(
        &self,
        kind: FilterKind,
        owner: &str,
        action: &str,
    ) -> Vec<&FilterDescriptor> {
        let action = action.trim();
        self.list_ref(kind)
            .iter()
            .filter(|d| d.enabled && d.owner == owner && d.matches_action(action))
            .collect()
    }

    fn list_ref(&self, kind: FilterKind) -> &[FilterDescriptor] {
        match kind {
            FilterKind::Before => &self.before,
            FilterKind::After => &self.after,
        }
    }

    fn list_mut(&mut self, kind: FilterKind) -> &mut Vec<FilterDescriptor> {
        match kind {
            FilterKind::Before => &mut self.before,
            FilterKind::After => &mut self.after,
        }
    }
}
