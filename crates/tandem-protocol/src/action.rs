//! Action-name parsing.
//!
//! Wire form is `"Controller/Action"` or a bare `"Action"` (controller then
//! defaults to `"Home"`).  A leading slash (`"/SignIn"`) addresses the
//! reserved internal controller whose name is the empty string.

/// Controller the bare-action shorthand resolves to.
pub const DEFAULT_CONTROLLER: &str = "Home";

/// A parsed `Controller/Action` pair.
///
/// Parsing never fails for non-empty input; matching against the registry
/// (including case-insensitivity) is the dispatcher's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionName {
    pub controller: String,
    pub action: String,
}

impl ActionName {
    pub fn new(controller: impl Into<String>, action: impl Into<String>) -> Self {
        ActionName {
            controller: controller.into(),
            action: action.into(),
        }
    }

    /// Parse the wire form.  Returns `None` only for input with no action
    /// segment at all (`""` or `"Ctrl/"`).
    pub fn parse(raw: &str) -> Option<Self> {
        let (controller, action) = match raw.split_once('/') {
            Some((controller, action)) => (controller, action),
            None => (DEFAULT_CONTROLLER, raw),
        };
        if action.is_empty() {
            return None;
        }
        Some(ActionName::new(controller, action))
    }

    /// True when this addresses the reserved internal controller.
    pub fn is_internal(&self) -> bool {
        self.controller.is_empty()
    }
}

impl std::fmt::Display for ActionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.controller, self.action)
    }
}
