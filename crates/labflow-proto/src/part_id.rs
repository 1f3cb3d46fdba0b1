//! Dotted part identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a part within an experiment.
///
/// Identifiers are dotted paths (`fan.left`); each segment denotes nesting
/// inside a flow. Two reserved names double as routing sentinels: `quit`
/// ends the experiment and `done` leaves the enclosing flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartId(String);

impl PartId {
    /// Routing target that ends the experiment.
    pub const TERMINAL: &'static str = "quit";

    /// Routing target that leaves the enclosing flow.
    pub const LEAVE_FLOW: &'static str = "done";

    /// Creates a new part ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The terminal sentinel as an identifier.
    pub fn terminal() -> Self {
        Self::new(Self::TERMINAL)
    }

    /// The leave-flow sentinel as an identifier.
    pub fn leave_flow() -> Self {
        Self::new(Self::LEAVE_FLOW)
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_terminal(&self) -> bool {
        self.0 == Self::TERMINAL
    }

    pub fn is_leave_flow(&self) -> bool {
        self.0 == Self::LEAVE_FLOW
    }

    /// Returns true for either routing sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.is_terminal() || self.is_leave_flow()
    }

    /// The last segment (the name the part was declared under).
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Iterates the dotted segments from outermost to innermost.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Nesting depth; top-level parts have depth 1.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The enclosing flow, or `None` for a top-level part.
    pub fn parent(&self) -> Option<PartId> {
        self.0.rsplit_once('.').map(|(parent, _)| PartId::new(parent))
    }

    /// Builds the identifier of a member declared inside this part.
    pub fn child(&self, name: &str) -> PartId {
        PartId(format!("{}.{}", self.0, name))
    }

    /// Returns true if this part is nested (at any depth) inside `flow`.
    pub fn is_within(&self, flow: &PartId) -> bool {
        self.0.len() > flow.0.len()
            && self.0.starts_with(flow.as_str())
            && self.0.as_bytes()[flow.0.len()] == b'.'
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PartId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for PartId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_and_parent() {
        let id = PartId::new("outer.inner.leaf");
        assert_eq!(id.name(), "leaf");
        assert_eq!(id.depth(), 3);
        assert_eq!(id.parent(), Some(PartId::new("outer.inner")));
        assert_eq!(PartId::new("top").parent(), None);
    }

    #[test]
    fn test_child() {
        assert_eq!(PartId::new("fan").child("left").as_str(), "fan.left");
    }

    #[test]
    fn test_is_within() {
        let flow = PartId::new("fan");
        assert!(PartId::new("fan.left").is_within(&flow));
        assert!(PartId::new("fan.left.deep").is_within(&flow));
        assert!(!PartId::new("fanout.left").is_within(&flow));
        assert!(!PartId::new("fan").is_within(&flow));
    }

    #[test]
    fn test_sentinels() {
        assert!(PartId::terminal().is_terminal());
        assert!(PartId::leave_flow().is_leave_flow());
        assert!(PartId::new("quit").is_sentinel());
        assert!(!PartId::new("start").is_sentinel());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let json = serde_json::to_string(&PartId::new("a.b")).unwrap();
        assert_eq!(json, "\"a.b\"");
    }
}
