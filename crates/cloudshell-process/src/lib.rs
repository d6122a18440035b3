pub mod readiness;
pub mod supervisor;
pub mod tail;
pub mod vm;

pub use readiness::ReadinessScanner;
pub use supervisor::{Supervisor, VmProcess};
pub use vm::{VmCommand, VmSpec};

/// Opaque per-connection token. Also scopes the session's temp paths.
///
/// NOTE: Freshly random for every session; never derived from client input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of the supervised emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VmState {
    Starting,
    Ready,
    Exited(Option<i32>),
}

impl VmState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Exited(_) => "exited",
        }
    }
}

/// Per-process notifications, in order: at most one `Ready`, then exactly one `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    Ready,
    Exited(Option<i32>),
}
