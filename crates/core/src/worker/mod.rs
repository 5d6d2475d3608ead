//! # Worker Management
//!
//! Isolated execution for agent workers: a git worktree per task attempt, a
//! supervised process per worktree, and lifecycle plumbing that keeps the
//! two in sync.

pub mod lifecycle;
pub mod session;
pub mod worktree;

pub use lifecycle::{compose_mission, OrphanReport, WorkerLifecycleManager, WorkspaceStatus};
pub use session::{SessionHandle, SessionRegistry, WorkerOutcome, IMPASSE_MARKER};
pub use worktree::MergeResult;
