//! Child-session launch.
//!
//! One launch routine serves both paths that start children: the queue
//! worker (full safety checks) and the approved-agent spawner (human
//! already approved; depth pinned to the top level). Keeping them on one
//! routine keeps the spawn sequence identical where it matters.

mod handler;
mod launcher;

pub use handler::LaunchHandler;
pub use launcher::{LaunchChecks, LaunchOutcome, LaunchSpec, SessionLauncher};
