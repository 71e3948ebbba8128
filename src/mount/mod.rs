//! Mount lifecycle

pub mod session;

pub use session::MountSession;
