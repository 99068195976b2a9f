//! Configuration stores: user-global host config and per-project config.

pub mod host;
pub mod project;

pub use host::HostConfig;
pub use project::ProjectConfig;
