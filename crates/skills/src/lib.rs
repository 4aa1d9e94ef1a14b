//! Skill discovery, aliasing, and install/uninstall for the agent's
//! skills directory (markdown doc + manifest pairs, optionally packaged
//! as signed tarballs).

pub mod aliases;
pub mod installer;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod types;
