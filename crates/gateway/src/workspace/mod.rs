//! Workspace file access: bootstrap context discovery and read-through
//! caching of context files served to the prompt builder.

pub mod bootstrap;
pub mod files;
