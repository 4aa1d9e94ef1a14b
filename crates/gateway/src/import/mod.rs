//! Importers for bringing external OpenClaw installs into this gateway's
//! workspace and config.

pub mod openclaw;
