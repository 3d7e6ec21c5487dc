//! Subcommand implementations.

pub(crate) mod completions;
pub(crate) mod identify;
pub(crate) mod ports;
pub(crate) mod scan;
