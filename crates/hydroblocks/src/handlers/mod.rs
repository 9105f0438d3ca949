//! Block handlers, one module per family. Each handler returns the result
//! for the happy path and a [`hydrocore::BlockError`] for everything else;
//! the executor turns errors into failed results.

pub(crate) mod actuator;
pub(crate) mod control;
pub(crate) mod error_handler;
pub(crate) mod logic;
pub(crate) mod sensor;
pub(crate) mod variables;
