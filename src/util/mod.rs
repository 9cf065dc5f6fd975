//! Shared utilities: constants, logging, options and test helpers.

pub mod constants;
pub mod logger;
pub mod options;

#[cfg(any(test, feature = "test_private"))]
pub mod test_util;
