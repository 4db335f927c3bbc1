//! Test support for the Galena end-to-end suite.

pub mod helpers;
