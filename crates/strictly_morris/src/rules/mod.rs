//! Game rules for three-piece morris.
//!
//! This module contains the pure decision functions the engine is built on.

mod line;

pub use line::{forms_line, has_line};
