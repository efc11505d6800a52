//! Debugger front ends.

pub mod dap;
