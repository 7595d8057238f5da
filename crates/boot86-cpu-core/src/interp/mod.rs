//! The instruction-at-a-time interpreter.

pub mod exec;
