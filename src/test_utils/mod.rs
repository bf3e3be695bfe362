//! Test doubles for the processor and the embedding environment.

pub mod mock;
