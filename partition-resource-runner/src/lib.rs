//! Library side of `partition-resource-runner`: gathering partition parameters
//! from the command line.

pub mod inputs;
