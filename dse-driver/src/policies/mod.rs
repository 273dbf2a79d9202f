//! Policies let users configure how the driver picks hosts for a statement.
//! Every policy is a trait, so a custom one is a trait implementation away.

pub mod load_balancing;
