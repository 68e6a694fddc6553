// Shared math and protocol constants for the qsnd workspace.

pub mod q_shared;
