pub mod decider;
