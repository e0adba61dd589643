pub mod build;
pub mod inspect;
pub mod prune;
pub mod pull;
