pub mod schedule;
pub mod stack;
