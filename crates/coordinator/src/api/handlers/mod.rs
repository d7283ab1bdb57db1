pub mod admin;
pub mod steps;
pub mod workers;
pub mod workflows;
