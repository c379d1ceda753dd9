pub mod auth;
pub mod core;
pub mod grid;
pub mod import;
pub mod students;
