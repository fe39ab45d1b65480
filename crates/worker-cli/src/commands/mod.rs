pub mod handler;
pub mod launch;
pub mod provision;
