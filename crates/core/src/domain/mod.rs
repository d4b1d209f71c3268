pub mod instance;
pub mod step;
