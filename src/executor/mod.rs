pub mod chrome;
pub mod confirm;
pub mod coordinator;
pub mod dispatcher;
pub mod domain;
pub mod driver;
pub mod memory;
pub mod safety;
