pub mod alert;
pub mod fleet;
pub mod history;
