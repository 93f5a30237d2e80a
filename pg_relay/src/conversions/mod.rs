pub mod cdc_event;
pub mod cell;
pub mod change_event;
pub mod relation;
