pub mod parse_value;
pub mod shutdown_signal;
