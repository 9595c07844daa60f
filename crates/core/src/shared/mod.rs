pub mod assignment;
pub mod bbox;
pub mod frame;
pub mod mac;
