pub mod domain;
pub mod history;
pub mod match_tracker;
pub mod matcher;
pub mod whitelist;
