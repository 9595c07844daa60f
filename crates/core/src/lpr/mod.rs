pub mod best_frame;
pub mod domain;
pub mod roi_workers;
