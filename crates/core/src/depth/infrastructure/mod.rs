pub mod frame_depth_reader;
