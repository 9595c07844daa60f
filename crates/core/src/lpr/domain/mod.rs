pub mod plate_recognizer;
