/// A cropped vehicle region handed to plate recognition.
#[derive(Clone, Debug)]
pub struct RoiImage {
    /// Contiguous RGB bytes, row-major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Domain interface for the licence-plate recogniser.
///
/// Returns `Ok(None)` when no plate is readable in the region;
/// recognition engines that are not installed report unavailability via
/// `is_available` instead of erroring.
pub trait PlateRecognizer: Send + Sync {
    fn recognize(
        &self,
        roi: &RoiImage,
    ) -> Result<Option<(String, f64)>, Box<dyn std::error::Error>>;

    fn is_available(&self) -> bool {
        true
    }
}

/// Recogniser used when no plate engine is wired in; every region reads
/// as "no plate".
pub struct NullPlateRecognizer;

impl PlateRecognizer for NullPlateRecognizer {
    fn recognize(
        &self,
        _roi: &RoiImage,
    ) -> Result<Option<(String, f64)>, Box<dyn std::error::Error>> {
        Ok(None)
    }

    fn is_available(&self) -> bool {
        false
    }
}
