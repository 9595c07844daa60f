use crate::shared::bbox::BBox;
use crate::shared::frame::Frame;

/// Whether a vehicle class belongs to the construction fleet (identified
/// by beacon) or is a civilian vehicle (identified by licence plate).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClassGroup {
    Construction,
    Civilian,
}

/// The ten vehicle classes the detector emits, with stable ids 0-9.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VehicleClass {
    Excavator,
    Loader,
    Bulldozer,
    Crane,
    Roller,
    DumpTruck,
    Car,
    Van,
    Bus,
    Truck,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 10] = [
        VehicleClass::Excavator,
        VehicleClass::Loader,
        VehicleClass::Bulldozer,
        VehicleClass::Crane,
        VehicleClass::Roller,
        VehicleClass::DumpTruck,
        VehicleClass::Car,
        VehicleClass::Van,
        VehicleClass::Bus,
        VehicleClass::Truck,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(&self) -> u8 {
        Self::ALL
            .iter()
            .position(|c| c == self)
            .unwrap_or_default() as u8
    }

    /// Lowercase wire token, e.g. `dump_truck`.
    pub fn label(&self) -> &'static str {
        match self {
            VehicleClass::Excavator => "excavator",
            VehicleClass::Loader => "loader",
            VehicleClass::Bulldozer => "bulldozer",
            VehicleClass::Crane => "crane",
            VehicleClass::Roller => "roller",
            VehicleClass::DumpTruck => "dump_truck",
            VehicleClass::Car => "car",
            VehicleClass::Van => "van",
            VehicleClass::Bus => "bus",
            VehicleClass::Truck => "truck",
        }
    }

    pub fn group(&self) -> ClassGroup {
        match self {
            VehicleClass::Excavator
            | VehicleClass::Loader
            | VehicleClass::Bulldozer
            | VehicleClass::Crane
            | VehicleClass::Roller
            | VehicleClass::DumpTruck => ClassGroup::Construction,
            VehicleClass::Car | VehicleClass::Van | VehicleClass::Bus | VehicleClass::Truck => {
                ClassGroup::Civilian
            }
        }
    }

    /// Maps a whitelist `machine_type` token onto a construction class.
    /// Accepts `-` or `_` separators in any case; civilian classes never
    /// match a machine type.
    pub fn from_machine_type(machine_type: &str) -> Option<Self> {
        let normalized = machine_type.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .filter(|c| c.group() == ClassGroup::Construction)
            .find(|c| c.label() == normalized)
    }
}

/// A single detector output for one frame. Transient — consumed by one
/// tracker update.
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f64,
    pub class: VehicleClass,
}

/// Domain interface for the black-box vehicle detector.
///
/// Implementations may be stateful (e.g. frame skipping or replay),
/// hence `&mut self`.
pub trait VehicleDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>>;

    /// Health predicate; callers branch explicitly instead of catching
    /// errors used as control flow.
    fn is_available(&self) -> bool {
        true
    }
}
