use std::fmt;

pub use nalgebra::{Vector2, Vector3};
pub use units::todo::{Lengthf64, Chargef64};

pub type Vec2 = Vector2<f64>;
pub type Vec3 = Vector3<f64>;

/// Particle hypothesis attached to a reconstructed segment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pid {
    #[default]
    Unknown,
    Alpha,
    C12,
    C14,
    Dot,
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pid::Unknown => "unknown",
            Pid::Alpha   => "alpha",
            Pid::C12     => "12C",
            Pid::C14     => "14C",
            Pid::Dot     => "dot",
        };
        write!(f, "{name}")
    }
}

/// Dummy loss reported when a quantity cannot be evaluated
pub const DUMMY_LOSS: f64 = 999.0;
