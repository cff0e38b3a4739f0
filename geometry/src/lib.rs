//! Read-only description of the TPC readout: three strip planes (U, V, W)
//! plus a drift (time) axis.

mod projection;
mod tpc;

pub use projection::Projection;
pub use tpc::{GeometryError, GeometryParams, GeometryTPC, Range};

pub use nalgebra::{Vector2, Vector3};
