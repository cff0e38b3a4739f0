pub use crate::error::{ConfigError, Result};
pub use crate::types::{Pid, Vector2, Vector3, Lengthf64, Chargef64};
pub use crate::hit::{Hit2D, Hit2DCollection};
pub use crate::histogram::{Axis, Histo1D, Histo2D};
pub use crate::segment2d::TrackSegment2D;
pub use crate::segment3d::TrackSegment3D;
pub use crate::track::{FitMode, Track3D};
pub use crate::builder::{BuilderState, TrackBuilder};
pub use crate::dedx::{DedxFitter, EventType};
pub use crate::ionrange::{Gas, IonRangeCalculator};

pub use geometry::{GeometryTPC, Projection, Range};
