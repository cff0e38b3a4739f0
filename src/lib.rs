mod exports;
pub use exports::*;

pub mod types;
pub mod error;
pub mod hit;
pub mod histogram;
pub mod minimize;
pub mod rechits;
pub mod segment2d;
pub mod hough;
pub mod segment3d;
pub mod track;
pub mod builder;
pub mod curve;
pub mod ionrange;
pub mod dedx;
pub mod event;
pub mod toymc;
pub mod analysis;
pub mod config;
pub mod utils;
