use crate::types::{Chargef64, Lengthf64};

/// A charge deposit in one projection plane.
///
/// `pos_time` is the drift coordinate and `pos_strip` the coordinate along the
/// strip pitch direction, both in mm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit2D {
    pos_time : Lengthf64,
    pos_strip: Lengthf64,
    charge   : Chargef64,
}

impl Hit2D {
    pub fn new(pos_time: Lengthf64, pos_strip: Lengthf64, charge: Chargef64) -> Self {
        Self { pos_time, pos_strip, charge }
    }
    pub fn pos_time (&self) -> Lengthf64 { self.pos_time }
    pub fn pos_strip(&self) -> Lengthf64 { self.pos_strip }
    pub fn charge   (&self) -> Chargef64 { self.charge }
}

pub type Hit2DCollection = Vec<Hit2D>;

pub fn total_charge(hits: &[Hit2D]) -> Chargef64 {
    hits.iter().map(Hit2D::charge).sum()
}
