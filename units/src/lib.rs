//! Physical quantities used throughout the reconstruction.
//!
//! Inner loops work on plain `f64` millimetres (see [`todo`]); `uom`
//! quantities are used where values enter from configuration or leave
//! towards the analysis layer.

pub mod todo;

pub use uom;
pub use uom::si::Quantity;
pub use uom::si::f64::{
    Angle, Energy, Frequency, Length, Pressure, Ratio, ThermodynamicTemperature, Time, Velocity,
};

mod units {
  pub use uom::si::{length  ::{millimeter, centimeter},
                    time    ::{microsecond, nanosecond},
                    velocity::meter_per_second,
                    frequency::megahertz,
                    pressure::millibar,
                    thermodynamic_temperature::kelvin,
                    energy  ::megaelectronvolt,
                    ratio   ::ratio,
                    angle   ::{radian, degree},
  };
}

// Making values from float literals seems to be very long-winded, so provide
// some pithily-named convenience constructors.

/// Generate a function called NAME which returns QUANTITY by interpreting its
/// argument as UNIT
///
/// wrap!(NAME QUANTITY UNIT);
macro_rules! wrap {
  ($name:ident $quantity:ident $unit:ident ) => {
    pub fn $name(x: f64) -> $quantity { $quantity::new::<units::$unit>(x) }
  };
}

wrap!(cm     Length                     centimeter);
wrap!(mm     Length                     millimeter);
wrap!(us     Time                      microsecond);
wrap!(ns     Time                       nanosecond);
wrap!(m_s    Velocity             meter_per_second);
wrap!(mhz    Frequency                   megahertz);
wrap!(mbar   Pressure                     millibar);
wrap!(kelvin ThermodynamicTemperature       kelvin);
wrap!(mev    Energy               megaelectronvolt);
wrap!(ratio  Ratio                           ratio);
wrap!(radian Angle                          radian);
wrap!(degree Angle                          degree);

// Reverse direction of the above.
pub fn mm_    (x: Length                  ) -> f64 { x.get::<units::millimeter>() }
pub fn cm_    (x: Length                  ) -> f64 { x.get::<units::centimeter>() }
pub fn us_    (x: Time                    ) -> f64 { x.get::<units::microsecond>() }
pub fn mhz_   (x: Frequency               ) -> f64 { x.get::<units::megahertz>() }
pub fn mbar_  (x: Pressure                ) -> f64 { x.get::<units::millibar>() }
pub fn kelvin_(x: ThermodynamicTemperature) -> f64 { x.get::<units::kelvin>() }
pub fn mev_   (x: Energy                  ) -> f64 { x.get::<units::megaelectronvolt>() }
pub fn ratio_ (x: Ratio                   ) -> f64 { x.get::<units::ratio>() }
pub fn radian_(x: Angle                   ) -> f64 { x.get::<units::radian>() }

/// Drift velocities are quoted in cm/μs, which `uom` has no abbreviation for.
pub fn cm_us (x: f64) -> Velocity { m_s(x * 1.0e4) }
pub fn cm_us_(x: Velocity) -> f64 { x.get::<units::meter_per_second>() * 1.0e-4 }

/// Distance drifted during one time cell, in mm
pub fn drift_per_cell_mm(drift: Velocity, sampling: Frequency) -> f64 {
    mm_(drift / sampling)
}

#[macro_export]
macro_rules! assert_uom_eq {
  ($unit:ident, $lhs:expr, $rhs:expr, $algo:ident <= $tol:expr) => {
    float_eq::assert_float_eq!($lhs.get::<$unit>(), $rhs.get::<$unit>(), $algo <= $tol)
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use float_eq::assert_float_eq;

  #[test]
  fn lengths_add_across_units() {
    let v = vec![mm(1.0), cm(1.0)];
    let total: Length = v.into_iter().sum();
    use units::millimeter;
    assert_uom_eq!(millimeter, total, mm(11.0), ulps <= 1);
  }

  #[test]
  fn drift_velocity_round_trip() {
    assert_float_eq!(cm_us_(cm_us(0.646)), 0.646, ulps <= 2);
  }

  #[test]
  fn drift_per_cell() {
    // 0.646 cm/us at 25 MHz: 6.46 mm/us * 0.04 us
    assert_float_eq!(drift_per_cell_mm(cm_us(0.646), mhz(25.0)), 0.2584, r2nd <= 1e-12);
  }
}
