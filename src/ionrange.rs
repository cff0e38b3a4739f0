//! Range-energy conversion for ions stopping in the TPC gas.
//!
//! Range curves are tabulated at reference conditions (250 mbar, 293.15 K)
//! and scaled to the running conditions by ideal-gas density:
//! `range(p, T) = range_ref · (T / T_ref) · (p_ref / p)`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use units::{kelvin_, mbar_, Pressure, ThermodynamicTemperature};

use crate::curve::{BraggKleeman, Curve};
use crate::error::{ConfigError, Result};
use crate::types::Pid;

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum Gas {
    CO2,
    #[serde(rename = "He_CO2_90_10")]
    HeCO2_90_10,
}

impl fmt::Display for Gas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gas::CO2         => write!(f, "CO2"),
            Gas::HeCO2_90_10 => write!(f, "He_CO2_90_10"),
        }
    }
}

impl FromStr for Gas {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CO2"          => Ok(Gas::CO2),
            "He_CO2_90_10" => Ok(Gas::HeCO2_90_10),
            other          => Err(ConfigError::UnknownGas(other.into())),
        }
    }
}

/// MeV per atomic mass unit
pub const ATOMIC_MASS_UNIT_MEV: f64 = 931.494_102_422_8;

/// Ion rest mass in atomic mass units
pub fn ion_mass_u(ion: Pid) -> Result<f64> {
    match ion {
        Pid::Alpha => Ok(4.001_506_179_127),
        Pid::C12   => Ok(12.0),
        Pid::C14   => Ok(14.003_241_989_4),
        other      => Err(ConfigError::UnsupportedParticle(other.to_string())),
    }
}

pub const REFERENCE_PRESSURE_MBAR   : f64 = 250.0;
pub const REFERENCE_TEMPERATURE_K   : f64 = 293.15;

/// Energy up to which the built-in range tables extend, MeV
const TABLE_MAX_ENERGY: f64 = 40.0;

/// Built-in range-energy relations at reference conditions
fn builtin_law(gas: Gas, ion: Pid) -> Option<BraggKleeman> {
    let law = |energy, range, exponent| Some(BraggKleeman::new(energy, range, exponent, 1.0));
    match (gas, ion) {
        (Gas::CO2        , Pid::Alpha) => law(10.0, 297.23, 1.75),
        (Gas::CO2        , Pid::C12  ) => law( 5.0,  23.43, 1.30),
        (Gas::CO2        , Pid::C14  ) => law( 5.0,  22.10, 1.30),
        (Gas::HeCO2_90_10, Pid::Alpha) => law(10.0, 845.00, 1.75),
        (Gas::HeCO2_90_10, Pid::C12  ) => law( 5.0,  71.50, 1.30),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct IonRangeCalculator {
    gas        : Gas,
    pressure   : f64, // mbar
    temperature: f64, // K
    /// energy (MeV) → range (mm) at reference conditions
    range      : HashMap<Pid, Curve>,
    energy     : HashMap<Pid, Curve>,
}

impl IonRangeCalculator {

    /// Calculator with the built-in tables for `gas`
    pub fn new(gas: Gas, pressure: Pressure, temperature: ThermodynamicTemperature) -> Result<Self> {
        let mut calc = Self {
            gas, pressure: 0.0, temperature: 0.0,
            range: HashMap::new(), energy: HashMap::new()
        };
        calc.set_conditions(pressure, temperature)?;
        for ion in [Pid::Alpha, Pid::C12, Pid::C14] {
            if let Some(law) = builtin_law(gas, ion) {
                calc.register(ion, law.range_curve(TABLE_MAX_ENERGY, 400)?)?;
            }
        }
        if calc.range.is_empty() {
            return Err(ConfigError::MissingCurve { gas: gas.to_string(), ion: "any ion".into() })
        }
        Ok(calc)
    }

    /// Replace (or add) the range curve of `ion`: range in mm as a function
    /// of kinetic energy in MeV, at reference conditions.
    pub fn register(&mut self, ion: Pid, range_vs_energy: Curve) -> Result<()> {
        ion_mass_u(ion)?;
        let curve  = range_vs_energy.through_origin()?;
        let energy = curve.inverted()?;
        self.range .insert(ion, curve);
        self.energy.insert(ion, energy);
        Ok(())
    }

    pub fn set_conditions(&mut self, pressure: Pressure, temperature: ThermodynamicTemperature) -> Result<()> {
        let (p, t) = (mbar_(pressure), kelvin_(temperature));
        if !(p > 0.0 && p.is_finite()) { return Err(ConfigError::OutOfRange { what: "gas pressure [mbar]"  , value: p }) }
        if !(t > 0.0 && t.is_finite()) { return Err(ConfigError::OutOfRange { what: "gas temperature [K]", value: t }) }
        self.pressure    = p;
        self.temperature = t;
        Ok(())
    }

    pub fn gas             (&self) -> Gas { self.gas }
    pub fn pressure_mbar   (&self) -> f64 { self.pressure }
    pub fn temperature_k   (&self) -> f64 { self.temperature }

    /// Ratio of running to reference range for the same energy
    fn density_scale(&self) -> f64 {
        (self.temperature / REFERENCE_TEMPERATURE_K) * (REFERENCE_PRESSURE_MBAR / self.pressure)
    }

    fn curves(&self, ion: Pid) -> Result<(&Curve, &Curve)> {
        match (self.range.get(&ion), self.energy.get(&ion)) {
            (Some(r), Some(e)) => Ok((r, e)),
            _ => {
                ion_mass_u(ion)?;
                Err(ConfigError::MissingCurve { gas: self.gas.to_string(), ion: ion.to_string() })
            }
        }
    }

    /// Range in mm of `ion` with kinetic energy `energy` MeV
    pub fn range_mm(&self, ion: Pid, energy: f64) -> Result<f64> {
        let (range, _) = self.curves(ion)?;
        if !(energy >= 0.0) { return Err(ConfigError::OutOfRange { what: "kinetic energy [MeV]", value: energy }) }
        Ok(range.eval(energy) * self.density_scale())
    }

    /// Kinetic energy in MeV of `ion` stopping after `range` mm
    pub fn energy_mev(&self, ion: Pid, range: f64) -> Result<f64> {
        let (_, energy) = self.curves(ion)?;
        if !(range >= 0.0) { return Err(ConfigError::OutOfRange { what: "range [mm]", value: range }) }
        Ok(energy.eval(range / self.density_scale()))
    }

    pub fn mass_mev(ion: Pid) -> Result<f64> { Ok(ion_mass_u(ion)? * ATOMIC_MASS_UNIT_MEV) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;
    use rstest::rstest;
    use units::{kelvin, mbar};

    fn reference(gas: Gas) -> IonRangeCalculator {
        IonRangeCalculator::new(gas, mbar(REFERENCE_PRESSURE_MBAR), kelvin(REFERENCE_TEMPERATURE_K)).unwrap()
    }

    #[rstest(/**/ ion       , energy, range ,
             case(Pid::Alpha, 10.0  , 297.23),
             case(Pid::C12  ,  5.0  ,  23.43),
    )]
    fn reference_points(ion: Pid, energy: f64, range: f64) {
        let calc = reference(Gas::CO2);
        assert_float_eq!(calc.range_mm(ion, energy).unwrap(), range, r2nd <= 1e-3);
        assert_float_eq!(calc.energy_mev(ion, range).unwrap(), energy, r2nd <= 1e-3);
    }

    #[test]
    fn zero_energy_has_zero_range() {
        let calc = reference(Gas::CO2);
        assert_float_eq!(calc.range_mm(Pid::Alpha, 0.0).unwrap(), 0.0, abs <= 1e-12);
        assert_float_eq!(calc.energy_mev(Pid::C14, 0.0).unwrap(), 0.0, abs <= 1e-12);
    }

    #[test]
    fn range_scales_with_density() {
        let mut calc = reference(Gas::CO2);
        let r_ref = calc.range_mm(Pid::Alpha, 6.0).unwrap();
        calc.set_conditions(mbar(125.0), kelvin(2.0 * REFERENCE_TEMPERATURE_K)).unwrap();
        assert_float_eq!(calc.range_mm(Pid::Alpha, 6.0).unwrap(), 4.0 * r_ref, r2nd <= 1e-12);
        assert_float_eq!(calc.energy_mev(Pid::Alpha, 4.0 * r_ref).unwrap(), 6.0, r2nd <= 1e-3);
    }

    #[test]
    fn invalid_requests_are_errors() {
        let calc = reference(Gas::HeCO2_90_10);
        assert!(matches!(calc.range_mm(Pid::C14, 1.0), Err(ConfigError::MissingCurve { .. })));
        assert!(matches!(calc.range_mm(Pid::Dot, 1.0), Err(ConfigError::UnsupportedParticle(_))));
        assert!(matches!(calc.range_mm(Pid::Alpha, -1.0), Err(ConfigError::OutOfRange { .. })));
        assert!(matches!(calc.energy_mev(Pid::Alpha, -1.0), Err(ConfigError::OutOfRange { .. })));
        assert!(IonRangeCalculator::new(Gas::CO2, mbar(0.0), kelvin(293.0)).is_err());
        assert!(IonRangeCalculator::new(Gas::CO2, mbar(250.0), kelvin(-1.0)).is_err());
        assert!(matches!("Ar".parse::<Gas>(), Err(ConfigError::UnknownGas(_))));
    }

    #[test]
    fn custom_curve_replaces_builtin() {
        let mut calc = reference(Gas::CO2);
        calc.register(Pid::Alpha, Curve::new(vec![(1.0, 10.0), (2.0, 30.0)]).unwrap()).unwrap();
        assert_float_eq!(calc.range_mm(Pid::Alpha, 0.5).unwrap(),  5.0, abs <= 1e-12);
        assert_float_eq!(calc.energy_mev(Pid::Alpha, 20.0).unwrap(), 1.5, abs <= 1e-12);
    }

    #[test]
    fn masses() {
        assert_float_eq!(IonRangeCalculator::mass_mev(Pid::Alpha).unwrap(), 3727.379, abs <= 1e-3);
        assert_float_eq!(IonRangeCalculator::mass_mev(Pid::C12).unwrap(), 12.0 * ATOMIC_MASS_UNIT_MEV, ulps <= 1);
    }
}
