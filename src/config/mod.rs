//! Configuration file parser for reconstruction runs

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, de};

use geometry::{GeometryParams, GeometryTPC};
use units::{degree, Frequency, Length, Time, Velocity};

use crate::builder::BuilderParams;
use crate::dedx::DedxParams;
use crate::error::Result;
use crate::hough::HoughParams;
use crate::rechits::RecHitParams;
use crate::toymc::ToyParams;

fn deserialize_uom<'d, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'d>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    String::deserialize(deserializer)?
        .parse::<T>()
        .map_err(de::Error::custom)
}

/// Everything needed to reconstruct a run. Every table and field may be
/// omitted.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RecoConfig {
    pub geometry: GeometryConfig,
    pub rechits : RecHitParams,
    pub hough   : HoughParams,
    pub builder : BuilderParams,
    pub dedx    : DedxParams,
    pub toy     : ToyParams,
}

/// Physical quantities are written with their units, e.g. `"1.5 mm"`
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GeometryConfig {
    #[serde(deserialize_with = "deserialize_uom")]
    pub strip_pitch   : Length,

    #[serde(deserialize_with = "deserialize_uom")]
    pub drift_velocity: Velocity,

    #[serde(deserialize_with = "deserialize_uom")]
    pub sampling_rate : Frequency,

    #[serde(deserialize_with = "deserialize_uom")]
    pub trigger_delay : Time,

    pub n_strips      : [usize; 3],
    pub n_timecells   : usize,

    /// Pitch directions of U, V and W in degrees
    pub pitch_angle_deg: [f64; 3],
}

impl Default for GeometryConfig {
    fn default() -> Self {
        let p = GeometryParams::default();
        Self {
            strip_pitch    : p.strip_pitch,
            drift_velocity : p.drift_velocity,
            sampling_rate  : p.sampling_rate,
            trigger_delay  : p.trigger_delay,
            n_strips       : p.n_strips,
            n_timecells    : p.n_timecells,
            pitch_angle_deg: [180.0, 60.0, -60.0],
        }
    }
}

impl GeometryConfig {
    pub fn params(&self) -> GeometryParams {
        GeometryParams {
            strip_pitch   : self.strip_pitch,
            drift_velocity: self.drift_velocity,
            sampling_rate : self.sampling_rate,
            trigger_delay : self.trigger_delay,
            n_strips      : self.n_strips,
            n_timecells   : self.n_timecells,
            pitch_angle   : self.pitch_angle_deg.map(degree),
        }
    }

    pub fn build(&self) -> Result<GeometryTPC> { Ok(GeometryTPC::new(self.params())?) }
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<RecoConfig> {
    let text = fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::io::Write;

    use units::{assert_uom_eq, cm_us, mhz, mm, ns};
    use uom::si::{frequency::megahertz, length::millimeter, time::nanosecond, velocity::meter_per_second};

    use crate::builder::AlphaPolicy;
    use crate::error::ConfigError;
    use crate::ionrange::Gas;

    // ----- Test the example on-disk config file ----------------------------------------
    #[test]
    fn example_config_file() {
        let config = read_config_file("tpcreco.toml").unwrap();
        assert_eq!(config.builder.max_prongs, 3);
        assert_eq!(config.builder.alpha_policy, AlphaPolicy::LongestIsAlpha);
        assert_eq!(config.hough.n_phi_bins, 100);
        assert_eq!(config.dedx.pressure, 250.0);
        assert_eq!(config.toy.gas, Gas::CO2);
        assert_uom_eq!(millimeter, config.geometry.strip_pitch, mm(1.5), r2nd <= 1e-12);
        config.geometry.build().unwrap();
    }

    // ----- Some helpers to make the tests more concise ---------------------------------
    fn parse<'d, D: Deserialize<'d>>(input: &'d str) -> D {
        toml::from_str(input).unwrap()
    }

    fn parse_carefully<'d, D: Deserialize<'d>>(input: &'d str) -> std::result::Result<D, toml::de::Error> {
        toml::from_str(input)
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config: RecoConfig = parse("");
        assert_eq!(config, RecoConfig::default());
        assert_eq!(config.geometry.params(), GeometryParams::default());
    }

    #[test]
    fn geometry_quantities_with_units() {
        let config: GeometryConfig = parse(r#"
            strip_pitch    = "0.15 cm"
            drift_velocity = "6460 m/s"
            sampling_rate  = "12.5 MHz"
            trigger_delay  = "500 ns"
            n_timecells    = 256
        "#);
        assert_uom_eq!(millimeter      , config.strip_pitch   , mm(1.5)     , r2nd <= 1e-12);
        assert_uom_eq!(meter_per_second, config.drift_velocity, cm_us(0.646), r2nd <= 1e-12);
        assert_uom_eq!(megahertz       , config.sampling_rate , mhz(12.5)   , r2nd <= 1e-12);
        assert_uom_eq!(nanosecond      , config.trigger_delay , ns(500.0)   , r2nd <= 1e-12);
        assert_eq!(config.n_strips, [72, 92, 92]);
        assert_eq!(config.build().unwrap().n_timecells(), 256);
    }

    #[rstest(/**/ value,
             case(r#""1.5 MHz""#),
             case(r#""pitch 1.5 mm""#),
             case(r#""1.5""#),
             case("1.5"),
    )]
    fn bad_unit_is_reported(value: &str) {
        let result: std::result::Result<GeometryConfig, _> = parse_carefully(&format!("strip_pitch = {value}"));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: std::result::Result<RecoConfig, _> = parse_carefully("[builder]\nmax_prong = 2");
        assert!(result.is_err());
        let result: std::result::Result<RecoConfig, _> = parse_carefully("[tracker]");
        assert!(result.is_err());
    }

    #[test]
    fn sub_tables() {
        let config: RecoConfig = parse(r#"
            [rechits]
            kernel_sum_threshold = 100.0

            [hough]
            tie_policy = "LastEncountered"

            [builder]
            alpha_policy = "FromDedx"
            identify     = false

            [dedx]
            nominal_pressure = 190.0
            pressure         = 95.0

            [toy]
            gas          = "He_CO2_90_10"
            alpha_energy = [1.0, 2.0]
        "#);
        assert_eq!(config.rechits.kernel_sum_threshold, 100.0);
        assert_eq!(config.rechits.max_value_thr, RecHitParams::default().max_value_thr);
        assert_eq!(config.hough.tie_policy, crate::hough::TiePolicy::LastEncountered);
        assert_eq!(config.builder.alpha_policy, AlphaPolicy::FromDedx);
        assert!(!config.builder.identify);
        assert_eq!(config.dedx.nominal_pressure, 190.0);
        assert_eq!(config.toy.gas, Gas::HeCO2_90_10);
        assert_eq!(config.toy.alpha_energy, (1.0, 2.0));
    }

    #[test]
    fn invalid_geometry_is_a_config_error() {
        let config: GeometryConfig = parse(r#"strip_pitch = "0 mm""#);
        assert!(matches!(config.build(), Err(ConfigError::Geometry(_))));
        let config: GeometryConfig = parse("pitch_angle_deg = [0.0, 0.0, 60.0]");
        assert!(matches!(config.build(), Err(ConfigError::Geometry(_))));
    }

    #[test]
    fn read_errors() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(read_config_file(dir.path().join("missing.toml")), Err(ConfigError::Io(_))));
        let path = dir.path().join("broken.toml");
        let mut file = fs::File::create(&path)?;
        writeln!(file, "[builder")?;
        assert!(matches!(read_config_file(&path), Err(ConfigError::Toml(_))));
        Ok(())
    }
}
