//! Command-line parsing helpers and wall-clock reporting

use std::str::FromStr;

use crate::types::Vec3;

/// Parse `"x,y,z"`
pub fn parse_triplet<T: FromStr>(s: &str) -> Result<(T, T, T), String>
where
    <T as FromStr>::Err: std::fmt::Display,
{
    let v = s.split(',').map(str::trim).collect::<Vec<_>>();
    if v.len() != 3 { return Err(format!("expected 3 comma-separated values, got '{s}'")) }
    let p = |x: &str| x.parse::<T>().map_err(|e| format!("'{x}': {e}"));
    Ok((p(v[0])?, p(v[1])?, p(v[2])?))
}

/// Parse a direction `"x,y,z"`; need not be normalised
pub fn parse_direction(s: &str) -> Result<Vec3, String> {
    let (x, y, z) = parse_triplet::<f64>(s)?;
    let v = Vec3::new(x, y, z);
    if v.norm() == 0.0 { return Err("direction must not be the null vector".into()) }
    Ok(v)
}

pub mod timing {

    use std::io::Write;
    use std::time::Instant;

    /// Prints `<stage> ... <elapsed> ms` for each stage of a run
    pub struct Progress {
        started: Instant,
    }

    impl Progress {

        #[allow(clippy::new_without_default)]
        pub fn new() -> Self { Self { started: Instant::now() } }

        pub fn start(&mut self, stage: &str) {
            print!("{stage} ... ");
            let _ = std::io::stdout().flush();
            self.started = Instant::now();
        }

        pub fn done(&self) { println!("{} ms", self.started.elapsed().as_millis()); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest(/**/ input,          expected,
             case("1,2,3",        Ok((1.0, 2.0, 3.0))),
             case(" 2 , -4 ,0.5", Ok((2.0, -4.0, 0.5))),
    )]
    fn triplets(input: &str, expected: Result<(f64, f64, f64), String>) {
        assert_eq!(parse_triplet::<f64>(input), expected);
    }

    #[test]
    fn malformed_input() {
        assert!(parse_triplet::<f64>("1,2").is_err());
        assert!(parse_triplet::<f64>("1,a,3").is_err());
        assert!(parse_direction("0,0,0").is_err());
    }

    #[test]
    fn progress_reports_a_stage() {
        let mut progress = timing::Progress::new();
        progress.start("stage");
        progress.done();
    }

    #[test]
    fn directions() {
        assert_eq!(parse_triplet::<i32>("1, -2, 3"), Ok((1, -2, 3)));
        assert_eq!(parse_direction("-1,0,0"), Ok(-Vec3::x()));
    }
}
