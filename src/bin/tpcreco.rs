use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use tpcreco::analysis::{TrackAnalysis, TrackSummary};
use tpcreco::config::{read_config_file, RecoConfig};
use tpcreco::event::{EventSource, ToyEventSource};
use tpcreco::toymc::{ToyEvent, ToyGenerator};
use tpcreco::types::Vec3;
use tpcreco::utils::{parse_direction, parse_triplet, timing::Progress};
use tpcreco::{DedxFitter, IonRangeCalculator, TrackBuilder};

use units::{kelvin, mbar};

#[derive(clap::Parser, Debug, Clone)]
#[command(
    name = "tpcreco",
    about = "Reconstruct 3D tracks from toy Monte Carlo TPC events",
)]
pub struct Cli {
    /// TOML reconstruction config. Built-in defaults when absent
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of events to generate and reconstruct
    #[arg(short = 'n', long, default_value = "10")]
    pub entries: usize,

    /// Seed of the first event; event i uses seed + i
    #[arg(short, long, default_value = "1")]
    pub seed: u64,

    /// Direction of the beam, in detector coordinates
    #[arg(long, default_value = "-1,0,0", value_parser = parse_direction, allow_hyphen_values = true)]
    pub beam: Vec3,

    /// Repeat a single straight track starting here (mm) instead of random events
    #[arg(long, requires = "end", value_parser = parse_point, allow_hyphen_values = true)]
    pub start: Option<Vec3>,

    /// End (mm) of the repeated track
    #[arg(long, requires = "start", value_parser = parse_point, allow_hyphen_values = true)]
    pub end: Option<Vec3>,

    /// Energy (MeV) deposited by the repeated track
    #[arg(long, default_value = "6.0")]
    pub energy: f64,
}

fn parse_point(s: &str) -> Result<Vec3, String> {
    let (x, y, z) = parse_triplet::<f64>(s)?;
    Ok(Vec3::new(x, y, z))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Cli::parse();
    let mut progress = Progress::new();

    // --- Configuration -------------------------------------------------------------
    progress.start("Reading configuration");
    let config = match &args.config {
        Some(path) => read_config_file(path)?,
        None       => RecoConfig::default(),
    };
    let geometry = Arc::new(config.geometry.build()?);
    progress.done();

    progress.start("Preparing reference dE/dx curves");
    let fitter  = DedxFitter::new(config.dedx.clone())?;
    let ranges  = IonRangeCalculator::new(config.toy.gas, mbar(config.toy.pressure), kelvin(config.toy.temperature))?;
    progress.done();

    let mut builder = TrackBuilder::new(geometry.clone(), config.builder.clone())
        .with_rec_hit_params(config.rechits.clone())
        .with_hough_params(config.hough.clone())
        .with_dedx(fitter);
    let mut analysis = TrackAnalysis::new(ranges, args.beam, config.builder.alpha_policy);

    let generator = ToyGenerator::new(geometry, config.toy.clone())?;
    let mut source = match (args.start, args.end) {
        (Some(start), Some(end)) => ToyEventSource::repeating(generator, args.seed, args.entries,
                                                              ToyEvent::single(start, end, args.energy)),
        _                        => ToyEventSource::new(generator, args.seed, args.entries),
    };

    // --- Progress bar --------------------------------------------------------------
    let pb = ProgressBar::new(source.number_of_entries() as u64);
    pb.set_style(ProgressStyle::default_bar()
                 .template("Reconstructing: {msg}\n[{elapsed_precise}] {wide_bar} {pos}/{len} ({eta_precise})")?);

    // --- Event loop ----------------------------------------------------------------
    let mut outcomes = BTreeMap::<String, usize>::new();
    let mut summaries = vec![];
    for entry in 0..source.number_of_entries() {
        let Some(event) = source.load_entry(entry) else { break };
        let (id, timestamp) = (event.id(), event.timestamp());
        builder.set_event(event);
        let state = builder.reconstruct();
        *outcomes.entry(state.to_string()).or_default() += 1;
        let summary = analysis.summarise(builder.track(), id, timestamp);
        pb.set_message(format!("event {id}: {state}, {} segment(s)", summary.n_prongs()));
        summaries.push(summary);
        pb.inc(1);
    }
    pb.finish_with_message("<finished reconstructing events>");

    // --- Report --------------------------------------------------------------------
    for summary in &summaries { print_summary(summary); }
    for (state, count) in outcomes {
        println!("{state:>20}: {count}");
    }
    Ok(())
}

fn print_summary(s: &TrackSummary) {
    let dt = s.delta_timestamp.map_or("-".to_string(), |dt| format!("{dt:.3e} s"));
    println!("event {:6}  {:?}  vertex ({:7.2}, {:7.2}, {:7.2}) mm  chi2 {:9.3}  dt {dt}",
             s.event_id, s.topology, s.vertex.x, s.vertex.y, s.vertex.z, s.chi2);
    for seg in &s.segments {
        let energy = seg.energy.map_or("-".to_string(), |e| format!("{e:.3} MeV"));
        println!("    {:7}  length {:7.2} mm  cos(theta_beam) {:6.3}  phi_beam {:6.3}  E {energy}",
                 format!("{:?}", seg.pid), seg.length, seg.cos_theta_beam, seg.phi_beam);
    }
}
