use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;

use gatewatch_core::beacon::domain::scanner::{BeaconScanner, StaticBeaconScanner};
use gatewatch_core::config::Config;
use gatewatch_core::depth::domain::depth_reader::DepthReader;
use gatewatch_core::depth::infrastructure::frame_depth_reader::FrameDepthReader;
use gatewatch_core::detection::domain::vehicle_detector::VehicleDetector;
use gatewatch_core::detection::infrastructure::replay_detector::ReplayDetector;
use gatewatch_core::lpr::domain::plate_recognizer::NullPlateRecognizer;
use gatewatch_core::pipeline::frame_source::ImageSequenceSource;
use gatewatch_core::pipeline::runner::{Pipeline, PipelineAdapters};
use gatewatch_core::shared::mac::normalize_mac;

/// Vehicle identification at the site gate: detection, tracking, beacon
/// fusion, plate recognition and cloud alerting over recorded frames.
///
/// Live capture and GPU inference are provided by the platform service;
/// this binary drives the core over a recorded frame directory with a
/// detection sidecar.
#[derive(Parser)]
#[command(name = "gatewatch")]
struct Cli {
    /// Frame directory to replay, or the literal token `camera`.
    source: String,

    /// YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSON sidecar with recorded per-frame detections.
    #[arg(long)]
    detections: Option<PathBuf>,

    /// Replayed beacon observations as `MAC=RSSI` pairs,
    /// e.g. `AA:BB:CC:DD:EE:01=-62`.
    #[arg(long, value_delimiter = ',')]
    beacons: Option<Vec<String>>,

    /// Device identifier reported to the cloud.
    #[arg(long, default_value = "gate-01")]
    device_id: String,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::from_yaml_file(&cli.config)?;

    if cli.source == "camera" {
        return Err(
            "live camera capture is provided by the platform capture service; \
             pass a recorded frame directory"
                .into(),
        );
    }

    let mut source = ImageSequenceSource::open(Path::new(&cli.source))?;
    log::info!("replaying {} frames from {}", source.len(), cli.source);

    let detector: Box<dyn VehicleDetector> = match &cli.detections {
        Some(path) => Box::new(ReplayDetector::from_json_file(path)?),
        None => Box::new(ReplayDetector::from_json_str("{}")?),
    };

    let scanner: Box<dyn BeaconScanner> =
        Box::new(StaticBeaconScanner::new(parse_beacons(&cli.beacons)?));

    let depth_reader: Box<dyn DepthReader> = Box::new(FrameDepthReader::new(&config.depth));

    let mut pipeline = Pipeline::new(
        &config,
        PipelineAdapters {
            detector,
            scanner,
            depth_reader,
            recognizer: Arc::new(NullPlateRecognizer),
        },
        cli.device_id,
    )?;

    let result = pipeline.run(&mut source);
    let stats = pipeline.stats().snapshot();
    pipeline.shutdown();

    log::info!(
        "done: {} frames, {} alerts",
        stats["frame_count"], stats["alert_count"]
    );
    result
}

fn parse_beacons(
    args: &Option<Vec<String>>,
) -> Result<Vec<(String, f64)>, Box<dyn std::error::Error>> {
    let Some(args) = args else {
        return Ok(Vec::new());
    };
    let mut readings = Vec::with_capacity(args.len());
    for arg in args {
        let (mac, rssi) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected MAC=RSSI, got {arg:?}"))?;
        let mac = normalize_mac(mac).ok_or_else(|| format!("invalid MAC address {mac:?}"))?;
        let rssi: f64 = rssi
            .parse()
            .map_err(|_| format!("invalid RSSI value {rssi:?}"))?;
        readings.push((mac, rssi));
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_beacons() {
        let parsed = parse_beacons(&Some(vec![
            "aa-bb-cc-dd-ee-01=-62".into(),
            "AA:BB:CC:DD:EE:02=-70.5".into(),
        ]))
        .unwrap();
        assert_eq!(parsed[0], ("AA:BB:CC:DD:EE:01".into(), -62.0));
        assert_eq!(parsed[1], ("AA:BB:CC:DD:EE:02".into(), -70.5));
    }

    #[test]
    fn test_parse_beacons_rejects_garbage() {
        assert!(parse_beacons(&Some(vec!["nonsense".into()])).is_err());
        assert!(parse_beacons(&Some(vec!["XX:YY=1".into()])).is_err());
        assert!(parse_beacons(&None).unwrap().is_empty());
    }
}
