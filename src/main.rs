use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::thread::{self, ScopedJoinHandle};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use flate2::read::GzDecoder;
use serde::Deserialize;

use quad_ukf::error::EstimatorResult;
use quad_ukf::publisher::{JsonLinesSink, PoseSink};
use quad_ukf::rerun_logger::RerunSink;
use quad_ukf::sensor_fusion::{EstimatorConfig, QuadEstimator};
use quad_ukf::types::{ImuEvent, PoseEvent};

#[derive(Parser, Debug)]
#[command(name = "quad_ukf_replay")]
#[command(about = "Replay recorded IMU and pose streams through the quadrotor UKF", long_about = None)]
struct Args {
    /// Session log (.json or .json.gz) with "imu" and "pose" event arrays
    #[arg(long)]
    session: PathBuf,

    /// Estimator config (JSON); missing fields use defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "quad_ukf_sessions")]
    output_dir: String,

    /// Feed the IMU and pose streams from two threads instead of merging them by time
    #[arg(long, default_value_t = false)]
    concurrent: bool,

    /// Also record the estimate to a Rerun .rrd file
    #[arg(long)]
    rerun: Option<PathBuf>,
}

#[derive(Deserialize)]
struct SessionLog {
    #[serde(default)]
    imu: Vec<ImuEvent>,
    #[serde(default)]
    pose: Vec<PoseEvent>,
}

fn load_session(path: &Path) -> Result<SessionLog> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let session = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        serde_json::from_reader(BufReader::new(gz))?
    } else {
        serde_json::from_reader(BufReader::new(file))?
    };
    Ok(session)
}

enum Event<'a> {
    Imu(&'a ImuEvent),
    Pose(&'a PoseEvent),
}

impl Event<'_> {
    fn timestamp(&self) -> f64 {
        match self {
            Event::Imu(e) => e.timestamp,
            Event::Pose(e) => e.timestamp,
        }
    }
}

#[derive(Default, Debug)]
struct StreamStats {
    processed: usize,
    dropped: BTreeMap<&'static str, usize>,
}

impl StreamStats {
    fn record(&mut self, result: EstimatorResult<()>) {
        match result {
            Ok(()) => self.processed += 1,
            Err(e) => *self.dropped.entry(e.kind()).or_insert(0) += 1,
        }
    }

    fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    fn print(&self, name: &str) {
        println!(
            "  {:<5} processed: {:>7}  dropped: {:>5}",
            name,
            self.processed,
            self.dropped_total()
        );
        for (kind, count) in &self.dropped {
            println!("        {:<24} {}", kind, count);
        }
    }
}

/// Both streams merged by timestamp, IMU first on ties.
fn replay_serial<S: PoseSink>(
    estimator: &QuadEstimator<S>,
    session: &SessionLog,
) -> (StreamStats, StreamStats) {
    let mut events: Vec<Event> = session
        .imu
        .iter()
        .map(Event::Imu)
        .chain(session.pose.iter().map(Event::Pose))
        .collect();
    events.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));

    let mut imu_stats = StreamStats::default();
    let mut pose_stats = StreamStats::default();
    for event in events {
        match event {
            Event::Imu(e) => imu_stats.record(estimator.handle_imu(e)),
            Event::Pose(e) => pose_stats.record(estimator.handle_pose(e)),
        }
    }
    (imu_stats, pose_stats)
}

/// One thread per stream, the way live callbacks arrive.
fn replay_concurrent<S: PoseSink>(
    estimator: &QuadEstimator<S>,
    session: &SessionLog,
) -> Result<(StreamStats, StreamStats)> {
    thread::scope(|s| {
        let imu = s.spawn(|| {
            let mut stats = StreamStats::default();
            for e in &session.imu {
                stats.record(estimator.handle_imu(e));
            }
            stats
        });
        let pose = s.spawn(|| {
            let mut stats = StreamStats::default();
            for e in &session.pose {
                stats.record(estimator.handle_pose(e));
            }
            stats
        });
        Ok((join_stream("IMU", imu)?, join_stream("Pose", pose)?))
    })
}

fn join_stream(name: &str, handle: ScopedJoinHandle<'_, StreamStats>) -> Result<StreamStats> {
    handle.join().map_err(|panic| {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        anyhow!("{} replay thread panicked: {}", name, reason)
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("[{}] Quad UKF replay starting", ts_now());
    println!("  Session: {}", args.session.display());
    println!("  Mode: {}", if args.concurrent { "concurrent" } else { "serial" });
    println!("  Output Dir: {}", args.output_dir);

    let config = match args.config.as_ref() {
        Some(path) => EstimatorConfig::load(path)?,
        None => EstimatorConfig::default(),
    };

    let session = load_session(&args.session)?;
    println!(
        "[{}] Loaded {} IMU and {} pose events",
        ts_now(),
        session.imu.len(),
        session.pose.len()
    );

    std::fs::create_dir_all(&args.output_dir)?;
    let stamp = ts_now_clean();
    let poses_path = format!("{}/poses_{}.jsonl", args.output_dir, stamp);
    let poses_file = File::create(&poses_path).with_context(|| format!("creating {}", poses_path))?;

    let mut sinks: Vec<Box<dyn PoseSink>> = vec![Box::new(JsonLinesSink::new(BufWriter::new(poses_file)))];
    if let Some(path) = args.rerun.as_ref() {
        sinks.push(Box::new(RerunSink::new(&path.to_string_lossy())?));
    }

    // Start one nominal step before the first event.
    let first = session
        .imu
        .iter()
        .map(|e| e.timestamp)
        .chain(session.pose.iter().map(|e| e.timestamp))
        .fold(f64::INFINITY, f64::min);
    let t0 = if first.is_finite() { first - config.initial_dt } else { 0.0 };

    let estimator = QuadEstimator::new(config, t0, sinks);

    let started = Utc::now();
    let (imu_stats, pose_stats) = if args.concurrent {
        replay_concurrent(&estimator, &session)?
    } else {
        replay_serial(&estimator, &session)
    };
    let elapsed = Utc::now().signed_duration_since(started);

    estimator.flush_sinks().context("flushing outputs")?;

    let pose_array_path = format!("{}/pose_array_{}.json", args.output_dir, stamp);
    let writer = BufWriter::new(
        File::create(&pose_array_path).with_context(|| format!("creating {}", pose_array_path))?,
    );
    serde_json::to_writer_pretty(writer, &estimator.pose_history())?;

    let belief = estimator.belief()?;
    let p = belief.state.position();
    let q = belief.state.orientation();

    println!(
        "[{}] Replay finished in {} ms",
        ts_now(),
        elapsed.num_milliseconds()
    );
    imu_stats.print("IMU");
    pose_stats.print("Pose");
    println!("  Published: {}", estimator.published());
    println!("  Final t: {:.6}", belief.timestamp);
    println!("  Position: ({:.4}, {:.4}, {:.4})", p.x, p.y, p.z);
    println!(
        "  Orientation (x, y, z, w): ({:.4}, {:.4}, {:.4}, {:.4})",
        q.i, q.j, q.k, q.w
    );
    println!("  Covariance trace: {:.6}", belief.covariance.trace());
    println!("  Poses: {}", poses_path);
    println!("  Pose array: {}", pose_array_path);

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
