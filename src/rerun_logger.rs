use anyhow::Result;
use rerun::{archetypes::Scalar, Points3D, RecordingStreamBuilder};

use crate::publisher::PoseSink;
use crate::types::{PoseArray, PoseWithCovarianceStamped};

/// Rerun recording of the estimated pose, for offline inspection of a replay.
/// Supports Rerun v0.15+ API with archetype-based logging
pub struct RerunSink {
    rec: rerun::RecordingStream,
    /// Log the trail every N history updates
    trail_every: usize,
    updates: usize,
}

impl RerunSink {
    /// Initialize Rerun recording to file
    /// Takes output path (e.g., "quad_ukf_sessions/rerun_20251122_120000.rrd")
    pub fn new(output_path: &str) -> Result<Self> {
        let rec = RecordingStreamBuilder::new("quad_ukf_replay")
            .save(output_path)
            .map_err(|e| anyhow::anyhow!("Failed to create Rerun recording: {}", e))?;

        log::info!("[RERUN] Recording initialized to: {}", output_path);

        Ok(RerunSink {
            rec,
            trail_every: 50,
            updates: 0,
        })
    }

    /// Set the current time for all subsequent logs
    pub fn set_time(&self, t: f64) {
        self.rec.set_time_seconds("stable_time", t);
    }

    /// Log a scalar value (generic for any measurement)
    pub fn log_scalar(&self, path: &str, value: f64) {
        let _ = self.rec.log(path, &Scalar::new(value));
    }
}

impl PoseSink for RerunSink {
    fn publish_pose_with_covariance(&mut self, msg: &PoseWithCovarianceStamped) {
        self.set_time(msg.header.stamp.as_secs_f64());

        let p = &msg.pose.position;
        self.log_scalar("filter/ukf/position_x", p.x);
        self.log_scalar("filter/ukf/position_y", p.y);
        self.log_scalar("filter/ukf/position_z", p.z);

        let q = &msg.pose.orientation;
        self.log_scalar("filter/ukf/quat_x", q.x);
        self.log_scalar("filter/ukf/quat_y", q.y);
        self.log_scalar("filter/ukf/quat_z", q.z);
        self.log_scalar("filter/ukf/quat_w", q.w);

        // Position variance (diagonal of the 6x6 block)
        let var_sum = msg.covariance[0] + msg.covariance[7] + msg.covariance[14];
        self.log_scalar("filter/ukf/position_var", var_sum);

        let _ = self.rec.log(
            "world/quad",
            &Points3D::new([[p.x as f32, p.y as f32, p.z as f32]]),
        );
    }

    fn publish_pose_array(&mut self, msg: &PoseArray) {
        self.updates += 1;
        if self.updates % self.trail_every != 0 {
            return;
        }
        let trail: Vec<[f32; 3]> = msg
            .poses
            .iter()
            .map(|p| [p.position.x as f32, p.position.y as f32, p.position.z as f32])
            .collect();
        let _ = self.rec.log("world/trail", &Points3D::new(trail));
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.rec.flush_blocking();
        Ok(())
    }
}
