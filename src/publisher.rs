//! Pose output: per-update records plus a rolling pose history.
//!
//! The publisher turns a belief into the three output artifacts and hands
//! them to a [`PoseSink`]. Sinks decide where they go (a channel, a JSON
//! lines file, a Rerun recording, or nowhere).

use std::collections::VecDeque;
use std::io::Write;

use crossbeam::channel::Sender;
use log::warn;
use serde::Serialize;

use crate::belief::QuadBelief;
use crate::types::{
    Header, Pose, PoseArray, PoseStamped, PoseWithCovarianceStamped, Quat, Stamp, Vec3,
};

pub const POSE_ARRAY_SIZE: usize = 10_000;
pub const MAP_FRAME: &str = "map";

/// Receiver of published pose artifacts. All methods default to no-ops.
pub trait PoseSink: Send {
    fn publish_pose_with_covariance(&mut self, _msg: &PoseWithCovarianceStamped) {}
    fn publish_pose_array(&mut self, _msg: &PoseArray) {}
    fn publish_pose(&mut self, _msg: &PoseStamped) {}

    /// Push buffered output to its destination.
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Discards everything.
impl PoseSink for () {}

/// Fan-out to every sink in order.
impl PoseSink for Vec<Box<dyn PoseSink>> {
    fn publish_pose_with_covariance(&mut self, msg: &PoseWithCovarianceStamped) {
        for sink in self.iter_mut() {
            sink.publish_pose_with_covariance(msg);
        }
    }

    fn publish_pose_array(&mut self, msg: &PoseArray) {
        for sink in self.iter_mut() {
            sink.publish_pose_array(msg);
        }
    }

    fn publish_pose(&mut self, msg: &PoseStamped) {
        for sink in self.iter_mut() {
            sink.publish_pose(msg);
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut first_err = None;
        for sink in self.iter_mut() {
            if let Err(e) = sink.flush() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl<S: PoseSink + ?Sized> PoseSink for Box<S> {
    fn publish_pose_with_covariance(&mut self, msg: &PoseWithCovarianceStamped) {
        (**self).publish_pose_with_covariance(msg);
    }

    fn publish_pose_array(&mut self, msg: &PoseArray) {
        (**self).publish_pose_array(msg);
    }

    fn publish_pose(&mut self, msg: &PoseStamped) {
        (**self).publish_pose(msg);
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (**self).flush()
    }
}

/// Owned copy of one published artifact.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Published {
    PoseWithCovariance(PoseWithCovarianceStamped),
    PoseArray(PoseArray),
    Pose(PoseStamped),
}

/// Forwards artifacts over a crossbeam channel.
///
/// The pose history is only forwarded when asked for, since it is copied
/// in full on every update.
pub struct ChannelSink {
    tx: Sender<Published>,
    include_history: bool,
}

impl ChannelSink {
    pub fn new(tx: Sender<Published>) -> Self {
        Self {
            tx,
            include_history: false,
        }
    }

    pub fn with_history(tx: Sender<Published>) -> Self {
        Self {
            tx,
            include_history: true,
        }
    }

    fn send(&self, msg: Published) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.tx.send(msg);
    }
}

impl PoseSink for ChannelSink {
    fn publish_pose_with_covariance(&mut self, msg: &PoseWithCovarianceStamped) {
        self.send(Published::PoseWithCovariance(msg.clone()));
    }

    fn publish_pose_array(&mut self, msg: &PoseArray) {
        if self.include_history {
            self.send(Published::PoseArray(msg.clone()));
        }
    }

    fn publish_pose(&mut self, msg: &PoseStamped) {
        self.send(Published::Pose(msg.clone()));
    }
}

/// Writes each pose-with-covariance record as one JSON line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    lines: usize,
    failed: bool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            lines: 0,
            failed: false,
        }
    }

    pub fn lines_written(&self) -> usize {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> PoseSink for JsonLinesSink<W> {
    fn publish_pose_with_covariance(&mut self, msg: &PoseWithCovarianceStamped) {
        let result = serde_json::to_string(msg)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(self.writer, "{}", line));
        match result {
            Ok(()) => self.lines += 1,
            Err(e) => {
                // Log the first failure only; a broken file stays broken.
                if !self.failed {
                    warn!("pose log write failed: {}", e);
                    self.failed = true;
                }
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Builds the output artifacts for each belief and keeps the pose history.
pub struct Publisher<S: PoseSink> {
    sink: S,
    history: PoseArray,
    capacity: usize,
    published: usize,
}

impl<S: PoseSink> Publisher<S> {
    pub fn new(sink: S) -> Self {
        Self::with_capacity(sink, POSE_ARRAY_SIZE)
    }

    pub fn with_capacity(sink: S, capacity: usize) -> Self {
        Self {
            sink,
            history: PoseArray {
                header: Header {
                    stamp: Stamp::default(),
                    frame_id: MAP_FRAME.to_string(),
                },
                poses: VecDeque::with_capacity(capacity.min(POSE_ARRAY_SIZE) + 1),
            },
            capacity,
            published: 0,
        }
    }

    /// Emit pose-with-covariance, then the history, then the stamped pose.
    pub fn publish(&mut self, belief: &QuadBelief) {
        let header = Header {
            stamp: Stamp::from_secs_f64(belief.timestamp),
            frame_id: MAP_FRAME.to_string(),
        };
        let pose = pose_of(belief);

        let with_cov = PoseWithCovarianceStamped {
            header: header.clone(),
            pose,
            covariance: covariance_block(belief),
        };
        self.sink.publish_pose_with_covariance(&with_cov);

        self.history.poses.push_front(pose);
        while self.history.poses.len() > self.capacity {
            self.history.poses.pop_back();
        }
        self.sink.publish_pose_array(&self.history);

        self.sink.publish_pose(&PoseStamped { header, pose });
        self.published += 1;
    }

    pub fn history(&self) -> &PoseArray {
        &self.history
    }

    pub fn published(&self) -> usize {
        self.published
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

fn pose_of(belief: &QuadBelief) -> Pose {
    Pose {
        position: Vec3::from(belief.state.position()),
        orientation: Quat::from(belief.state.orientation()),
    }
}

/// Upper-left 6x6 of the state covariance, row-major.
pub fn covariance_block(belief: &QuadBelief) -> [f64; 36] {
    let mut out = [0.0; 36];
    let p = &belief.covariance;
    for i in 0..6.min(p.nrows()) {
        for j in 0..6.min(p.ncols()) {
            out[i * 6 + j] = p[(i, j)];
        }
    }
    out
}
