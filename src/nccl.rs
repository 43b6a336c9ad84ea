//! Communication statistics pulled out of NCCL debug logs.
//!
//! The log is free-form text. Each line may name one collective or
//! point-to-point operation and may carry `busbw <float>` (GB/s) and
//! `size <integer>` (bytes) tokens. Lines that match nothing are ignored.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommOp {
    AllReduce,
    Broadcast,
    Send,
    Recv,
}

impl CommOp {
    /// Match order matters: a line is attributed to the first keyword found.
    pub const ALL: [CommOp; 4] = [CommOp::AllReduce, CommOp::Broadcast, CommOp::Send, CommOp::Recv];

    pub fn keyword(self) -> &'static str {
        match self {
            CommOp::AllReduce => "AllReduce",
            CommOp::Broadcast => "Broadcast",
            CommOp::Send => "Send",
            CommOp::Recv => "Recv",
        }
    }

    fn classify(line: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| line.contains(op.keyword()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NcclStats {
    pub operation_counts: BTreeMap<CommOp, u64>,
    pub bandwidth_samples: Vec<f64>,
    pub size_samples: Vec<u64>,
}

impl NcclStats {
    /// A missing file yields empty stats: single-GPU trials never write one.
    pub fn from_log(path: &Path) -> io::Result<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(mut reader: R) -> io::Result<Self> {
        let mut stats = Self::default();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            stats.observe(&String::from_utf8_lossy(&buf));
        }
        Ok(stats)
    }

    pub fn from_text(text: &str) -> Self {
        let mut stats = Self::default();
        for line in text.lines() {
            stats.observe(line);
        }
        stats
    }

    fn observe(&mut self, line: &str) {
        if let Some(op) = CommOp::classify(line) {
            *self.operation_counts.entry(op).or_insert(0) += 1;
        }
        if let Some(bw) = capture(busbw_pattern(), line).and_then(|s| s.parse::<f64>().ok()) {
            self.bandwidth_samples.push(bw);
        }
        if let Some(size) = capture(size_pattern(), line).and_then(|s| s.parse::<u64>().ok()) {
            self.size_samples.push(size);
        }
    }

    pub fn count(&self, op: CommOp) -> u64 {
        self.operation_counts.get(&op).copied().unwrap_or(0)
    }

    pub fn total_ops(&self) -> u64 {
        self.operation_counts.values().sum()
    }

    pub fn average_bandwidth_gbps(&self) -> f64 {
        if self.bandwidth_samples.is_empty() {
            return 0.0;
        }
        self.bandwidth_samples.iter().sum::<f64>() / self.bandwidth_samples.len() as f64
    }

    pub fn total_bytes(&self) -> u64 {
        self.size_samples.iter().sum()
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes() as f64 / BYTES_PER_GB
    }

    pub fn average_size_mb(&self) -> f64 {
        if self.size_samples.is_empty() {
            return 0.0;
        }
        self.total_bytes() as f64 / self.size_samples.len() as f64 / BYTES_PER_MB
    }

    pub fn is_empty(&self) -> bool {
        self.total_ops() == 0 && self.bandwidth_samples.is_empty() && self.size_samples.is_empty()
    }
}

impl Serialize for NcclStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let counts: BTreeMap<CommOp, u64> =
            CommOp::ALL.into_iter().map(|op| (op, self.count(op))).collect();
        let mut s = serializer.serialize_struct("NcclStats", 8)?;
        s.serialize_field("operation_counts", &counts)?;
        s.serialize_field("total_ops", &self.total_ops())?;
        s.serialize_field("avg_bandwidth_gbps", &self.average_bandwidth_gbps())?;
        s.serialize_field("total_bytes", &self.total_bytes())?;
        s.serialize_field("total_comm_gb", &self.total_gb())?;
        s.serialize_field("avg_comm_size_mb", &self.average_size_mb())?;
        s.serialize_field("bandwidth_samples", &self.bandwidth_samples)?;
        s.serialize_field("size_samples", &self.size_samples)?;
        s.end()
    }
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn busbw_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"busbw\s+([\d.]+)").expect("busbw pattern compiles"))
}

fn size_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"size\s+(\d+)").expect("size pattern compiles"))
}
