//! JSON-line run logs: one serialized record per line, appended.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::gradient_check::GradientCheck;
use crate::network::LossBreakdown;

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    ensure_parent(path.as_ref())?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Serialize)]
pub struct LossLogEntry {
    pub iteration: usize,
    pub data_loss: f64,
    pub reg_loss: f64,
    pub total_loss: f64,
    pub timestamp_ms: u128,
}

/// Appends the loss of one training iteration to `path`.
pub fn log_loss<P: AsRef<Path>>(path: P, iteration: usize, breakdown: &LossBreakdown) -> io::Result<()> {
    let entry = LossLogEntry {
        iteration,
        data_loss: breakdown.data_loss,
        reg_loss: breakdown.reg_loss,
        total_loss: breakdown.total(),
        timestamp_ms: timestamp_ms(),
    };
    append_json_line(path, &entry)
}

#[derive(Debug, Serialize)]
pub struct GradientCheckLogEntry {
    pub layer: String,
    pub parameter: String,
    pub relative_error: f64,
    pub timestamp_ms: u128,
}

/// Appends one line per parameter of a gradient-check report to `path`.
pub fn log_gradient_check<P: AsRef<Path>>(path: P, layer: &str, report: &[GradientCheck]) -> io::Result<()> {
    for check in report {
        let entry = GradientCheckLogEntry {
            layer: layer.to_string(),
            parameter: check.parameter.to_string(),
            relative_error: check.relative_error,
            timestamp_ms: timestamp_ms(),
        };
        append_json_line(path.as_ref(), &entry)?;
    }
    Ok(())
}
