//! Persists the last-used `run` parameters across invocations.
//!
//! The config directory is resolved by hand (`$XDG_CONFIG_HOME/dtmem` or
//! `$HOME/.config/dtmem`) rather than through a directories crate, the same
//! way the core library resolves its own session directories with plain
//! `std::env` lookups. Failure to persist is non-fatal — it's a convenience,
//! not part of the inversion's correctness.

use std::fs;
use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRun {
    pub map: String,
    pub trail: String,
    pub niter: u32,
    pub caim: f32,
    pub rmax: f32,
    pub default: String,
    pub tlim: f32,
    pub fwhm: f32,
    pub ndiv: usize,
    pub ntdiv: usize,
    pub tzero: f64,
    pub period: f64,
    pub output: String,
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join("dtmem"));
        }
    }
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config").join("dtmem"))
}

fn last_run_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("last_run.json"))
}

/// Best-effort write of the last-used parameters. Logs a warning and gives
/// up quietly on any I/O failure.
pub fn persist_last_run(last_run: &LastRun) {
    let Some(path) = last_run_path() else {
        warn!("could not resolve a config directory; last_run.json not written");
        return;
    };
    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("could not create config directory {}: {e}", dir.display());
            return;
        }
    }
    match serde_json::to_string_pretty(last_run) {
        Ok(json) => {
            if let Err(e) = fs::write(&path, json) {
                warn!("could not write {}: {e}", path.display());
            }
        }
        Err(e) => warn!("could not serialise last run parameters: {e}"),
    }
}

/// Load the previously persisted parameters, if any.
pub fn load_last_run() -> Option<LastRun> {
    let path = last_run_path()?;
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let last_run = LastRun {
            map: "start.map".into(),
            trail: "star.trail".into(),
            niter: 50,
            caim: 1.0,
            rmax: 0.2,
            default: "uniform".into(),
            tlim: 1e-3,
            fwhm: 150.0,
            ndiv: 2,
            ntdiv: 2,
            tzero: 0.0,
            period: 0.1,
            output: "result.map".into(),
        };
        let json = serde_json::to_string(&last_run).unwrap();
        let back: LastRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.map, last_run.map);
        assert_eq!(back.niter, last_run.niter);
    }
}
