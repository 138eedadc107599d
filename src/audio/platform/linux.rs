//! Linux per-process volume through PulseAudio/PipeWire
//!
//! Uses `pactl` (PulseAudio CLI), which works with both PulseAudio and
//! PipeWire via the pipewire-pulse compatibility layer. Each sink-input is
//! one application stream; its `application.process.id` property ties it to
//! a process.

use crate::audio::MixerError;
use std::process::Command;

/// Set every sink-input of `pid` to `value` (0-1).
pub fn set_process_volume(pid: u32, value: f32) -> Result<usize, MixerError> {
    let listing = run_pactl(&["list", "sink-inputs"])?;
    let indices = sink_inputs_for_pid(&listing, pid);

    let percent = format!("{}%", (value * 100.0).round() as u32);
    for index in &indices {
        run_pactl(&["set-sink-input-volume", &index.to_string(), &percent])?;
    }
    Ok(indices.len())
}

fn run_pactl(args: &[&str]) -> Result<String, MixerError> {
    let command = format!("pactl {}", args.join(" "));
    let output = Command::new("pactl")
        .args(args)
        .output()
        .map_err(|e| MixerError::Command {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(MixerError::Command {
            command,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Sink-input indices whose `application.process.id` equals `pid`.
fn sink_inputs_for_pid(listing: &str, pid: u32) -> Vec<u32> {
    let mut indices = Vec::new();
    let mut current_index: Option<u32> = None;

    for line in listing.lines() {
        let line = line.trim();

        if let Some(index) = line.strip_prefix("Sink Input #") {
            current_index = index.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("application.process.id = ") {
            let matches = value
                .trim_matches('"')
                .parse::<u32>()
                .map(|p| p == pid)
                .unwrap_or(false);
            if let (true, Some(index)) = (matches, current_index) {
                if !indices.contains(&index) {
                    indices.push(index);
                }
            }
        }
    }

    indices
}
