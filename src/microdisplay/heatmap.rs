//! The published heatmap record and per-stage latency accounting.

use std::time::{Duration, Instant};

use tracing::{error, info};

/// Pipeline stage boundaries stamped into each published heatmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceCheckpoint {
    /// Cycle start, before the capture target is prepared.
    Prepare,
    /// Capture target ready; raw sensor read begins.
    GrabImage,
    /// Raw sensor read complete; color conversion begins.
    Debayer,
    /// Input tensor filled; model execution begins.
    Inference,
    /// Heatmap derived; display handoff begins.
    DisplayHeatmap,
    /// Cycle complete.
    End,
}

impl InferenceCheckpoint {
    pub const ALL: [InferenceCheckpoint; 6] = [
        InferenceCheckpoint::Prepare,
        InferenceCheckpoint::GrabImage,
        InferenceCheckpoint::Debayer,
        InferenceCheckpoint::Inference,
        InferenceCheckpoint::DisplayHeatmap,
        InferenceCheckpoint::End,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Prepare => "Prepare",
            Self::GrabImage => "Grab image",
            Self::Debayer => "Debayer",
            Self::Inference => "Inference",
            Self::DisplayHeatmap => "Display heatmap",
            Self::End => "End",
        }
    }
}

pub const CHECKPOINT_COUNT: usize = InferenceCheckpoint::ALL.len();

/// One published frame: the confidence image plus its stage timestamps.
#[derive(Debug, Clone, Default)]
pub struct Heatmap {
    pub width: usize,
    pub height: usize,
    pub image_binary: Vec<u8>,
    timings: Vec<(InferenceCheckpoint, Instant)>,
}

impl Heatmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_timing_checkpoint(&mut self, checkpoint: InferenceCheckpoint) {
        self.timings.push((checkpoint, Instant::now()));
    }

    pub fn timings(&self) -> &[(InferenceCheckpoint, Instant)] {
        &self.timings
    }

    fn checkpoint(&self, checkpoint: InferenceCheckpoint) -> Option<Instant> {
        self.timings
            .iter()
            .find(|(c, _)| *c == checkpoint)
            .map(|(_, t)| *t)
    }
}

/// Accumulates per-stage durations across cycles and logs rolled-up
/// averages every N captures, then resets.
pub struct InferenceTimings {
    show_stats_every_n: u32,
    count: u32,
    total: Duration,
    steps: [Duration; CHECKPOINT_COUNT - 1],
}

impl InferenceTimings {
    pub fn new(show_stats_every_n: u32) -> Self {
        Self {
            show_stats_every_n,
            count: 0,
            total: Duration::ZERO,
            steps: [Duration::ZERO; CHECKPOINT_COUNT - 1],
        }
    }

    pub fn add_timing(&mut self, heatmap: &Heatmap) {
        if heatmap.timings().len() != CHECKPOINT_COUNT {
            error!(
                "Invalid number of timings. {} expected, but actual {}",
                CHECKPOINT_COUNT,
                heatmap.timings().len()
            );
            return;
        }
        let Some(first) = heatmap.checkpoint(InferenceCheckpoint::Prepare) else {
            return;
        };
        let Some(last) = heatmap.checkpoint(InferenceCheckpoint::End) else {
            return;
        };
        self.count += 1;
        self.total += last.duration_since(first);
        for (i, window) in InferenceCheckpoint::ALL.windows(2).enumerate() {
            if let (Some(start), Some(end)) =
                (heatmap.checkpoint(window[0]), heatmap.checkpoint(window[1]))
            {
                self.steps[i] += end.duration_since(start);
            }
        }

        if self.count >= self.show_stats_every_n {
            info!("Timing stats (average) for {} captures", self.count);
            info!("  Total: {} ms", (self.total / self.count).as_millis());
            for (i, window) in InferenceCheckpoint::ALL.windows(2).enumerate() {
                info!(
                    "    {}: {}",
                    window[0].label(),
                    self.average_duration_label(i)
                );
            }
            self.clear();
        }
    }

    fn average_duration_label(&self, step: usize) -> String {
        let milliseconds = (self.steps[step] / self.count.max(1)).as_millis();
        if milliseconds == 0 {
            "<1 ms".to_string()
        } else {
            format!("{milliseconds} ms")
        }
    }

    fn clear(&mut self) {
        self.count = 0;
        self.total = Duration::ZERO;
        self.steps = [Duration::ZERO; CHECKPOINT_COUNT - 1];
    }
}
