use serde::Serialize;
use std::collections::VecDeque;

/// Number of RSSI samples averaged into a quality reading.
pub const SAMPLE_WINDOW: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SignalQuality {
    /// No samples yet.
    Unknown,
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SignalQuality {
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r >= -60 => SignalQuality::Excellent,
            r if r >= -70 => SignalQuality::Good,
            r if r >= -80 => SignalQuality::Fair,
            _ => SignalQuality::Poor,
        }
    }
}

/// Rolling mean of the last [SAMPLE_WINDOW] RSSI readings.
#[derive(Debug, Clone, Default)]
pub struct QualitySampler {
    samples: VecDeque<i16>,
}

impl QualitySampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, rssi: i16) -> SignalQuality {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rssi);
        self.quality()
    }

    pub fn average(&self) -> Option<i16> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i32 = self.samples.iter().map(|&s| i32::from(s)).sum();
        // Mean of i16 values always fits in i16.
        Some((sum / self.samples.len() as i32) as i16)
    }

    pub fn quality(&self) -> SignalQuality {
        self.average()
            .map(SignalQuality::from_rssi)
            .unwrap_or(SignalQuality::Unknown)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
