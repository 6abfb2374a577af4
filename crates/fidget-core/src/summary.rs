//! Daily summary over decrypted session records.

use serde::{Deserialize, Serialize};

use crate::record::SessionRecord;

const MS_PER_MINUTE: u64 = 60_000;

/// Dominant interaction of a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MainActivity {
    CounterClockwise = 0,
    Clockwise = 1,
    Press = 2,
}

impl MainActivity {
    pub fn description(&self) -> &'static str {
        match self {
            Self::CounterClockwise => "Counter-Clockwise",
            Self::Clockwise => "Clockwise",
            Self::Press => "Press",
        }
    }
}

impl From<MainActivity> for u8 {
    fn from(activity: MainActivity) -> Self {
        activity as u8
    }
}

impl TryFrom<u8> for MainActivity {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::CounterClockwise),
            1 => Ok(Self::Clockwise),
            2 => Ok(Self::Press),
            other => Err(format!("unknown activity code {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub p: u32,
    pub ccw: u32,
    pub cw: u32,
}

impl ActivityCounts {
    /// Counter-clockwise wins ties.
    pub fn dominant(&self) -> MainActivity {
        if self.cw > self.ccw && self.cw > self.p {
            MainActivity::Clockwise
        } else if self.p > self.ccw && self.p > self.cw {
            MainActivity::Press
        } else {
            MainActivity::CounterClockwise
        }
    }
}

/// Aggregate of one day's sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    #[serde(rename = "avgHB")]
    pub avg: u32,
    #[serde(rename = "minHB")]
    pub min: f64,
    #[serde(rename = "maxHB")]
    pub max: f64,
    pub main: MainActivity,
    pub values: ActivityCounts,
    /// Whole minutes.
    pub duration: u64,
    pub session_count: usize,
    pub date: String,
    pub combined_data: Vec<SessionRecord>,
}

impl DailySummary {
    /// Aggregates the records that carry no error. Returns `None` when no
    /// such record exists.
    pub fn from_records(records: &[SessionRecord]) -> Option<Self> {
        let mut valid: Vec<SessionRecord> =
            records.iter().filter(|r| !r.is_error()).cloned().collect();
        if valid.is_empty() {
            return None;
        }

        let mut min = valid[0].min.unwrap_or(0.0);
        let mut max = valid[0].max.unwrap_or(0.0);
        let mut sum = 0.0;
        let mut total_ms = 0u64;
        let mut counts = ActivityCounts::default();

        for (index, record) in valid.iter_mut().enumerate() {
            // Device-supplied counters; a corrupt record must not overflow.
            counts.p = counts.p.saturating_add(record.p.unwrap_or(0));
            counts.ccw = counts.ccw.saturating_add(record.ccw.unwrap_or(0));
            counts.cw = counts.cw.saturating_add(record.cw.unwrap_or(0));
            total_ms = total_ms.saturating_add(record.duration.unwrap_or(0));

            // Zero means "no reading", not a minimum.
            if let Some(value) = record.min.filter(|v| *v != 0.0) {
                if value < min || min == 0.0 {
                    min = value;
                }
            }
            if let Some(value) = record.max.filter(|v| *v > max) {
                max = value;
            }
            sum += record.avg.unwrap_or(0.0);

            if record.id.is_none() {
                record.id = Some(index as u64);
            }
        }

        let avg = (sum / valid.len() as f64).round().max(0.0) as u32;
        let duration = (total_ms as f64 / MS_PER_MINUTE as f64).round() as u64;
        let date = valid[0].date.clone().unwrap_or_default();

        Some(Self {
            avg,
            min,
            max,
            main: counts.dominant(),
            values: counts,
            duration,
            session_count: valid.len(),
            date,
            combined_data: valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> SessionRecord {
        SessionRecord::from_value(value)
    }

    #[test]
    fn aggregates_valid_sessions() {
        let records = vec![
            record(json!({"id": 0, "min": 67, "max": 90, "avg": 78, "duration": 300000,
                "p": 3, "ccw": 15, "cw": 8, "date": "24.2.25"})),
            record(json!({"min": 70, "max": 95, "avg": 82, "duration": 400000,
                "p": 4, "ccw": 20, "cw": 12})),
            SessionRecord::failed("Decryption failed", None),
            record(json!({"min": 72, "max": 109, "avg": 88, "duration": 260000,
                "p": 3, "ccw": 20, "cw": 10})),
        ];

        let summary = DailySummary::from_records(&records).unwrap();
        assert_eq!(summary.session_count, 3);
        assert_eq!(summary.avg, 83);
        assert_eq!(summary.min, 67.0);
        assert_eq!(summary.max, 109.0);
        assert_eq!(summary.duration, 16);
        assert_eq!(summary.main, MainActivity::CounterClockwise);
        assert_eq!(summary.values, ActivityCounts { p: 10, ccw: 55, cw: 30 });
        assert_eq!(summary.date, "24.2.25");
        assert_eq!(summary.combined_data[1].id, Some(1));
        assert_eq!(summary.combined_data[2].id, Some(2));
    }

    #[test]
    fn only_failed_records_yield_nothing() {
        let records = vec![SessionRecord::failed("bad", None)];
        assert!(DailySummary::from_records(&records).is_none());
        assert!(DailySummary::from_records(&[]).is_none());
    }

    #[test]
    fn huge_counters_saturate() {
        let records = vec![
            record(json!({"avg": 70, "p": u32::MAX, "cw": 5, "duration": u64::MAX})),
            record(json!({"avg": 72, "p": 1, "cw": u32::MAX, "duration": 60000})),
        ];

        let summary = DailySummary::from_records(&records).unwrap();
        assert_eq!(summary.values.p, u32::MAX);
        assert_eq!(summary.values.cw, u32::MAX);
        assert_eq!(summary.duration, (u64::MAX as f64 / 60_000.0).round() as u64);
        assert_eq!(summary.session_count, 2);
    }

    #[test]
    fn dominant_activity() {
        let cw = ActivityCounts { p: 1, ccw: 2, cw: 3 };
        assert_eq!(cw.dominant(), MainActivity::Clockwise);
        let press = ActivityCounts { p: 9, ccw: 2, cw: 3 };
        assert_eq!(press.dominant(), MainActivity::Press);
        let tie = ActivityCounts { p: 3, ccw: 1, cw: 3 };
        assert_eq!(tie.dominant(), MainActivity::CounterClockwise);
        assert_eq!(MainActivity::Press.description(), "Press");
    }

    #[test]
    fn serializes_dashboard_field_names() {
        let records = vec![record(json!({"min": 60, "max": 70, "avg": 65}))];
        let value = serde_json::to_value(DailySummary::from_records(&records).unwrap()).unwrap();
        assert_eq!(value["avgHB"], json!(65));
        assert_eq!(value["sessionCount"], json!(1));
        assert_eq!(value["main"], json!(0));
    }
}
