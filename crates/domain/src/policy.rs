//! Process policies and their schedule predicate.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A process-level policy pushed by the controller.
///
/// `process_name` is matched case-insensitively against the live process
/// table. A policy with `allowed = false` causes matching processes to be
/// terminated whenever the policy is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: String,
    pub process_name: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<PolicySchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotas: Option<PolicyQuotas>,
    #[serde(default)]
    pub created_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_ts: Option<DateTime<Utc>>,
}

/// Optional time window during which a policy is active.
///
/// `start` and `end` are `"HH:MM"` local wall-clock times; `days_of_week`
/// uses Sunday = 0. A window with `start > end` spans midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySchedule {
    #[serde(rename = "start_hhmm")]
    pub start: String,
    #[serde(rename = "end_hhmm")]
    pub end: String,
    #[serde(default)]
    pub days_of_week: Vec<u8>,
}

/// Usage quotas. Accepted and persisted; enforcement is controller-driven
/// via scheduled-shutdown commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PolicyQuotas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_minutes: Option<u32>,
}

impl Policy {
    /// Whether this policy is active at local wall time `t`.
    ///
    /// Pure function of the policy and `t`: a policy with no schedule is
    /// always active; otherwise both the day-of-week set and the
    /// minute-of-day window (inclusive) must hold.
    pub fn active_at<Tz: chrono::TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        let Some(schedule) = &self.schedule else {
            return true;
        };
        schedule.contains(t)
    }
}

impl PolicySchedule {
    /// Whether local time `t` falls inside this schedule.
    pub fn contains<Tz: chrono::TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        let dow = t.weekday().num_days_from_sunday() as u8;
        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&dow) {
            return false;
        }
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            // Unparseable bounds never match; the policy stays inactive
            // rather than enforcing at the wrong time.
            return false;
        };
        let minute = (t.hour() * 60 + t.minute()) as u16;
        if start <= end {
            minute >= start && minute <= end
        } else {
            // Window spans midnight, e.g. 22:00–06:00.
            minute >= start || minute <= end
        }
    }
}

/// Parse `"HH:MM"` into a minute-of-day. Returns `None` for malformed input.
fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy_with_schedule(start: &str, end: &str, days: Vec<u8>) -> Policy {
        Policy {
            id: "p1".into(),
            process_name: "steam.exe".into(),
            allowed: false,
            schedule: Some(PolicySchedule {
                start: start.into(),
                end: end.into(),
                days_of_week: days,
            }),
            quotas: None,
            created_ts: None,
            updated_ts: None,
        }
    }

    // 2024-01-07 was a Sunday (day 0).
    fn sunday_at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 7, h, m, 0).unwrap()
    }

    #[test]
    fn no_schedule_is_always_active() {
        let p = Policy {
            id: "p".into(),
            process_name: "x".into(),
            allowed: true,
            schedule: None,
            quotas: None,
            created_ts: None,
            updated_ts: None,
        };
        assert!(p.active_at(&sunday_at(3, 0)));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let p = policy_with_schedule("09:00", "17:00", vec![0]);
        assert!(p.active_at(&sunday_at(9, 0)));
        assert!(p.active_at(&sunday_at(17, 0)));
        assert!(!p.active_at(&sunday_at(8, 59)));
        assert!(!p.active_at(&sunday_at(17, 1)));
    }

    #[test]
    fn wrong_day_is_inactive() {
        // Monday = 1 only.
        let p = policy_with_schedule("00:00", "23:59", vec![1]);
        assert!(!p.active_at(&sunday_at(12, 0)));
    }

    #[test]
    fn empty_day_set_means_every_day() {
        let p = policy_with_schedule("09:00", "17:00", vec![]);
        assert!(p.active_at(&sunday_at(12, 0)));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let p = policy_with_schedule("22:00", "06:00", vec![]);
        assert!(p.active_at(&sunday_at(23, 30)));
        assert!(p.active_at(&sunday_at(5, 59)));
        assert!(!p.active_at(&sunday_at(12, 0)));
    }

    #[test]
    fn malformed_bounds_never_match() {
        let p = policy_with_schedule("25:99", "17:00", vec![]);
        assert!(!p.active_at(&sunday_at(12, 0)));
    }

    #[test]
    fn round_trips_through_json() {
        let p = policy_with_schedule("09:00", "17:00", vec![0, 6]);
        let json = serde_json::to_string(&p).unwrap();
        let back: Policy = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
        assert!(json.contains("start_hhmm"));
    }
}
