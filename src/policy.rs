use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

use crate::error::PipelineError;

/// Cadence deciding whether a source is due for a re-run. All required
/// fields are validated eagerly at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    Daily { repeat_freq: u32 },
    Weekly { repeat_freq: u32, repeat_day: Weekday },
    Monthly { repeat_date: u32 },
}

impl UpdatePolicy {
    pub fn parse(
        kind: &str,
        repeat_freq: Option<u32>,
        repeat_day: Option<&str>,
        repeat_date: Option<u32>,
    ) -> Result<Self, PipelineError> {
        match kind.trim().to_lowercase().as_str() {
            "daily" => {
                let repeat_freq = repeat_freq
                    .ok_or_else(|| PipelineError::InvalidPolicy("daily requires repeatFreq".into()))?;
                if repeat_freq == 0 {
                    return Err(PipelineError::InvalidPolicy("repeatFreq must be >= 1".into()));
                }
                Ok(UpdatePolicy::Daily { repeat_freq })
            }
            "weekly" => {
                let repeat_freq = repeat_freq
                    .ok_or_else(|| PipelineError::InvalidPolicy("weekly requires repeatFreq".into()))?;
                if repeat_freq == 0 {
                    return Err(PipelineError::InvalidPolicy("repeatFreq must be >= 1".into()));
                }
                let day = repeat_day
                    .ok_or_else(|| PipelineError::InvalidPolicy("weekly requires repeatDay".into()))?;
                let repeat_day = parse_weekday(day)?;
                Ok(UpdatePolicy::Weekly {
                    repeat_freq,
                    repeat_day,
                })
            }
            "monthly" => {
                let repeat_date = repeat_date
                    .ok_or_else(|| PipelineError::InvalidPolicy("monthly requires repeatDate".into()))?;
                if !(1..=31).contains(&repeat_date) {
                    return Err(PipelineError::InvalidPolicy(format!(
                        "repeatDate out of range: {repeat_date}"
                    )));
                }
                Ok(UpdatePolicy::Monthly { repeat_date })
            }
            other => Err(PipelineError::InvalidPolicy(format!(
                "unknown update type: {other}"
            ))),
        }
    }

    /// Whether the source is due, given the last successful run. A source
    /// with no recorded success is always due.
    pub fn update_ready(&self, last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_success else {
            return true;
        };
        match *self {
            UpdatePolicy::Daily { repeat_freq } => {
                last + Duration::days(i64::from(repeat_freq)) < now
            }
            UpdatePolicy::Weekly {
                repeat_freq,
                repeat_day,
            } => {
                let today = now.date_naive();
                let last_date = last.date_naive();
                let gap = (today - last_date).num_days();
                today.weekday() == repeat_day
                    && today != last_date
                    && gap > i64::from(7 * (repeat_freq - 1) + 1)
            }
            UpdatePolicy::Monthly { repeat_date } => {
                let today = now.date_naive();
                let last_date = last.date_naive();
                let new_month = (today.year(), today.month()) != (last_date.year(), last_date.month());
                let day_matches = today.day() == repeat_date
                    || (repeat_date > days_in_month(today) && today.day() == days_in_month(today));
                new_month && day_matches
            }
        }
    }
}

fn parse_weekday(value: &str) -> Result<Weekday, PipelineError> {
    match value.trim().to_lowercase().as_str() {
        "monday" | "mon" => Ok(Weekday::Mon),
        "tuesday" | "tue" => Ok(Weekday::Tue),
        "wednesday" | "wed" => Ok(Weekday::Wed),
        "thursday" | "thu" => Ok(Weekday::Thu),
        "friday" | "fri" => Ok(Weekday::Fri),
        "saturday" | "sat" => Ok(Weekday::Sat),
        "sunday" | "sun" => Ok(Weekday::Sun),
        other => Err(PipelineError::InvalidPolicy(format!(
            "unknown weekday: {other}"
        ))),
    }
}

fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}
