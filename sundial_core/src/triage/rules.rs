//! Deterministic scoring for items with structured urgency signals.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::models::{Due, ItemDetails, NormalizedItem, TaskPriority};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleScore {
    pub score: u8,
    pub reasoning: String,
}

impl RuleScore {
    fn new(score: u32, reasoning: impl Into<String>) -> Self {
        Self {
            score: score.min(100) as u8,
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DueBucket {
    Overdue,
    Today,
    Tomorrow,
    ThisWeek,
    Later,
    None,
}

impl DueBucket {
    fn classify(due: Option<Due>, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        let (date, past) = match due {
            None => return DueBucket::None,
            Some(Due::Date(d)) => (d, d < today),
            Some(Due::At(at)) => (at.date_naive(), at < now),
        };
        if past {
            return DueBucket::Overdue;
        }
        let days = (date - today).num_days();
        match days {
            0 => DueBucket::Today,
            1 => DueBucket::Tomorrow,
            2..=7 => DueBucket::ThisWeek,
            _ => DueBucket::Later,
        }
    }

    fn base(self) -> u32 {
        match self {
            DueBucket::Overdue => 65,
            DueBucket::Today => 55,
            DueBucket::Tomorrow => 45,
            DueBucket::ThisWeek => 35,
            DueBucket::Later | DueBucket::None => 20,
        }
    }

    fn label(self) -> &'static str {
        match self {
            DueBucket::Overdue => "overdue",
            DueBucket::Today => "due today",
            DueBucket::Tomorrow => "due tomorrow",
            DueBucket::ThisWeek => "due this week",
            DueBucket::Later => "due later",
            DueBucket::None => "no due date",
        }
    }
}

fn priority_bonus(priority: TaskPriority) -> (u32, &'static str) {
    match priority {
        TaskPriority::Highest => (30, "highest priority"),
        TaskPriority::High => (20, "high priority"),
        TaskPriority::Low => (10, "low priority"),
        TaskPriority::Lowest => (0, "lowest priority"),
    }
}

pub fn score_task(priority: TaskPriority, due: Option<Due>, now: DateTime<Utc>) -> RuleScore {
    let bucket = DueBucket::classify(due, now);
    let (bonus, label) = priority_bonus(priority);
    RuleScore::new(bucket.base() + bonus, format!("{} + {label}", bucket.label()))
}

fn all_day_score(start: NaiveDate, now: DateTime<Utc>) -> RuleScore {
    match (start - now.date_naive()).num_days() {
        i64::MIN..=-1 => RuleScore::new(5, "all-day event already passed"),
        0 => RuleScore::new(60, "all-day event today"),
        1 => RuleScore::new(45, "all-day event tomorrow"),
        2..=7 => RuleScore::new(30, "all-day event this week"),
        _ => RuleScore::new(15, "all-day event later"),
    }
}

pub fn score_event(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    all_day: bool,
    now: DateTime<Utc>,
) -> RuleScore {
    if all_day {
        return all_day_score(start.date_naive(), now);
    }
    if now >= start {
        return match end {
            Some(end) if now < end => RuleScore::new(85, "in progress"),
            _ => RuleScore::new(5, "already started"),
        };
    }

    let until = start - now;
    if until <= Duration::hours(1) {
        RuleScore::new(90, "starts within the hour")
    } else if until <= Duration::hours(4) {
        RuleScore::new(80, format!("starts in {} hours", until.num_hours().max(1)))
    } else if until <= Duration::hours(24) {
        RuleScore::new(65, "starts within a day")
    } else if until <= Duration::hours(72) {
        RuleScore::new(45, "starts within three days")
    } else if until <= Duration::days(7) {
        RuleScore::new(30, "starts this week")
    } else {
        RuleScore::new(15, "more than a week out")
    }
}

pub fn score_transaction(amount: f64, pending: bool) -> RuleScore {
    let (base, label) = if amount <= 0.0 {
        (25, "incoming funds")
    } else if amount >= 1000.0 {
        (70, "large charge")
    } else if amount >= 250.0 {
        (50, "sizeable charge")
    } else if amount >= 50.0 {
        (35, "moderate charge")
    } else {
        (20, "small charge")
    };
    if pending {
        RuleScore::new(base + 5, format!("{label} + pending"))
    } else {
        RuleScore::new(base, label)
    }
}

/// Rule-based score, or `None` for kinds that need the classifier.
pub fn score_item(item: &NormalizedItem, now: DateTime<Utc>) -> Option<RuleScore> {
    match &item.details {
        ItemDetails::Task { priority, due } => Some(score_task(*priority, *due, now)),
        ItemDetails::Event {
            start,
            end,
            all_day,
        } => Some(score_event(*start, *end, *all_day, now)),
        ItemDetails::Transaction {
            amount, pending, ..
        } => Some(score_transaction(*amount, *pending)),
        ItemDetails::Email { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 13, 12, 0, 0).unwrap()
    }

    #[test]
    fn task_anchor_scores() {
        let n = now();
        let yesterday = Due::Date(n.date_naive() - Duration::days(1));
        let today = Due::Date(n.date_naive());

        let s = score_task(TaskPriority::Highest, Some(yesterday), n);
        assert_eq!(s.score, 95);
        assert_eq!(s.reasoning, "overdue + highest priority");

        assert_eq!(score_task(TaskPriority::Highest, Some(today), n).score, 85);

        let s = score_task(TaskPriority::Lowest, None, n);
        assert_eq!(s.score, 20);
        assert_eq!(s.reasoning, "no due date + lowest priority");
    }

    #[test]
    fn timed_due_in_the_past_is_overdue() {
        let n = now();
        let s = score_task(TaskPriority::High, Some(Due::At(n - Duration::minutes(5))), n);
        assert_eq!(s.score, 85);
        let s = score_task(TaskPriority::High, Some(Due::At(n + Duration::hours(2))), n);
        assert_eq!(s.score, 75);
    }

    #[test]
    fn event_anchor_scores() {
        let n = now();
        assert!(score_event(n + Duration::hours(2), None, false, n).score >= 75);
        let far = score_event(n + Duration::days(5), None, false, n).score;
        assert!(far < 50 && far <= 30);
        assert_eq!(
            score_event(n - Duration::minutes(10), Some(n + Duration::minutes(20)), false, n).score,
            85
        );
        assert_eq!(score_event(n - Duration::hours(3), None, false, n).score, 5);
    }

    #[test]
    fn all_day_events_use_calendar_days() {
        let n = now();
        let midnight = Utc.with_ymd_and_hms(2026, 5, 13, 0, 0, 0).unwrap();
        assert_eq!(score_event(midnight, None, true, n).score, 60);
        assert_eq!(score_event(midnight + Duration::days(1), None, true, n).score, 45);
        assert_eq!(score_event(midnight - Duration::days(1), None, true, n).score, 5);
    }

    #[test]
    fn transaction_scores() {
        assert_eq!(score_transaction(1200.0, false).score, 70);
        assert_eq!(score_transaction(1200.0, true).score, 75);
        assert_eq!(score_transaction(12.5, false).score, 20);
        assert_eq!(score_transaction(-300.0, false).reasoning, "incoming funds");
    }
}
