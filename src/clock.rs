use chrono::{DateTime, Datelike, Local, NaiveDateTime};

pub const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Wall-clock source for day windows and month keys. Normally the system
/// clock; pinned to a fixed instant when COACHD_FIXED_NOW is set so that
/// spawned-process tests are deterministic.
#[derive(Debug, Clone)]
pub struct Clock {
    fixed: Option<NaiveDateTime>,
}

impl Clock {
    pub fn system() -> Self {
        Clock { fixed: None }
    }

    #[allow(dead_code)]
    pub fn fixed(at: NaiveDateTime) -> Self {
        Clock { fixed: Some(at) }
    }

    pub fn from_env() -> Self {
        match std::env::var("COACHD_FIXED_NOW") {
            Ok(raw) => match parse_fixed_now(&raw) {
                Some(at) => Clock { fixed: Some(at) },
                None => Clock::system(),
            },
            Err(_) => Clock::system(),
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.fixed.unwrap_or_else(|| Local::now().naive_local())
    }

    pub fn timestamp(&self) -> String {
        self.now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
    }

    /// Calendar-day key, e.g. "2025-03-14". Attendance idempotency keys on this.
    pub fn day_key(&self) -> String {
        self.now().format("%Y-%m-%d").to_string()
    }

    /// Month key in ledger form, e.g. "March 2025".
    pub fn month_key(&self) -> String {
        let now = self.now();
        format!("{} {}", MONTH_NAMES[now.month0() as usize], now.year())
    }
}

fn parse_fixed_now(raw: &str) -> Option<NaiveDateTime> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S").ok()
}

/// Validates a fee month key like "March 2025" and returns it with the
/// canonical month-name casing. None if the key is malformed.
pub fn parse_month_key(raw: &str) -> Option<String> {
    let t = raw.trim();
    let (name, year) = t.split_once(' ')?;
    let year: i32 = year.trim().parse().ok()?;
    if !(1970..=9999).contains(&year) {
        return None;
    }
    let canonical = MONTH_NAMES
        .iter()
        .find(|m| m.eq_ignore_ascii_case(name.trim()))?;
    Some(format!("{} {}", canonical, year))
}
