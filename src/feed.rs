/// Feed model module
///
/// A feed binds one source community (a subreddit) to one destination
/// Telegram channel, together with its scheduling and filtering settings.
/// Rows are owned by the storage layer; the relay core reads them and only
/// writes back `last_post_time` and dedup records after successful posts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing order requested from the content source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sorting {
    Hot,
    New,
    Rising,
    TopDay,
    TopWeek,
    TopMonth,
    TopAll,
}

impl Sorting {
    /// Listing path segment and optional time window query parameter.
    pub fn endpoint(&self) -> (&'static str, Option<&'static str>) {
        match self {
            Sorting::Hot => ("hot", None),
            Sorting::New => ("new", None),
            Sorting::Rising => ("rising", None),
            Sorting::TopDay => ("top", Some("day")),
            Sorting::TopWeek => ("top", Some("week")),
            Sorting::TopMonth => ("top", Some("month")),
            Sorting::TopAll => ("top", Some("all")),
        }
    }

    /// Long-window top listings get an initial snapshot when first enabled,
    /// so a freshly configured feed does not flood its channel with content
    /// that has been at the top for months.
    pub fn needs_initial_snapshot(&self) -> bool {
        matches!(self, Sorting::TopMonth | Sorting::TopAll)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sorting::Hot => "hot",
            Sorting::New => "new",
            Sorting::Rising => "rising",
            Sorting::TopDay => "top_day",
            Sorting::TopWeek => "top_week",
            Sorting::TopMonth => "top_month",
            Sorting::TopAll => "top_all",
        }
    }

    pub fn parse(s: &str) -> Option<Sorting> {
        match s {
            "hot" => Some(Sorting::Hot),
            "new" => Some(Sorting::New),
            "rising" => Some(Sorting::Rising),
            "top_day" => Some(Sorting::TopDay),
            "top_week" => Some(Sorting::TopWeek),
            "top_month" => Some(Sorting::TopMonth),
            "top_all" => Some(Sorting::TopAll),
            _ => None,
        }
    }
}

/// One configured relay feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    /// Source-system id (the subreddit name key).
    pub id: String,
    /// Display name used in logs and admin messages.
    pub name: String,
    /// Destination Telegram chat. Feeds without a channel are never scheduled.
    pub channel_id: Option<i64>,

    pub sorting: Sorting,
    /// Candidates requested from the source per run.
    pub limit: u32,
    /// Accepted candidates posted per run at most.
    pub number_of_posts: u32,

    /// Minimum minutes between posts, before quiet-hours adjustment.
    pub max_frequency: i64,
    /// Quiet-hours window, hours of day 0-23. Both unset means no window.
    pub quiet_hours_start: Option<u8>,
    pub quiet_hours_end: Option<u8>,
    /// Frequency multiplier inside the quiet window. 0 suppresses posting
    /// entirely, 1 disables the window.
    pub quiet_hours_demultiplier: f64,
    /// Set only after a successful delivery.
    pub last_post_time: Option<DateTime<Utc>>,

    pub min_score: i64,
    pub allow_nsfw: bool,
    /// Candidates younger than this are rejected. 0 disables the rule.
    pub min_age_minutes: i64,
    pub image_only: bool,
    pub ignore_pinned: bool,

    /// Test feeds run the full fetch/filter/post path but never persist
    /// dedup rows or touch `last_post_time`.
    pub test: bool,
    pub enabled: bool,
}

impl Feed {
    /// A minimal enabled feed with relay defaults; used by tests and by the
    /// bootstrap path that seeds a feed row from the environment.
    pub fn new(id: &str, channel_id: i64) -> Self {
        Feed {
            id: id.to_string(),
            name: id.to_string(),
            channel_id: Some(channel_id),
            sorting: Sorting::Hot,
            limit: 25,
            number_of_posts: 1,
            max_frequency: 60,
            quiet_hours_start: None,
            quiet_hours_end: None,
            quiet_hours_demultiplier: 1.0,
            last_post_time: None,
            min_score: 0,
            allow_nsfw: false,
            min_age_minutes: 0,
            image_only: false,
            ignore_pinned: true,
            test: false,
            enabled: true,
        }
    }
}
