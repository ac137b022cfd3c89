/// Filter chain module
///
/// Per-feed acceptance rules applied to each candidate. Rules run in a
/// fixed order and short-circuit on the first rejection so the debug log
/// names the rule that dropped a candidate.

use chrono::{DateTime, Utc};

use crate::feed::Feed;
use crate::source::Candidate;

/// True when the candidate passes every rule configured on the feed.
pub fn accepts(feed: &Feed, candidate: &Candidate, now: DateTime<Utc>) -> bool {
    if feed.ignore_pinned && candidate.is_pinned {
        log::debug!("[{}] rejected {}: pinned", feed.name, candidate.id);
        return false;
    }

    if feed.image_only && !candidate.is_image {
        log::debug!("[{}] rejected {}: not an image", feed.name, candidate.id);
        return false;
    }

    if candidate.score < feed.min_score {
        log::debug!(
            "[{}] rejected {}: score {} below minimum {}",
            feed.name,
            candidate.id,
            candidate.score,
            feed.min_score
        );
        return false;
    }

    if !feed.allow_nsfw && candidate.is_adult {
        log::debug!("[{}] rejected {}: marked adult", feed.name, candidate.id);
        return false;
    }

    if feed.min_age_minutes > 0 {
        let age_minutes = (now - candidate.created_at).num_minutes();
        if age_minutes < feed.min_age_minutes {
            log::debug!(
                "[{}] rejected {}: {}min old, minimum age {}min",
                feed.name,
                candidate.id,
                age_minutes,
                feed.min_age_minutes
            );
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidate() -> Candidate {
        Candidate {
            id: "c1".into(),
            title: "a title".into(),
            score: 100,
            created_at: Utc::now() - Duration::hours(6),
            is_pinned: false,
            is_adult: false,
            is_image: true,
            url: "https://i.redd.it/c1.jpg".into(),
            permalink: "https://www.reddit.com/r/pics/c1".into(),
            author: "author".into(),
            raw_size: 64,
        }
    }

    #[test]
    fn default_feed_accepts_plain_candidate() {
        let feed = Feed::new("pics", 1);
        assert!(accepts(&feed, &candidate(), Utc::now()));
    }

    #[test]
    fn pinned_rejected_when_ignored() {
        let feed = Feed::new("pics", 1);
        let mut c = candidate();
        c.is_pinned = true;
        assert!(!accepts(&feed, &c, Utc::now()));

        let mut lenient = Feed::new("pics", 1);
        lenient.ignore_pinned = false;
        assert!(accepts(&lenient, &c, Utc::now()));
    }

    #[test]
    fn image_only_rejects_links() {
        let mut feed = Feed::new("pics", 1);
        feed.image_only = true;
        let mut c = candidate();
        c.is_image = false;
        assert!(!accepts(&feed, &c, Utc::now()));
    }

    #[test]
    fn score_threshold_applies() {
        let mut feed = Feed::new("pics", 1);
        feed.min_score = 500;
        assert!(!accepts(&feed, &candidate(), Utc::now()));
        feed.min_score = 100;
        assert!(accepts(&feed, &candidate(), Utc::now()));
    }

    #[test]
    fn adult_content_needs_opt_in() {
        let feed = Feed::new("pics", 1);
        let mut c = candidate();
        c.is_adult = true;
        assert!(!accepts(&feed, &c, Utc::now()));

        let mut nsfw_feed = Feed::new("pics", 1);
        nsfw_feed.allow_nsfw = true;
        assert!(accepts(&nsfw_feed, &c, Utc::now()));
    }

    #[test]
    fn min_age_rejects_fresh_posts() {
        let mut feed = Feed::new("pics", 1);
        feed.min_age_minutes = 120;
        let now = Utc::now();

        let mut fresh = candidate();
        fresh.created_at = now - Duration::minutes(30);
        assert!(!accepts(&feed, &fresh, now));

        let mut settled = candidate();
        settled.created_at = now - Duration::minutes(180);
        assert!(accepts(&feed, &settled, now));
    }
}
