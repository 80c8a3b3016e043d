//! Consecutive-sighting confirmation.
//!
//! A single matched frame is not trusted on its own: an identity must be
//! matched on the same camera `required` times in a row, with no more than
//! `max_gap` between sightings, before the observation reaches the state
//! machine.

use crate::types::IdentityId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct ConfirmationConfig {
    /// Consecutive sightings needed; 1 disables confirmation.
    pub required: u32,
    /// Longest gap between sightings that keeps a streak alive.
    pub max_gap: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            required: 3,
            max_gap: Duration::seconds(2),
        }
    }
}

/// Result of feeding one sighting to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Pending { seen: u32, required: u32 },
    Confirmed,
}

#[derive(Debug, Clone, Copy)]
struct Streak {
    count: u32,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    config: ConfirmationConfig,
    streaks: HashMap<(String, IdentityId), Streak>,
}

impl ConfirmationTracker {
    pub fn new(config: ConfirmationConfig) -> Self {
        Self {
            config: ConfirmationConfig {
                required: config.required.max(1),
                ..config
            },
            streaks: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ConfirmationConfig {
        &self.config
    }

    /// Record a matched sighting of `identity` on `camera_id`.
    ///
    /// Reaching the required count confirms the observation. The streak is
    /// kept until [`release`](Self::release) is called once the decision has
    /// been made, so a failed evaluation can be retried without starting over.
    /// After release a person standing in front of the camera is confirmed
    /// again every `required` frames (the state machine absorbs those as
    /// duplicates).
    pub fn sighting(
        &mut self,
        camera_id: &str,
        identity: &IdentityId,
        at: DateTime<Utc>,
    ) -> Confirmation {
        let required = self.config.required;
        let key = (camera_id.to_string(), identity.clone());

        let count = match self.streaks.get(&key) {
            Some(s) if at >= s.last_seen && at - s.last_seen <= self.config.max_gap => s.count + 1,
            _ => 1,
        };

        self.streaks.insert(key, Streak { count, last_seen: at });
        if count >= required {
            return Confirmation::Confirmed;
        }
        Confirmation::Pending { seen: count, required }
    }

    /// Reset the streak of `identity` on `camera_id` after its decision.
    pub fn release(&mut self, camera_id: &str, identity: &IdentityId) {
        self.streaks.remove(&(camera_id.to_string(), identity.clone()));
    }

    /// Break every streak on `camera_id`, e.g. after an unrecognised face on
    /// a single-face frame.
    pub fn reset_camera(&mut self, camera_id: &str) {
        self.streaks.retain(|(cam, _), _| cam != camera_id);
    }

    /// Drop streaks that can no longer continue.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let max_gap = self.config.max_gap;
        self.streaks.retain(|_, s| now - s.last_seen <= max_gap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_three_consecutive_sightings() {
        let mut tr = ConfirmationTracker::new(ConfirmationConfig::default());
        let id = IdentityId::from("alice");
        assert_eq!(tr.sighting("cam0", &id, t(0)), Confirmation::Pending { seen: 1, required: 3 });
        assert_eq!(tr.sighting("cam0", &id, t(100)), Confirmation::Pending { seen: 2, required: 3 });
        assert_eq!(tr.sighting("cam0", &id, t(200)), Confirmation::Confirmed);
        tr.release("cam0", &id);
        assert_eq!(tr.sighting("cam0", &id, t(300)), Confirmation::Pending { seen: 1, required: 3 });
    }

    #[test]
    fn test_confirmed_streak_held_until_release() {
        let mut tr = ConfirmationTracker::new(ConfirmationConfig::default());
        let id = IdentityId::from("alice");
        tr.sighting("cam0", &id, t(0));
        tr.sighting("cam0", &id, t(100));
        assert_eq!(tr.sighting("cam0", &id, t(200)), Confirmation::Confirmed);
        assert_eq!(tr.sighting("cam0", &id, t(300)), Confirmation::Confirmed);
        tr.release("cam1", &id);
        assert_eq!(tr.sighting("cam0", &id, t(400)), Confirmation::Confirmed);
    }

    #[test]
    fn test_gap_breaks_streak() {
        let mut tr = ConfirmationTracker::new(ConfirmationConfig::default());
        let id = IdentityId::from("alice");
        tr.sighting("cam0", &id, t(0));
        tr.sighting("cam0", &id, t(100));
        assert_eq!(tr.sighting("cam0", &id, t(5_000)), Confirmation::Pending { seen: 1, required: 3 });
    }

    #[test]
    fn test_cameras_are_independent() {
        let mut tr = ConfirmationTracker::new(ConfirmationConfig::default());
        let id = IdentityId::from("alice");
        tr.sighting("cam0", &id, t(0));
        tr.sighting("cam0", &id, t(100));
        assert_eq!(tr.sighting("cam1", &id, t(150)), Confirmation::Pending { seen: 1, required: 3 });
        tr.reset_camera("cam0");
        assert_eq!(tr.sighting("cam0", &id, t(200)), Confirmation::Pending { seen: 1, required: 3 });
    }

    #[test]
    fn test_single_sighting_mode() {
        let mut tr = ConfirmationTracker::new(ConfirmationConfig {
            required: 0,
            ..Default::default()
        });
        assert_eq!(tr.config().required, 1);
        assert_eq!(tr.sighting("cam0", &"bob".into(), t(0)), Confirmation::Confirmed);
    }

    #[test]
    fn test_prune_drops_stale_streaks() {
        let mut tr = ConfirmationTracker::new(ConfirmationConfig::default());
        let id = IdentityId::from("alice");
        tr.sighting("cam0", &id, t(0));
        tr.sighting("cam0", &id, t(100));
        tr.prune(t(10_000));
        assert_eq!(tr.sighting("cam0", &id, t(10_050)), Confirmation::Pending { seen: 1, required: 3 });
    }
}
