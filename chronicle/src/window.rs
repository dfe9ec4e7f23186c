use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Fixed event-time windows with allowed lateness.
///
/// A window covering `[start, start + duration)` stays buffered until
/// `now >= start + duration + allowed_lateness`, so late arrivals keep
/// merging into it right up to the moment it is emitted. After that,
/// inserts for it are refused and the caller dead-letters them; a window
/// is never emitted twice.
pub struct WindowBuffer<T> {
    duration: Duration,
    allowed_lateness: Duration,
    open: BTreeMap<DateTime<Utc>, Vec<T>>,
}

pub enum InsertOutcome<T> {
    Accepted,
    /// The window this item belongs to has already been emitted
    Late(T),
}

impl<T> WindowBuffer<T> {
    pub fn new(duration: Duration, allowed_lateness: Duration) -> Self {
        assert!(duration > Duration::zero(), "window duration must be positive");
        Self {
            duration,
            allowed_lateness,
            open: BTreeMap::new(),
        }
    }

    /// Start of the window containing `event_time`.
    pub fn window_start(&self, event_time: DateTime<Utc>) -> DateTime<Utc> {
        let dur_ms = self.duration.num_milliseconds();
        let ms = event_time.timestamp_millis().div_euclid(dur_ms) * dur_ms;
        // Unwrap is safe, a floored millis value is never ambiguous in Utc
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    pub fn insert(
        &mut self,
        event_time: DateTime<Utc>,
        now: DateTime<Utc>,
        item: T,
    ) -> InsertOutcome<T> {
        let start = self.window_start(event_time);
        if let Some(bucket) = self.open.get_mut(&start) {
            bucket.push(item);
            return InsertOutcome::Accepted;
        }

        if now >= start + self.duration + self.allowed_lateness {
            return InsertOutcome::Late(item);
        }

        self.open.insert(start, vec![item]);
        InsertOutcome::Accepted
    }

    /// Remove and return every window whose grace period has elapsed,
    /// oldest first.
    pub fn drain_closed(&mut self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, Vec<T>)> {
        let mut closed = Vec::new();
        // BTreeMap iterates in ascending key order, so the split point is
        // the first window still within its grace period
        let still_open = self
            .open
            .keys()
            .find(|start| now < **start + self.duration + self.allowed_lateness)
            .copied();

        let remaining = match still_open {
            Some(split) => self.open.split_off(&split),
            None => BTreeMap::new(),
        };
        for (start, items) in std::mem::replace(&mut self.open, remaining) {
            closed.push((start, items));
        }
        closed
    }

    /// Flush everything, regardless of grace periods. Used on drain at
    /// shutdown.
    pub fn drain_all(&mut self) -> Vec<(DateTime<Utc>, Vec<T>)> {
        std::mem::take(&mut self.open).into_iter().collect()
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn buffer() -> WindowBuffer<&'static str> {
        // 10 second windows, 5 seconds of allowed lateness
        WindowBuffer::new(Duration::seconds(10), Duration::seconds(5))
    }

    #[test]
    fn window_start_floors_to_the_duration() {
        let buf = buffer();
        assert_eq!(
            buf.window_start(ts("2024-03-01T10:00:07Z")),
            ts("2024-03-01T10:00:00Z")
        );
        assert_eq!(
            buf.window_start(ts("2024-03-01T10:00:10Z")),
            ts("2024-03-01T10:00:10Z")
        );
    }

    #[test]
    fn windows_close_only_after_the_grace_period() {
        let mut buf = buffer();
        let now = ts("2024-03-01T10:00:07Z");
        assert!(matches!(
            buf.insert(ts("2024-03-01T10:00:01Z"), now, "a"),
            InsertOutcome::Accepted
        ));

        // End of window: grace still running, nothing closes
        assert!(buf.drain_closed(ts("2024-03-01T10:00:10Z")).is_empty());
        assert!(buf.drain_closed(ts("2024-03-01T10:00:14Z")).is_empty());

        let closed = buf.drain_closed(ts("2024-03-01T10:00:15Z"));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, ts("2024-03-01T10:00:00Z"));
        assert_eq!(closed[0].1, vec!["a"]);
        assert_eq!(buf.open_windows(), 0);
    }

    #[test]
    fn late_arrival_within_grace_merges_into_its_window() {
        let mut buf = buffer();
        buf.insert(ts("2024-03-01T10:00:01Z"), ts("2024-03-01T10:00:02Z"), "a");

        // 10:00:12 is after the window's end but within its grace period
        assert!(matches!(
            buf.insert(ts("2024-03-01T10:00:09Z"), ts("2024-03-01T10:00:12Z"), "late"),
            InsertOutcome::Accepted
        ));

        let closed = buf.drain_closed(ts("2024-03-01T10:00:20Z"));
        assert_eq!(closed[0].1, vec!["a", "late"]);
    }

    #[test]
    fn beyond_grace_arrivals_are_refused() {
        let mut buf = buffer();
        // Window [10:00:00, 10:00:10) plus 5s grace expired at 10:00:15
        match buf.insert(ts("2024-03-01T10:00:03Z"), ts("2024-03-01T10:00:15Z"), "x") {
            InsertOutcome::Late(item) => assert_eq!(item, "x"),
            InsertOutcome::Accepted => panic!("expected refusal"),
        }
        assert_eq!(buf.open_windows(), 0);
    }

    #[test]
    fn drain_closed_returns_windows_oldest_first() {
        let mut buf = buffer();
        let now = ts("2024-03-01T10:00:25Z");
        buf.insert(ts("2024-03-01T10:00:21Z"), now, "newer");
        buf.insert(ts("2024-03-01T10:00:11Z"), now, "older");
        buf.insert(ts("2024-03-01T10:00:24Z"), now, "newer2");

        // Only the older window is past grace at 10:00:32
        let closed = buf.drain_closed(ts("2024-03-01T10:00:32Z"));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1, vec!["older"]);
        assert_eq!(buf.open_windows(), 1);

        buf.insert(ts("2024-03-01T10:00:31Z"), ts("2024-03-01T10:00:33Z"), "newest");
        let closed = buf.drain_closed(ts("2024-03-01T10:01:00Z"));
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].0, ts("2024-03-01T10:00:20Z"));
        assert_eq!(closed[0].1, vec!["newer", "newer2"]);
        assert_eq!(closed[1].0, ts("2024-03-01T10:00:30Z"));
        assert_eq!(closed[1].1, vec!["newest"]);
    }

    #[test]
    fn drain_all_flushes_open_windows() {
        let mut buf = buffer();
        let now = ts("2024-03-01T10:00:05Z");
        buf.insert(ts("2024-03-01T10:00:01Z"), now, "a");
        buf.insert(ts("2024-03-01T10:00:11Z"), now, "b");

        let drained = buf.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(buf.open_windows(), 0);
    }
}
