//! Pre-sequence ring buffer: a fixed-window in-memory queue that
//! continuously absorbs every capturable event, tagged with the
//! pre-sequence sentinel, so that a just-opened sequence can retroactively
//! claim the samples that preceded it.

use std::collections::VecDeque;
use std::time::Duration;

use pyde1_core::message::Event;

/// Holds every event whose `arrival_time` falls within `window` of the
/// most recently pushed event. Pushing drops items older than the window
/// from the front, so steady-state memory is bounded by event rate, not
/// by wall-clock uptime.
pub struct RingBuffer {
    items: VecDeque<Event>,
    window: Duration,
}

impl RingBuffer {
    pub fn new(window: Duration) -> Self {
        RingBuffer {
            items: VecDeque::new(),
            window,
        }
    }

    pub fn push(&mut self, event: Event) {
        let cutoff = event.header.arrival_time - chrono::Duration::from_std(self.window).unwrap_or_default();
        self.items.push_back(event);
        while let Some(front) = self.items.front() {
            if front.header.arrival_time < cutoff {
                self.items.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drains every buffered item whose `arrival_time` is at or after
    /// `since`, in arrival order, leaving the buffer empty. Called once a
    /// sequence opens and claims the pre-sequence window.
    pub fn drain_since(&mut self, since: chrono::DateTime<chrono::Utc>) -> Vec<Event> {
        let (claimed, _discarded): (Vec<Event>, Vec<Event>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|e| e.header.arrival_time >= since);
        claimed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_core::message::{EventHeader, EventPayload, WaterLevelPayload};

    fn event_at(t: chrono::DateTime<chrono::Utc>) -> Event {
        Event {
            header: EventHeader {
                arrival_time: t,
                create_time: t,
                ..EventHeader::new_now("test")
            },
            payload: EventPayload::WaterLevel(WaterLevelPayload {
                level_mm: 1.0,
                low_water_threshold_mm: 0.5,
            }),
        }
    }

    #[test]
    fn old_items_fall_out_of_the_window_on_push() {
        let mut buffer = RingBuffer::new(Duration::from_secs(2));
        let t0 = chrono::Utc::now();
        buffer.push(event_at(t0));
        buffer.push(event_at(t0 + chrono::Duration::milliseconds(500)));
        buffer.push(event_at(t0 + chrono::Duration::milliseconds(2600)));
        // t0 is now 2.6s behind the latest push, outside the 2s window.
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn drain_since_claims_only_items_at_or_after_cutoff() {
        let mut buffer = RingBuffer::new(Duration::from_secs(5));
        let t0 = chrono::Utc::now();
        buffer.push(event_at(t0 - chrono::Duration::milliseconds(1800)));
        buffer.push(event_at(t0 - chrono::Duration::milliseconds(1200)));
        buffer.push(event_at(t0 - chrono::Duration::milliseconds(400)));
        buffer.push(event_at(t0 + chrono::Duration::milliseconds(200)));
        let claimed = buffer.drain_since(t0 - chrono::Duration::milliseconds(2000));
        assert_eq!(claimed.len(), 4);
        assert!(buffer.is_empty());
    }
}
