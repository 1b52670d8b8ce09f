use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A change in a member's voice channel membership, derived from the host's
/// `(previous_channel, new_channel)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    Connect { channel: u64 },
    Disconnect { channel: u64 },
    Switch { from: u64, to: u64 },
}

impl VoiceEvent {
    /// Returns `None` when the membership did not change (mute, deafen,
    /// stream toggles and the like).
    pub fn from_transition(previous: Option<u64>, new: Option<u64>) -> Option<Self> {
        match (previous, new) {
            (None, Some(channel)) => Some(VoiceEvent::Connect { channel }),
            (Some(channel), None) => Some(VoiceEvent::Disconnect { channel }),
            (Some(from), Some(to)) if from != to => Some(VoiceEvent::Switch { from, to }),
            _ => None,
        }
    }
}

/// One finished stretch of time a member spent in a single channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletedSession {
    pub member_id: u64,
    pub channel_id: u64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceSession {
    pub channel_id: u64,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    InVoice(VoiceSession),
}

impl SessionState {
    /// Pure transition of the per-member state machine.
    pub fn apply(
        self,
        member_id: u64,
        event: VoiceEvent,
        now: DateTime<Utc>,
    ) -> (SessionState, Option<CompletedSession>) {
        let started = |channel_id| SessionState::InVoice(VoiceSession { channel_id, since: now });

        match (self, event) {
            (SessionState::Idle, VoiceEvent::Connect { channel }) => (started(channel), None),
            // Nothing is being timed, so there is nothing to close.
            (SessionState::Idle, _) => (SessionState::Idle, None),

            (SessionState::InVoice(current), VoiceEvent::Disconnect { .. }) => {
                (SessionState::Idle, Some(current.close(member_id, now)))
            }

            // A Connect while already in voice is handled as a switch.
            (SessionState::InVoice(current), VoiceEvent::Connect { channel: to })
            | (SessionState::InVoice(current), VoiceEvent::Switch { to, .. }) => {
                (started(to), Some(current.close(member_id, now)))
            }
        }
    }
}

impl VoiceSession {
    fn close(self, member_id: u64, now: DateTime<Utc>) -> CompletedSession {
        CompletedSession {
            member_id,
            channel_id: self.channel_id,
            elapsed_secs: elapsed_secs(self.since, now),
        }
    }
}

/// Wall-clock delta in seconds, microsecond precision. A clock that stepped
/// backwards yields zero.
pub fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).to_std().unwrap_or_default().as_secs_f64()
}

/// Owns the sessions of every member currently in voice.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: HashMap<u64, VoiceSession>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(
        &mut self,
        member_id: u64,
        event: VoiceEvent,
        now: DateTime<Utc>,
    ) -> Option<CompletedSession> {
        let state = self.state(member_id);

        if let (
            SessionState::InVoice(current),
            VoiceEvent::Disconnect { channel } | VoiceEvent::Switch { from: channel, .. },
        ) = (state, event)
        {
            if current.channel_id != channel {
                tracing::debug!(
                    member_id,
                    tracked = current.channel_id,
                    reported = channel,
                    "channel mismatch, closing the tracked session"
                );
            }
        }

        let (next, record) = state.apply(member_id, event, now);
        match next {
            SessionState::Idle => {
                if self.sessions.remove(&member_id).is_none() && record.is_none() {
                    tracing::warn!(member_id, ?event, "voice update for an untracked member");
                }
            }
            SessionState::InVoice(session) => {
                self.sessions.insert(member_id, session);
            }
        }
        record
    }

    /// Starts timing a member found in voice when observation begins.
    /// Returns `false` if the member already had a session.
    pub fn seed(&mut self, member_id: u64, channel_id: u64, now: DateTime<Utc>) -> bool {
        if self.sessions.contains_key(&member_id) {
            return false;
        }
        self.sessions.insert(member_id, VoiceSession { channel_id, since: now });
        true
    }

    pub fn state(&self, member_id: u64) -> SessionState {
        match self.sessions.get(&member_id) {
            Some(session) => SessionState::InVoice(*session),
            None => SessionState::Idle,
        }
    }

    pub fn session(&self, member_id: u64) -> Option<&VoiceSession> {
        self.sessions.get(&member_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    const GENERAL: u64 = 100;
    const GAMING: u64 = 200;
    const MEMBER: u64 = 42;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::seconds(secs)
    }

    #[test]
    fn transition_mapping() {
        assert_eq!(
            VoiceEvent::from_transition(None, Some(1)),
            Some(VoiceEvent::Connect { channel: 1 })
        );
        assert_eq!(
            VoiceEvent::from_transition(Some(1), None),
            Some(VoiceEvent::Disconnect { channel: 1 })
        );
        assert_eq!(
            VoiceEvent::from_transition(Some(1), Some(2)),
            Some(VoiceEvent::Switch { from: 1, to: 2 })
        );
        assert_eq!(VoiceEvent::from_transition(Some(1), Some(1)), None);
        assert_eq!(VoiceEvent::from_transition(None, None), None);
    }

    #[test]
    fn connect_then_disconnect_emits_elapsed() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.handle(MEMBER, VoiceEvent::Connect { channel: GENERAL }, at(0)).is_none());
        assert_eq!(tracker.len(), 1);

        let record = tracker
            .handle(MEMBER, VoiceEvent::Disconnect { channel: GENERAL }, at(95))
            .unwrap();
        assert_eq!(
            record,
            CompletedSession { member_id: MEMBER, channel_id: GENERAL, elapsed_secs: 95.0 }
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn switch_closes_first_channel_and_restarts_timer() {
        let mut tracker = SessionTracker::new();
        tracker.handle(MEMBER, VoiceEvent::Connect { channel: GENERAL }, at(0));

        let first = tracker
            .handle(MEMBER, VoiceEvent::Switch { from: GENERAL, to: GAMING }, at(120))
            .unwrap();
        assert_eq!(first.channel_id, GENERAL);
        assert_eq!(first.elapsed_secs, 120.0);
        assert_eq!(
            tracker.session(MEMBER),
            Some(&VoiceSession { channel_id: GAMING, since: at(120) })
        );

        let second = tracker
            .handle(MEMBER, VoiceEvent::Disconnect { channel: GAMING }, at(300))
            .unwrap();
        assert_eq!(second.channel_id, GAMING);
        assert_eq!(second.elapsed_secs, 180.0);
        assert_eq!(first.elapsed_secs + second.elapsed_secs, 300.0);
    }

    #[test]
    fn events_while_idle_are_ignored() {
        let mut tracker = SessionTracker::new();
        let leave = VoiceEvent::Disconnect { channel: GENERAL };
        let switch = VoiceEvent::Switch { from: GENERAL, to: GAMING };
        assert!(tracker.handle(MEMBER, leave, at(10)).is_none());
        assert!(tracker.handle(MEMBER, switch, at(20)).is_none());
        assert_eq!(tracker.state(MEMBER), SessionState::Idle);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn untracked_switch_and_disconnect_log_the_same_warning() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut tracker = SessionTracker::new();
            tracker.handle(MEMBER, VoiceEvent::Switch { from: GENERAL, to: GAMING }, at(0));
            tracker.handle(MEMBER, VoiceEvent::Disconnect { channel: GAMING }, at(5));
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.matches("voice update for an untracked member").count(), 2);
        assert!(!output.contains("left voice"));
    }

    #[test]
    fn duplicate_connect_acts_as_switch() {
        let mut tracker = SessionTracker::new();
        tracker.handle(MEMBER, VoiceEvent::Connect { channel: GENERAL }, at(0));
        let record = tracker
            .handle(MEMBER, VoiceEvent::Connect { channel: GAMING }, at(30))
            .unwrap();
        assert_eq!(record.channel_id, GENERAL);
        assert_eq!(record.elapsed_secs, 30.0);
        assert_eq!(tracker.session(MEMBER).map(|s| s.channel_id), Some(GAMING));
    }

    #[test]
    fn zero_length_session_still_records() {
        let join = VoiceEvent::Connect { channel: GENERAL };
        let leave = VoiceEvent::Disconnect { channel: GENERAL };
        let (state, record) = SessionState::Idle.apply(MEMBER, join, at(5));
        let (state, record2) = state.apply(MEMBER, leave, at(5));
        assert!(record.is_none());
        assert_eq!(state, SessionState::Idle);
        assert_eq!(record2.unwrap().elapsed_secs, 0.0);
    }

    #[test]
    fn clock_going_backwards_clamps_to_zero() {
        assert_eq!(elapsed_secs(at(10), at(4)), 0.0);
        let micro = at(0) + TimeDelta::microseconds(1_750_000);
        assert_eq!(elapsed_secs(at(0), micro), 1.75);
    }

    #[test]
    fn mismatched_disconnect_closes_tracked_channel() {
        let mut tracker = SessionTracker::new();
        tracker.handle(MEMBER, VoiceEvent::Connect { channel: GENERAL }, at(0));
        let record = tracker
            .handle(MEMBER, VoiceEvent::Disconnect { channel: GAMING }, at(7))
            .unwrap();
        assert_eq!(record.channel_id, GENERAL);
    }

    #[test]
    fn seed_does_not_overwrite_live_session() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.seed(MEMBER, GENERAL, at(0)));
        assert!(!tracker.seed(MEMBER, GAMING, at(50)));
        let record = tracker
            .handle(MEMBER, VoiceEvent::Disconnect { channel: GENERAL }, at(60))
            .unwrap();
        assert_eq!(record.elapsed_secs, 60.0);
    }

    #[test]
    fn sessions_sum_over_repeated_visits() {
        let mut tracker = SessionTracker::new();
        let visits = [(0, 10), (20, 65), (100, 101), (200, 200)];
        let mut total = 0.0;
        for (join, leave) in visits {
            tracker.handle(MEMBER, VoiceEvent::Connect { channel: GENERAL }, at(join));
            total += tracker
                .handle(MEMBER, VoiceEvent::Disconnect { channel: GENERAL }, at(leave))
                .unwrap()
                .elapsed_secs;
        }
        assert_eq!(total, 56.0);
    }
}
