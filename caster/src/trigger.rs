//! Track trigger controller.
//!
//! Tracks the artist tracks the operator plays into the mix and turns each
//! finished playback into a marker for the active recording. Time is passed
//! in as epoch milliseconds so the controller never reads a clock itself.

use std::collections::HashMap;

use api::recording::{RecordingState, TrackType};
use api::request::AddMarker;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Active {
    version: String,
    started_at_ms: i64,
}

#[derive(Debug, Clone)]
struct Playback {
    track_key: String,
    full_duration_ms: u64,
    started_at_ms: i64,
}

/// A marker ready to be posted, pinned to the recording it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub version: String,
    pub marker: AddMarker,
}

#[derive(Debug, Default)]
pub struct TriggerController {
    recording: Option<Active>,
    playing: HashMap<(String, TrackType), Playback>,
}

impl TriggerController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt the server's view of the recording, e.g. after a reload
    pub fn sync(&mut self, state: &RecordingState) {
        self.recording = match (state.is_recording, &state.version, state.started_at) {
            (true, Some(version), Some(started_at_ms)) => Some(Active {
                version: version.clone(),
                started_at_ms,
            }),
            _ => None,
        };
    }

    pub fn recording_started(&mut self, version: &str, started_at_ms: i64) {
        self.recording = Some(Active {
            version: version.to_string(),
            started_at_ms,
        });
    }

    pub fn recording_stopped(&mut self) {
        self.recording = None;
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn is_playing(&self, artist_id: &str, track_type: TrackType) -> bool {
        self.playing
            .contains_key(&(artist_id.to_string(), track_type))
    }

    /// Start playing; restarting a track that is still playing finishes the
    /// earlier playback first
    pub fn play(
        &mut self,
        now_ms: i64,
        artist_id: &str,
        track_type: TrackType,
        track_key: &str,
        full_duration_ms: u64,
    ) -> Option<Cue> {
        let previous = self.stop(now_ms, artist_id, track_type);
        self.playing.insert(
            (artist_id.to_string(), track_type),
            Playback {
                track_key: track_key.to_string(),
                full_duration_ms,
                started_at_ms: now_ms,
            },
        );
        previous
    }

    /// Operator stopped the track early
    pub fn stop(&mut self, now_ms: i64, artist_id: &str, track_type: TrackType) -> Option<Cue> {
        let playback = self.playing.remove(&(artist_id.to_string(), track_type))?;
        let played = (now_ms - playback.started_at_ms).max(0) as u64;
        self.cue(artist_id, track_type, playback, played)
    }

    /// The track played to its end
    pub fn ended(&mut self, artist_id: &str, track_type: TrackType) -> Option<Cue> {
        let playback = self.playing.remove(&(artist_id.to_string(), track_type))?;
        let played = playback.full_duration_ms;
        self.cue(artist_id, track_type, playback, played)
    }

    /// Finish every playback whose full length has elapsed, in start order
    pub fn tick(&mut self, now_ms: i64) -> Vec<Cue> {
        let mut done: Vec<(String, TrackType, i64)> = self
            .playing
            .iter()
            .filter(|(_, p)| now_ms - p.started_at_ms >= p.full_duration_ms as i64)
            .map(|((artist, track_type), p)| (artist.clone(), *track_type, p.started_at_ms))
            .collect();
        done.sort_by_key(|(_, _, started)| *started);
        done.into_iter()
            .filter_map(|(artist, track_type, _)| self.ended(&artist, track_type))
            .collect()
    }

    /// Stop everything still playing, e.g. right before the recording stops
    pub fn stop_all(&mut self, now_ms: i64) -> Vec<Cue> {
        let mut playing: Vec<(String, TrackType, i64)> = self
            .playing
            .iter()
            .map(|((artist, track_type), p)| (artist.clone(), *track_type, p.started_at_ms))
            .collect();
        playing.sort_by_key(|(_, _, started)| *started);
        playing
            .into_iter()
            .filter_map(|(artist, track_type, _)| self.stop(now_ms, &artist, track_type))
            .collect()
    }

    fn cue(
        &self,
        artist_id: &str,
        track_type: TrackType,
        playback: Playback,
        played_ms: u64,
    ) -> Option<Cue> {
        let active = self.recording.as_ref()?;
        let offset_ms = (playback.started_at_ms - active.started_at_ms).max(0);
        Some(Cue {
            version: active.version.clone(),
            marker: AddMarker {
                artist_id: artist_id.to_string(),
                track_type,
                track_key: playback.track_key,
                duration_ms: played_ms.min(playback.full_duration_ms),
                offset_ms: Some(offset_ms),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn recording(version: &str, started_at: i64) -> RecordingState {
        RecordingState {
            is_recording: true,
            show_id: Some("S".to_string()),
            version: Some(version.to_string()),
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    #[test]
    fn test_stop_reports_played_duration_and_offset() {
        let mut c = TriggerController::new();
        c.recording_started("V1", T0);
        assert!(c
            .play(T0 + 12_000, "A", TrackType::Track1, "artists/A/t1.wav", 30_000)
            .is_none());
        let cue = c.stop(T0 + 20_000, "A", TrackType::Track1).unwrap();
        assert_eq!(cue.version, "V1");
        assert_eq!(cue.marker.offset_ms, Some(12_000));
        assert_eq!(cue.marker.duration_ms, 8_000);
        assert!(!c.is_playing("A", TrackType::Track1));
    }

    #[test]
    fn test_nothing_reported_without_recording() {
        let mut c = TriggerController::new();
        c.play(T0, "A", TrackType::VoiceMessage, "artists/A/v.wav", 5_000);
        assert!(c.ended("A", TrackType::VoiceMessage).is_none());
    }

    #[test]
    fn test_offset_clamped_when_started_before_recording() {
        let mut c = TriggerController::new();
        c.play(T0 - 3_000, "A", TrackType::Track2, "artists/A/t2.wav", 10_000);
        c.recording_started("V1", T0);
        let cue = c.ended("A", TrackType::Track2).unwrap();
        assert_eq!(cue.marker.offset_ms, Some(0));
        assert_eq!(cue.marker.duration_ms, 10_000);
    }

    #[test]
    fn test_tick_finishes_in_start_order() {
        let mut c = TriggerController::new();
        c.sync(&recording("V2", T0));
        c.play(T0 + 2_000, "B", TrackType::Track1, "artists/B/t1.wav", 1_000);
        c.play(T0 + 1_000, "A", TrackType::Track1, "artists/A/t1.wav", 1_500);
        c.play(T0 + 1_000, "C", TrackType::Track1, "artists/C/t1.wav", 60_000);
        let cues = c.tick(T0 + 3_500);
        let artists: Vec<_> = cues.iter().map(|c| c.marker.artist_id.as_str()).collect();
        assert_eq!(artists, vec!["A", "B"]);
        assert!(c.is_playing("C", TrackType::Track1));

        let rest = c.stop_all(T0 + 4_000);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].marker.duration_ms, 3_000);
        assert!(!c.is_playing("C", TrackType::Track1));
    }

    #[test]
    fn test_replay_finishes_previous_playback() {
        let mut c = TriggerController::new();
        c.recording_started("V1", T0);
        c.play(T0, "A", TrackType::Track1, "artists/A/t1.wav", 9_000);
        let cue = c
            .play(T0 + 4_000, "A", TrackType::Track1, "artists/A/t1.wav", 9_000)
            .unwrap();
        assert_eq!(cue.marker.duration_ms, 4_000);
        assert!(c.is_playing("A", TrackType::Track1));
    }

    #[test]
    fn test_sync_follows_server_state() {
        let mut c = TriggerController::new();
        c.sync(&recording("V3", T0));
        assert!(c.is_recording());
        c.sync(&RecordingState::default());
        assert!(!c.is_recording());
    }
}
