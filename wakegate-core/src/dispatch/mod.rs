//! Detection event dispatch: payload parsing, keyword window and routing.
//!
//! The capture session's callback thread hands raw payloads to the
//! first-stage engine, which uses the helpers here to turn them into a
//! [`DetectionEvent`], a ring-buffer [`KeywordWindow`] and the owning session.

pub mod payload;

pub use payload::{
    parse_detection_payload, DetectionEvent, DetectionPayloadWriter, ModelDetection,
};

use crate::buffering::format::AudioFormat;
use crate::engine::SessionId;
use crate::error::{Result, WakegateError};
use crate::model::CompositeModel;

/// Event id of a first-stage detection.
pub const EVENT_DETECTION: u32 = 0x0001;
/// Event id acknowledging an engine reset (end of stream).
pub const EVENT_END_OF_STREAM: u32 = 0x0002;

/// Keyword start/end as byte offsets into the ring buffer, counted from the
/// first FTRT byte written after the detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordWindow {
    pub start: usize,
    pub end: usize,
}

/// Maps the event's keyword times onto ring-buffer offsets. The FTRT data
/// starts at `timestamp - ftrt_len`.
pub fn keyword_window(event: &DetectionEvent, format: &AudioFormat) -> Result<KeywordWindow> {
    let ftrt_start = event
        .timestamp_us
        .saturating_sub(u64::from(event.ftrt_len_us));
    if event.kw_start_us >= event.kw_end_us || event.kw_start_us < ftrt_start {
        return Err(WakegateError::InvalidKeywordIndex {
            start_us: event.kw_start_us,
            end_us: event.kw_end_us,
            ftrt_start_us: ftrt_start,
        });
    }
    Ok(KeywordWindow {
        start: format.us_to_bytes(event.kw_start_us - ftrt_start),
        end: format.us_to_bytes(event.kw_end_us - ftrt_start),
    })
}

/// Bytes of FTRT audio the DSP holds for this event.
pub fn ftrt_bytes(event: &DetectionEvent, format: &AudioFormat) -> usize {
    format.us_to_bytes(u64::from(event.ftrt_len_us))
}

/// Session a detection was routed to, and for multi-model payloads the
/// model entry it was matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub owner: SessionId,
    pub model: Option<ModelDetection>,
}

/// Finds the session a detection belongs to.
///
/// - one attached session: always that session
/// - multi-model payload: the first detected model registered to an
///   eligible session
/// - merged payload: the owner of the first non-zero keyphrase slot
pub fn route_detection(
    event: &DetectionEvent,
    attached: &[SessionId],
    composite: &CompositeModel,
    model_owners: &[(u32, SessionId)],
    eligible: impl Fn(SessionId) -> bool,
) -> Result<Option<Route>> {
    let owner_of = |model: &ModelDetection| {
        model_owners
            .iter()
            .find(|(model_id, _)| *model_id == model.model_id)
            .map(|(_, s)| *s)
    };

    if let [only] = attached {
        let model = event
            .models
            .iter()
            .find(|m| owner_of(m) == Some(*only))
            .or(event.models.first())
            .copied();
        return Ok(Some(Route { owner: *only, model }));
    }
    if event.is_multi_model() {
        return Ok(event.models.iter().find_map(|m| {
            owner_of(m)
                .filter(|s| eligible(*s))
                .map(|owner| Route { owner, model: Some(*m) })
        }));
    }
    Ok(composite
        .owner_of_detection(&event.confidence_levels, eligible)?
        .map(|owner| Route { owner, model: None }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelLibHandle;
    use crate::sim::JsonModelLib;

    fn event(start: u64, end: u64, ts: u64, ftrt: u32) -> DetectionEvent {
        DetectionEvent {
            kw_start_us: start,
            kw_end_us: end,
            timestamp_us: ts,
            ftrt_len_us: ftrt,
            ..DetectionEvent::default()
        }
    }

    #[test]
    fn window_is_relative_to_ftrt_start() {
        let fmt = AudioFormat::default();
        let w = keyword_window(&event(1_000_000, 1_300_000, 1_500_000, 1_000_000), &fmt).unwrap();
        assert_eq!(w.start, fmt.us_to_bytes(500_000));
        assert_eq!(w.end, fmt.us_to_bytes(800_000));
        assert_eq!(ftrt_bytes(&event(0, 0, 0, 1_000_000), &fmt), 32_000);
    }

    #[test]
    fn inverted_window_is_invalid() {
        let fmt = AudioFormat::default();
        assert!(matches!(
            keyword_window(&event(900, 900, 2_000, 2_000), &fmt),
            Err(WakegateError::InvalidKeywordIndex { .. })
        ));
    }

    #[test]
    fn start_before_ftrt_is_invalid() {
        let fmt = AudioFormat::default();
        assert!(keyword_window(&event(100, 900, 2_000, 1_000), &fmt).is_err());
    }

    #[test]
    fn routing_rules() {
        let mut composite = CompositeModel::new(ModelLibHandle::new(JsonModelLib));
        composite
            .add_model(SessionId(1), &JsonModelLib::encode(&["alexa"], &[], &[]))
            .unwrap();
        composite
            .add_model(SessionId(2), &JsonModelLib::encode(&["jarvis"], &[], &[]))
            .unwrap();

        let merged = DetectionEvent {
            confidence_levels: vec![0, 70],
            ..DetectionEvent::default()
        };
        assert_eq!(
            route_detection(&merged, &[SessionId(1)], &composite, &[], |_| true)
                .unwrap()
                .map(|r| r.owner),
            Some(SessionId(1))
        );
        let both = [SessionId(1), SessionId(2)];
        assert_eq!(
            route_detection(&merged, &both, &composite, &[], |_| true)
                .unwrap()
                .map(|r| r.owner),
            Some(SessionId(2))
        );

        let multi = DetectionEvent {
            models: vec![ModelDetection {
                model_id: 11,
                ..ModelDetection::default()
            }],
            ..DetectionEvent::default()
        };
        let owners = [(10, SessionId(1)), (11, SessionId(2))];
        let route = route_detection(&multi, &both, &composite, &owners, |_| true)
            .unwrap()
            .unwrap();
        assert_eq!(route.owner, SessionId(2));
        assert_eq!(route.model.map(|m| m.model_id), Some(11));
    }

    #[test]
    fn multi_model_skips_entries_of_stopped_sessions() {
        let composite = CompositeModel::new(ModelLibHandle::new(JsonModelLib));
        let stopped = ModelDetection {
            model_id: 10,
            best_confidence: 90,
            kw_start_us: 100_000,
            ..ModelDetection::default()
        };
        let active = ModelDetection {
            model_id: 11,
            best_confidence: 75,
            kw_start_us: 400_000,
            ..ModelDetection::default()
        };
        let event = DetectionEvent {
            models: vec![stopped, active],
            ..DetectionEvent::default()
        };
        let owners = [(10, SessionId(1)), (11, SessionId(2))];
        let both = [SessionId(1), SessionId(2)];

        let route = route_detection(&event, &both, &composite, &owners, |s| s == SessionId(2))
            .unwrap()
            .unwrap();
        assert_eq!(route.owner, SessionId(2));
        assert_eq!(route.model, Some(active));

        let nobody = route_detection(&event, &both, &composite, &owners, |_| false).unwrap();
        assert!(nobody.is_none());
    }

    #[test]
    fn narrowed_event_carries_only_the_matched_model() {
        let matched = ModelDetection {
            model_id: 11,
            best_confidence: 75,
            kw_start_us: 1_000_000,
            kw_end_us: 1_300_000,
            timestamp_us: 1_500_000,
            ..ModelDetection::default()
        };
        let event = DetectionEvent {
            confidence_levels: vec![90, 75],
            kw_start_us: 200_000,
            kw_end_us: 300_000,
            timestamp_us: 400_000,
            ftrt_len_us: 1_000_000,
            models: vec![
                ModelDetection {
                    model_id: 10,
                    best_confidence: 90,
                    ..ModelDetection::default()
                },
                matched,
            ],
            ..DetectionEvent::default()
        };
        let narrowed = event.for_model(&matched);
        assert_eq!(narrowed.confidence_levels, vec![75]);
        assert_eq!(
            (narrowed.kw_start_us, narrowed.kw_end_us, narrowed.timestamp_us),
            (1_000_000, 1_300_000, 1_500_000)
        );
        assert_eq!(narrowed.ftrt_len_us, 1_000_000);
        assert_eq!(narrowed.models, vec![matched]);
    }
}
