use std::fmt;
use std::str::FromStr;

use chrono::DateTime;

use crate::model::*;

use super::EngineError;

/// Which existing appointments a candidate is compared against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictScope {
    /// Every persisted appointment, whatever its room. Two bookings in
    /// different rooms at the same time are rejected.
    #[default]
    Global,
    /// Only appointments in the candidate's room.
    Room,
}

impl FromStr for ConflictScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(ConflictScope::Global),
            "room" => Ok(ConflictScope::Room),
            other => Err(format!("unknown conflict scope {other:?} (expected global or room)")),
        }
    }
}

impl fmt::Display for ConflictScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictScope::Global => f.write_str("global"),
            ConflictScope::Room => f.write_str("room"),
        }
    }
}

/// Structural check of an inbound appointment.
///
/// Room, doctor, start and finish are required and start must differ from
/// finish. The patient is allowed to be missing.
pub fn validate_draft(draft: &AppointmentDraft) -> Result<Candidate, EngineError> {
    let room = draft.room.as_ref().ok_or(EngineError::Invalid("room is required"))?;
    let doctor_id = draft.doctor_id.ok_or(EngineError::Invalid("doctor is required"))?;
    let start = draft.starts_at.ok_or(EngineError::Invalid("starts_at is required"))?;
    let end = draft.finishes_at.ok_or(EngineError::Invalid("finishes_at is required"))?;
    if start == end {
        return Err(EngineError::Invalid("starts_at equals finishes_at"));
    }
    Ok(Candidate {
        patient_id: draft.patient_id,
        doctor_id,
        room: room.clone(),
        span: Span::new(start, end),
    })
}

/// Both endpoints must map to a calendar instant. Any length and any era is
/// otherwise accepted.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    let representable = |ms: Ms| DateTime::from_timestamp_millis(ms).is_some();
    if !representable(span.start) || !representable(span.end) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// First existing appointment the candidate overlaps, in iteration order.
pub fn find_conflict<'a>(
    candidate: &Candidate,
    existing: impl IntoIterator<Item = &'a Appointment>,
    scope: ConflictScope,
) -> Option<&'a Appointment> {
    existing.into_iter().find(|appt| {
        let in_scope = match scope {
            ConflictScope::Global => true,
            ConflictScope::Room => appt.room == candidate.room,
        };
        in_scope && candidate.span.overlaps(&appt.span)
    })
}

pub fn has_conflict<'a>(
    candidate: &Candidate,
    existing: impl IntoIterator<Item = &'a Appointment>,
    scope: ConflictScope,
) -> bool {
    find_conflict(candidate, existing, scope).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = 60_000;

    /// Minutes after midnight on 2023-10-22.
    fn t(hh: i64, mm: i64) -> Ms {
        1_697_932_800_000 + (hh * 60 + mm) * M
    }

    fn draft(start: Ms, end: Ms) -> AppointmentDraft {
        AppointmentDraft {
            patient_id: Some(1),
            doctor_id: Some(1),
            room: Some("gynecology".into()),
            starts_at: Some(start),
            finishes_at: Some(end),
        }
    }

    fn existing(id: RecordId, room: &str, start: Ms, end: Ms) -> Appointment {
        Appointment {
            id,
            patient_id: Some(1),
            doctor_id: 1,
            room: room.into(),
            span: Span::new(start, end),
        }
    }

    fn candidate(room: &str, start: Ms, end: Ms) -> Candidate {
        Candidate {
            patient_id: Some(2),
            doctor_id: 2,
            room: room.into(),
            span: Span::new(start, end),
        }
    }

    // ── validate_draft ────────────────────────────────────

    #[test]
    fn complete_draft_is_valid() {
        let c = validate_draft(&draft(t(19, 30), t(20, 30))).unwrap();
        assert_eq!(c.span, Span::new(t(19, 30), t(20, 30)));
        assert_eq!(c.room, "gynecology");
        assert_eq!(c.doctor_id, 1);
    }

    #[test]
    fn missing_room_rejected() {
        let d = AppointmentDraft { room: None, ..draft(t(19, 30), t(20, 30)) };
        assert!(matches!(validate_draft(&d), Err(EngineError::Invalid(_))));
    }

    #[test]
    fn missing_doctor_rejected() {
        let d = AppointmentDraft { doctor_id: None, ..draft(t(19, 30), t(20, 30)) };
        assert!(matches!(validate_draft(&d), Err(EngineError::Invalid(_))));
    }

    #[test]
    fn missing_start_rejected() {
        let d = AppointmentDraft { starts_at: None, ..draft(t(19, 30), t(20, 30)) };
        assert!(matches!(validate_draft(&d), Err(EngineError::Invalid(_))));
    }

    #[test]
    fn missing_finish_rejected() {
        let d = AppointmentDraft { finishes_at: None, ..draft(t(19, 30), t(20, 30)) };
        assert!(matches!(validate_draft(&d), Err(EngineError::Invalid(_))));
    }

    #[test]
    fn zero_length_rejected() {
        let err = validate_draft(&draft(t(23, 59), t(23, 59))).unwrap_err();
        assert!(matches!(err, EngineError::Invalid("starts_at equals finishes_at")));
    }

    #[test]
    fn missing_patient_tolerated() {
        let d = AppointmentDraft { patient_id: None, ..draft(t(19, 30), t(20, 30)) };
        let c = validate_draft(&d).unwrap();
        assert_eq!(c.patient_id, None);
    }

    #[test]
    fn backwards_span_passes_structural_check() {
        let c = validate_draft(&draft(t(20, 30), t(19, 30))).unwrap();
        assert_eq!(c.span.duration_ms(), -60 * M);
    }

    // ── validate_span ─────────────────────────────────────

    #[test]
    fn long_and_pre_epoch_spans_accepted() {
        assert!(validate_span(&Span::new(t(10, 0), t(11, 0))).is_ok());
        assert!(validate_span(&Span::new(-3_600_000, -60_000)).is_ok());
        assert!(validate_span(&Span::new(t(10, 0), t(10, 0) + 30 * 24 * 60 * M)).is_ok());
    }

    #[test]
    fn unrepresentable_timestamps_rejected() {
        assert!(matches!(
            validate_span(&Span::new(0, i64::MAX)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_span(&Span::new(i64::MIN, 0)).is_err());
    }

    // ── find_conflict ─────────────────────────────────────

    #[test]
    fn no_existing_no_conflict() {
        let c = candidate("gynecology", t(10, 0), t(11, 0));
        let none: Vec<Appointment> = Vec::new();
        assert!(!has_conflict(&c, &none, ConflictScope::Global));
    }

    #[test]
    fn overlapping_booking_conflicts() {
        let booked = [existing(1, "gynecology", t(19, 30), t(20, 30))];
        let c = candidate("gynecology", t(20, 0), t(20, 45));
        assert_eq!(find_conflict(&c, &booked, ConflictScope::Global).map(|a| a.id), Some(1));
    }

    #[test]
    fn back_to_back_booking_accepted() {
        let booked = [existing(1, "gynecology", t(19, 30), t(20, 30))];
        let c = candidate("gynecology", t(20, 30), t(21, 0));
        assert!(!has_conflict(&c, &booked, ConflictScope::Global));
        let before = candidate("gynecology", t(19, 0), t(19, 30));
        assert!(!has_conflict(&before, &booked, ConflictScope::Global));
    }

    #[test]
    fn first_match_wins() {
        let booked = [
            existing(1, "gynecology", t(8, 0), t(9, 0)),
            existing(2, "gynecology", t(10, 0), t(11, 0)),
            existing(3, "gynecology", t(10, 30), t(12, 0)),
        ];
        let c = candidate("gynecology", t(10, 45), t(11, 15));
        assert_eq!(find_conflict(&c, &booked, ConflictScope::Global).map(|a| a.id), Some(2));
    }

    #[test]
    fn global_scope_flags_other_rooms() {
        let booked = [existing(1, "dermatology", t(19, 30), t(20, 30))];
        let c = candidate("gynecology", t(20, 0), t(20, 15));
        assert!(has_conflict(&c, &booked, ConflictScope::Global));
    }

    #[test]
    fn room_scope_ignores_other_rooms() {
        let booked = [
            existing(1, "dermatology", t(19, 30), t(20, 30)),
            existing(2, "gynecology", t(21, 0), t(22, 0)),
        ];
        let c = candidate("gynecology", t(20, 0), t(20, 15));
        assert!(!has_conflict(&c, &booked, ConflictScope::Room));
        let late = candidate("gynecology", t(21, 30), t(21, 45));
        assert!(has_conflict(&late, &booked, ConflictScope::Room));
    }

    #[test]
    fn scope_parses() {
        assert_eq!("global".parse::<ConflictScope>(), Ok(ConflictScope::Global));
        assert_eq!(" ROOM ".parse::<ConflictScope>(), Ok(ConflictScope::Room));
        assert!("doctor".parse::<ConflictScope>().is_err());
        assert_eq!(ConflictScope::Room.to_string(), "room");
    }
}
