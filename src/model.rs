use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Store-assigned identifier for doctors, patients and appointments.
pub type RecordId = u64;

/// Appointment time range, half-open `[start, end)`.
///
/// Only `start != end` is enforced (at validation time); a span whose end
/// precedes its start is representable and compared as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Intervals intersect unless one finishes at or before the other starts.
    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        !(self.end <= other.start || other.end <= self.start)
    }
}

/// Identity and contact fields shared by doctors and patients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub age: i32,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: RecordId,
    pub contact: Contact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: RecordId,
    pub contact: Contact,
}

/// A room is its own key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub name: String,
}

/// Inbound appointment as decoded from a request: every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentDraft {
    pub patient_id: Option<RecordId>,
    pub doctor_id: Option<RecordId>,
    pub room: Option<String>,
    pub starts_at: Option<Ms>,
    pub finishes_at: Option<Ms>,
}

/// A structurally valid appointment that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub patient_id: Option<RecordId>,
    pub doctor_id: RecordId,
    pub room: String,
    pub span: Span,
}

impl Candidate {
    pub fn into_appointment(self, id: RecordId) -> Appointment {
        Appointment {
            id,
            patient_id: self.patient_id,
            doctor_id: self.doctor_id,
            room: self.room,
            span: self.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: RecordId,
    /// Not required at creation; see `validate_draft`.
    pub patient_id: Option<RecordId>,
    pub doctor_id: RecordId,
    pub room: String,
    pub span: Span,
}

impl Appointment {
    pub fn overlaps(&self, other: &Appointment) -> bool {
        self.span.overlaps(&other.span)
    }
}

/// WAL record format. One variant per mutation, flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DoctorAdded { id: RecordId, contact: Contact },
    DoctorRemoved { id: RecordId },
    DoctorsCleared,
    PatientAdded { id: RecordId, contact: Contact },
    PatientRemoved { id: RecordId },
    PatientsCleared,
    RoomAdded { name: String },
    RoomRemoved { name: String },
    RoomsCleared,
    AppointmentBooked {
        id: RecordId,
        patient_id: Option<RecordId>,
        doctor_id: RecordId,
        room: String,
        span: Span,
    },
    AppointmentCancelled { id: RecordId },
    AppointmentsCleared,
    /// Written by compaction so id sequences survive even when the rows
    /// that used the highest ids are gone.
    SequencesAdvanced {
        doctors: RecordId,
        patients: RecordId,
        appointments: RecordId,
    },
}

// ── Timestamps ───────────────────────────────────────────────────

/// Textual formats accepted for appointment times. The first is the format
/// the front desk uses (`19:30 22/10/2023`).
const TIMESTAMP_FORMATS: &[&str] = &[
    "%H:%M %d/%m/%Y",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse a naive timestamp (interpreted as UTC) into Unix milliseconds.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Render Unix milliseconds as `YYYY-MM-DDTHH:MM:SS`. Out-of-range values
/// fall back to the raw number.
pub fn format_timestamp(ms: Ms) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}
