use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::model::*;

/// One keyed collection of records.
pub struct Table<K, V> {
    rows: DashMap<K, V>,
}

impl<K, V> Default for Table<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self { rows: DashMap::new() }
    }
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Snapshot of every row, ordered by key.
    pub fn list_all(&self) -> Vec<V> {
        let mut rows: Vec<(K, V)> = self
            .rows
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, v)| v).collect()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        self.rows.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) {
        self.rows.insert(key, value);
    }

    pub fn remove(&self, key: &K) -> bool {
        self.rows.remove(key).is_some()
    }

    /// Remove every row, returning how many there were.
    pub fn clear(&self) -> usize {
        let n = self.rows.len();
        self.rows.clear();
        n
    }
}

/// Monotonic id source. Ids start at 1 and are never handed out twice.
#[derive(Default)]
pub struct IdSequence {
    last: AtomicU64,
}

impl IdSequence {
    pub fn next(&self) -> RecordId {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make sure future ids are greater than `id` (used during replay).
    pub fn observe(&self, id: RecordId) {
        self.last.fetch_max(id, Ordering::SeqCst);
    }

    pub fn last(&self) -> RecordId {
        self.last.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    pub doctors: Table<RecordId, Doctor>,
    pub patients: Table<RecordId, Patient>,
    pub rooms: Table<String, Room>,
    pub appointments: Table<RecordId, Appointment>,
    pub doctor_ids: IdSequence,
    pub patient_ids: IdSequence,
    pub appointment_ids: IdSequence,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a logged mutation. Replay and live writes share this path.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::DoctorAdded { id, contact } => {
                self.doctor_ids.observe(*id);
                self.doctors.insert(*id, Doctor { id: *id, contact: contact.clone() });
            }
            Event::DoctorRemoved { id } => {
                self.doctors.remove(id);
            }
            Event::DoctorsCleared => {
                self.doctors.clear();
            }
            Event::PatientAdded { id, contact } => {
                self.patient_ids.observe(*id);
                self.patients.insert(*id, Patient { id: *id, contact: contact.clone() });
            }
            Event::PatientRemoved { id } => {
                self.patients.remove(id);
            }
            Event::PatientsCleared => {
                self.patients.clear();
            }
            Event::RoomAdded { name } => {
                self.rooms.insert(name.clone(), Room { name: name.clone() });
            }
            Event::RoomRemoved { name } => {
                self.rooms.remove(name);
            }
            Event::RoomsCleared => {
                self.rooms.clear();
            }
            Event::AppointmentBooked { id, patient_id, doctor_id, room, span } => {
                self.appointment_ids.observe(*id);
                self.appointments.insert(
                    *id,
                    Appointment {
                        id: *id,
                        patient_id: *patient_id,
                        doctor_id: *doctor_id,
                        room: room.clone(),
                        span: *span,
                    },
                );
            }
            Event::AppointmentCancelled { id } => {
                self.appointments.remove(id);
            }
            Event::AppointmentsCleared => {
                self.appointments.clear();
            }
            Event::SequencesAdvanced { doctors, patients, appointments } => {
                self.doctor_ids.observe(*doctors);
                self.patient_ids.observe(*patients);
                self.appointment_ids.observe(*appointments);
            }
        }
    }

    /// Events that rebuild the current state from nothing.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = vec![Event::SequencesAdvanced {
            doctors: self.doctor_ids.last(),
            patients: self.patient_ids.last(),
            appointments: self.appointment_ids.last(),
        }];
        events.extend(
            self.doctors
                .list_all()
                .into_iter()
                .map(|d| Event::DoctorAdded { id: d.id, contact: d.contact }),
        );
        events.extend(
            self.patients
                .list_all()
                .into_iter()
                .map(|p| Event::PatientAdded { id: p.id, contact: p.contact }),
        );
        events.extend(
            self.rooms
                .list_all()
                .into_iter()
                .map(|r| Event::RoomAdded { name: r.name }),
        );
        events.extend(self.appointments.list_all().into_iter().map(|a| {
            Event::AppointmentBooked {
                id: a.id,
                patient_id: a.patient_id,
                doctor_id: a.doctor_id,
                room: a.room,
                span: a.span,
            }
        }));
        events
    }

    pub fn doctor_in_use(&self, id: RecordId) -> bool {
        self.appointments.rows.iter().any(|e| e.value().doctor_id == id)
    }

    pub fn patient_in_use(&self, id: RecordId) -> bool {
        self.appointments
            .rows
            .iter()
            .any(|e| e.value().patient_id == Some(id))
    }

    pub fn room_in_use(&self, name: &str) -> bool {
        self.appointments.rows.iter().any(|e| e.value().room == name)
    }

    pub fn any_doctor_in_use(&self) -> bool {
        !self.appointments.is_empty()
    }

    pub fn any_patient_in_use(&self) -> bool {
        self.appointments
            .rows
            .iter()
            .any(|e| e.value().patient_id.is_some())
    }

    pub fn any_room_in_use(&self) -> bool {
        !self.appointments.is_empty()
    }
}
