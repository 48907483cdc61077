use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, validate_draft, validate_span};
use super::{Engine, EngineError, WalCommand};

fn check_contact(contact: &Contact) -> Result<(), EngineError> {
    let fields = [&contact.first_name, &contact.last_name, &contact.email];
    if fields.iter().any(|f| f.as_ref().is_some_and(|s| s.len() > MAX_NAME_LEN)) {
        return Err(EngineError::LimitExceeded("contact field too long"));
    }
    Ok(())
}

fn check_room_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::Invalid("room name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Doctors ──────────────────────────────────────────────

    pub async fn create_doctor(&self, contact: Contact) -> Result<Doctor, EngineError> {
        check_contact(&contact)?;
        if self.store.doctors.len() >= MAX_RECORDS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }
        let _gate = self.commit_gate.read().await;
        let id = self.store.doctor_ids.next();
        let event = Event::DoctorAdded { id, contact: contact.clone() };
        self.persist_and_apply(&event).await?;
        Ok(Doctor { id, contact })
    }

    pub async fn delete_doctor(&self, id: RecordId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        if !self.store.doctors.contains(&id) {
            return Err(EngineError::doctor_not_found(id));
        }
        if self.store.doctor_in_use(id) {
            return Err(EngineError::Referenced(format!("doctor {id}")));
        }
        self.persist_and_apply(&Event::DoctorRemoved { id }).await
    }

    pub async fn delete_all_doctors(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        if self.store.any_doctor_in_use() {
            return Err(EngineError::Referenced("doctors".into()));
        }
        let n = self.store.doctors.len();
        self.persist_and_apply(&Event::DoctorsCleared).await?;
        Ok(n)
    }

    // ── Patients ─────────────────────────────────────────────

    pub async fn create_patient(&self, contact: Contact) -> Result<Patient, EngineError> {
        check_contact(&contact)?;
        if self.store.patients.len() >= MAX_RECORDS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many patients"));
        }
        let _gate = self.commit_gate.read().await;
        let id = self.store.patient_ids.next();
        let event = Event::PatientAdded { id, contact: contact.clone() };
        self.persist_and_apply(&event).await?;
        Ok(Patient { id, contact })
    }

    pub async fn delete_patient(&self, id: RecordId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        if !self.store.patients.contains(&id) {
            return Err(EngineError::patient_not_found(id));
        }
        if self.store.patient_in_use(id) {
            return Err(EngineError::Referenced(format!("patient {id}")));
        }
        self.persist_and_apply(&Event::PatientRemoved { id }).await
    }

    pub async fn delete_all_patients(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        if self.store.any_patient_in_use() {
            return Err(EngineError::Referenced("patients".into()));
        }
        let n = self.store.patients.len();
        self.persist_and_apply(&Event::PatientsCleared).await?;
        Ok(n)
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, name: String) -> Result<Room, EngineError> {
        check_room_name(&name)?;
        let _gate = self.commit_gate.write().await;
        if self.store.rooms.contains(&name) {
            return Err(EngineError::AlreadyExists(name));
        }
        if self.store.rooms.len() >= MAX_RECORDS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        self.persist_and_apply(&Event::RoomAdded { name: name.clone() }).await?;
        Ok(Room { name })
    }

    pub async fn delete_room(&self, name: &str) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        if !self.store.rooms.contains(&name.to_string()) {
            return Err(EngineError::room_not_found(name));
        }
        if self.store.room_in_use(name) {
            return Err(EngineError::Referenced(format!("room {name}")));
        }
        self.persist_and_apply(&Event::RoomRemoved { name: name.to_string() }).await
    }

    pub async fn delete_all_rooms(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        if self.store.any_room_in_use() {
            return Err(EngineError::Referenced("rooms".into()));
        }
        let n = self.store.rooms.len();
        self.persist_and_apply(&Event::RoomsCleared).await?;
        Ok(n)
    }

    // ── Appointments ─────────────────────────────────────────

    /// Validate, check references, scan for overlaps, persist.
    ///
    /// The scan and the insert happen under the exclusive gate; two
    /// overlapping requests cannot both pass the scan.
    pub async fn create_appointment(
        &self,
        draft: AppointmentDraft,
    ) -> Result<Appointment, EngineError> {
        let result = self.try_create_appointment(draft).await;
        match &result {
            Ok(appt) => info!(
                id = appt.id,
                room = %appt.room,
                starts_at = %format_timestamp(appt.span.start),
                finishes_at = %format_timestamp(appt.span.end),
                "appointment booked"
            ),
            Err(e) => {
                metrics::counter!(
                    crate::observability::APPOINTMENTS_REJECTED_TOTAL,
                    "reason" => e.kind()
                )
                .increment(1);
                debug!("appointment rejected: {e}");
            }
        }
        result
    }

    async fn try_create_appointment(
        &self,
        draft: AppointmentDraft,
    ) -> Result<Appointment, EngineError> {
        let candidate = validate_draft(&draft)?;
        validate_span(&candidate.span)?;

        let _gate = self.commit_gate.write().await;

        let existing = self.store.appointments.list_all();
        if let Some(hit) = find_conflict(&candidate, &existing, self.conflict_scope) {
            return Err(EngineError::Conflict(hit.id));
        }

        if !self.store.doctors.contains(&candidate.doctor_id) {
            return Err(EngineError::doctor_not_found(candidate.doctor_id));
        }
        if !self.store.rooms.contains(&candidate.room) {
            return Err(EngineError::room_not_found(&candidate.room));
        }
        if let Some(pid) = candidate.patient_id
            && !self.store.patients.contains(&pid)
        {
            return Err(EngineError::patient_not_found(pid));
        }
        if existing.len() >= MAX_RECORDS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many appointments"));
        }

        let appointment = candidate.into_appointment(self.store.appointment_ids.next());
        let event = Event::AppointmentBooked {
            id: appointment.id,
            patient_id: appointment.patient_id,
            doctor_id: appointment.doctor_id,
            room: appointment.room.clone(),
            span: appointment.span,
        };
        self.persist_and_apply(&event).await?;
        Ok(appointment)
    }

    pub async fn delete_appointment(&self, id: RecordId) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if !self.store.appointments.contains(&id) {
            return Err(EngineError::appointment_not_found(id));
        }
        self.persist_and_apply(&Event::AppointmentCancelled { id }).await
    }

    pub async fn delete_all_appointments(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        let n = self.store.appointments.len();
        self.persist_and_apply(&Event::AppointmentsCleared).await?;
        Ok(n)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No mutation may be between its WAL append and its apply while the
        // snapshot is taken, or the swap would drop it.
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot_events();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
