use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn list_doctors(&self) -> Vec<Doctor> {
        self.store.doctors.list_all()
    }

    pub fn get_doctor(&self, id: RecordId) -> Result<Doctor, EngineError> {
        self.store
            .doctors
            .find(&id)
            .ok_or_else(|| EngineError::doctor_not_found(id))
    }

    pub fn list_patients(&self) -> Vec<Patient> {
        self.store.patients.list_all()
    }

    pub fn get_patient(&self, id: RecordId) -> Result<Patient, EngineError> {
        self.store
            .patients
            .find(&id)
            .ok_or_else(|| EngineError::patient_not_found(id))
    }

    pub fn list_rooms(&self) -> Vec<Room> {
        self.store.rooms.list_all()
    }

    pub fn get_room(&self, name: &str) -> Result<Room, EngineError> {
        self.store
            .rooms
            .find(&name.to_string())
            .ok_or_else(|| EngineError::room_not_found(name))
    }

    /// Every persisted appointment in id order. Empty means there is nothing
    /// to show, which the wire layer reports as a zero-row result.
    pub fn list_appointments(&self) -> Vec<Appointment> {
        self.store.appointments.list_all()
    }

    pub fn get_appointment(&self, id: RecordId) -> Result<Appointment, EngineError> {
        self.store
            .appointments
            .find(&id)
            .ok_or_else(|| EngineError::appointment_not_found(id))
    }
}
