//! The local relational store, reached only through this operation
//! interface (§1 Non-goals: the store's own design is out of scope; the
//! coordination layer depends only on the contract below). `SqliteStore`
//! is a real, pooled implementation; `MemoryStore` is the in-process test
//! double used throughout the test suite.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::CoordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitState {
    Active,
    Completed,
    Cancelled,
}

impl VisitState {
    pub fn as_str(self) -> &'static str {
        match self {
            VisitState::Active => "active",
            VisitState::Completed => "completed",
            VisitState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub name: String,
    pub age: i32,
    pub sex: Option<String>,
    pub curp: Option<String>,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: i64,
    pub sala_id: u32,
    pub available: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bed {
    pub id: i64,
    pub sala_id: u32,
    pub occupied: bool,
    pub current_patient: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialWorker {
    pub id: i64,
    pub sala_id: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub folio: String,
    pub patient_id: i64,
    pub doctor_id: i64,
    pub bed_id: i64,
    pub sw_id: i64,
    pub sala_id: u32,
    pub symptoms: String,
    pub diagnosis: Option<String>,
    pub state: VisitState,
    pub created_at_unix: i64,
    pub closed_at_unix: Option<i64>,
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Inputs needed to mint and insert a new visit; the folio itself is
/// computed by the coordinator and passed in so this trait stays a thin
/// operation interface rather than owning folio policy.
#[derive(Debug, Clone)]
pub struct NewVisit {
    pub folio: String,
    pub patient_id: i64,
    pub doctor_id: i64,
    pub bed_id: i64,
    pub sw_id: i64,
    pub sala_id: u32,
    pub symptoms: String,
}

/// The operation interface the coordination layer is allowed to call.
/// Every method is a short, self-contained transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn doctor_available(&self, doctor_id: i64) -> Result<bool, CoordError>;
    async fn bed_free(&self, bed_id: i64) -> Result<bool, CoordError>;

    /// Inserts the patient and returns its id.
    async fn insert_patient(&self, patient: NewPatient) -> Result<i64, CoordError>;

    async fn visit_by_folio(&self, folio: &str) -> Result<Option<Visit>, CoordError>;

    /// Transactional re-read + insert + resource flip, all or nothing.
    async fn create_visit(&self, visit: NewVisit) -> Result<Visit, CoordError>;

    /// Idempotent: returns `Ok(existing)` without mutating state if the
    /// folio is already present.
    async fn replicate_visit(&self, visit: NewVisit) -> Result<Visit, CoordError>;

    async fn close_visit(&self, folio: &str, doctor_id: i64, diagnosis: String) -> Result<Visit, CoordError>;

    async fn list_doctors(&self, sala_id: u32, disponible: Option<bool>, activo: Option<bool>) -> Result<Vec<Doctor>, CoordError>;
    async fn list_beds(&self, sala_id: u32, ocupada: Option<bool>) -> Result<Vec<Bed>, CoordError>;
    async fn list_visits(&self, sala_id: u32, estado: Option<VisitState>, limit: Option<usize>) -> Result<Vec<Visit>, CoordError>;

    async fn next_sequence(&self, sala_id: u32) -> Result<u64, CoordError>;
    async fn advance_sequence_to(&self, sala_id: u32, value: u64) -> Result<u64, CoordError>;

    async fn stats(&self, sala_id: u32) -> Result<StoreStats, CoordError>;
}

#[derive(Debug, Clone)]
pub struct NewPatient {
    pub name: String,
    pub age: i32,
    pub sex: Option<String>,
    pub curp: Option<String>,
    pub contact: Option<String>,
}

impl NewPatient {
    pub fn validate(&self) -> Result<(), CoordError> {
        if self.name.trim().is_empty() {
            return Err(CoordError::Validation("patient name is required".into()));
        }
        if !(0..=130).contains(&self.age) {
            return Err(CoordError::Validation("patient age out of range".into()));
        }
        if let Some(curp) = &self.curp {
            if curp.len() != 18 {
                return Err(CoordError::Validation("curp must be 18 characters".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub node_id: u32,
    pub doctors_total: i64,
    pub doctors_available: i64,
    pub beds_total: i64,
    pub beds_available: i64,
    pub visits_active: i64,
    pub visits_completed: i64,
    pub doctors_pct: f64,
    pub beds_pct: f64,
}

fn capacity_pct(available: i64, total: i64) -> f64 {
    if total > 0 {
        (available as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------

struct MemoryInner {
    node_id: u32,
    patients: HashMap<i64, Patient>,
    doctors: HashMap<i64, Doctor>,
    beds: HashMap<i64, Bed>,
    visits: HashMap<String, Visit>,
    sequences: HashMap<u32, u64>,
    next_patient_id: i64,
}

pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new(node_id: u32) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                node_id,
                patients: HashMap::new(),
                doctors: HashMap::new(),
                beds: HashMap::new(),
                visits: HashMap::new(),
                sequences: HashMap::new(),
                next_patient_id: 1,
            }),
        }
    }

    pub fn seed_doctor(&self, id: i64, sala_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.doctors.insert(id, Doctor { id, sala_id, available: true, active: true });
    }

    pub fn seed_bed(&self, id: i64, sala_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.beds.insert(id, Bed { id, sala_id, occupied: false, current_patient: None });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn doctor_available(&self, doctor_id: i64) -> Result<bool, CoordError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.doctors.get(&doctor_id).map(|d| d.available).unwrap_or(false))
    }

    async fn bed_free(&self, bed_id: i64) -> Result<bool, CoordError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.beds.get(&bed_id).map(|b| !b.occupied).unwrap_or(false))
    }

    async fn insert_patient(&self, patient: NewPatient) -> Result<i64, CoordError> {
        patient.validate()?;
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_patient_id;
        inner.next_patient_id += 1;
        inner.patients.insert(
            id,
            Patient { id, name: patient.name, age: patient.age, sex: patient.sex, curp: patient.curp, contact: patient.contact },
        );
        Ok(id)
    }

    async fn visit_by_folio(&self, folio: &str) -> Result<Option<Visit>, CoordError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.visits.get(folio).cloned())
    }

    async fn create_visit(&self, visit: NewVisit) -> Result<Visit, CoordError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.visits.contains_key(&visit.folio) {
            return Err(CoordError::Validation(format!("folio {} already exists", visit.folio)));
        }
        let doctor_ok = inner.doctors.get(&visit.doctor_id).map(|d| d.available).unwrap_or(false);
        let bed_ok = inner.beds.get(&visit.bed_id).map(|b| !b.occupied).unwrap_or(false);
        if !doctor_ok || !bed_ok {
            return Err(CoordError::ResourceBusy(crate::ids::ResourceKey::doctor(visit.doctor_id)));
        }
        let record = Visit {
            folio: visit.folio.clone(),
            patient_id: visit.patient_id,
            doctor_id: visit.doctor_id,
            bed_id: visit.bed_id,
            sw_id: visit.sw_id,
            sala_id: visit.sala_id,
            symptoms: visit.symptoms,
            diagnosis: None,
            state: VisitState::Active,
            created_at_unix: now_unix(),
            closed_at_unix: None,
        };
        if let Some(d) = inner.doctors.get_mut(&visit.doctor_id) {
            d.available = false;
        }
        if let Some(b) = inner.beds.get_mut(&visit.bed_id) {
            b.occupied = true;
            b.current_patient = Some(visit.patient_id);
        }
        inner.visits.insert(visit.folio.clone(), record.clone());
        Ok(record)
    }

    async fn replicate_visit(&self, visit: NewVisit) -> Result<Visit, CoordError> {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(existing) = inner.visits.get(&visit.folio) {
                return Ok(existing.clone());
            }
        }
        // Replication never re-checks availability: the leader is authoritative.
        let mut inner = self.inner.lock().unwrap();
        let record = Visit {
            folio: visit.folio.clone(),
            patient_id: visit.patient_id,
            doctor_id: visit.doctor_id,
            bed_id: visit.bed_id,
            sw_id: visit.sw_id,
            sala_id: visit.sala_id,
            symptoms: visit.symptoms,
            diagnosis: None,
            state: VisitState::Active,
            created_at_unix: now_unix(),
            closed_at_unix: None,
        };
        if let Some(d) = inner.doctors.get_mut(&visit.doctor_id) {
            d.available = false;
        }
        if let Some(b) = inner.beds.get_mut(&visit.bed_id) {
            b.occupied = true;
            b.current_patient = Some(visit.patient_id);
        }
        inner.visits.insert(visit.folio.clone(), record.clone());
        Ok(record)
    }

    async fn close_visit(&self, folio: &str, doctor_id: i64, diagnosis: String) -> Result<Visit, CoordError> {
        let mut inner = self.inner.lock().unwrap();
        let visit = inner
            .visits
            .get(folio)
            .cloned()
            .ok_or_else(|| CoordError::NotFound(format!("visit {folio}")))?;
        if visit.state != VisitState::Active {
            return Err(CoordError::AlreadyClosed { folio: folio.to_string() });
        }
        if visit.doctor_id != doctor_id {
            return Err(CoordError::NotAssigned { folio: folio.to_string(), doctor_id });
        }
        let bed_id = visit.bed_id;
        let doctor_ref = visit.doctor_id;
        let mut updated = visit;
        updated.state = VisitState::Completed;
        updated.diagnosis = Some(diagnosis);
        updated.closed_at_unix = Some(now_unix());
        inner.visits.insert(folio.to_string(), updated.clone());
        if let Some(d) = inner.doctors.get_mut(&doctor_ref) {
            d.available = true;
        }
        if let Some(b) = inner.beds.get_mut(&bed_id) {
            b.occupied = false;
            b.current_patient = None;
        }
        Ok(updated)
    }

    async fn list_doctors(&self, sala_id: u32, disponible: Option<bool>, activo: Option<bool>) -> Result<Vec<Doctor>, CoordError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .doctors
            .values()
            .filter(|d| d.sala_id == sala_id)
            .filter(|d| disponible.is_none_or(|want| d.available == want))
            .filter(|d| activo.is_none_or(|want| d.active == want))
            .cloned()
            .collect())
    }

    async fn list_beds(&self, sala_id: u32, ocupada: Option<bool>) -> Result<Vec<Bed>, CoordError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .beds
            .values()
            .filter(|b| b.sala_id == sala_id)
            .filter(|b| ocupada.is_none_or(|want| b.occupied == want))
            .cloned()
            .collect())
    }

    async fn list_visits(&self, sala_id: u32, estado: Option<VisitState>, limit: Option<usize>) -> Result<Vec<Visit>, CoordError> {
        let inner = self.inner.lock().unwrap();
        let mut visits: Vec<Visit> = inner
            .visits
            .values()
            .filter(|v| v.sala_id == sala_id)
            .filter(|v| estado.is_none_or(|want| v.state == want))
            .cloned()
            .collect();
        visits.sort_by_key(|v| v.created_at_unix);
        if let Some(limit) = limit {
            visits.truncate(limit);
        }
        Ok(visits)
    }

    async fn next_sequence(&self, sala_id: u32) -> Result<u64, CoordError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.sequences.entry(sala_id).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn advance_sequence_to(&self, sala_id: u32, value: u64) -> Result<u64, CoordError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.sequences.entry(sala_id).or_insert(0);
        if value > *entry {
            *entry = value;
        }
        Ok(*entry)
    }

    async fn stats(&self, sala_id: u32) -> Result<StoreStats, CoordError> {
        let inner = self.inner.lock().unwrap();
        let doctors: Vec<&Doctor> = inner.doctors.values().filter(|d| d.sala_id == sala_id && d.active).collect();
        let beds: Vec<&Bed> = inner.beds.values().filter(|b| b.sala_id == sala_id).collect();
        let visits: Vec<&Visit> = inner.visits.values().filter(|v| v.sala_id == sala_id).collect();
        let doctors_total = doctors.len() as i64;
        let doctors_available = doctors.iter().filter(|d| d.available).count() as i64;
        let beds_total = beds.len() as i64;
        let beds_available = beds.iter().filter(|b| !b.occupied).count() as i64;
        Ok(StoreStats {
            node_id: inner.node_id,
            doctors_total,
            doctors_available,
            beds_total,
            beds_available,
            visits_active: visits.iter().filter(|v| v.state == VisitState::Active).count() as i64,
            visits_completed: visits.iter().filter(|v| v.state == VisitState::Completed).count() as i64,
            doctors_pct: capacity_pct(doctors_available, doctors_total),
            beds_pct: capacity_pct(beds_available, beds_total),
        })
    }
}

// ---------------------------------------------------------------------
// SQLite-backed store
// ---------------------------------------------------------------------

pub struct SqliteStore {
    node_id: u32,
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &Path, node_id: u32) -> Result<Self, CoordError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::new(manager).map_err(|e| CoordError::Store(e.to_string()))?;
        let store = Self { node_id, pool };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), CoordError> {
        let conn = self.pool.get().map_err(|e| CoordError::Store(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS patients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                age INTEGER NOT NULL,
                sex TEXT,
                curp TEXT,
                contact TEXT
            );
            CREATE TABLE IF NOT EXISTS doctors (
                id INTEGER PRIMARY KEY,
                sala_id INTEGER NOT NULL,
                available INTEGER NOT NULL DEFAULT 1,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS beds (
                id INTEGER PRIMARY KEY,
                sala_id INTEGER NOT NULL,
                occupied INTEGER NOT NULL DEFAULT 0,
                current_patient INTEGER
            );
            CREATE TABLE IF NOT EXISTS visits (
                folio TEXT PRIMARY KEY,
                patient_id INTEGER NOT NULL,
                doctor_id INTEGER NOT NULL,
                bed_id INTEGER NOT NULL,
                sw_id INTEGER NOT NULL,
                sala_id INTEGER NOT NULL,
                symptoms TEXT NOT NULL,
                diagnosis TEXT,
                state TEXT NOT NULL,
                created_at_unix INTEGER NOT NULL,
                closed_at_unix INTEGER
            );
            CREATE TABLE IF NOT EXISTS sequences (
                sala_id INTEGER PRIMARY KEY,
                value INTEGER NOT NULL DEFAULT 0
            );",
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        Ok(())
    }

    fn visit_from_row(row: &rusqlite::Row) -> rusqlite::Result<Visit> {
        let state: String = row.get("state")?;
        Ok(Visit {
            folio: row.get("folio")?,
            patient_id: row.get("patient_id")?,
            doctor_id: row.get("doctor_id")?,
            bed_id: row.get("bed_id")?,
            sw_id: row.get("sw_id")?,
            sala_id: row.get("sala_id")?,
            symptoms: row.get("symptoms")?,
            diagnosis: row.get("diagnosis")?,
            state: match state.as_str() {
                "active" => VisitState::Active,
                "completed" => VisitState::Completed,
                _ => VisitState::Cancelled,
            },
            created_at_unix: row.get("created_at_unix")?,
            closed_at_unix: row.get("closed_at_unix")?,
        })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, CoordError> {
        self.pool.get().map_err(|e| CoordError::Store(e.to_string()))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn doctor_available(&self, doctor_id: i64) -> Result<bool, CoordError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT available FROM doctors WHERE id = ?1",
            params![doctor_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|v| v != 0)
        .map_err(|e| CoordError::Store(e.to_string()))
    }

    async fn bed_free(&self, bed_id: i64) -> Result<bool, CoordError> {
        let conn = self.conn()?;
        conn.query_row("SELECT occupied FROM beds WHERE id = ?1", params![bed_id], |row| row.get::<_, i64>(0))
            .map(|v| v == 0)
            .map_err(|e| CoordError::Store(e.to_string()))
    }

    async fn insert_patient(&self, patient: NewPatient) -> Result<i64, CoordError> {
        patient.validate()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO patients (name, age, sex, curp, contact) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![patient.name, patient.age, patient.sex, patient.curp, patient.contact],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    async fn visit_by_folio(&self, folio: &str) -> Result<Option<Visit>, CoordError> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM visits WHERE folio = ?1", params![folio], Self::visit_from_row)
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(CoordError::Store(e.to_string())) })
    }

    async fn create_visit(&self, visit: NewVisit) -> Result<Visit, CoordError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| CoordError::Store(e.to_string()))?;

        let doctor_available: i64 = tx
            .query_row("SELECT available FROM doctors WHERE id = ?1", params![visit.doctor_id], |r| r.get(0))
            .map_err(|_| CoordError::NotFound(format!("doctor {}", visit.doctor_id)))?;
        let bed_occupied: i64 = tx
            .query_row("SELECT occupied FROM beds WHERE id = ?1", params![visit.bed_id], |r| r.get(0))
            .map_err(|_| CoordError::NotFound(format!("bed {}", visit.bed_id)))?;
        if doctor_available == 0 || bed_occupied != 0 {
            return Err(CoordError::ResourceBusy(crate::ids::ResourceKey::doctor(visit.doctor_id)));
        }

        let created_at = now_unix();
        tx.execute(
            "INSERT INTO visits (folio, patient_id, doctor_id, bed_id, sw_id, sala_id, symptoms, diagnosis, state, created_at_unix, closed_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 'active', ?8, NULL)",
            params![visit.folio, visit.patient_id, visit.doctor_id, visit.bed_id, visit.sw_id, visit.sala_id, visit.symptoms, created_at],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.execute("UPDATE doctors SET available = 0 WHERE id = ?1", params![visit.doctor_id])
            .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.execute(
            "UPDATE beds SET occupied = 1, current_patient = ?1 WHERE id = ?2",
            params![visit.patient_id, visit.bed_id],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.commit().map_err(|e| CoordError::Store(e.to_string()))?;

        Ok(Visit {
            folio: visit.folio,
            patient_id: visit.patient_id,
            doctor_id: visit.doctor_id,
            bed_id: visit.bed_id,
            sw_id: visit.sw_id,
            sala_id: visit.sala_id,
            symptoms: visit.symptoms,
            diagnosis: None,
            state: VisitState::Active,
            created_at_unix: created_at,
            closed_at_unix: None,
        })
    }

    async fn replicate_visit(&self, visit: NewVisit) -> Result<Visit, CoordError> {
        if let Some(existing) = self.visit_by_folio(&visit.folio).await? {
            return Ok(existing);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| CoordError::Store(e.to_string()))?;
        let created_at = now_unix();
        tx.execute(
            "INSERT OR IGNORE INTO visits (folio, patient_id, doctor_id, bed_id, sw_id, sala_id, symptoms, diagnosis, state, created_at_unix, closed_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 'active', ?8, NULL)",
            params![visit.folio, visit.patient_id, visit.doctor_id, visit.bed_id, visit.sw_id, visit.sala_id, visit.symptoms, created_at],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.execute("UPDATE doctors SET available = 0 WHERE id = ?1", params![visit.doctor_id])
            .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.execute(
            "UPDATE beds SET occupied = 1, current_patient = ?1 WHERE id = ?2",
            params![visit.patient_id, visit.bed_id],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.commit().map_err(|e| CoordError::Store(e.to_string()))?;
        self.visit_by_folio(&visit.folio).await?.ok_or_else(|| CoordError::Store("replication commit lost".into()))
    }

    async fn close_visit(&self, folio: &str, doctor_id: i64, diagnosis: String) -> Result<Visit, CoordError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| CoordError::Store(e.to_string()))?;
        let existing = tx
            .query_row("SELECT * FROM visits WHERE folio = ?1", params![folio], Self::visit_from_row)
            .map_err(|_| CoordError::NotFound(format!("visit {folio}")))?;
        if existing.state != VisitState::Active {
            return Err(CoordError::AlreadyClosed { folio: folio.to_string() });
        }
        if existing.doctor_id != doctor_id {
            return Err(CoordError::NotAssigned { folio: folio.to_string(), doctor_id });
        }
        let closed_at = now_unix();
        tx.execute(
            "UPDATE visits SET state = 'completed', diagnosis = ?1, closed_at_unix = ?2 WHERE folio = ?3",
            params![diagnosis, closed_at, folio],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.execute("UPDATE doctors SET available = 1 WHERE id = ?1", params![existing.doctor_id])
            .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.execute("UPDATE beds SET occupied = 0, current_patient = NULL WHERE id = ?1", params![existing.bed_id])
            .map_err(|e| CoordError::Store(e.to_string()))?;
        tx.commit().map_err(|e| CoordError::Store(e.to_string()))?;

        Ok(Visit { diagnosis: Some(diagnosis), state: VisitState::Completed, closed_at_unix: Some(closed_at), ..existing })
    }

    async fn list_doctors(&self, sala_id: u32, disponible: Option<bool>, activo: Option<bool>) -> Result<Vec<Doctor>, CoordError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, sala_id, available, active FROM doctors WHERE sala_id = ?1")
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![sala_id], |row| {
                Ok(Doctor {
                    id: row.get(0)?,
                    sala_id: row.get(1)?,
                    available: row.get::<_, i64>(2)? != 0,
                    active: row.get::<_, i64>(3)? != 0,
                })
            })
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let doctor = row.map_err(|e| CoordError::Store(e.to_string()))?;
            if disponible.is_some_and(|want| doctor.available != want) {
                continue;
            }
            if activo.is_some_and(|want| doctor.active != want) {
                continue;
            }
            out.push(doctor);
        }
        Ok(out)
    }

    async fn list_beds(&self, sala_id: u32, ocupada: Option<bool>) -> Result<Vec<Bed>, CoordError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, sala_id, occupied, current_patient FROM beds WHERE sala_id = ?1")
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let rows = stmt
            .query_map(params![sala_id], |row| {
                Ok(Bed {
                    id: row.get(0)?,
                    sala_id: row.get(1)?,
                    occupied: row.get::<_, i64>(2)? != 0,
                    current_patient: row.get(3)?,
                })
            })
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let bed = row.map_err(|e| CoordError::Store(e.to_string()))?;
            if ocupada.is_some_and(|want| bed.occupied != want) {
                continue;
            }
            out.push(bed);
        }
        Ok(out)
    }

    async fn list_visits(&self, sala_id: u32, estado: Option<VisitState>, limit: Option<usize>) -> Result<Vec<Visit>, CoordError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM visits WHERE sala_id = ?1 ORDER BY created_at_unix ASC")
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let rows = stmt.query_map(params![sala_id], Self::visit_from_row).map_err(|e| CoordError::Store(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let visit = row.map_err(|e| CoordError::Store(e.to_string()))?;
            if let Some(want) = estado {
                if visit.state != want {
                    continue;
                }
            }
            out.push(visit);
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn next_sequence(&self, sala_id: u32) -> Result<u64, CoordError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sequences (sala_id, value) VALUES (?1, 1)
             ON CONFLICT(sala_id) DO UPDATE SET value = value + 1",
            params![sala_id],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        conn.query_row("SELECT value FROM sequences WHERE sala_id = ?1", params![sala_id], |r| r.get::<_, i64>(0))
            .map(|v| v as u64)
            .map_err(|e| CoordError::Store(e.to_string()))
    }

    async fn advance_sequence_to(&self, sala_id: u32, value: u64) -> Result<u64, CoordError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sequences (sala_id, value) VALUES (?1, ?2)
             ON CONFLICT(sala_id) DO UPDATE SET value = MAX(value, excluded.value)",
            params![sala_id, value as i64],
        )
        .map_err(|e| CoordError::Store(e.to_string()))?;
        conn.query_row("SELECT value FROM sequences WHERE sala_id = ?1", params![sala_id], |r| r.get::<_, i64>(0))
            .map(|v| v as u64)
            .map_err(|e| CoordError::Store(e.to_string()))
    }

    async fn stats(&self, sala_id: u32) -> Result<StoreStats, CoordError> {
        let conn = self.conn()?;
        let doctors_total: i64 = conn
            .query_row("SELECT COUNT(*) FROM doctors WHERE sala_id = ?1 AND active = 1", params![sala_id], |r| r.get(0))
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let doctors_available: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM doctors WHERE sala_id = ?1 AND active = 1 AND available = 1",
                params![sala_id],
                |r| r.get(0),
            )
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let beds_total: i64 = conn
            .query_row("SELECT COUNT(*) FROM beds WHERE sala_id = ?1", params![sala_id], |r| r.get(0))
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let beds_available: i64 = conn
            .query_row("SELECT COUNT(*) FROM beds WHERE sala_id = ?1 AND occupied = 0", params![sala_id], |r| r.get(0))
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let visits_active: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM visits WHERE sala_id = ?1 AND state = 'active'",
                params![sala_id],
                |r| r.get(0),
            )
            .map_err(|e| CoordError::Store(e.to_string()))?;
        let visits_completed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM visits WHERE sala_id = ?1 AND state = 'completed'",
                params![sala_id],
                |r| r.get(0),
            )
            .map_err(|e| CoordError::Store(e.to_string()))?;
        Ok(StoreStats {
            node_id: self.node_id,
            doctors_total,
            doctors_available,
            beds_total,
            beds_available,
            visits_active,
            visits_completed,
            doctors_pct: capacity_pct(doctors_available, doctors_total),
            beds_pct: capacity_pct(beds_available, beds_total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_visit_flips_doctor_and_bed() {
        let store = MemoryStore::new(1);
        store.seed_doctor(2, 1);
        store.seed_bed(3, 1);

        let visit = store
            .create_visit(NewVisit {
                folio: "5+2+1+001".into(),
                patient_id: 5,
                doctor_id: 2,
                bed_id: 3,
                sw_id: 1,
                sala_id: 1,
                symptoms: "chest pain".into(),
            })
            .await
            .unwrap();

        assert_eq!(visit.folio, "5+2+1+001");
        assert!(!store.doctor_available(2).await.unwrap());
        assert!(!store.bed_free(3).await.unwrap());
    }

    #[tokio::test]
    async fn close_visit_requires_matching_doctor() {
        let store = MemoryStore::new(1);
        store.seed_doctor(4, 2);
        store.seed_bed(9, 2);
        store
            .create_visit(NewVisit {
                folio: "9+4+2+014".into(),
                patient_id: 9,
                doctor_id: 4,
                bed_id: 9,
                sw_id: 1,
                sala_id: 2,
                symptoms: "dehydration".into(),
            })
            .await
            .unwrap();

        let err = store.close_visit("9+4+2+014", 5, "wrong doctor".into()).await.unwrap_err();
        assert!(matches!(err, CoordError::NotAssigned { .. }));

        let closed = store.close_visit("9+4+2+014", 4, "dehydration".into()).await.unwrap();
        assert_eq!(closed.state, VisitState::Completed);
        assert!(store.doctor_available(4).await.unwrap());
        assert!(store.bed_free(9).await.unwrap());
    }

    #[tokio::test]
    async fn replicate_visit_is_idempotent() {
        let store = MemoryStore::new(1);
        store.seed_doctor(2, 1);
        store.seed_bed(3, 1);
        let new_visit = || NewVisit {
            folio: "5+2+1+001".into(),
            patient_id: 5,
            doctor_id: 2,
            bed_id: 3,
            sw_id: 1,
            sala_id: 1,
            symptoms: "chest pain".into(),
        };

        store.replicate_visit(new_visit()).await.unwrap();
        store.replicate_visit(new_visit()).await.unwrap();

        let visits = store.list_visits(1, None, None).await.unwrap();
        assert_eq!(visits.len(), 1);
    }

    #[tokio::test]
    async fn sequence_is_strictly_increasing() {
        let store = MemoryStore::new(1);
        let a = store.next_sequence(1).await.unwrap();
        let b = store.next_sequence(1).await.unwrap();
        let c = store.next_sequence(1).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn stats_capacity_percentages() {
        let store = MemoryStore::new(1);
        store.seed_doctor(1, 1);
        store.seed_doctor(2, 1);
        store.seed_bed(1, 1);
        store
            .create_visit(NewVisit {
                folio: "x".into(),
                patient_id: 1,
                doctor_id: 1,
                bed_id: 1,
                sw_id: 1,
                sala_id: 1,
                symptoms: "s".into(),
            })
            .await
            .unwrap();

        let stats = store.stats(1).await.unwrap();
        assert_eq!(stats.doctors_total, 2);
        assert_eq!(stats.doctors_available, 1);
        assert_eq!(stats.doctors_pct, 50.0);
        assert_eq!(stats.beds_pct, 0.0);
    }

    #[tokio::test]
    async fn sqlite_store_roundtrips_visit_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sala1.db");
        let store = SqliteStore::open(&path, 1).unwrap();

        {
            let conn = store.conn().unwrap();
            conn.execute("INSERT INTO doctors (id, sala_id, available, active) VALUES (2, 1, 1, 1)", []).unwrap();
            conn.execute("INSERT INTO beds (id, sala_id, occupied) VALUES (3, 1, 0)", []).unwrap();
        }

        let visit = store
            .create_visit(NewVisit {
                folio: "5+2+1+001".into(),
                patient_id: 5,
                doctor_id: 2,
                bed_id: 3,
                sw_id: 1,
                sala_id: 1,
                symptoms: "chest pain".into(),
            })
            .await
            .unwrap();
        assert_eq!(visit.folio, "5+2+1+001");
        assert!(!store.doctor_available(2).await.unwrap());

        let closed = store.close_visit(&visit.folio, 2, "ok".into()).await.unwrap();
        assert_eq!(closed.state, VisitState::Completed);
        assert!(store.doctor_available(2).await.unwrap());
    }
}
