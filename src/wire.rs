use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::ClinicAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct ClinicHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ClinicQueryParser>,
}

impl ClinicHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ClinicQueryParser),
        }
    }

    /// Parse and execute one statement, recording RED metrics.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertDoctor(contact) => {
                engine.create_doctor(contact).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertPatient(contact) => {
                engine.create_patient(contact).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertRoom { name } => {
                engine.create_room(name).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertAppointment(draft) => {
                engine.create_appointment(draft).await.map_err(engine_err)?;
                Ok(inserted())
            }

            Command::SelectDoctors { id } => {
                let doctors = match id {
                    Some(id) => vec![engine.get_doctor(id).map_err(engine_err)?],
                    None => engine.list_doctors(),
                };
                contact_rows(doctors.iter().map(|d| (d.id, &d.contact)))
            }
            Command::SelectPatients { id } => {
                let patients = match id {
                    Some(id) => vec![engine.get_patient(id).map_err(engine_err)?],
                    None => engine.list_patients(),
                };
                contact_rows(patients.iter().map(|p| (p.id, &p.contact)))
            }
            Command::SelectRooms { name } => {
                let rooms = match name {
                    Some(name) => vec![engine.get_room(&name).map_err(engine_err)?],
                    None => engine.list_rooms(),
                };
                room_rows(&rooms)
            }
            Command::SelectAppointments { id } => {
                let appointments = match id {
                    Some(id) => vec![engine.get_appointment(id).map_err(engine_err)?],
                    None => engine.list_appointments(),
                };
                appointment_rows(&appointments)
            }

            Command::DeleteDoctors { id: Some(id) } => {
                engine.delete_doctor(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::DeleteDoctors { id: None } => {
                let n = engine.delete_all_doctors().await.map_err(engine_err)?;
                Ok(deleted(n))
            }
            Command::DeletePatients { id: Some(id) } => {
                engine.delete_patient(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::DeletePatients { id: None } => {
                let n = engine.delete_all_patients().await.map_err(engine_err)?;
                Ok(deleted(n))
            }
            Command::DeleteRooms { name: Some(name) } => {
                engine.delete_room(&name).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::DeleteRooms { name: None } => {
                let n = engine.delete_all_rooms().await.map_err(engine_err)?;
                Ok(deleted(n))
            }
            Command::DeleteAppointments { id: Some(id) } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::DeleteAppointments { id: None } => {
                let n = engine.delete_all_appointments().await.map_err(engine_err)?;
                Ok(deleted(n))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

// ── Result sets ──────────────────────────────────────────────────

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn contact_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::INT8),
        column("first_name", Type::VARCHAR),
        column("last_name", Type::VARCHAR),
        column("age", Type::INT4),
        column("email", Type::VARCHAR),
    ]
}

fn room_schema() -> Vec<FieldInfo> {
    vec![column("room_name", Type::VARCHAR)]
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::INT8),
        column("patient_id", Type::INT8),
        column("doctor_id", Type::INT8),
        column("room_name", Type::VARCHAR),
        column("starts_at", Type::VARCHAR),
        column("finishes_at", Type::VARCHAR),
    ]
}

/// Columns the statement will return; empty for anything that is not a
/// SELECT the dialect understands. Placeholders are bound to a dummy literal
/// so the statement parses before any parameters arrive.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let bound = bind_placeholders(sql, |_| Some("'0'".to_string()));
    match sql::parse_sql(&bound) {
        Ok(Command::SelectAppointments { .. }) => appointment_schema(),
        Ok(Command::SelectDoctors { .. } | Command::SelectPatients { .. }) => contact_schema(),
        Ok(Command::SelectRooms { .. }) => room_schema(),
        _ => vec![],
    }
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: Vec<PgWireResult<DataRow>>,
) -> PgWireResult<Response> {
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn contact_rows<'a>(
    records: impl Iterator<Item = (RecordId, &'a Contact)>,
) -> PgWireResult<Response> {
    let schema = Arc::new(contact_schema());
    let rows: Vec<PgWireResult<DataRow>> = records
        .map(|(id, c)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(id as i64))?;
            encoder.encode_field(&c.first_name)?;
            encoder.encode_field(&c.last_name)?;
            encoder.encode_field(&c.age)?;
            encoder.encode_field(&c.email)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn room_rows(rooms: &[Room]) -> PgWireResult<Response> {
    let schema = Arc::new(room_schema());
    let rows: Vec<PgWireResult<DataRow>> = rooms
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn appointment_rows(appointments: &[Appointment]) -> PgWireResult<Response> {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<DataRow>> = appointments
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(a.id as i64))?;
            encoder.encode_field(&a.patient_id.map(|p| p as i64))?;
            encoder.encode_field(&(a.doctor_id as i64))?;
            encoder.encode_field(&a.room)?;
            encoder.encode_field(&format_timestamp(a.span.start))?;
            encoder.encode_field(&format_timestamp(a.span.end))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

#[async_trait]
impl SimpleQueryHandler for ClinicHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClinicQueryParser;

#[async_trait]
impl QueryParser for ClinicQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ClinicHandler {
    type Statement = String;
    type QueryParser = ClinicQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Every `$N` placeholder outside quoted literals and identifiers, as the
/// byte range it occupies and its index.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Rebuild `sql` with each placeholder replaced by `render(n)`. One pass over
/// the original text, so rendered values are never scanned again. A
/// placeholder `render` declines is left as written.
fn bind_placeholders(sql: &str, render: impl Fn(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[copied..range.start]);
        match render(n) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&sql[range.clone()]),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    bind_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClinicFactory {
    handler: Arc<ClinicHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ClinicAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ClinicFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = ClinicAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ClinicHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClinicFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ClinicFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE reported for each engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Invalid(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Referenced(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("WAL failure: {msg}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM doctors"), 0);
        assert_eq!(count_params("SELECT * FROM doctors WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO appointments VALUES ($1, $2, $3, $5, $4)"),
            5
        );
        assert_eq!(count_params("SELECT $12"), 12);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let params = vec![Some(b"O'Brien".to_vec()), None];
        let sql = substitute_params("INSERT INTO patients (last_name, email) VALUES ($1, $2)", &params);
        assert_eq!(
            sql,
            "INSERT INTO patients (last_name, email) VALUES ('O''Brien', NULL)"
        );
    }

    #[test]
    fn substitute_handles_double_digit_placeholders() {
        let params: Vec<Option<Vec<u8>>> = (1..=10).map(|i| Some(i.to_string().into_bytes())).collect();
        let sql = substitute_params("$1 $10", &params);
        assert_eq!(sql, "'1' '10'");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = vec![Some(b"Ana".to_vec()), Some(b"pay$1@x.com".to_vec())];
        let sql = substitute_params("INSERT INTO patients (first_name, email) VALUES ($1, $2)", &params);
        assert_eq!(sql, "INSERT INTO patients (first_name, email) VALUES ('Ana', 'pay$1@x.com')");
        let Command::InsertPatient(c) = sql::parse_sql(&sql).unwrap() else {
            panic!("expected InsertPatient");
        };
        assert_eq!(c.first_name.as_deref(), Some("Ana"));
        assert_eq!(c.email.as_deref(), Some("pay$1@x.com"));
    }

    #[test]
    fn placeholders_inside_literals_are_text() {
        let params = vec![Some(b"x".to_vec())];
        let sql = substitute_params("SELECT * FROM rooms WHERE room_name = 'it''s $1'", &params);
        assert_eq!(sql, "SELECT * FROM rooms WHERE room_name = 'it''s $1'");
        assert_eq!(count_params("SELECT * FROM rooms WHERE room_name = '$3' OR $1"), 1);
        assert_eq!(substitute_params("SELECT $2", &params), "SELECT $2");
    }

    #[test]
    fn substituted_statement_parses() {
        let params = vec![
            Some(b"1".to_vec()),
            Some(b"gynecology".to_vec()),
            Some(b"19:30 22/10/2023".to_vec()),
            Some(b"20:30 22/10/2023".to_vec()),
        ];
        let sql = substitute_params(
            "INSERT INTO appointments (doctor_id, room_name, starts_at, finishes_at) VALUES ($1, $2, $3, $4)",
            &params,
        );
        let Command::InsertAppointment(d) = sql::parse_sql(&sql).unwrap() else {
            panic!("expected InsertAppointment");
        };
        assert_eq!(d.doctor_id, Some(1));
        assert_eq!(d.starts_at, Some(1_698_003_000_000));
    }

    #[test]
    fn result_schema_by_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM appointments WHERE id = $1"),
            vec!["id", "patient_id", "doctor_id", "room_name", "starts_at", "finishes_at"]
        );
        assert_eq!(names("select * from doctors").len(), 5);
        assert_eq!(names("SELECT * FROM rooms"), vec!["room_name"]);
        assert_eq!(
            names("SELECT * FROM rooms WHERE room_name = 'appointments'"),
            vec!["room_name"]
        );
        assert_eq!(names("SELECT * FROM patients WHERE id = $1").len(), 5);
        assert!(names("SELECT * FROM nurses").is_empty());
        assert!(names("DELETE FROM appointments").is_empty());
        assert!(names("INSERT INTO rooms VALUES ('x')").is_empty());
    }

    #[test]
    fn sqlstate_per_engine_error() {
        assert_eq!(engine_sqlstate(&EngineError::Invalid("x")), "22023");
        assert_eq!(engine_sqlstate(&EngineError::Conflict(1)), "23P01");
        assert_eq!(engine_sqlstate(&EngineError::NotFound("room a".into())), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::AlreadyExists("a".into())), "23505");
        assert_eq!(engine_sqlstate(&EngineError::Referenced("a".into())), "23503");
        assert_eq!(engine_sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(engine_sqlstate(&EngineError::WalError("disk".into())), "XX000");
    }

    #[test]
    fn sqlstate_per_sql_error() {
        assert_eq!(sql_sqlstate(&SqlError::InvalidValue("bad".into())), "22023");
        assert_eq!(sql_sqlstate(&SqlError::Empty), "42601");
        assert_eq!(sql_sqlstate(&SqlError::UnknownTable("x".into())), "42601");
    }
}
