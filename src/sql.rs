use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

const CONTACT_COLUMNS: &[&str] = &["first_name", "last_name", "age", "email"];
const ROOM_COLUMNS: &[&str] = &["room_name"];
const APPOINTMENT_COLUMNS: &[&str] = &["patient_id", "doctor_id", "room_name", "starts_at", "finishes_at"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDoctor(Contact),
    InsertPatient(Contact),
    InsertRoom { name: String },
    InsertAppointment(AppointmentDraft),
    SelectDoctors { id: Option<RecordId> },
    SelectPatients { id: Option<RecordId> },
    SelectRooms { name: Option<String> },
    SelectAppointments { id: Option<RecordId> },
    DeleteDoctors { id: Option<RecordId> },
    DeletePatients { id: Option<RecordId> },
    DeleteRooms { name: Option<String> },
    DeleteAppointments { id: Option<RecordId> },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "doctors" | "patients" => {
            let row = bind_columns("contact", CONTACT_COLUMNS, &insert.columns, &values)?;
            let contact = Contact {
                first_name: row.text("first_name")?,
                last_name: row.text("last_name")?,
                age: row.int("age")?.unwrap_or(0),
                email: row.text("email")?,
            };
            if table == "doctors" {
                Ok(Command::InsertDoctor(contact))
            } else {
                Ok(Command::InsertPatient(contact))
            }
        }
        "rooms" => {
            let row = bind_columns("rooms", ROOM_COLUMNS, &insert.columns, &values)?;
            let name = row
                .text("room_name")?
                .ok_or_else(|| SqlError::InvalidValue("room_name is required".into()))?;
            Ok(Command::InsertRoom { name })
        }
        "appointments" => {
            let row = bind_columns("appointments", APPOINTMENT_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertAppointment(AppointmentDraft {
                patient_id: row.id("patient_id")?,
                doctor_id: row.id("doctor_id")?,
                room: row.text("room_name")?,
                starts_at: row.timestamp("starts_at")?,
                finishes_at: row.timestamp("finishes_at")?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "doctors" => Ok(Command::DeleteDoctors { id: where_id(&delete.selection)? }),
        "patients" => Ok(Command::DeletePatients { id: where_id(&delete.selection)? }),
        "rooms" => Ok(Command::DeleteRooms { name: where_room(&delete.selection)? }),
        "appointments" => Ok(Command::DeleteAppointments { id: where_id(&delete.selection)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "doctors" => Ok(Command::SelectDoctors { id: where_id(&select.selection)? }),
        "patients" => Ok(Command::SelectPatients { id: where_id(&select.selection)? }),
        "rooms" => Ok(Command::SelectRooms { name: where_room(&select.selection)? }),
        "appointments" => Ok(Command::SelectAppointments { id: where_id(&select.selection)? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column binding ────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row<'a> {
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == col).map(|(_, e)| *e)
    }

    fn text(&self, col: &str) -> Result<Option<String>, SqlError> {
        match self.get(col) {
            Some(expr) => literal(expr),
            None => Ok(None),
        }
    }

    fn int(&self, col: &'static str) -> Result<Option<i32>, SqlError> {
        let Some(s) = self.text(col)? else { return Ok(None) };
        s.parse()
            .map(Some)
            .map_err(|_| SqlError::InvalidValue(format!("{col}: expected integer, got {s}")))
    }

    fn id(&self, col: &'static str) -> Result<Option<RecordId>, SqlError> {
        let Some(s) = self.text(col)? else { return Ok(None) };
        parse_id(col, &s).map(Some)
    }

    fn timestamp(&self, col: &'static str) -> Result<Option<Ms>, SqlError> {
        let Some(s) = self.text(col)? else { return Ok(None) };
        parse_timestamp(&s)
            .or_else(|| s.parse::<Ms>().ok())
            .map(Some)
            .ok_or_else(|| SqlError::InvalidValue(format!("{col}: bad timestamp {s:?}")))
    }
}

/// Pair values with their columns. Without an explicit column list the
/// values are positional in `known` order.
fn bind_columns<'a>(
    table: &'static str,
    known: &[&'static str],
    columns: &[ast::Ident],
    values: &'a [Expr],
) -> Result<Row<'a>, SqlError> {
    if columns.is_empty() {
        if values.len() > known.len() {
            return Err(SqlError::WrongArity(table, known.len(), values.len()));
        }
        return Ok(Row {
            cells: known.iter().copied().zip(values.iter()).collect(),
        });
    }

    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let mut cells = Vec::with_capacity(columns.len());
    for (ident, expr) in columns.iter().zip(values) {
        let name = ident.value.to_lowercase();
        let col = known
            .iter()
            .copied()
            .find(|k| *k == name)
            .ok_or(SqlError::UnknownColumn(name))?;
        cells.push((col, expr));
    }
    Ok(Row { cells })
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// `WHERE <column> = <literal>`, or nothing. Any other filter is rejected
/// rather than ignored, so a typo never widens a DELETE to the whole table.
fn where_eq(selection: &Option<Expr>, column: &'static str) -> Result<Option<String>, SqlError> {
    let Some(sel) = selection else { return Ok(None) };
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => {
            literal(right)?.map(Some).ok_or(SqlError::BadFilter(column))
        }
        Expr::Nested(inner) => where_eq(&Some((**inner).clone()), column),
        _ => Err(SqlError::BadFilter(column)),
    }
}

fn where_id(selection: &Option<Expr>) -> Result<Option<RecordId>, SqlError> {
    match where_eq(selection, "id")? {
        Some(s) => parse_id("id", &s).map(Some),
        None => Ok(None),
    }
}

fn where_room(selection: &Option<Expr>) -> Result<Option<String>, SqlError> {
    where_eq(selection, "room_name")
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// The textual content of a literal; `None` for NULL.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!("expected literal, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        match literal(expr)? {
            Some(s) => Ok(Some(format!("-{s}"))),
            None => Err(SqlError::Parse("cannot negate NULL".into())),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_id(col: &'static str, s: &str) -> Result<RecordId, SqlError> {
    s.trim()
        .parse()
        .map_err(|_| SqlError::InvalidValue(format!("{col}: bad id {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("only `{0} = <value>` is supported in WHERE")]
    BadFilter(&'static str),
    /// Well-formed SQL carrying a value that cannot be a field of the record.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_insert_doctor() {
        let sql = "INSERT INTO doctors (first_name, last_name, age, email) VALUES ('Marcos', 'Corporan', 28, 'Mcorporan@hospital.com')";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertDoctor(c) => {
                assert_eq!(c.first_name.as_deref(), Some("Marcos"));
                assert_eq!(c.last_name.as_deref(), Some("Corporan"));
                assert_eq!(c.age, 28);
                assert_eq!(c.email.as_deref(), Some("Mcorporan@hospital.com"));
            }
            _ => panic!("expected InsertDoctor, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_patient_positional_and_partial() {
        let cmd = parse_sql("INSERT INTO patients VALUES ('Juana', 'Sosa')").unwrap();
        match cmd {
            Command::InsertPatient(c) => {
                assert_eq!(c.first_name.as_deref(), Some("Juana"));
                assert_eq!(c.age, 0);
                assert_eq!(c.email, None);
            }
            _ => panic!("expected InsertPatient, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_contact_with_nulls() {
        let cmd = parse_sql("INSERT INTO doctors (email, age) VALUES (NULL, NULL)").unwrap();
        assert_eq!(cmd, Command::InsertDoctor(Contact::default()));
    }

    #[test]
    fn parse_insert_room() {
        let cmd = parse_sql("INSERT INTO rooms (room_name) VALUES ('gynecology')").unwrap();
        assert_eq!(cmd, Command::InsertRoom { name: "gynecology".into() });
        assert!(matches!(
            parse_sql("INSERT INTO rooms VALUES (NULL)"),
            Err(SqlError::InvalidValue(_))
        ));
    }

    #[test]
    fn parse_insert_appointment() {
        let sql = "INSERT INTO appointments (patient_id, doctor_id, room_name, starts_at, finishes_at) \
                   VALUES (1, 2, 'gynecology', '19:30 22/10/2023', '20:30 22/10/2023')";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertAppointment(d) => {
                assert_eq!(d.patient_id, Some(1));
                assert_eq!(d.doctor_id, Some(2));
                assert_eq!(d.room.as_deref(), Some("gynecology"));
                assert_eq!(d.starts_at, Some(1_698_003_000_000));
                assert_eq!(d.finishes_at, Some(1_698_006_600_000));
            }
            _ => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_appointment_iso_and_millis() {
        let sql = "INSERT INTO appointments (doctor_id, room_name, starts_at, finishes_at) \
                   VALUES ('3', 'gynecology', '2023-10-22T19:30:00', 1698006600000)";
        let Command::InsertAppointment(d) = parse_sql(sql).unwrap() else {
            panic!("expected InsertAppointment");
        };
        assert_eq!(d.patient_id, None);
        assert_eq!(d.doctor_id, Some(3));
        assert_eq!(d.starts_at, Some(1_698_003_000_000));
        assert_eq!(d.finishes_at, Some(1_698_006_600_000));
    }

    #[test]
    fn missing_appointment_fields_stay_absent() {
        // Structural checks belong to the engine; the parser only binds.
        let sql = "INSERT INTO appointments (room_name) VALUES ('gynecology')";
        let Command::InsertAppointment(d) = parse_sql(sql).unwrap() else {
            panic!("expected InsertAppointment");
        };
        assert_eq!(d.doctor_id, None);
        assert_eq!(d.starts_at, None);
        assert_eq!(d.finishes_at, None);
    }

    #[test]
    fn bad_timestamp_is_invalid_value() {
        let sql = "INSERT INTO appointments (starts_at) VALUES ('tomorrow-ish')";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn bad_id_is_invalid_value() {
        let sql = "INSERT INTO appointments (doctor_id) VALUES ('abc')";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
        let sql = "INSERT INTO appointments (doctor_id) VALUES (-1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn arity_and_column_errors() {
        assert!(matches!(
            parse_sql("INSERT INTO rooms VALUES ('a', 'b')"),
            Err(SqlError::WrongArity("rooms", 1, 2))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO rooms (room_name) VALUES ('a', 'b')"),
            Err(SqlError::WrongArity(..))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO rooms (floor) VALUES ('a')"),
            Err(SqlError::UnknownColumn(c)) if c == "floor"
        ));
    }

    #[test]
    fn multi_row_insert_rejected() {
        let sql = "INSERT INTO rooms VALUES ('a'), ('b')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM appointments").unwrap(),
            Command::SelectAppointments { id: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM doctors WHERE id = 7").unwrap(),
            Command::SelectDoctors { id: Some(7) }
        );
        assert_eq!(
            parse_sql("select * from Patients where id = '4'").unwrap(),
            Command::SelectPatients { id: Some(4) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM rooms WHERE room_name = 'gynecology'").unwrap(),
            Command::SelectRooms { name: Some("gynecology".into()) }
        );
    }

    #[test]
    fn parse_deletes() {
        assert_eq!(
            parse_sql("DELETE FROM appointments").unwrap(),
            Command::DeleteAppointments { id: None }
        );
        assert_eq!(
            parse_sql("DELETE FROM appointments WHERE id = 3").unwrap(),
            Command::DeleteAppointments { id: Some(3) }
        );
        assert_eq!(
            parse_sql("DELETE FROM rooms WHERE room_name = 'dermatology'").unwrap(),
            Command::DeleteRooms { name: Some("dermatology".into()) }
        );
    }

    #[test]
    fn unsupported_filter_is_not_ignored() {
        assert!(matches!(
            parse_sql("DELETE FROM doctors WHERE age > 30"),
            Err(SqlError::BadFilter("id"))
        ));
        assert!(matches!(
            parse_sql("DELETE FROM rooms WHERE id = 1"),
            Err(SqlError::BadFilter("room_name"))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM nurses"),
            Err(SqlError::UnknownTable(t)) if t == "nurses"
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
