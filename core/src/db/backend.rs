//! Execution backend over a PostgreSQL connection pool, behind a mockable
//! trait so the proxy can be tested without a database.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use color_eyre::Report;
use deadpool_postgres::Pool;
use mockall::automock;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_postgres::{
	types::{to_sql_checked, IsNull, ToSql, Type},
	Row, Transaction,
};
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BackendError {
	#[error("Function not found: {0}")]
	NotFound(String),
	/// Backend diagnostic, safe to surface to the caller.
	#[error("{0}")]
	Execution(String),
	#[error("Database unavailable")]
	Unavailable(#[source] Report),
}

/// What the proxy needs from a database: parameter names of a function and
/// transactional execution of a call.
#[automock]
#[async_trait]
pub trait Backend: Send + Sync {
	/// Ordered input parameter names of `schema.function`, or `None` when
	/// no such function exists.
	async fn signature(
		&self,
		schema: &str,
		function: &str,
	) -> Result<Option<Vec<String>>, BackendError>;

	/// Runs `schema.function(args...)` in its own transaction and shapes
	/// the result set into a JSON value.
	async fn call(
		&self,
		schema: &str,
		function: &str,
		args: Vec<Value>,
	) -> Result<Value, BackendError>;
}

const SIGNATURE_SQL: &str = "
SELECT array_agg(p.parameter_name ORDER BY p.ordinal_position)
  FILTER (WHERE p.parameter_name IS NOT NULL) AS parameter_names
FROM information_schema.routines r
LEFT JOIN information_schema.parameters p
  ON p.specific_schema = r.specific_schema
 AND p.specific_name = r.specific_name
 AND p.parameter_mode IN ('IN', 'INOUT')
WHERE r.routine_schema = $1
  AND r.routine_name = $2
GROUP BY r.specific_name
ORDER BY r.specific_name
";

pub struct PgBackend {
	pool: Pool,
}

impl PgBackend {
	pub fn new(pool: Pool) -> Self {
		PgBackend { pool }
	}
}

#[async_trait]
impl Backend for PgBackend {
	async fn signature(
		&self,
		schema: &str,
		function: &str,
	) -> Result<Option<Vec<String>>, BackendError> {
		let client = self
			.pool
			.get()
			.await
			.map_err(|error| BackendError::Unavailable(Report::new(error)))?;
		let rows = client
			.query(SIGNATURE_SQL, &[&schema, &function])
			.await
			.map_err(|error| BackendError::Execution(db_message(&error)))?;
		// Overloads are not distinguishable through information_schema,
		// the first routine by specific_name wins.
		match rows.first() {
			None => Ok(None),
			Some(row) => {
				let names: Option<Vec<String>> = row
					.try_get(0)
					.map_err(|error| BackendError::Execution(db_message(&error)))?;
				Ok(Some(names.unwrap_or_default()))
			},
		}
	}

	async fn call(
		&self,
		schema: &str,
		function: &str,
		args: Vec<Value>,
	) -> Result<Value, BackendError> {
		let mut client = self
			.pool
			.get()
			.await
			.map_err(|error| BackendError::Unavailable(Report::new(error)))?;
		let transaction = client
			.transaction()
			.await
			.map_err(|error| BackendError::Execution(db_message(&error)))?;

		let placeholders = (1..=args.len())
			.map(|i| format!("${i}"))
			.collect::<Vec<_>>()
			.join(", ");
		let sql = format!("SELECT * FROM {schema}.{function}({placeholders})");
		debug!(%sql, args = args.len(), "Calling stored function");

		match run(&transaction, &sql, &args).await {
			Ok(value) => {
				transaction
					.commit()
					.await
					.map_err(|error| BackendError::Execution(db_message(&error)))?;
				Ok(value)
			},
			Err(failure) => {
				// Explicit rollback keeps the pooled connection usable for
				// the next call.
				if let Err(rollback) = transaction.rollback().await {
					error!(%rollback, "Cannot roll back failed transaction");
				}
				Err(failure)
			},
		}
	}
}

async fn run(
	transaction: &Transaction<'_>,
	sql: &str,
	args: &[Value],
) -> Result<Value, BackendError> {
	// Preparing first lets the driver report the declared parameter types,
	// which is what PgJson dispatches on.
	let statement = transaction
		.prepare(sql)
		.await
		.map_err(|error| BackendError::Execution(db_message(&error)))?;
	let params: Vec<PgJson> = args.iter().cloned().map(PgJson).collect();
	let param_refs: Vec<&(dyn ToSql + Sync)> =
		params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
	let rows = transaction
		.query(&statement, &param_refs)
		.await
		.map_err(|error| BackendError::Execution(db_message(&error)))?;
	rows_to_value(&rows)
}

/// One row, one column yields that scalar; no rows yield null; anything
/// else becomes an array of column-name → value objects.
fn rows_to_value(rows: &[Row]) -> Result<Value, BackendError> {
	match rows {
		[] => Ok(Value::Null),
		[row] if row.columns().len() == 1 => column_value(row, 0),
		rows => rows
			.iter()
			.map(row_object)
			.collect::<Result<Vec<Value>, BackendError>>()
			.map(Value::Array),
	}
}

fn row_object(row: &Row) -> Result<Value, BackendError> {
	let mut object = Map::new();
	for index in 0..row.columns().len() {
		let name = row.columns()[index].name().to_string();
		object.insert(name, column_value(row, index)?);
	}
	Ok(Value::Object(object))
}

fn column_value(row: &Row, index: usize) -> Result<Value, BackendError> {
	let column_type = row.columns()[index].type_().clone();
	let value = match column_type {
		Type::BOOL => json!(get::<bool>(row, index)?),
		Type::INT2 => json!(get::<i16>(row, index)?),
		Type::INT4 => json!(get::<i32>(row, index)?),
		Type::INT8 => json!(get::<i64>(row, index)?),
		Type::FLOAT4 => json!(get::<f32>(row, index)?),
		Type::FLOAT8 => json!(get::<f64>(row, index)?),
		Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
			json!(get::<String>(row, index)?)
		},
		Type::JSON | Type::JSONB => get::<Value>(row, index)?.unwrap_or(Value::Null),
		Type::UUID => json!(get::<Uuid>(row, index)?),
		Type::BYTEA => json!(get::<Vec<u8>>(row, index)?.map(|bytes| BASE64.encode(bytes))),
		Type::TIMESTAMP => json!(get::<NaiveDateTime>(row, index)?
			.map(|value| value.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
		Type::TIMESTAMPTZ => json!(get::<DateTime<Utc>>(row, index)?
			.map(|value| value.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string())),
		Type::DATE => {
			json!(get::<NaiveDate>(row, index)?.map(|value| value.format("%Y-%m-%d").to_string()))
		},
		Type::TIME => {
			json!(get::<NaiveTime>(row, index)?.map(|value| value.format("%H:%M:%S%.f").to_string()))
		},
		other => {
			return Err(BackendError::Execution(format!(
				"Unsupported column type: {other}"
			)))
		},
	};
	Ok(value)
}

fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
	row: &'a Row,
	index: usize,
) -> Result<Option<T>, BackendError> {
	row.try_get(index)
		.map_err(|error| BackendError::Execution(db_message(&error)))
}

/// Prefers the server-side diagnostic over the driver's wrapper text.
fn db_message(error: &tokio_postgres::Error) -> String {
	match error.as_db_error() {
		Some(db_error) => db_error.message().to_string(),
		None => error.to_string(),
	}
}

/// JSON value encoded into the declared type of a prepared-statement
/// parameter. Nulls pass through for every type.
#[derive(Debug)]
pub(crate) struct PgJson(pub Value);

type ToSqlError = Box<dyn std::error::Error + Sync + Send>;

impl PgJson {
	fn as_bool(&self) -> Result<bool, ToSqlError> {
		self.0.as_bool().ok_or_else(|| self.mismatch("boolean"))
	}

	fn as_i64(&self) -> Result<i64, ToSqlError> {
		self.0.as_i64().ok_or_else(|| self.mismatch("integer"))
	}

	fn as_f64(&self) -> Result<f64, ToSqlError> {
		self.0.as_f64().ok_or_else(|| self.mismatch("number"))
	}

	fn as_str(&self) -> Result<&str, ToSqlError> {
		self.0.as_str().ok_or_else(|| self.mismatch("string"))
	}

	fn mismatch(&self, expected: &str) -> ToSqlError {
		format!("Expected {expected} parameter, got {}", self.0).into()
	}
}

impl ToSql for PgJson {
	fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, ToSqlError> {
		if self.0.is_null() {
			return Ok(IsNull::Yes);
		}
		match *ty {
			Type::BOOL => self.as_bool()?.to_sql(ty, out),
			Type::INT2 => i16::try_from(self.as_i64()?)?.to_sql(ty, out),
			Type::INT4 => i32::try_from(self.as_i64()?)?.to_sql(ty, out),
			Type::INT8 => self.as_i64()?.to_sql(ty, out),
			Type::FLOAT4 => (self.as_f64()? as f32).to_sql(ty, out),
			Type::FLOAT8 => self.as_f64()?.to_sql(ty, out),
			Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
				self.as_str()?.to_sql(ty, out)
			},
			Type::JSON | Type::JSONB => self.0.to_sql(ty, out),
			Type::UUID => Uuid::parse_str(self.as_str()?)?.to_sql(ty, out),
			Type::BYTEA => BASE64.decode(self.as_str()?)?.to_sql(ty, out),
			Type::TIMESTAMP => parse_timestamp(self.as_str()?)?.to_sql(ty, out),
			Type::TIMESTAMPTZ => parse_timestamp(self.as_str()?)?
				.and_utc()
				.to_sql(ty, out),
			Type::DATE => NaiveDate::parse_from_str(self.as_str()?, "%Y-%m-%d")?.to_sql(ty, out),
			Type::TIME => {
				NaiveTime::parse_from_str(self.as_str()?, "%H:%M:%S%.f")?.to_sql(ty, out)
			},
			ref other => Err(format!("Unsupported parameter type: {other}").into()),
		}
	}

	fn accepts(_ty: &Type) -> bool {
		true
	}

	to_sql_checked!();
}

/// Accepts both `"2024-01-02 03:04:05"` and the ISO `T` separator, with
/// optional fractional seconds and a trailing offset for timestamptz input.
fn parse_timestamp(text: &str) -> Result<NaiveDateTime, ToSqlError> {
	if let Ok(with_offset) = DateTime::parse_from_rfc3339(text) {
		return Ok(with_offset.naive_utc());
	}
	let normalized = text.replacen('T', " ", 1);
	Ok(NaiveDateTime::parse_from_str(
		&normalized,
		"%Y-%m-%d %H:%M:%S%.f",
	)?)
}
