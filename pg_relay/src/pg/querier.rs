use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::types::{to_sql_checked, Format, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::warn;

use crate::conversions::cell::CellValue;

use super::{parse_config, PgUrlError, Querier, QuerierError, Query, Row};

impl ToSql for CellValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            CellValue::Null => Ok(IsNull::Yes),
            CellValue::Bool(b) => b.to_sql(ty, out),
            CellValue::Int(i) => match *ty {
                Type::INT2 => (*i as i16).to_sql(ty, out),
                Type::INT4 => (*i as i32).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            CellValue::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            CellValue::String(s) => s.to_sql(ty, out),
            CellValue::Bytes { data, .. } => data.as_slice().to_sql(ty, out),
            CellValue::Timestamp(ts) => match *ty {
                Type::TIMESTAMP => ts.naive_utc().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            CellValue::Json(v) => v.to_sql(ty, out),
            // hstore and arrays go over the wire in their text form; the
            // server parses the literal against the column's real type.
            CellValue::Hstore(pairs) => {
                out.extend_from_slice(encode_hstore_text(pairs).as_bytes());
                Ok(IsNull::No)
            }
            CellValue::Array(items) => {
                out.extend_from_slice(encode_array_text(items).as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        match self {
            CellValue::Hstore(_) | CellValue::Array(_) => Format::Text,
            _ => Format::Binary,
        }
    }

    to_sql_checked!();
}

fn escape_double_quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `"k"=>"v", "k2"=>NULL`, the text form [`CellDecoder`] parses back.
fn encode_hstore_text(pairs: &[(String, Option<String>)]) -> String {
    let parts: Vec<String> = pairs
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Some(value) => escape_double_quoted(value),
                None => "NULL".to_string(),
            };
            format!("{}=>{}", escape_double_quoted(key), value)
        })
        .collect();
    parts.join(", ")
}

/// `{a,"c,d",NULL}`, the text array literal [`CellDecoder`] parses back.
fn encode_array_text(items: &[CellValue]) -> String {
    let parts: Vec<String> = items.iter().map(encode_array_element).collect();
    format!("{{{}}}", parts.join(","))
}

fn encode_array_element(value: &CellValue) -> String {
    match value {
        CellValue::Null => "NULL".to_string(),
        CellValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        CellValue::Int(i) => i.to_string(),
        CellValue::Float(f) => f.to_string(),
        CellValue::String(s) => escape_double_quoted(s),
        CellValue::Timestamp(ts) => escape_double_quoted(&ts.to_rfc3339()),
        CellValue::Json(v) => escape_double_quoted(&v.to_string()),
        CellValue::Bytes { data, .. } => {
            let mut hex = String::with_capacity(2 + data.len() * 2);
            hex.push_str("\\x");
            for b in data {
                hex.push_str(&format!("{b:02x}"));
            }
            escape_double_quoted(&hex)
        }
        CellValue::Hstore(pairs) => escape_double_quoted(&encode_hstore_text(pairs)),
        CellValue::Array(inner) => encode_array_text(inner),
    }
}

fn cell_from_row(row: &tokio_postgres::Row, index: usize) -> Result<CellValue, QuerierError> {
    let column = &row.columns()[index];
    let value = match *column.type_() {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(index)
            .map(|v| v.map(CellValue::Bool)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .map(|v| v.map(|v| CellValue::Int(v as i64))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)
            .map(|v| v.map(|v| CellValue::Int(v as i64))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(index)
            .map(|v| v.map(CellValue::Int)),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .map(|v| v.map(|v| CellValue::Float(v as f64))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(index)
            .map(|v| v.map(CellValue::Float)),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(index)
            .map(|v| v.map(CellValue::Timestamp)),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(index)
            .map(|v| v.map(|naive| CellValue::Timestamp(naive.and_utc()))),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)
            .map(|v| v.map(CellValue::Json)),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(index).map(|v| {
            v.map(|data| CellValue::Bytes {
                oid: Type::BYTEA.oid(),
                data,
            })
        }),
        _ => row
            .try_get::<_, Option<String>>(index)
            .map(|v| v.map(CellValue::String)),
    };

    value
        .map(|v| v.unwrap_or(CellValue::Null))
        .map_err(|e| QuerierError::Query(format!("decoding column {}: {e}", column.name())))
}

fn rows_to_rows(rows: Vec<tokio_postgres::Row>) -> Result<Vec<Row>, QuerierError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            values.push((
                row.columns()[index].name().to_string(),
                cell_from_row(&row, index)?,
            ));
        }
        out.push(Row { values });
    }
    Ok(out)
}

fn map_pg_error(err: tokio_postgres::Error) -> QuerierError {
    if err.is_closed() {
        QuerierError::Connection(err.to_string())
    } else {
        QuerierError::Query(err.to_string())
    }
}

/// [`Querier`] over a plain tokio_postgres connection. Serves the postgres
/// sink, the postgres schema-log store and the snapshot generator.
pub struct PgQuerier {
    // The transaction API needs exclusive access to the client.
    client: Mutex<Client>,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgQuerier {
    pub async fn connect(url: &str) -> Result<Self, PgUrlError> {
        let mut config = parse_config(url)?;
        if config.get_connect_timeout().is_none() {
            config.connect_timeout(std::time::Duration::from_secs(30));
        }
        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("postgres connection closed: {e}");
            }
        });

        Ok(Self {
            client: Mutex::new(client),
            connection_task,
        })
    }

    fn params_of(query: &Query) -> Vec<&(dyn ToSql + Sync)> {
        query
            .params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect()
    }
}

#[async_trait]
impl Querier for PgQuerier {
    async fn query(&self, query: &Query) -> Result<Vec<Row>, QuerierError> {
        let client = self.client.lock().await;
        let rows = client
            .query(&query.sql, &Self::params_of(query))
            .await
            .map_err(map_pg_error)?;
        rows_to_rows(rows)
    }

    async fn execute(&self, query: &Query) -> Result<u64, QuerierError> {
        let client = self.client.lock().await;
        client
            .execute(&query.sql, &Self::params_of(query))
            .await
            .map_err(map_pg_error)
    }

    async fn execute_in_tx(&self, queries: &[Query]) -> Result<(), QuerierError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(map_pg_error)?;
        for query in queries {
            tx.execute(&query.sql, &Self::params_of(query))
                .await
                .map_err(map_pg_error)?;
        }
        tx.commit().await.map_err(map_pg_error)
    }

    async fn close(&self) -> Result<(), QuerierError> {
        self.connection_task.abort();
        Ok(())
    }
}

impl Drop for PgQuerier {
    fn drop(&mut self) {
        // The connection task must not outlive the client it drives.
        self.connection_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::cell::CellDecoder;

    fn encoded(value: &CellValue) -> bytes::BytesMut {
        let mut buf = bytes::BytesMut::new();
        // hstore has no fixed oid and arrays carry their own element
        // syntax, so the declared type is irrelevant to these arms.
        let is_null = value.to_sql(&Type::TEXT, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::No));
        buf
    }

    #[test]
    fn hstore_params_encode_as_text_and_round_trip() {
        let value = CellValue::Hstore(vec![
            ("a".to_string(), Some("1, x".to_string())),
            ("quo\"ted".to_string(), Some("back\\slash".to_string())),
            ("b".to_string(), None),
        ]);

        assert!(matches!(
            value.encode_format(&Type::TEXT),
            Format::Text
        ));

        let buf = encoded(&value);
        let decoder = CellDecoder::new(Some(90000));
        assert_eq!(decoder.decode_text(90000, &buf).unwrap(), value);
    }

    #[test]
    fn array_params_encode_as_postgres_literals() {
        let value = CellValue::Array(vec![
            CellValue::Int(1),
            CellValue::Null,
            CellValue::Int(3),
        ]);

        let buf = encoded(&value);
        assert_eq!(&buf[..], &b"{1,NULL,3}"[..]);

        let decoder = CellDecoder::default();
        assert_eq!(
            decoder.decode_text(Type::INT8_ARRAY.oid(), &buf).unwrap(),
            value
        );
    }

    #[test]
    fn text_arrays_round_trip_commas_and_quotes() {
        let value = CellValue::Array(vec![
            CellValue::String("c,d".to_string()),
            CellValue::String("NULL".to_string()),
            CellValue::Null,
            CellValue::String("quo\"te".to_string()),
        ]);

        let buf = encoded(&value);
        let decoder = CellDecoder::default();
        assert_eq!(
            decoder.decode_text(Type::TEXT_ARRAY.oid(), &buf).unwrap(),
            value
        );
    }

    #[test]
    fn scalar_params_stay_binary() {
        assert!(matches!(
            CellValue::Int(1).encode_format(&Type::INT8),
            Format::Binary
        ));
    }
}
