//! Multi-format parser.
//!
//! Detects whether a raw payload is JSON or delimited CSV, coerces each field
//! against the topic's `CanonicalSchema`, and extracts the close-of-business
//! (COB) partition value. Never talks to the schema registry itself — the
//! caller resolves and caches the `CanonicalSchema` (see `ingest-io::schema`)
//! and hands it in, so this module stays synchronous and trivially testable.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use ingest_core::{CanonicalSchema, DetectedFormat, FailureKind, FieldType, FieldValue, IngestError, Record};
use serde_json::Value as JsonValue;

/// Result of parsing one raw payload. A single payload can expand into more
/// than one `ParsedRecord` for multi-row CSV bodies (open question:
/// CSV "first record per payload" is the default; multi-row is opt-in per
/// topic via `allow_multi_row_csv`).
pub type ParseOutcome = Vec<ingest_core::ParsedRecord>;

pub fn parse_record(
    record: &Record,
    schema: &CanonicalSchema,
    cob_field: &str,
    cob_lookback_days: i64,
    allow_multi_row_csv: bool,
    allowed_formats: &[DetectedFormat],
) -> Result<ParseOutcome, IngestError> {
    let format = detect_format(&record.raw_payload);
    if !allowed_formats.is_empty() && !allowed_formats.contains(&format) {
        return Err(IngestError::new(
            FailureKind::Parse,
            format!("detected format {format:?} is not in this topic's allowed formats {allowed_formats:?}"),
        ));
    }
    let rows: Vec<BTreeMap<String, JsonValue>> = match format {
        DetectedFormat::Json => vec![parse_json_object(&record.raw_payload)?],
        DetectedFormat::Csv => parse_csv_rows(&record.raw_payload, schema, allow_multi_row_csv)?,
        DetectedFormat::Binary => {
            return Err(IngestError::new(
                FailureKind::Parse,
                "payload is neither valid JSON nor delimited text".to_string(),
            ))
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let fields = coerce_row(&row, schema)?;
        let cob_date = extract_cob(&fields, cob_field, cob_lookback_days)?;
        out.push(ingest_core::ParsedRecord {
            fields,
            detected_format: format,
            cob_date,
            business_timestamp: None,
            enrichment: BTreeMap::new(),
            source_ref: record.source_ref(),
            correlation_id: record.correlation_id.clone(),
            arrival_timestamp: record.arrival_timestamp,
        });
    }
    Ok(out)
}

fn detect_format(payload: &[u8]) -> DetectedFormat {
    let trimmed = payload.iter().position(|b| !b.is_ascii_whitespace());
    match trimmed.map(|i| payload[i]) {
        Some(b'{') | Some(b'[') => {
            if serde_json::from_slice::<JsonValue>(payload).is_ok() {
                DetectedFormat::Json
            } else {
                DetectedFormat::Binary
            }
        }
        Some(_) if std::str::from_utf8(payload).is_ok() => DetectedFormat::Csv,
        _ => DetectedFormat::Binary,
    }
}

fn parse_json_object(payload: &[u8]) -> Result<BTreeMap<String, JsonValue>, IngestError> {
    let value: JsonValue = serde_json::from_slice(payload)
        .map_err(|e| IngestError::wrap(FailureKind::Parse, "invalid JSON payload", e))?;
    match value {
        JsonValue::Object(map) => Ok(map.into_iter().collect()),
        other => Err(IngestError::new(
            FailureKind::Parse,
            format!("expected a JSON object at the payload root, got {other}"),
        )),
    }
}

fn parse_csv_rows(
    payload: &[u8],
    schema: &CanonicalSchema,
    allow_multi_row_csv: bool,
) -> Result<Vec<BTreeMap<String, JsonValue>>, IngestError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| IngestError::wrap(FailureKind::Parse, "CSV payload is not valid UTF-8", e))?;
    let mut lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return Err(IngestError::new(FailureKind::Parse, "empty CSV payload".to_string()));
    }
    let column_names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();

    // A leading line that's exactly the declared column names, in order, is a
    // header: strip it before counting data rows so a headered single-record
    // payload isn't mistaken for two rows (and the header itself never gets
    // coerced as data).
    if lines.first().map(|first| first.split(',').map(str::trim).collect::<Vec<_>>()) == Some(column_names.clone()) {
        lines.remove(0);
    }
    if lines.is_empty() {
        return Err(IngestError::new(
            FailureKind::Parse,
            "CSV payload has a header row but no data rows".to_string(),
        ));
    }
    if lines.len() > 1 && !allow_multi_row_csv {
        return Err(IngestError::new(
            FailureKind::Parse,
            format!("payload contains {} rows but multi-row CSV is not enabled for this topic", lines.len()),
        ));
    }
    lines
        .iter()
        .map(|line| {
            let values: Vec<&str> = line.split(',').collect();
            if values.len() != column_names.len() {
                return Err(IngestError::new(
                    FailureKind::Parse,
                    format!(
                        "CSV row has {} columns, schema expects {}",
                        values.len(),
                        column_names.len()
                    ),
                ));
            }
            Ok(column_names
                .iter()
                .zip(values)
                .map(|(name, raw)| (name.to_string(), JsonValue::String(raw.trim().to_string())))
                .collect())
        })
        .collect()
}

fn coerce_row(
    row: &BTreeMap<String, JsonValue>,
    schema: &CanonicalSchema,
) -> Result<BTreeMap<String, FieldValue>, IngestError> {
    let mut fields = BTreeMap::new();
    for def in &schema.fields {
        match row.get(&def.name) {
            None | Some(JsonValue::Null) => {
                if def.required {
                    return Err(IngestError::new(
                        FailureKind::Schema,
                        format!("required field '{}' missing", def.name),
                    ));
                }
                fields.insert(def.name.clone(), FieldValue::Null);
            }
            Some(value) => {
                let coerced = coerce_value(value, &def.field_type).map_err(|msg| {
                    IngestError::new(FailureKind::Schema, format!("field '{}': {msg}", def.name))
                })?;
                fields.insert(def.name.clone(), coerced);
            }
        }
    }
    Ok(fields)
}

fn coerce_value(value: &JsonValue, ty: &FieldType) -> Result<FieldValue, String> {
    match (ty, value) {
        (FieldType::String, JsonValue::String(s)) => Ok(FieldValue::String(s.clone())),
        (FieldType::String, other) => Ok(FieldValue::String(other.to_string())),

        (FieldType::Int32, JsonValue::Number(n)) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(FieldValue::Int32)
            .ok_or_else(|| format!("{n} does not fit in int32")),
        (FieldType::Int32, JsonValue::String(s)) => {
            s.parse::<i32>().map(FieldValue::Int32).map_err(|e| e.to_string())
        }

        (FieldType::Int64, JsonValue::Number(n)) => {
            n.as_i64().map(FieldValue::Int64).ok_or_else(|| format!("{n} is not an integer"))
        }
        (FieldType::Int64, JsonValue::String(s)) => {
            s.parse::<i64>().map(FieldValue::Int64).map_err(|e| e.to_string())
        }

        (FieldType::Double, JsonValue::Number(n)) => {
            n.as_f64().map(FieldValue::Double).ok_or_else(|| "not a finite number".to_string())
        }
        (FieldType::Double, JsonValue::String(s)) => s
            .parse::<f64>()
            .map_err(|e| e.to_string())
            .and_then(|v| if v.is_finite() { Ok(v) } else { Err(format!("'{s}' is not a finite number")) })
            .map(FieldValue::Double),

        (FieldType::Boolean, JsonValue::Bool(b)) => Ok(FieldValue::Boolean(*b)),
        (FieldType::Boolean, JsonValue::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(FieldValue::Boolean(true)),
            "false" | "0" => Ok(FieldValue::Boolean(false)),
            _ => Err(format!("'{s}' is not a boolean")),
        },

        (FieldType::TimestampMillis, JsonValue::Number(n)) => {
            n.as_i64().map(FieldValue::TimestampMillis).ok_or_else(|| "not an epoch-millis integer".to_string())
        }
        (FieldType::TimestampMillis, JsonValue::String(s)) => parse_timestamp_millis(s),

        (FieldType::Enum(allowed), JsonValue::String(s)) => {
            if allowed.iter().any(|a| a == s) {
                Ok(FieldValue::Enum(s.clone()))
            } else {
                Err(format!("'{s}' is not one of {allowed:?}"))
            }
        }

        (FieldType::Array(inner), JsonValue::Array(items)) => {
            let coerced: Result<Vec<_>, _> = items.iter().map(|v| coerce_value(v, inner)).collect();
            Ok(FieldValue::Array(coerced?))
        }

        (FieldType::Map(_, value_ty), JsonValue::Object(map)) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), coerce_value(v, value_ty)?);
            }
            Ok(FieldValue::Map(out))
        }

        (FieldType::Struct(children), JsonValue::Object(map)) => {
            let mut out = BTreeMap::new();
            for child in children {
                match map.get(&child.name) {
                    None | Some(JsonValue::Null) if !child.required => {
                        out.insert(child.name.clone(), FieldValue::Null);
                    }
                    None => return Err(format!("struct field '{}' missing", child.name)),
                    Some(v) => {
                        out.insert(child.name.clone(), coerce_value(v, &child.field_type)?);
                    }
                }
            }
            Ok(FieldValue::Struct(out))
        }

        (_, JsonValue::Null) => Ok(FieldValue::Null),
        (expected, got) => Err(format!("expected {expected:?}, got {got}")),
    }
}

fn parse_timestamp_millis(s: &str) -> Result<FieldValue, String> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(FieldValue::TimestampMillis(dt.timestamp_millis()));
    }
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(FieldValue::TimestampMillis(ms));
    }
    // No offset given: a local date-time with no zone is assumed UTC.
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Ok(FieldValue::TimestampMillis(naive.and_utc().timestamp_millis()));
        }
    }
    Err(format!("'{s}' is not a timestamp"))
}

fn extract_cob(
    fields: &BTreeMap<String, FieldValue>,
    cob_field: &str,
    lookback_days: i64,
) -> Result<NaiveDate, IngestError> {
    let raw = fields.get(cob_field).ok_or_else(|| {
        IngestError::new(FailureKind::Cob, format!("COB field '{cob_field}' missing"))
    })?;
    let date = match raw {
        FieldValue::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| IngestError::wrap(FailureKind::Cob, format!("unparseable COB date '{s}'"), e))?,
        FieldValue::TimestampMillis(ms) => {
            chrono::DateTime::from_timestamp_millis(*ms)
                .ok_or_else(|| IngestError::new(FailureKind::Cob, "COB timestamp out of range".to_string()))?
                .date_naive()
        }
        other => {
            return Err(IngestError::new(
                FailureKind::Cob,
                format!("COB field has unsupported type for date extraction: {other:?}"),
            ))
        }
    };

    let today = Utc::now().date_naive();
    let delta = (today - date).num_days();
    if delta < 0 {
        return Err(IngestError::new(
            FailureKind::Cob,
            format!("COB date {date} is in the future relative to today ({today})"),
        ));
    }
    if delta > lookback_days {
        return Err(IngestError::new(
            FailureKind::Cob,
            format!("COB date {date} is {delta} days from today, outside the {lookback_days}-day lookback window"),
        ));
    }
    Ok(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::{CanonicalSchema, FieldDef, FieldType};

    fn test_schema() -> CanonicalSchema {
        CanonicalSchema {
            name: "trades".into(),
            version: 1,
            fields: vec![
                FieldDef { name: "cobDate".into(), field_type: FieldType::String, required: true },
                FieldDef { name: "id".into(), field_type: FieldType::Int64, required: true },
                FieldDef { name: "price".into(), field_type: FieldType::Double, required: false },
            ],
        }
    }

    fn record(payload: &str) -> Record {
        Record {
            topic: "trades".into(),
            partition: 0,
            offset: 0,
            key: None,
            raw_payload: payload.as_bytes().to_vec(),
            arrival_timestamp: Utc::now(),
            correlation_id: "c1".into(),
        }
    }

    #[test]
    fn parses_valid_json_with_today_cob() {
        let today = Utc::now().date_naive();
        let payload = format!(r#"{{"cobDate":"{today}","id":42,"price":1.5}}"#);
        let rec = record(&payload);
        let out = parse_record(&rec, &test_schema(), "cobDate", 7, false, &[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cob_date, today);
        assert_eq!(out[0].fields.get("id"), Some(&FieldValue::Int64(42)));
    }

    #[test]
    fn rejects_missing_required_field() {
        let rec = record(r#"{"cobDate":"2024-01-01"}"#);
        let err = parse_record(&rec, &test_schema(), "cobDate", 3650, false, &[]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Schema);
    }

    #[test]
    fn rejects_cob_outside_lookback() {
        let rec = record(r#"{"cobDate":"1999-01-01","id":1}"#);
        let err = parse_record(&rec, &test_schema(), "cobDate", 7, false, &[]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Cob);
    }

    #[test]
    fn rejects_cob_in_the_future() {
        let tomorrow = Utc::now().date_naive() + chrono::Duration::days(1);
        let payload = format!(r#"{{"cobDate":"{tomorrow}","id":1}}"#);
        let rec = record(&payload);
        let err = parse_record(&rec, &test_schema(), "cobDate", 3650, false, &[]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Cob);
    }

    #[test]
    fn rejects_multi_row_csv_unless_enabled() {
        let today = Utc::now().date_naive();
        let payload = format!("{today},1,1.0\n{today},2,2.0\n");
        let rec = record(&payload);
        let err = parse_record(&rec, &test_schema(), "cobDate", 7, false, &[]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Parse);
        let out = parse_record(&rec, &test_schema(), "cobDate", 7, true, &[]).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn headered_csv_payload_yields_one_row() {
        let schema = CanonicalSchema {
            name: "clicks".into(),
            version: 1,
            fields: vec![
                FieldDef { name: "user_id".into(), field_type: FieldType::String, required: true },
                FieldDef { name: "event".into(), field_type: FieldType::String, required: true },
                FieldDef { name: "cobDate".into(), field_type: FieldType::String, required: true },
            ],
        };
        let rec = record("user_id,event,cobDate\nu3,click,2024-01-16");
        let out = parse_record(&rec, &schema, "cobDate", 3650, false, &[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields.get("user_id"), Some(&FieldValue::String("u3".to_string())));
        assert_eq!(out[0].cob_date, chrono::NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());
    }

    #[test]
    fn rejects_format_not_in_topic_allowlist() {
        let today = Utc::now().date_naive();
        let payload = format!("{today},1,1.0\n");
        let rec = record(&payload);
        let err =
            parse_record(&rec, &test_schema(), "cobDate", 7, false, &[DetectedFormat::Json]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Parse);
    }

    #[test]
    fn accepts_naive_local_datetime_as_utc() {
        assert_eq!(
            parse_timestamp_millis("2024-01-15T12:00:00").unwrap(),
            FieldValue::TimestampMillis(
                chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap()
                    .and_utc()
                    .timestamp_millis()
            )
        );
    }

    proptest::proptest! {
        #[test]
        fn cob_within_lookback_always_accepted(days_ago in 0i64..3650, lookback in 0i64..3650) {
            let date = Utc::now().date_naive() - chrono::Duration::days(days_ago);
            let fields = BTreeMap::from([("cobDate".to_string(), FieldValue::String(date.to_string()))]);
            let result = extract_cob(&fields, "cobDate", lookback);
            if days_ago <= lookback {
                proptest::prop_assert_eq!(result.unwrap(), date);
            } else {
                proptest::prop_assert_eq!(result.unwrap_err().kind(), FailureKind::Cob);
            }
        }
    }
}
