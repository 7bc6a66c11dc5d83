//! Rejected rows as CSV, ready to be fixed and uploaded again

use std::iter;

use super::types::FailedRow;
use crate::error::ImportResult;

/// Render `rows` under `line,reason,<original headers>`.
///
/// Parse failures may have a different width than the headers, so the
/// writer is flexible.
pub fn failed_rows_csv(headers: &[String], rows: &[FailedRow]) -> ImportResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    writer.write_record(
        ["line", "reason"]
            .into_iter()
            .chain(headers.iter().map(String::as_str)),
    )?;

    for row in rows {
        writer.write_record(
            iter::once(row.line_number.to_string())
                .chain(iter::once(row.reason.clone()))
                .chain(row.row_data.iter().cloned()),
        )?;
    }

    writer
        .into_inner()
        .map_err(|err| err.into_error().into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::import::types::FailureKind;

    #[test]
    fn test_export_keeps_original_values() {
        let headers = vec!["email".to_string(), "note".to_string()];
        let rows = vec![
            FailedRow::new(
                3,
                FailureKind::Validation,
                "email: value is required",
                vec!["".into(), "has, comma".into()],
            ),
            FailedRow::new(5, FailureKind::Parse, "expected 2 fields, found 3", vec![
                "a".into(),
                "b".into(),
                "c".into(),
            ]),
        ];

        let csv = String::from_utf8(failed_rows_csv(&headers, &rows).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], "line,reason,email,note");
        assert_eq!(lines[1], "3,email: value is required,,\"has, comma\"");
        assert_eq!(lines[2], "5,\"expected 2 fields, found 3\",a,b,c");
    }

    #[test]
    fn test_export_without_rows_has_header_only() {
        let csv = failed_rows_csv(&["id".to_string()], &[]).unwrap();
        assert_eq!(csv, b"line,reason,id\n");
    }
}
