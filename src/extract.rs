// src/extract.rs

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tracing::{error, info};

/// One normalized leave entry from the uploaded export. Leave type and
/// organization names are already canonicalized to Xero's vocabulary.
#[derive(Debug, Clone)]
pub struct LeaveRequestRow {
    pub employee: String,
    pub org: String,
    pub leave_type: String,
    pub date: NaiveDate,
    pub hours: Decimal,
    pub description: String,
}

const COL_EMPLOYEE: usize = 0;
const COL_DATE: usize = 1;
const COL_HOURS: usize = 2;
const COL_LEAVE_TYPE: usize = 3;
const COL_ALT_LEAVE_TYPE: usize = 4;
const COL_ORG: usize = 5;
const COL_DESCRIPTION: usize = 6;

const DATE_FORMAT: &str = "%d/%m/%Y";

/// Krow exports leave-type names that differ from Xero's payroll
/// configuration. First matching rule wins; one rule is applied per cell.
const LEAVE_TYPE_RULES: &[(&str, &str)] = &[
    (
        "Parental Leave (10 days for new family member)",
        "Parental Leave (Paid)",
    ),
    ("Parental Leave", "Parental Leave (Paid)"),
    ("Compassionate Leave", "Compassionate Leave (paid)"),
    ("Carers", "Carer's"),
    ("Unpaid", "Other Unpaid"),
];

const ORG_NAME_RULES: &[(&str, &str)] = &[("Cuusoo", "Cuusoo Pty Ltd")];

fn apply_rules(raw: &str, rules: &[(&str, &str)]) -> String {
    for (from, to) in rules {
        if raw.contains(from) {
            return raw.replace(from, to);
        }
    }
    raw.to_string()
}

pub fn canonical_leave_type(raw: &str) -> String {
    apply_rules(raw, LEAVE_TYPE_RULES)
}

pub fn canonical_org_name(raw: &str) -> String {
    apply_rules(raw, ORG_NAME_RULES)
}

/// Reads the staged upload and returns the parsed rows together with one
/// error string per row that could not be parsed. A missing or unreadable
/// file yields no rows and a single error.
pub fn rows_from_path(path: &Path) -> (Vec<LeaveRequestRow>, Vec<String>) {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            error!("failed to open uploaded file {}: {}", path.display(), e);
            return (
                Vec::new(),
                vec![
                    "Unable to open the uploaded file. Please confirm the file is in CSV format. "
                        .to_string(),
                ],
            );
        }
    };
    rows_from_reader(file)
}

pub fn rows_from_reader<R: Read>(reader: R) -> (Vec<LeaveRequestRow>, Vec<String>) {
    let mut rows = Vec::new();
    let mut errors = Vec::new();

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    for record in csv_reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                errors.push(format!("Unable to read a row from the uploaded file: {} ", e));
                continue;
            }
        };

        let cell = |idx: usize| record.get(idx).unwrap_or("").trim();

        let raw_date = cell(COL_DATE);
        let date = match NaiveDate::parse_from_str(raw_date, DATE_FORMAT) {
            Ok(date) => date,
            Err(_) => {
                errors.push(format!(
                    "Invalid entry for Leave Date: {}. Valid Format DD/MM/YYYY (Ex: 01/06/2020)",
                    raw_date
                ));
                continue;
            }
        };

        let raw_hours = cell(COL_HOURS);
        let hours = match Decimal::from_str(raw_hours) {
            Ok(hours) => hours,
            Err(_) => {
                errors.push(format!("Invalid entry for Leave Hours: {} ", raw_hours));
                continue;
            }
        };

        let mut leave_type = cell(COL_LEAVE_TYPE);
        if leave_type.is_empty() {
            leave_type = cell(COL_ALT_LEAVE_TYPE);
        }

        rows.push(LeaveRequestRow {
            employee: cell(COL_EMPLOYEE).to_string(),
            org: canonical_org_name(cell(COL_ORG)),
            leave_type: canonical_leave_type(leave_type),
            date,
            hours,
            description: cell(COL_DESCRIPTION).to_string(),
        });
    }

    info!(rows = rows.len(), errors = errors.len(), "extracted leave requests");
    (rows, errors)
}
