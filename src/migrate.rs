// src/migrate.rs

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::extract::{self, LeaveRequestRow};
use crate::reconcile::{
    effective_available_units, paid_unpaid_split, rejects_unpaid_fallback, UNPAID_LEAVE,
};
use crate::report::Reporter;
use crate::xero::{
    Employee, LeaveApplicationRequest, LeavePeriod, XeroApi, EMPLOYEE_PAGE_SIZE,
};

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);
const LOW_QUOTA_THRESHOLD: i64 = 5;
const ERROR_MARKER: &str = "Error:";

/// Remaining Xero per-minute call quota, observed opportunistically from
/// response headers. Scoped to one run so concurrent test runs stay isolated.
#[derive(Debug, Default)]
struct RemainingQuota {
    remaining: Option<i64>,
}

impl RemainingQuota {
    fn observe(&mut self, remaining: Option<i64>) {
        if remaining.is_some() {
            self.remaining = remaining;
        }
    }

    fn is_low(&self) -> bool {
        matches!(self.remaining, Some(r) if r < LOW_QUOTA_THRESHOLD)
    }

    fn value(&self) -> Option<i64> {
        self.remaining
    }
}

/// One leave application ready for dispatch, paid or unpaid portion.
struct LeaveSubmission {
    tenant_id: String,
    employee_id: String,
    employee: String,
    org: String,
    leave_type_id: String,
    /// Leave type the units are actually booked against.
    applied_type: String,
    /// Leave type the row originally asked for, kept for the audit line.
    requested_type: String,
    date: NaiveDate,
    units: Decimal,
    start_date: String,
    end_date: String,
    payment_date: String,
    description: String,
}

pub struct MigrationService {
    client: Arc<dyn XeroApi>,
    reporter: Reporter,
    csv_file_location: PathBuf,
    settle_delay: Duration,
    rate_limit_cooldown: Duration,
}

impl MigrationService {
    pub fn new(
        client: Arc<dyn XeroApi>,
        reporter: Reporter,
        csv_file_location: PathBuf,
        rate_limit_cooldown: Duration,
    ) -> Self {
        Self {
            client,
            reporter,
            csv_file_location,
            settle_delay: DEFAULT_SETTLE_DELAY,
            rate_limit_cooldown,
        }
    }

    /// Overrides the pause taken before each balance re-read. Tests run with
    /// zero.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Processes the staged upload end to end and returns the run's error
    /// lines; an empty list means every row landed in Xero. The audit report
    /// is emailed in both cases.
    pub async fn run_migration(&self) -> Vec<String> {
        info!("executing leave migration run");
        let (rows, extract_errors) = extract::rows_from_path(&self.csv_file_location);
        if !extract_errors.is_empty() {
            info!(
                count = extract_errors.len(),
                "errors during extracting uploaded data"
            );
        }

        if rows.is_empty() {
            self.reporter.dispatch(extract_errors.clone(), Vec::new());
            return extract_errors;
        }

        let (errors, successes) = self.process_rows(rows, extract_errors).await;
        self.reporter.dispatch(errors.clone(), successes);
        errors
    }

    /// The sequential run driver: resolves each row against the caches,
    /// reconciles it, and fans submissions out onto concurrent tasks. Returns
    /// (errors, audit successes) once every dispatched submission has landed.
    pub(crate) async fn process_rows(
        &self,
        rows: Vec<LeaveRequestRow>,
        mut errors: Vec<String>,
    ) -> (Vec<String>, Vec<String>) {
        info!(rows = rows.len(), "processing leave requests");

        let connections = match self.client.connections().await {
            Ok(connections) => connections,
            Err(e) => {
                let message = format!(
                    "Failed to fetch connections from Xero: {}. Please try again later or contact admin. ",
                    e
                );
                error!("{}", message);
                errors.push(message);
                return (errors, Vec::new());
            }
        };
        let tenants: HashMap<String, String> = connections
            .into_iter()
            .map(|c| (c.org_name, c.tenant_id))
            .collect();

        // Caches shared by every row of the run. Filled by this loop only;
        // the concurrent submission tasks never touch them.
        let mut employees: HashMap<String, Employee> = HashMap::new();
        let mut payment_dates: HashMap<String, String> = HashMap::new();
        let mut filled_orgs: HashSet<String> = HashSet::new();
        let mut filled_tenants: HashSet<String> = HashSet::new();
        let mut failed_orgs: HashMap<String, String> = HashMap::new();
        let mut failed_tenants: HashSet<String> = HashSet::new();

        let mut row_errors: Vec<String> = Vec::new();
        let mut quota = RemainingQuota::default();

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<String>();
        let mut submissions: JoinSet<()> = JoinSet::new();

        for row in &rows {
            if quota.is_low() {
                info!(
                    remaining = ?quota.value(),
                    "pausing the run due to low remaining rate limit"
                );
                sleep(self.rate_limit_cooldown).await;
            }

            let Some(tenant_id) = tenants.get(&row.org) else {
                let message = format!(
                    "Failed to get Organization details from Xero. Organization: {}. ",
                    row.org
                );
                warn!("{}", message);
                row_errors.push(message);
                continue;
            };

            // A directory fetch failure poisons the organization for the rest
            // of the run; each remaining row surfaces the same error.
            if let Some(message) = failed_orgs.get(&row.org) {
                errors.push(message.clone());
                continue;
            }
            if !filled_orgs.contains(&row.org) {
                match self
                    .fill_employee_directory(tenant_id, &row.org, &mut employees, &mut quota)
                    .await
                {
                    Ok(()) => {
                        filled_orgs.insert(row.org.clone());
                    }
                    Err(message) => {
                        errors.push(message.clone());
                        failed_orgs.insert(row.org.clone(), message);
                        continue;
                    }
                }
            }

            // A calendar fetch failure is surfaced once per tenant; remaining
            // rows for that tenant are skipped.
            if failed_tenants.contains(tenant_id) {
                continue;
            }
            if !filled_tenants.contains(tenant_id) {
                match self.client.payroll_calendars(tenant_id).await {
                    Ok(response) => {
                        quota.observe(response.rate_limit_remaining);
                        for calendar in response.payroll_calendars {
                            payment_dates
                                .insert(calendar.payroll_calendar_id, calendar.payment_date);
                        }
                        filled_tenants.insert(tenant_id.clone());
                    }
                    Err(e) => {
                        let message = format!(
                            "Failed to fetch employee payroll calendar settings from Xero. Organization: {}. Please reupload entry for this ORG. ",
                            row.org
                        );
                        warn!("payroll calendar fetch failed: {}", e);
                        push_unique(&mut row_errors, message);
                        failed_tenants.insert(tenant_id.clone());
                        continue;
                    }
                }
            }

            let outcome = self
                .reconcile_row(
                    row,
                    tenant_id,
                    &employees,
                    &payment_dates,
                    &mut quota,
                    &result_tx,
                    &mut submissions,
                )
                .await;
            for message in outcome {
                push_unique(&mut row_errors, message);
            }
        }

        // All rows dispatched; wait for every submission, then drain the
        // shared result channel.
        drop(result_tx);
        while submissions.join_next().await.is_some() {}

        errors.append(&mut row_errors);
        let mut successes = Vec::new();
        while let Some(line) = result_rx.recv().await {
            if line.contains(ERROR_MARKER) {
                errors.push(line);
            } else {
                successes.push(line);
            }
        }

        (errors, successes)
    }

    /// Loads the organization's full employee directory, page by page, into
    /// the shared name-keyed map. Stops at the first short page.
    async fn fill_employee_directory(
        &self,
        tenant_id: &str,
        org: &str,
        employees: &mut HashMap<String, Employee>,
        quota: &mut RemainingQuota,
    ) -> Result<(), String> {
        let mut page = 1u32;
        loop {
            let response = match self.client.employees(tenant_id, page).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(org, page, "employee fetch failed: {}", e);
                    return Err(format!(
                        "Failed to fetch employees from Xero. Organization: {}. ",
                        org
                    ));
                }
            };
            quota.observe(response.rate_limit_remaining);

            let count = response.employees.len();
            for employee in response.employees {
                let display_name = format!("{} {}", employee.first_name, employee.last_name);
                employees.insert(display_name, employee);
            }

            if count < EMPLOYEE_PAGE_SIZE {
                return Ok(());
            }
            page += 1;
        }
    }

    /// Decides the paid/unpaid split for one row against a fresh balance and
    /// dispatches up to two leave applications. Returns the row's error
    /// lines; an empty list means the row produced only submissions.
    #[allow(clippy::too_many_arguments)]
    async fn reconcile_row(
        &self,
        row: &LeaveRequestRow,
        tenant_id: &str,
        employees: &HashMap<String, Employee>,
        payment_dates: &HashMap<String, String>,
        quota: &mut RemainingQuota,
        result_tx: &UnboundedSender<String>,
        submissions: &mut JoinSet<()>,
    ) -> Vec<String> {
        let Some(employee) = employees.get(&row.employee) else {
            return vec![format!(
                "Employee not found in Xero. Employee: {}. Organization: {}  ",
                row.employee, row.org
            )];
        };

        let Some(payment_date) = payment_dates.get(&employee.payroll_calendar_id) else {
            return vec![format!(
                "Failed to fetch employee payroll calendar settings from Xero. Employee: {}. Organization: {} ",
                row.employee, row.org
            )];
        };

        info!(employee = %row.employee, "calculating leaves to be applied");

        // Give any submission dispatched for an earlier row a moment to be
        // applied before reading this row's balance.
        sleep(self.settle_delay).await;
        let balance = match self
            .client
            .leave_balance(tenant_id, &employee.employee_id)
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                warn!("leave balance fetch failed: {}", e);
                return vec![format!(
                    "Failed to fetch employee leave balance from Xero. Employee: {}. Organization: {} ",
                    row.employee, row.org
                )];
            }
        };
        quota.observe(balance.rate_limit_remaining);

        let Some(balances) = balance.employees.first().map(|e| &e.leave_balances) else {
            return vec![format!(
                "Failed to fetch employee leave balance from Xero. Employee: {}. Organization: {} ",
                row.employee, row.org
            )];
        };

        let unpaid_type_id = balances
            .iter()
            .find(|b| b.leave_type.eq_ignore_ascii_case(UNPAID_LEAVE))
            .map(|b| b.leave_type_id.clone());

        let Some(matched) = balances
            .iter()
            .find(|b| b.leave_type.eq_ignore_ascii_case(&row.leave_type))
        else {
            return vec![format!(
                "Leave type {} not found/configured in Xero for Employee: {}. Organization: {} ",
                row.leave_type, row.employee, row.org
            )];
        };

        let available = effective_available_units(&row.leave_type, matched.number_of_units);
        let split = paid_unpaid_split(row.hours, available);
        let skip_unpaid = rejects_unpaid_fallback(&row.leave_type);

        let epoch_ms = row
            .date
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp_millis();
        let leave_period_date = format!("/Date({})/", epoch_ms);

        let mut row_errors = Vec::new();

        if split.paid > Decimal::ZERO {
            self.dispatch_submission(
                submissions,
                result_tx,
                LeaveSubmission {
                    tenant_id: tenant_id.to_string(),
                    employee_id: employee.employee_id.clone(),
                    employee: row.employee.clone(),
                    org: row.org.clone(),
                    leave_type_id: matched.leave_type_id.clone(),
                    applied_type: row.leave_type.clone(),
                    requested_type: row.leave_type.clone(),
                    date: row.date,
                    units: split.paid,
                    start_date: leave_period_date.clone(),
                    end_date: leave_period_date.clone(),
                    payment_date: payment_date.clone(),
                    description: row.description.clone(),
                },
            );
        }

        if split.unpaid > Decimal::ZERO && !skip_unpaid {
            match unpaid_type_id {
                Some(leave_type_id) => self.dispatch_submission(
                    submissions,
                    result_tx,
                    LeaveSubmission {
                        tenant_id: tenant_id.to_string(),
                        employee_id: employee.employee_id.clone(),
                        employee: row.employee.clone(),
                        org: row.org.clone(),
                        leave_type_id,
                        applied_type: UNPAID_LEAVE.to_string(),
                        requested_type: row.leave_type.clone(),
                        date: row.date,
                        units: split.unpaid,
                        start_date: leave_period_date.clone(),
                        end_date: leave_period_date,
                        payment_date: payment_date.clone(),
                        description: row.description.clone(),
                    },
                ),
                None => row_errors.push(format!(
                    "Leave type {} not found/configured in Xero for Employee: {}. Organization: {} ",
                    UNPAID_LEAVE, row.employee, row.org
                )),
            }
        }

        if split.unpaid > Decimal::ZERO && skip_unpaid {
            row_errors.push(format!(
                "Employee: {} has insufficient Leave balance for Leave type {} requested for {} hours ",
                row.employee, row.leave_type, split.unpaid
            ));
        }

        row_errors
    }

    /// Spawns one concurrent task per leave application. The task reports its
    /// outcome on the shared result channel and never blocks the row loop.
    fn dispatch_submission(
        &self,
        submissions: &mut JoinSet<()>,
        result_tx: &UnboundedSender<String>,
        submission: LeaveSubmission,
    ) {
        let client = Arc::clone(&self.client);
        let result_tx = result_tx.clone();

        submissions.spawn(async move {
            let title = if submission.description.is_empty() {
                format!(
                    "{} {}",
                    submission.applied_type,
                    submission.date.format("%d/%m")
                )
            } else {
                submission.description.clone()
            };

            let request = LeaveApplicationRequest {
                employee_id: submission.employee_id.clone(),
                leave_type_id: submission.leave_type_id.clone(),
                start_date: submission.start_date.clone(),
                end_date: submission.end_date.clone(),
                title,
                leave_periods: vec![LeavePeriod {
                    pay_period_end_date: submission.payment_date.clone(),
                    number_of_units: submission.units,
                }],
            };

            info!(employee = %submission.employee, "applying leave request");
            let line = match client.apply_leave(&submission.tenant_id, request).await {
                Ok(()) => format!(
                    "{},{},{},{},{},{}",
                    submission.employee,
                    submission.requested_type,
                    submission.applied_type,
                    submission.date.format("%-d/%-m/%Y"),
                    submission.units,
                    submission.org
                ),
                Err(e) => {
                    error!(
                        employee = %submission.employee,
                        org = %submission.org,
                        "failed to post leave application to xero: {}",
                        e
                    );
                    format!(
                        "Error: Failed to post Leave application to xero for Employee: {} Organization: {} ",
                        submission.employee, submission.org
                    )
                }
            };
            // The receiver outlives every task; a send failure only means the
            // run was abandoned.
            let _ = result_tx.send(line);
        });
    }
}

/// Repeated reconcile failures (same employee, same cause) collapse into a
/// single error line.
fn push_unique(errors: &mut Vec<String>, message: String) {
    if !errors.iter().any(|existing| existing.contains(&message)) {
        errors.push(message);
    }
}
