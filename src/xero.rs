// src/xero.rs

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

pub const EMPLOYEE_PAGE_SIZE: usize = 100;

const TENANT_ID_HEADER: &str = "xero-tenant-id";
const RATE_LIMIT_HEADER: &str = "X-MinLimit-Remaining";

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);
const RETRY_ATTEMPTS: u32 = 3;

// --- Xero API Data Structures ---

/// One authorized organisation from the connections endpoint. This endpoint
/// predates the payroll API and uses camelCase keys.
#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "tenantType", default)]
    pub tenant_type: String,
    #[serde(rename = "tenantName")]
    pub org_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Employee {
    #[serde(rename = "EmployeeID")]
    pub employee_id: String,
    #[serde(rename = "FirstName")]
    pub first_name: String,
    #[serde(rename = "LastName")]
    pub last_name: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "PayrollCalendarID", default)]
    pub payroll_calendar_id: String,
    #[serde(rename = "LeaveBalances", default)]
    pub leave_balances: Vec<LeaveBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaveBalance {
    #[serde(rename = "LeaveName")]
    pub leave_type: String,
    #[serde(rename = "LeaveTypeID")]
    pub leave_type_id: String,
    #[serde(rename = "NumberOfUnits")]
    pub number_of_units: Decimal,
    #[serde(rename = "TypeOfUnits", default)]
    pub type_of_units: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmpResponse {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Employees", default)]
    pub employees: Vec<Employee>,
    /// Parsed from the X-MinLimit-Remaining response header, not the body.
    #[serde(skip)]
    pub rate_limit_remaining: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaveBalanceResponse {
    #[serde(rename = "Employees", default)]
    pub employees: Vec<Employee>,
    #[serde(skip)]
    pub rate_limit_remaining: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayrollCalendar {
    #[serde(rename = "PayrollCalendarID")]
    pub payroll_calendar_id: String,
    #[serde(rename = "CalendarType", default)]
    pub calendar_type: String,
    #[serde(rename = "PaymentDate")]
    pub payment_date: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayrollCalendarResponse {
    #[serde(rename = "PayrollCalendars", default)]
    pub payroll_calendars: Vec<PayrollCalendar>,
    #[serde(skip)]
    pub rate_limit_remaining: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveApplicationRequest {
    #[serde(rename = "EmployeeID")]
    pub employee_id: String,
    #[serde(rename = "LeaveTypeID")]
    pub leave_type_id: String,
    #[serde(rename = "StartDate")]
    pub start_date: String,
    #[serde(rename = "EndDate")]
    pub end_date: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "LeavePeriods")]
    pub leave_periods: Vec<LeavePeriod>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeavePeriod {
    #[serde(rename = "PayPeriodEndDate")]
    pub pay_period_end_date: String,
    #[serde(rename = "NumberOfUnits")]
    pub number_of_units: Decimal,
}

/// Token JSON persisted by the OAuth callback and read back on every API call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

// --- Error Type ---

#[derive(Error, Debug)]
pub enum XeroError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("access token unavailable: {0}")]
    Token(String),

    #[error("xero rejected the credentials (401)")]
    Unauthorized,

    #[error("xero rate limit exceeded (429)")]
    RateLimited,

    #[error("xero {api} returned status {status}: {message}")]
    Api {
        api: &'static str,
        status: StatusCode,
        message: String,
    },
}

impl XeroError {
    /// Transport failures, 429s and server-side errors are worth another
    /// attempt; everything else fails immediately.
    fn is_retryable(&self) -> bool {
        match self {
            XeroError::Request(_) | XeroError::RateLimited => true,
            XeroError::Api { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

struct Backoff {
    delay: Duration,
    attempts_left: u32,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: RETRY_INITIAL_DELAY,
            attempts_left: RETRY_ATTEMPTS,
        }
    }

    /// Sleeps for the current delay and doubles it, up to the cap. Returns
    /// false once the retry budget is spent.
    async fn pause(&mut self) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        sleep(self.delay).await;
        self.delay = std::cmp::min(self.delay * 2, RETRY_MAX_DELAY);
        true
    }
}

// --- Client Interface ---

/// The slice of the Xero payroll API the migration consumes. Kept as a trait
/// so the run driver can be exercised against an in-memory double.
#[async_trait]
pub trait XeroApi: Send + Sync {
    async fn connections(&self) -> Result<Vec<Connection>, XeroError>;

    async fn employees(&self, tenant_id: &str, page: u32) -> Result<EmpResponse, XeroError>;

    async fn leave_balance(
        &self,
        tenant_id: &str,
        employee_id: &str,
    ) -> Result<LeaveBalanceResponse, XeroError>;

    async fn payroll_calendars(
        &self,
        tenant_id: &str,
    ) -> Result<PayrollCalendarResponse, XeroError>;

    async fn apply_leave(
        &self,
        tenant_id: &str,
        request: LeaveApplicationRequest,
    ) -> Result<(), XeroError>;
}

// --- Client Implementation ---

pub struct XeroClient {
    http: Client,
    endpoint: String,
    token_file: PathBuf,
}

impl XeroClient {
    pub fn new(endpoint: &str, token_file: PathBuf) -> Result<Self, XeroError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token_file,
        })
    }

    /// The token file is re-read on every call so a re-authorization through
    /// the OAuth callback takes effect mid-run.
    async fn access_token(&self) -> Result<String, XeroError> {
        read_access_token(&self.token_file).await
    }

    fn connections_url(&self) -> String {
        format!("{}/connections", self.endpoint)
    }

    fn employees_url(&self, page: u32) -> String {
        format!("{}/payroll.xro/1.0/Employees?page={}", self.endpoint, page)
    }

    fn leave_balance_url(&self, employee_id: &str) -> String {
        format!("{}/payroll.xro/1.0/Employees/{}", self.endpoint, employee_id)
    }

    fn payroll_calendars_url(&self) -> String {
        format!("{}/payroll.xro/1.0/PayrollCalendars", self.endpoint)
    }

    fn leave_applications_url(&self) -> String {
        format!("{}/payroll.xro/1.0/LeaveApplications", self.endpoint)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        api: &'static str,
        url: &str,
        tenant_id: Option<&str>,
    ) -> Result<(T, Option<i64>), XeroError> {
        let mut backoff = Backoff::new();
        loop {
            match self.get_once(api, url, tenant_id).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() => {
                    if !backoff.pause().await {
                        warn!("retry budget exhausted for {}: {}", api, err);
                        return Err(err);
                    }
                    warn!("retrying {} after error: {}", api, err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        api: &'static str,
        url: &str,
        tenant_id: Option<&str>,
    ) -> Result<(T, Option<i64>), XeroError> {
        let token = self.access_token().await?;
        let mut request = self.http.get(url).bearer_auth(token);
        if let Some(tenant) = tenant_id {
            request = request.header(TENANT_ID_HEADER, tenant);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(XeroError::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(XeroError::RateLimited);
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read error body: {}", e));
            return Err(XeroError::Api {
                api,
                status,
                message,
            });
        }

        let quota = remaining_quota(response.headers());
        let body = response.text().await?;
        let value = serde_json::from_str::<T>(&body)?;
        Ok((value, quota))
    }
}

#[async_trait]
impl XeroApi for XeroClient {
    async fn connections(&self) -> Result<Vec<Connection>, XeroError> {
        let (connections, _) = self
            .get_json::<Vec<Connection>>("GetConnections", &self.connections_url(), None)
            .await?;
        Ok(connections)
    }

    async fn employees(&self, tenant_id: &str, page: u32) -> Result<EmpResponse, XeroError> {
        info!(tenant_id, page, "fetching employees");
        let (mut response, quota) = self
            .get_json::<EmpResponse>("GetEmployees", &self.employees_url(page), Some(tenant_id))
            .await?;
        response.rate_limit_remaining = quota;
        Ok(response)
    }

    async fn leave_balance(
        &self,
        tenant_id: &str,
        employee_id: &str,
    ) -> Result<LeaveBalanceResponse, XeroError> {
        info!(employee_id, "fetching leave balance");
        let (mut response, quota) = self
            .get_json::<LeaveBalanceResponse>(
                "EmployeeLeaveBalance",
                &self.leave_balance_url(employee_id),
                Some(tenant_id),
            )
            .await?;
        response.rate_limit_remaining = quota;
        Ok(response)
    }

    async fn payroll_calendars(
        &self,
        tenant_id: &str,
    ) -> Result<PayrollCalendarResponse, XeroError> {
        info!(tenant_id, "fetching payroll calendar settings");
        let (mut response, quota) = self
            .get_json::<PayrollCalendarResponse>(
                "GetPayrollCalendars",
                &self.payroll_calendars_url(),
                Some(tenant_id),
            )
            .await?;
        response.rate_limit_remaining = quota;
        Ok(response)
    }

    /// Leave applications are not retried here: a failed POST is surfaced to
    /// the run's result aggregation instead of being replayed blindly.
    async fn apply_leave(
        &self,
        tenant_id: &str,
        request: LeaveApplicationRequest,
    ) -> Result<(), XeroError> {
        let token = self.access_token().await?;
        // The endpoint accepts a batch; the migration always posts one.
        let payload = vec![request];

        let response = self
            .http
            .post(self.leave_applications_url())
            .bearer_auth(token)
            .header(TENANT_ID_HEADER, tenant_id)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(XeroError::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(XeroError::RateLimited);
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read error body: {}", e));
            return Err(XeroError::Api {
                api: "EmployeeLeaveApplication",
                status,
                message,
            });
        }
        Ok(())
    }
}

pub async fn read_access_token(token_file: &Path) -> Result<String, XeroError> {
    let raw = tokio::fs::read_to_string(token_file).await.map_err(|e| {
        XeroError::Token(format!(
            "unable to read token file {}: {}",
            token_file.display(),
            e
        ))
    })?;
    let data: TokenData = serde_json::from_str(&raw)
        .map_err(|e| XeroError::Token(format!("token file is not valid JSON: {}", e)))?;
    Ok(data.access_token)
}

fn remaining_quota(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(RATE_LIMIT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
}
