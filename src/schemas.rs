use serde::Deserialize;
use serde_json::{Map, Value};
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

/// Serialize an input struct into a JSON object for the table service.
pub fn serialize_to_map<T: serde::Serialize>(input: &T) -> Map<String, Value> {
    match serde_json::to_value(input) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Drop nulls so optional fields don't overwrite stored columns.
pub fn remove_nulls(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter(|(_, value)| !value.is_null())
        .collect()
}

pub fn clamp_limit_in_range(limit: Option<i64>, min: i64, max: i64) -> i64 {
    limit.unwrap_or(100).clamp(min, max)
}

fn default_usd() -> String {
    "USD".to_string()
}
fn default_utc() -> String {
    "UTC".to_string()
}
fn default_operator_role() -> String {
    "operator".to_string()
}
fn default_expires_in_days() -> i32 {
    14
}
fn default_false() -> bool {
    false
}
fn default_active() -> String {
    "active".to_string()
}
fn default_pending() -> String {
    "pending".to_string()
}
fn default_open() -> String {
    "open".to_string()
}
fn default_medium() -> String {
    "medium".to_string()
}
fn default_general() -> String {
    "general".to_string()
}
fn default_rent() -> String {
    "rent".to_string()
}
fn default_bedrooms() -> i16 {
    1
}
fn default_bathrooms() -> f64 {
    1.0
}

// --- organizations ---------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateOrganizationInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub legal_name: Option<String>,
    #[serde(default = "default_usd")]
    pub default_currency: String,
    #[serde(default = "default_utc")]
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateOrganizationInput {
    pub name: Option<String>,
    pub legal_name: Option<String>,
    pub default_currency: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateOrganizationInviteInput {
    #[validate(email)]
    pub email: String,
    #[serde(default = "default_operator_role")]
    pub role: String,
    #[serde(default = "default_expires_in_days")]
    pub expires_in_days: i32,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AcceptOrganizationInviteInput {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CreateOrganizationMemberInput {
    pub user_id: String,
    #[serde(default = "default_operator_role")]
    pub role: String,
    #[serde(default = "default_false")]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateOrganizationMemberInput {
    pub role: Option<String>,
    pub is_primary: Option<bool>,
}

// --- properties and units --------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePropertyInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default = "default_active")]
    pub status: String,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub country_code: Option<String>,
    pub property_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdatePropertyInput {
    pub name: Option<String>,
    pub status: Option<String>,
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub country_code: Option<String>,
    pub property_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateUnitInput {
    pub organization_id: String,
    pub property_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub code: Option<String>,
    #[serde(default = "default_bedrooms")]
    pub bedrooms: i16,
    #[serde(default = "default_bathrooms")]
    pub bathrooms: f64,
    pub monthly_rent: Option<f64>,
    #[serde(default = "default_active")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateUnitInput {
    pub name: Option<String>,
    pub code: Option<String>,
    pub bedrooms: Option<i16>,
    pub bathrooms: Option<f64>,
    pub monthly_rent: Option<f64>,
    pub status: Option<String>,
}

// --- tenants and leases ----------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateTenantInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default = "default_pending")]
    pub status: String,
    // Optional lease terms; when present a lease is created alongside.
    pub unit_id: Option<String>,
    pub lease_start: Option<String>,
    pub lease_end: Option<String>,
    pub monthly_rent: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateTenantInput {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: Option<String>,
    pub unit_id: Option<String>,
    pub lease_start: Option<String>,
    pub lease_end: Option<String>,
    pub monthly_rent: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateLeaseInput {
    pub organization_id: String,
    pub tenant_id: String,
    pub unit_id: String,
    pub lease_start: Option<String>,
    pub lease_end: Option<String>,
    #[validate(range(min = 0.0))]
    pub monthly_amount: f64,
    #[serde(default = "default_pending")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateLeaseInput {
    pub lease_start: Option<String>,
    pub lease_end: Option<String>,
    pub monthly_amount: Option<f64>,
    pub status: Option<String>,
}

// --- vendors, expenses, mortgages, maintenance -----------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateVendorInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub category: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateVendorInput {
    pub name: Option<String>,
    pub category: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateExpenseInput {
    pub organization_id: String,
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub vendor_id: Option<String>,
    #[serde(default = "default_general")]
    pub category: String,
    #[validate(range(min = 0.0))]
    pub amount: f64,
    pub incurred_on: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateExpenseInput {
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub vendor_id: Option<String>,
    pub category: Option<String>,
    pub amount: Option<f64>,
    pub incurred_on: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateMortgageInput {
    pub organization_id: String,
    pub property_id: String,
    #[validate(length(min = 1, max = 255))]
    pub lender_name: String,
    #[validate(range(min = 0.0))]
    pub monthly_payment: f64,
    pub interest_rate: Option<f64>,
    pub principal: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateMortgageInput {
    pub lender_name: Option<String>,
    pub monthly_payment: Option<f64>,
    pub interest_rate: Option<f64>,
    pub principal: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateMaintenanceTaskInput {
    pub organization_id: String,
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub vendor_id: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub description: Option<String>,
    #[serde(default = "default_medium")]
    pub priority: String,
    #[serde(default = "default_open")]
    pub status: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateMaintenanceTaskInput {
    pub property_id: Option<String>,
    pub unit_id: Option<String>,
    pub vendor_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub due_date: Option<String>,
}

// --- billing and payments --------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateBillingRecordInput {
    pub organization_id: String,
    pub tenant_id: String,
    pub unit_id: String,
    /// Year-month key, e.g. "2024-01".
    pub billing_period: String,
    #[validate(range(min = 0.0))]
    pub amount: f64,
    pub due_date: String,
    #[serde(default = "default_pending")]
    pub status: String,
    #[serde(default = "default_rent")]
    pub record_type: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateBillingRecordInput {
    pub amount: Option<f64>,
    pub due_date: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateRentPaymentInput {
    pub organization_id: String,
    pub tenant_id: String,
    pub unit_id: Option<String>,
    #[validate(range(min = 0.01))]
    pub amount: f64,
    /// Billing period ("2024-02") or obligation id the payment targets.
    /// Defaults to the current period when absent.
    pub billing_period: Option<String>,
    pub paid_date: Option<String>,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateRentPaymentInput {
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

// --- query strings ----------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OrgScopedQuery {
    pub org_id: String,
    pub limit: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitsQuery {
    pub org_id: String,
    pub property_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeasesQuery {
    pub org_id: String,
    pub tenant_id: Option<String>,
    pub unit_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpensesQuery {
    pub org_id: String,
    pub property_id: Option<String>,
    pub category: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceQuery {
    pub org_id: String,
    pub property_id: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RentPaymentsQuery {
    pub org_id: String,
    pub tenant_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingRecordsQuery {
    pub org_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateBillingQuery {
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportsPeriodQuery {
    pub org_id: String,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarQuery {
    pub org_id: String,
    pub days: Option<i64>,
}

// --- path params -------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OrgPath {
    pub org_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrgMemberPath {
    pub org_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyPath {
    pub property_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitPath {
    pub unit_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantPath {
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeasePath {
    pub lease_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorPath {
    pub vendor_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpensePath {
    pub expense_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MortgagePath {
    pub mortgage_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceTaskPath {
    pub task_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingRecordPath {
    pub record_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RentPaymentPath {
    pub payment_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamps_limits_into_range() {
        assert_eq!(clamp_limit_in_range(None, 1, 1000), 100);
        assert_eq!(clamp_limit_in_range(Some(0), 1, 1000), 1);
        assert_eq!(clamp_limit_in_range(Some(5000), 1, 1000), 1000);
        assert_eq!(clamp_limit_in_range(Some(25), 1, 1000), 25);
    }

    #[test]
    fn remove_nulls_drops_only_null_entries() {
        let input = CreateTenantInput {
            organization_id: "org".to_string(),
            full_name: "Riley Tenant".to_string(),
            email: None,
            phone: None,
            status: "pending".to_string(),
            unit_id: None,
            lease_start: None,
            lease_end: None,
            monthly_rent: None,
        };
        let map = remove_nulls(serialize_to_map(&input));
        assert!(map.contains_key("full_name"));
        assert!(!map.contains_key("email"));
        assert!(!map.contains_key("monthly_rent"));
    }

    #[test]
    fn billing_record_input_applies_defaults() {
        let input: CreateBillingRecordInput = serde_json::from_value(json!({
            "organization_id": "org-1",
            "tenant_id": "tenant-1",
            "unit_id": "unit-1",
            "billing_period": "2024-01",
            "amount": 1200.0,
            "due_date": "2024-01-15"
        }))
        .unwrap();
        assert_eq!(input.status, "pending");
        assert_eq!(input.record_type, "rent");
        assert!(validate_input(&input).is_ok());
    }

    #[test]
    fn rejects_invalid_inputs() {
        let input: CreateRentPaymentInput = serde_json::from_value(json!({
            "organization_id": "org-1",
            "tenant_id": "tenant-1",
            "amount": 0.0
        }))
        .unwrap();
        assert!(validate_input(&input).is_err());

        let org: CreateOrganizationInput = serde_json::from_value(json!({ "name": "" })).unwrap();
        assert!(validate_input(&org).is_err());
    }
}
