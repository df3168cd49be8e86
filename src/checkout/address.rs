//! Shipping address selection: a saved address for signed-in shoppers, or
//! fields typed into the form. Exactly one source is active; both produce
//! the same normalised [`ShippingAddress`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

use crate::checkout::model::CustomerContext;
use crate::errors::{FieldErrors, ServiceError};

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{10,11}$").expect("phone pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub line: String,
    pub province_id: String,
    pub province_name: String,
    pub district_id: String,
    pub district_name: String,
    pub ward_id: String,
    pub ward_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub full_address: String,
}

fn full_address(line: &str, ward: &str, district: &str, province: &str) -> String {
    [line, ward, district, province]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// An address from the shopper's address book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedAddress {
    pub id: String,
    pub full_name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    pub line: String,
    pub province_id: String,
    pub province_name: String,
    pub district_id: String,
    pub district_name: String,
    pub ward_id: String,
    pub ward_name: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Address form fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ManualAddressInput {
    pub full_name: String,
    #[validate(regex(path = "PHONE_RE", message = "Phone must be 10-11 digits"))]
    pub phone: String,
    #[validate(email(message = "Email is invalid"))]
    pub email: String,
    pub line: String,
    pub province_id: Option<String>,
    pub district_id: Option<String>,
    pub ward_id: Option<String>,
    pub note: Option<String>,
}

/// Province → district → ward lookup, owned by the region service.
pub trait RegionDirectory: Send + Sync {
    fn province_name(&self, province_id: &str) -> Option<String>;
    /// Name of the district if it belongs to the province.
    fn district_name(&self, province_id: &str, district_id: &str) -> Option<String>;
    /// Name of the ward if it belongs to the district.
    fn ward_name(&self, district_id: &str, ward_id: &str) -> Option<String>;
}

/// In-memory directory built from explicit entries.
#[derive(Debug, Clone, Default)]
pub struct StaticRegionDirectory {
    provinces: HashMap<String, String>,
    districts: HashMap<(String, String), String>,
    wards: HashMap<(String, String), String>,
}

impl StaticRegionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_province(mut self, id: &str, name: &str) -> Self {
        self.provinces.insert(id.to_string(), name.to_string());
        self
    }

    pub fn with_district(mut self, province_id: &str, id: &str, name: &str) -> Self {
        self.districts
            .insert((province_id.to_string(), id.to_string()), name.to_string());
        self
    }

    pub fn with_ward(mut self, district_id: &str, id: &str, name: &str) -> Self {
        self.wards
            .insert((district_id.to_string(), id.to_string()), name.to_string());
        self
    }
}

impl RegionDirectory for StaticRegionDirectory {
    fn province_name(&self, province_id: &str) -> Option<String> {
        self.provinces.get(province_id).cloned()
    }

    fn district_name(&self, province_id: &str, district_id: &str) -> Option<String> {
        self.districts
            .get(&(province_id.to_string(), district_id.to_string()))
            .cloned()
    }

    fn ward_name(&self, district_id: &str, ward_id: &str) -> Option<String> {
        self.wards
            .get(&(district_id.to_string(), ward_id.to_string()))
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSource {
    Saved(SavedAddress),
    Manual(ManualAddressInput),
}

#[derive(Debug, Clone)]
pub struct AddressResolver {
    source: AddressSource,
    fallback_email: Option<String>,
    errors: FieldErrors,
}

impl AddressResolver {
    /// Signed-in shoppers start on their default (or first) saved address;
    /// everyone else starts on the form.
    pub fn for_customer(customer: &CustomerContext, saved: &[SavedAddress]) -> Self {
        let preferred = if customer.is_authenticated() {
            saved
                .iter()
                .find(|a| a.is_default)
                .or_else(|| saved.first())
                .cloned()
        } else {
            None
        };
        let source = match preferred {
            Some(address) => AddressSource::Saved(address),
            None => AddressSource::Manual(ManualAddressInput {
                email: customer.email.clone().unwrap_or_default(),
                ..Default::default()
            }),
        };
        Self {
            source,
            fallback_email: customer.email.clone(),
            errors: FieldErrors::new(),
        }
    }

    pub fn source(&self) -> &AddressSource {
        &self.source
    }

    pub fn is_saved(&self) -> bool {
        matches!(self.source, AddressSource::Saved(_))
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn use_saved(&mut self, address: SavedAddress) {
        self.source = AddressSource::Saved(address);
        self.errors.clear();
    }

    pub fn use_manual(&mut self, input: ManualAddressInput) {
        self.source = AddressSource::Manual(input);
        self.errors.clear();
    }

    /// Form fields for editing; `None` while a saved address is active.
    pub fn manual_mut(&mut self) -> Option<&mut ManualAddressInput> {
        match &mut self.source {
            AddressSource::Manual(input) => Some(input),
            AddressSource::Saved(_) => None,
        }
    }

    /// Validates the active source, records field errors, and returns the
    /// normalised address.
    pub fn resolve(&mut self, regions: &dyn RegionDirectory) -> Result<ShippingAddress, ServiceError> {
        let result = match &self.source {
            AddressSource::Saved(saved) => self.resolve_saved(saved),
            AddressSource::Manual(input) => resolve_manual(input, regions),
        };
        match result {
            Ok(address) => {
                self.errors.clear();
                Ok(address)
            }
            Err(errors) => {
                self.errors = errors.clone();
                Err(ServiceError::FieldValidation(errors))
            }
        }
    }

    fn resolve_saved(&self, saved: &SavedAddress) -> Result<ShippingAddress, FieldErrors> {
        let mut errors = FieldErrors::new();
        if saved.full_name.trim().is_empty() {
            errors.add("fullName", "Saved address has no recipient name");
        }
        if saved.phone.trim().is_empty() {
            errors.add("phone", "Saved address has no phone number");
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ShippingAddress {
            full_name: saved.full_name.trim().to_string(),
            phone: saved.phone.trim().to_string(),
            email: saved
                .email
                .clone()
                .or_else(|| self.fallback_email.clone())
                .unwrap_or_default(),
            line: saved.line.trim().to_string(),
            province_id: saved.province_id.clone(),
            province_name: saved.province_name.clone(),
            district_id: saved.district_id.clone(),
            district_name: saved.district_name.clone(),
            ward_id: saved.ward_id.clone(),
            ward_name: saved.ward_name.clone(),
            note: None,
            full_address: full_address(
                &saved.line,
                &saved.ward_name,
                &saved.district_name,
                &saved.province_name,
            ),
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn resolve_manual(
    input: &ManualAddressInput,
    regions: &dyn RegionDirectory,
) -> Result<ShippingAddress, FieldErrors> {
    let mut errors = FieldErrors::new();

    let trimmed = ManualAddressInput {
        full_name: input.full_name.trim().to_string(),
        phone: input.phone.trim().to_string(),
        email: input.email.trim().to_string(),
        line: input.line.trim().to_string(),
        ..input.clone()
    };
    let required = [
        ("fullName", &trimmed.full_name, "Full name is required"),
        ("phone", &trimmed.phone, "Phone is required"),
        ("email", &trimmed.email, "Email is required"),
        ("line", &trimmed.line, "Street address is required"),
    ];
    for (field, value, message) in required {
        if value.is_empty() {
            errors.add(field, message);
        }
    }

    if let Err(format_errors) = trimmed.validate() {
        for (field, message) in FieldErrors::from(format_errors).iter() {
            errors.add(field, message);
        }
    }

    let province_id = non_blank(&input.province_id);
    let district_id = non_blank(&input.district_id);
    let ward_id = non_blank(&input.ward_id);

    let province_name = match province_id {
        None => {
            errors.add("provinceId", "Select a province");
            None
        }
        Some(id) => {
            let name = regions.province_name(id);
            if name.is_none() {
                errors.add("provinceId", "Unknown province");
            }
            name
        }
    };
    let district_name = match (province_id, district_id) {
        (_, None) => {
            errors.add("districtId", "Select a district");
            None
        }
        (Some(p), Some(d)) if province_name.is_some() => {
            let name = regions.district_name(p, d);
            if name.is_none() {
                errors.add("districtId", "District does not belong to the selected province");
            }
            name
        }
        _ => None,
    };
    let ward_name = match (district_id, ward_id) {
        (_, None) => {
            errors.add("wardId", "Select a ward");
            None
        }
        (Some(d), Some(w)) if district_name.is_some() => {
            let name = regions.ward_name(d, w);
            if name.is_none() {
                errors.add("wardId", "Ward does not belong to the selected district");
            }
            name
        }
        _ => None,
    };

    match (province_id, province_name, district_id, district_name, ward_id, ward_name) {
        (Some(pid), Some(pname), Some(did), Some(dname), Some(wid), Some(wname))
            if errors.is_empty() =>
        {
            Ok(ShippingAddress {
                full_address: full_address(&trimmed.line, &wname, &dname, &pname),
                full_name: trimmed.full_name,
                phone: trimmed.phone,
                email: trimmed.email,
                line: trimmed.line,
                province_id: pid.to_string(),
                province_name: pname,
                district_id: did.to_string(),
                district_name: dname,
                ward_id: wid.to_string(),
                ward_name: wname,
                note: non_blank(&input.note).map(str::to_string),
            })
        }
        _ => Err(errors),
    }
}
