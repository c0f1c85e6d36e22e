//! Read-side projections used by the dashboards: filtering, pagination and
//! impact figures. Everything here is a pure function of records already
//! loaded from the store.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{
    Donation, DonationRequest, DonationStatus, FoodCategory, RequestStatus, UserId,
};

pub const MEALS_PER_KG: f64 = 2.0;
pub const CARBON_OFFSET_KG_PER_KG: f64 = 2.0;
pub const TOP_DONORS_LIMIT: usize = 5;

// ── Filtering ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DonationFilter {
    pub category: Option<FoodCategory>,
    /// Case-insensitive substring of the description.
    pub keyword: Option<String>,
    /// Case-insensitive substring of the pickup address.
    pub location: Option<String>,
    pub status: Option<DonationStatus>,
    pub donor_id: Option<UserId>,
}

fn contains_ci(haystack: &str, needle: Option<&str>) -> bool {
    match needle.map(str::trim) {
        None | Some("") => true,
        Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
    }
}

impl DonationFilter {
    pub fn matches(&self, donation: &Donation) -> bool {
        self.category.map_or(true, |c| donation.category == c)
            && self.status.map_or(true, |s| donation.status == s)
            && self
                .donor_id
                .as_ref()
                .map_or(true, |d| &donation.donor_id == d)
            && contains_ci(&donation.description, self.keyword.as_deref())
            && contains_ci(&donation.pickup_address, self.location.as_deref())
    }

    pub fn apply(&self, donations: Vec<Donation>) -> Vec<Donation> {
        donations.into_iter().filter(|d| self.matches(d)).collect()
    }
}

// ── Pagination ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total_elements: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    /// Zero-based slice of `items`. A `size` of 0 is treated as 1.
    pub fn slice(items: Vec<T>, page: usize, size: usize) -> Page<T> {
        let size = size.max(1);
        let total_elements = items.len();
        let total_pages = total_elements.div_ceil(size);
        let content = items
            .into_iter()
            .skip(page.saturating_mul(size))
            .take(size)
            .collect();
        Page {
            content,
            page,
            size,
            total_elements,
            total_pages,
        }
    }
}

// ── Impact ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryShare {
    pub category: FoodCategory,
    pub food_saved_kg: f64,
    pub percentage: f64,
}

/// Food saved per pickup city. Donations whose address names no city are
/// left out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CityImpact {
    pub city: String,
    pub food_saved_kg: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopDonor {
    pub donor_id: UserId,
    pub total_donations: usize,
    pub food_saved_kg: f64,
}

/// Platform-wide figures for the admin dashboard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub total_donations: usize,
    pub by_status: BTreeMap<DonationStatus, usize>,
    pub total_food_saved_kg: f64,
    pub total_meals_served: u64,
    pub total_carbon_offset_kg: f64,
    /// Completed share of donations that reached a terminal status.
    pub completion_rate_percent: f64,
    pub food_by_category: Vec<CategoryShare>,
    /// Largest first.
    pub food_by_city: Vec<CityImpact>,
    pub top_donors: Vec<TopDonor>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DonorImpact {
    pub donor_id: UserId,
    pub total_donations: usize,
    pub completed_donations: usize,
    pub food_saved_kg: f64,
    pub meals_provided: u64,
    pub carbon_offset_kg: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeneficiaryImpact {
    pub beneficiary_id: UserId,
    pub total_requests: usize,
    pub by_status: BTreeMap<RequestStatus, usize>,
    pub food_received_kg: f64,
    pub meals_received: u64,
}

/// Kilograms moved by a completed donation; 0 for anything else.
fn saved_kg(donation: &Donation) -> f64 {
    if donation.status == DonationStatus::Completed {
        donation.quantity.as_kg().unwrap_or(0.0)
    } else {
        0.0
    }
}

fn meals(kg: f64) -> u64 {
    (kg * MEALS_PER_KG).floor() as u64
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

pub fn impact_report(donations: &[Donation]) -> ImpactReport {
    let mut by_status: BTreeMap<DonationStatus, usize> =
        DonationStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut by_category: BTreeMap<FoodCategory, f64> = BTreeMap::new();
    let mut by_city: BTreeMap<&str, f64> = BTreeMap::new();
    let mut donors: HashMap<&UserId, (usize, f64)> = HashMap::new();
    let mut total_kg = 0.0;

    for donation in donations {
        *by_status.entry(donation.status).or_default() += 1;
        let kg = saved_kg(donation);
        total_kg += kg;
        if kg > 0.0 {
            *by_category.entry(donation.category).or_default() += kg;
            if let Some(city) = donation.city() {
                *by_city.entry(city).or_default() += kg;
            }
        }
        let entry = donors.entry(&donation.donor_id).or_default();
        entry.0 += 1;
        entry.1 += kg;
    }

    let completed = by_status[&DonationStatus::Completed];
    let resolved = completed
        + by_status[&DonationStatus::Expired]
        + by_status[&DonationStatus::Rejected];

    let food_by_category = by_category
        .into_iter()
        .map(|(category, kg)| CategoryShare {
            category,
            food_saved_kg: kg,
            percentage: percent(kg, total_kg),
        })
        .collect();

    let mut food_by_city: Vec<CityImpact> = by_city
        .into_iter()
        .map(|(city, kg)| CityImpact {
            city: city.to_string(),
            food_saved_kg: kg,
        })
        .collect();
    // Stable sort keeps equal totals in city order.
    food_by_city.sort_by(|a, b| b.food_saved_kg.total_cmp(&a.food_saved_kg));

    let mut top_donors: Vec<TopDonor> = donors
        .into_iter()
        .map(|(donor_id, (count, kg))| TopDonor {
            donor_id: donor_id.clone(),
            total_donations: count,
            food_saved_kg: kg,
        })
        .collect();
    top_donors.sort_by(|a, b| {
        b.total_donations
            .cmp(&a.total_donations)
            .then_with(|| a.donor_id.cmp(&b.donor_id))
    });
    top_donors.truncate(TOP_DONORS_LIMIT);

    ImpactReport {
        total_donations: donations.len(),
        by_status,
        total_food_saved_kg: total_kg,
        total_meals_served: meals(total_kg),
        total_carbon_offset_kg: total_kg * CARBON_OFFSET_KG_PER_KG,
        completion_rate_percent: percent(completed as f64, resolved as f64),
        food_by_category,
        food_by_city,
        top_donors,
    }
}

pub fn donor_impact(donor_id: &UserId, donations: &[Donation]) -> DonorImpact {
    let own: Vec<&Donation> = donations.iter().filter(|d| &d.donor_id == donor_id).collect();
    let food_saved_kg: f64 = own.iter().map(|d| saved_kg(d)).sum();
    DonorImpact {
        donor_id: donor_id.clone(),
        total_donations: own.len(),
        completed_donations: own
            .iter()
            .filter(|d| d.status == DonationStatus::Completed)
            .count(),
        food_saved_kg,
        meals_provided: meals(food_saved_kg),
        carbon_offset_kg: food_saved_kg * CARBON_OFFSET_KG_PER_KG,
    }
}

/// `donations` only needs to contain the donations the requests point at.
pub fn beneficiary_impact(
    beneficiary_id: &UserId,
    requests: &[DonationRequest],
    donations: &[Donation],
) -> BeneficiaryImpact {
    let mut by_status: BTreeMap<RequestStatus, usize> =
        RequestStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut food_received_kg = 0.0;

    for request in requests.iter().filter(|r| &r.beneficiary_id == beneficiary_id) {
        *by_status.entry(request.status).or_default() += 1;
        if request.status == RequestStatus::Approved {
            food_received_kg += donations
                .iter()
                .find(|d| d.id == request.donation_id)
                .map_or(0.0, saved_kg);
        }
    }

    BeneficiaryImpact {
        beneficiary_id: beneficiary_id.clone(),
        total_requests: by_status.values().sum(),
        by_status,
        food_received_kg,
        meals_received: meals(food_received_kg),
    }
}
