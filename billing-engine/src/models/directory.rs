//! Units, currencies and exchange rates provided by the surrounding system.

use crate::models::RecordState;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A billable unit (apartment, office, parking space).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Unit {
    pub id: Uuid,
    pub condominium_id: Uuid,
    pub building_id: Uuid,
    pub unit_number: String,
    pub floor: Option<i32>,
    pub area_m2: Option<Decimal>,
    pub aliquot_percentage: Option<Decimal>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub parking_spaces: Option<i32>,
    pub state: RecordState,
}

impl Unit {
    /// Numeric attribute by formula variable name.
    pub fn attribute(&self, name: &str) -> Option<Decimal> {
        match name {
            "area_m2" => self.area_m2,
            "aliquot_percentage" => self.aliquot_percentage,
            "floor" => self.floor.map(Decimal::from),
            "bedrooms" => self.bedrooms.map(Decimal::from),
            "bathrooms" => self.bathrooms.map(Decimal::from),
            "parking_spaces" => self.parking_spaces.map(Decimal::from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Currency {
    pub code: String,
    pub name: String,
    pub decimal_places: i32,
    pub is_base: bool,
}

impl Currency {
    pub fn scale(&self) -> u32 {
        self.decimal_places.max(0) as u32
    }
}

/// Conversion rate from one currency to another, effective from a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExchangeRate {
    pub id: Uuid,
    pub from_currency: String,
    pub to_currency: String,
    pub rate: Decimal,
    pub effective_date: NaiveDate,
}
