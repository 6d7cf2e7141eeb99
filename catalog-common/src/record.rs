use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, MalformedRecord};

/// Store segments this short are too vague to geocode.
const MIN_ADDRESS_CHARS: usize = 4;

/// Per-100g nutrition facts. Negative values are dropped as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrition {
    pub energy_100g: Option<f64>,
    pub sugars_100g: Option<f64>,
    pub fat_100g: Option<f64>,
    pub salt_100g: Option<f64>,
    pub proteins_100g: Option<f64>,
}

/// A product as returned by the catalog API, after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Unique product code. Never empty; used as the dedup key.
    pub code: String,
    pub product_name: Option<String>,
    pub brands: Vec<String>,
    pub categories: Vec<String>,
    /// Lower-cased, one of `a` to `e`.
    pub nutriscore_grade: Option<String>,
    /// One of 1 to 4.
    pub nova_group: Option<u8>,
    #[serde(flatten)]
    pub nutrition: Nutrition,
    /// Raw, possibly comma separated, list of stores selling the product.
    pub stores: Option<String>,
}

impl CatalogRecord {
    /// Parse one element of a catalog page.
    ///
    /// Nutrition fields are read from the top level or from a nested `nutriments` object.
    pub fn from_json(value: &Value) -> Result<Self, MalformedRecord> {
        let object = value
            .as_object()
            .ok_or_else(|| MalformedRecord(format!("expected an object, got {value}")))?;

        let code = object
            .get("code")
            .and_then(text)
            .ok_or_else(|| MalformedRecord("missing product code".to_owned()))?;

        let nutriments = object.get("nutriments").and_then(Value::as_object);
        let nutrient = |name: &str| {
            object
                .get(name)
                .or_else(|| nutriments.and_then(|n| n.get(name)))
                .and_then(quantity)
        };

        Ok(Self {
            product_name: object.get("product_name").and_then(text),
            brands: object.get("brands").map(list).unwrap_or_default(),
            categories: object.get("categories").map(list).unwrap_or_default(),
            nutriscore_grade: object
                .get("nutriscore_grade")
                .and_then(text)
                .map(|grade| grade.to_lowercase())
                .filter(|grade| matches!(grade.as_str(), "a" | "b" | "c" | "d" | "e")),
            nova_group: object
                .get("nova_group")
                .and_then(quantity)
                .filter(|group| group.fract() == 0.0 && (1.0..=4.0).contains(group))
                .map(|group| group as u8),
            nutrition: Nutrition {
                energy_100g: nutrient("energy_100g"),
                sugars_100g: nutrient("sugars_100g"),
                fat_100g: nutrient("fat_100g"),
                salt_100g: nutrient("salt_100g"),
                proteins_100g: nutrient("proteins_100g"),
            },
            stores: object.get("stores").and_then(text),
            code,
        })
    }

    /// The address used for geocoding: the first store segment, when it is long enough.
    pub fn store_address(&self) -> Option<&str> {
        let first = self.stores.as_deref()?.split(',').next()?.trim();
        (first.chars().count() >= MIN_ADDRESS_CHARS).then_some(first)
    }
}

fn text(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

fn list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_owned)
            .collect(),
        Value::Array(items) => items.iter().filter_map(text).collect(),
        _ => Vec::new(),
    }
}

fn quantity(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (number.is_finite() && number >= 0.0).then_some(number)
}

/// Outcome of geocoding one address.
///
/// An unmatched result never carries coordinates, city or postal code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    /// The normalized address that was looked up.
    pub address: String,
    pub matched: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Within [0, 1]; 0 when unmatched.
    pub confidence: f64,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    /// Full label of the resolved address, as returned by the geocoder.
    pub label: Option<String>,
}

impl GeocodeResult {
    pub fn unmatched(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            matched: false,
            latitude: None,
            longitude: None,
            confidence: 0.0,
            city: None,
            postal_code: None,
            label: None,
        }
    }
}

/// A catalog record with its geocoding merged in. Built once by the `Enricher`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: CatalogRecord,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub geocoding_confidence: Option<f64>,
    pub store_label: Option<String>,
    pub is_geocoded: bool,
}

impl EnrichedRecord {
    pub fn unenriched(record: CatalogRecord) -> Self {
        Self {
            record,
            latitude: None,
            longitude: None,
            city: None,
            postal_code: None,
            geocoding_confidence: None,
            store_label: None,
            is_geocoded: false,
        }
    }

    /// Merge a geocoding result. Unmatched results leave every location field absent.
    pub fn merge(record: CatalogRecord, geocode: &GeocodeResult) -> Self {
        if !geocode.matched {
            return Self::unenriched(record);
        }

        Self {
            record,
            latitude: geocode.latitude,
            longitude: geocode.longitude,
            city: geocode.city.clone(),
            postal_code: geocode.postal_code.clone(),
            geocoding_confidence: Some(geocode.confidence),
            store_label: geocode.label.clone(),
            is_geocoded: true,
        }
    }

    pub fn has_field(&self, field: RecordField) -> bool {
        let record = &self.record;
        match field {
            RecordField::Code => !record.code.is_empty(),
            RecordField::ProductName => record.product_name.is_some(),
            RecordField::Brands => !record.brands.is_empty(),
            RecordField::Categories => !record.categories.is_empty(),
            RecordField::NutriscoreGrade => record.nutriscore_grade.is_some(),
            RecordField::NovaGroup => record.nova_group.is_some(),
            RecordField::Energy => record.nutrition.energy_100g.is_some(),
            RecordField::Sugars => record.nutrition.sugars_100g.is_some(),
            RecordField::Fat => record.nutrition.fat_100g.is_some(),
            RecordField::Salt => record.nutrition.salt_100g.is_some(),
            RecordField::Proteins => record.nutrition.proteins_100g.is_some(),
            RecordField::Stores => record.stores.is_some(),
            RecordField::Latitude => self.latitude.is_some(),
            RecordField::Longitude => self.longitude.is_some(),
            RecordField::City => self.city.is_some(),
            RecordField::PostalCode => self.postal_code.is_some(),
        }
    }
}

/// Fields of an `EnrichedRecord` that completeness can be measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Code,
    ProductName,
    Brands,
    Categories,
    NutriscoreGrade,
    NovaGroup,
    #[serde(rename = "energy_100g")]
    Energy,
    #[serde(rename = "sugars_100g")]
    Sugars,
    #[serde(rename = "fat_100g")]
    Fat,
    #[serde(rename = "salt_100g")]
    Salt,
    #[serde(rename = "proteins_100g")]
    Proteins,
    Stores,
    Latitude,
    Longitude,
    City,
    PostalCode,
}

impl RecordField {
    pub const ALL: [RecordField; 16] = [
        RecordField::Code,
        RecordField::ProductName,
        RecordField::Brands,
        RecordField::Categories,
        RecordField::NutriscoreGrade,
        RecordField::NovaGroup,
        RecordField::Energy,
        RecordField::Sugars,
        RecordField::Fat,
        RecordField::Salt,
        RecordField::Proteins,
        RecordField::Stores,
        RecordField::Latitude,
        RecordField::Longitude,
        RecordField::City,
        RecordField::PostalCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordField::Code => "code",
            RecordField::ProductName => "product_name",
            RecordField::Brands => "brands",
            RecordField::Categories => "categories",
            RecordField::NutriscoreGrade => "nutriscore_grade",
            RecordField::NovaGroup => "nova_group",
            RecordField::Energy => "energy_100g",
            RecordField::Sugars => "sugars_100g",
            RecordField::Fat => "fat_100g",
            RecordField::Salt => "salt_100g",
            RecordField::Proteins => "proteins_100g",
            RecordField::Stores => "stores",
            RecordField::Latitude => "latitude",
            RecordField::Longitude => "longitude",
            RecordField::City => "city",
            RecordField::PostalCode => "postal_code",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordField {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        RecordField::ALL
            .into_iter()
            .find(|field| field.as_str() == name)
            .ok_or_else(|| ConfigError::UnknownField(name.to_owned()))
    }
}

/// The catalog fields requested from the API, in query-parameter form.
pub fn catalog_fields() -> String {
    [
        "code",
        "product_name",
        "brands",
        "categories",
        "nutriscore_grade",
        "nova_group",
        "nutriments",
        "stores",
    ]
    .join(",")
}

/// Extract the product array from a catalog page body: either a bare array or the
/// `products` member of a search response.
pub fn page_items(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut object) => match object.remove("products") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}
