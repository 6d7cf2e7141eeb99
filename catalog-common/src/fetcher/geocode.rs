use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{ApiClient, Fetcher};
use crate::error::FetchError;
use crate::record::GeocodeResult;

/// GeoJSON FeatureCollection returned by the geocoder search endpoint, ranked best first.
#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// `[longitude, latitude]`
    coordinates: Vec<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    postcode: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

/// Resolves one free-text address to its top-ranked candidate.
pub struct GeocodeFetcher {
    client: ApiClient,
}

impl GeocodeFetcher {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

#[async_trait]
impl Fetcher for GeocodeFetcher {
    type Query = String;
    type Output = GeocodeResult;

    async fn fetch(&self, address: String) -> Result<GeocodeResult, FetchError> {
        if address.trim().is_empty() {
            return Ok(GeocodeResult::unmatched(address));
        }

        let params = [("q", address.clone()), ("limit", "1".to_owned())];
        let body = self.client.get_json("search/", &params).await?;

        top_candidate(address, body).map_err(|reason| FetchError::Malformed {
            api: self.client.name().to_owned(),
            reason,
        })
    }
}

/// Turn a search response into a result. No candidates, or a top candidate without usable
/// coordinates, is an unmatched result rather than an error.
fn top_candidate(address: String, body: Value) -> Result<GeocodeResult, String> {
    let collection: FeatureCollection =
        serde_json::from_value(body).map_err(|error| error.to_string())?;

    let Some(feature) = collection.features.into_iter().next() else {
        return Ok(GeocodeResult::unmatched(address));
    };

    let coordinates = feature
        .geometry
        .map(|geometry| geometry.coordinates)
        .unwrap_or_default();
    let (longitude, latitude) = match coordinates.as_slice() {
        [longitude, latitude, ..] if longitude.is_finite() && latitude.is_finite() => {
            (*longitude, *latitude)
        }
        _ => return Ok(GeocodeResult::unmatched(address)),
    };

    let properties = feature.properties;
    Ok(GeocodeResult {
        address,
        matched: true,
        latitude: Some(latitude),
        longitude: Some(longitude),
        confidence: properties.score.unwrap_or(0.0).clamp(0.0, 1.0),
        city: properties.city,
        postal_code: properties.postcode,
        label: properties.label,
    })
}
