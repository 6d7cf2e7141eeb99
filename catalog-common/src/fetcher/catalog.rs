use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ApiClient, FetchStats, Fetcher};
use crate::error::FetchError;
use crate::metrics_consts::{DUPLICATES_DROPPED, PAGES_FETCHED, RECORDS_SKIPPED};
use crate::record::{catalog_fields, page_items, CatalogRecord};

/// One page request against the catalog search endpoint. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub category: String,
    pub page: u32,
    pub page_size: u32,
}

/// The parsed records of one page.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub records: Vec<CatalogRecord>,
    /// False once the API returned an empty page.
    pub has_more: bool,
    /// Entries of this page that could not be parsed.
    pub skipped: u64,
}

/// Acquisition stopped on a page-level failure. Carries whatever was fetched before it,
/// so the caller can decide whether to keep it.
#[derive(Error, Debug)]
#[error("catalog acquisition stopped after {} records: {source}", records.len())]
pub struct PartialFetch {
    #[source]
    pub source: FetchError,
    pub records: Vec<CatalogRecord>,
    pub stats: FetchStats,
}

/// Paginated fetcher for the product catalog.
pub struct CatalogFetcher {
    client: ApiClient,
    page_size: u32,
    /// Safety bound against an API that never returns an empty page.
    max_pages: u32,
}

impl CatalogFetcher {
    pub fn new(client: ApiClient, page_size: u32, max_pages: u32) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
            max_pages,
        }
    }

    /// Fetch up to `max_items` distinct records of `category`, page by page.
    ///
    /// Stops on an empty page, once `max_items` records are collected, or after `max_pages`
    /// pages. A code already seen on an earlier page is dropped and counted, never overwritten.
    pub async fn fetch_catalog(
        &self,
        category: &str,
        max_items: usize,
    ) -> Result<(Vec<CatalogRecord>, FetchStats), PartialFetch> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut pages = 0;
        let mut records_skipped = 0;
        let mut duplicates_dropped = 0;

        let stats = |pages, records_skipped, duplicates_dropped| FetchStats {
            pages,
            records_skipped,
            duplicates_dropped,
            ..self.client.stats()
        };

        for page in 1..=self.max_pages {
            if records.len() >= max_items {
                break;
            }

            let query = PageQuery {
                category: category.to_owned(),
                page,
                page_size: self.page_size,
            };

            let fetched = match self.fetch(query).await {
                Ok(fetched) => fetched,
                Err(source) => {
                    warn!(category, page, "catalog page failed: {}", source);
                    return Err(PartialFetch {
                        source,
                        records,
                        stats: stats(pages, records_skipped, duplicates_dropped),
                    });
                }
            };

            pages += 1;
            records_skipped += fetched.skipped;

            for record in fetched.records {
                if records.len() >= max_items {
                    break;
                }
                if !seen.insert(record.code.clone()) {
                    debug!(code = record.code.as_str(), page, "dropping duplicate record");
                    duplicates_dropped += 1;
                    metrics::counter!(DUPLICATES_DROPPED).increment(1);
                    continue;
                }
                records.push(record);
            }

            info!(category, page, total = records.len(), "fetched catalog page");

            if !fetched.has_more {
                break;
            }

            if page == self.max_pages {
                warn!(category, max_pages = self.max_pages, "stopping at page limit");
            }
        }

        Ok((records, stats(pages, records_skipped, duplicates_dropped)))
    }
}

#[async_trait]
impl Fetcher for CatalogFetcher {
    type Query = PageQuery;
    type Output = CatalogPage;

    async fn fetch(&self, query: PageQuery) -> Result<CatalogPage, FetchError> {
        let params = [
            ("categories_tags", query.category),
            ("page", query.page.to_string()),
            ("page_size", query.page_size.to_string()),
            ("fields", catalog_fields()),
        ];
        let body = self.client.get_json("search", &params).await?;

        let items = page_items(body).ok_or_else(|| FetchError::Malformed {
            api: self.client.name().to_owned(),
            reason: "expected a product array".to_owned(),
        })?;

        let has_more = !items.is_empty();
        let mut page = CatalogPage {
            records: Vec::with_capacity(items.len()),
            has_more,
            skipped: 0,
        };

        for item in &items {
            match CatalogRecord::from_json(item) {
                Ok(record) => page.records.push(record),
                Err(error) => {
                    debug!(page = query.page, "skipping entry: {}", error);
                    page.skipped += 1;
                }
            }
        }

        metrics::counter!(PAGES_FETCHED).increment(1);
        metrics::counter!(RECORDS_SKIPPED).increment(page.skipped);

        Ok(page)
    }
}
