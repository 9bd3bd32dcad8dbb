//! Scraped name to catalog id resolution.
//!
//! The index is immutable once built. [`ItemResolver::rebuild`] loads the
//! catalog, builds a fresh [`NameIndex`] off to the side and swaps the `Arc`
//! in one write, so a lookup sees either the old index or the new one.

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};
use tracing::info;

use crate::{
    entities::{CatalogItem, DealType, Listing, ListingView},
    normalize::normalize,
    store::{CatalogSource, StoreError},
    upstream::DraftListing,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    Prefix,
    Contains,
}

#[derive(Debug, Default)]
pub struct NameIndex {
    exact: HashMap<String, i32>,
    /// Shortest name first, then by name, then by id. Prefix and contains
    /// lookups return the first hit in this order.
    ordered: Vec<(String, i32)>,
    built_at: Option<DateTime<Utc>>,
}

impl NameIndex {
    #[must_use]
    pub fn build(items: Vec<CatalogItem>) -> Self {
        let mut ordered: Vec<(String, i32)> = items
            .into_iter()
            .filter_map(|item| {
                let name = item.name.trim();
                (!name.is_empty()).then(|| (name.to_string(), item.item_id))
            })
            .collect();
        ordered.sort_by(|(a_name, a_id), (b_name, b_id)| {
            a_name
                .chars()
                .count()
                .cmp(&b_name.chars().count())
                .then_with(|| a_name.cmp(b_name))
                .then_with(|| a_id.cmp(b_id))
        });
        ordered.dedup_by(|b, a| a.0 == b.0);

        let exact = ordered.iter().cloned().collect();

        Self {
            exact,
            ordered,
            built_at: Some(Utc::now()),
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<(i32, MatchTier)> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        if let Some(id) = self.exact.get(name) {
            return Some((*id, MatchTier::Exact));
        }
        if let Some((_, id)) = self.ordered.iter().find(|(n, _)| n.starts_with(name)) {
            return Some((*id, MatchTier::Prefix));
        }
        self.ordered
            .iter()
            .find(|(n, _)| n.contains(name))
            .map(|(_, id)| (*id, MatchTier::Contains))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    #[must_use]
    pub const fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }
}

pub struct ItemResolver {
    index: RwLock<Arc<NameIndex>>,
    source: Arc<dyn CatalogSource>,
    icon_template: String,
}

impl std::fmt::Debug for ItemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemResolver")
            .field("entries", &self.snapshot().len())
            .field("icon_template", &self.icon_template)
            .finish_non_exhaustive()
    }
}

impl ItemResolver {
    /// Starts with an empty index; call [`Self::rebuild`] to load it.
    #[must_use]
    pub fn new(source: Arc<dyn CatalogSource>, icon_template: String) -> Self {
        Self {
            index: RwLock::new(Arc::new(NameIndex::default())),
            source,
            icon_template,
        }
    }

    /// Loads the catalog and replaces the index. On failure the previous
    /// index stays in place.
    pub async fn rebuild(&self) -> Result<usize, StoreError> {
        let start = Instant::now();
        let items = self.source.load().await?;
        let index = Arc::new(NameIndex::build(items));
        let entries = index.len();

        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;

        info!(
            entries,
            elapsed = ?start.elapsed(),
            "rebuilt item name index"
        );
        Ok(entries)
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<NameIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Catalog id for an already normalized name.
    #[must_use]
    pub fn resolve(&self, normalized: &str) -> Option<i32> {
        match self.snapshot().lookup(normalized) {
            Some((id, tier)) => {
                increment_counter!("vending_resolver_hit", "tier" => tier_label(tier));
                Some(id)
            }
            None => {
                increment_counter!("vending_resolver_miss");
                None
            }
        }
    }

    #[must_use]
    pub fn icon_url(&self, item_id: i32) -> String {
        self.icon_template.replace("{id}", &item_id.to_string())
    }

    /// Normalized name and catalog id for a scraped name. An id taken from
    /// the row image wins over name matching.
    #[must_use]
    pub fn identify(&self, item_name: &str, image_item_id: Option<i32>) -> (String, Option<i32>) {
        let normalized = normalize(item_name);
        let item_id = image_item_id.or_else(|| self.resolve(&normalized));
        (normalized, item_id)
    }

    #[must_use]
    pub fn view(&self, draft: &DraftListing) -> ListingView {
        let (item_name_normalized, item_id) = self.identify(&draft.item_name, draft.image_item_id);
        ListingView {
            item_name: draft.item_name.clone(),
            item_name_normalized,
            item_id,
            icon_url: item_id.map(|id| self.icon_url(id)),
            image_url: draft.image_url.clone(),
            price: draft.price,
            quantity: draft.quantity,
            shop_name: draft.shop_name.clone(),
            seller_name: draft.seller_name.clone(),
            location: draft.location.clone(),
            deal_type: draft.deal_type,
            map_id: draft.map_id.clone(),
            transaction_id: draft.transaction_id.clone(),
        }
    }

    /// View of a stored listing; its item id was resolved at insert time.
    #[must_use]
    pub fn view_stored(&self, listing: Listing) -> ListingView {
        ListingView {
            icon_url: listing.item_id.map(|id| self.icon_url(id)),
            item_id: listing.item_id,
            deal_type: DealType::from_db(&listing.deal_type),
            item_name: listing.item_name,
            item_name_normalized: listing.item_name_normalized,
            image_url: None,
            price: listing.price,
            quantity: listing.quantity,
            shop_name: listing.shop_name,
            seller_name: listing.seller_name,
            location: listing.location,
            map_id: Some(listing.map_id),
            transaction_id: Some(listing.transaction_id),
        }
    }
}

const fn tier_label(tier: MatchTier) -> &'static str {
    match tier {
        MatchTier::Exact => "exact",
        MatchTier::Prefix => "prefix",
        MatchTier::Contains => "contains",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn item(item_id: i32, name: &str) -> CatalogItem {
        CatalogItem {
            item_id,
            name: name.to_string(),
        }
    }

    fn index() -> NameIndex {
        NameIndex::build(vec![
            item(2357, "Valkyrie Armor"),
            item(501, "Red Potion"),
            item(545, "Condensed Red Potion"),
            item(12000, "Red Potion Box"),
            item(1201, "Knife"),
            item(1202, "Knife"),
            item(0, "  "),
        ])
    }

    #[test]
    fn tiers_in_order() {
        let index = index();
        assert_eq!(index.lookup("Red Potion"), Some((501, MatchTier::Exact)));
        assert_eq!(index.lookup("Red Pot"), Some((501, MatchTier::Prefix)));
        assert_eq!(index.lookup("ed Potion B"), Some((12000, MatchTier::Contains)));
        assert_eq!(index.lookup("Mjolnir"), None);
        assert_eq!(index.lookup(""), None);
    }

    #[test]
    fn ties_prefer_shortest_then_lowest_id() {
        let index = index();
        // "Red Potion" is shorter than "Condensed Red Potion"
        assert_eq!(index.lookup("Potion"), Some((501, MatchTier::Contains)));
        assert_eq!(index.lookup("Knife"), Some((1201, MatchTier::Exact)));
        assert_eq!(index.len(), 5);
    }

    struct SwitchingCatalog {
        items: Mutex<Vec<CatalogItem>>,
    }

    #[async_trait]
    impl CatalogSource for SwitchingCatalog {
        async fn load(&self) -> Result<Vec<CatalogItem>, StoreError> {
            Ok(self.items.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn rebuild_replaces_whole_index() {
        let catalog = Arc::new(SwitchingCatalog {
            items: Mutex::new(vec![item(501, "Red Potion")]),
        });
        let resolver = ItemResolver::new(
            catalog.clone(),
            "https://static.divine-pride.net/images/items/item/{id}.png".to_string(),
        );
        assert_eq!(resolver.resolve("Red Potion"), None);

        assert_eq!(resolver.rebuild().await.unwrap(), 1);
        let before = resolver.snapshot();
        assert_eq!(resolver.resolve("Red Potion"), Some(501));

        *catalog.items.lock().unwrap() = vec![item(502, "Orange Potion")];
        resolver.rebuild().await.unwrap();

        // a reader holding the old snapshot keeps a complete view
        assert_eq!(before.lookup("Red Potion"), Some((501, MatchTier::Exact)));
        assert_eq!(resolver.resolve("Red Potion"), None);
        assert_eq!(resolver.resolve("Orange Potion"), Some(502));
        assert_eq!(
            resolver.icon_url(502),
            "https://static.divine-pride.net/images/items/item/502.png"
        );
    }

    #[tokio::test]
    async fn views_normalize_and_resolve() {
        let catalog = Arc::new(SwitchingCatalog {
            items: Mutex::new(vec![item(2357, "Valkyrie Armor")]),
        });
        let resolver = ItemResolver::new(catalog, "/icons/{id}.png".to_string());
        resolver.rebuild().await.unwrap();

        let mut draft = crate::upstream::fake::draft("+7 Valkyrie Armor [1]", 100, "1");
        let view = resolver.view(&draft);
        assert_eq!(view.item_name_normalized, "Valkyrie Armor");
        assert_eq!(view.item_id, Some(2357));
        assert_eq!(view.icon_url.as_deref(), Some("/icons/2357.png"));

        draft.image_item_id = Some(2358);
        assert_eq!(resolver.view(&draft).item_id, Some(2358));
    }
}
