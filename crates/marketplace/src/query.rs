//! Read-side filters over record snapshots

use crate::types::{BluetoothTrader, MarketplaceAlert, MarketplacePrice, Record, TraderRole};
use std::time::Duration;

/// Case-insensitive substring match; an absent or blank filter matches anything
pub fn matches_filter(value: &str, filter: Option<&str>) -> bool {
    match filter.map(str::trim) {
        None | Some("") => true,
        Some(needle) => value.to_lowercase().contains(&needle.to_lowercase()),
    }
}

fn matches_any<'a>(mut values: impl Iterator<Item = &'a str>, filter: Option<&str>) -> bool {
    match filter.map(str::trim) {
        None | Some("") => true,
        Some(_) => values.any(|v| matches_filter(v, filter)),
    }
}

/// Age of `timestamp` is within `window` (inclusive)
pub fn is_fresh(timestamp: i64, now: i64, window: Duration) -> bool {
    now.saturating_sub(timestamp) <= window.as_millis() as i64
}

fn fresh_newest_first<T: Record>(records: Vec<T>, now: i64, window: Duration) -> impl Iterator<Item = T> {
    let mut records: Vec<T> = records
        .into_iter()
        .filter(|r| is_fresh(r.timestamp(), now, window))
        .collect();
    records.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
    records.into_iter()
}

/// Fresh prices matching commodity and location (location, county or market)
pub fn prices_nearby(
    prices: Vec<MarketplacePrice>,
    commodity: Option<&str>,
    location: Option<&str>,
    now: i64,
    freshness: Duration,
) -> Vec<MarketplacePrice> {
    fresh_newest_first(prices, now, freshness)
        .filter(|p| matches_filter(&p.commodity, commodity))
        .filter(|p| {
            matches_any(
                [p.location.as_str(), p.county.as_str(), p.market.as_str()].into_iter(),
                location,
            )
        })
        .collect()
}

/// Newest `limit` prices no older than `window`, for re-sharing
pub fn recent_prices(
    prices: Vec<MarketplacePrice>,
    now: i64,
    window: Duration,
    limit: usize,
) -> Vec<MarketplacePrice> {
    fresh_newest_first(prices, now, window).take(limit).collect()
}

pub fn alerts_nearby(
    alerts: Vec<MarketplaceAlert>,
    commodity: Option<&str>,
    location: Option<&str>,
    now: i64,
    freshness: Duration,
) -> Vec<MarketplaceAlert> {
    fresh_newest_first(alerts, now, freshness)
        .filter(|a| matches_filter(&a.commodity, commodity))
        .filter(|a| matches_any([a.location.as_str(), a.county.as_str()].into_iter(), location))
        .collect()
}

pub fn traders_matching(
    traders: Vec<BluetoothTrader>,
    role: Option<TraderRole>,
    commodity: Option<&str>,
    location: Option<&str>,
    now: i64,
    freshness: Duration,
) -> Vec<BluetoothTrader> {
    fresh_newest_first(traders, now, freshness)
        .filter(|t| role.map_or(true, |r| t.role == r))
        .filter(|t| matches_any(t.commodities.iter().map(String::as_str), commodity))
        .filter(|t| matches_any([t.location.as_str(), t.county.as_str()].into_iter(), location))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertType;
    use proptest::prelude::*;

    const NOW: i64 = 1_700_000_000_000;
    const HOUR: i64 = 60 * 60 * 1000;
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn price(id: &str, commodity: &str, location: &str, county: &str, age_ms: i64) -> MarketplacePrice {
        let mut price = MarketplacePrice::new(commodity, 10.0, "kg", location, county);
        price.id = id.to_string();
        price.timestamp = NOW - age_ms;
        price
    }

    fn trader(device: &str, role: TraderRole, commodities: &[&str], age_ms: i64) -> BluetoothTrader {
        let mut trader = BluetoothTrader::new(
            device,
            role,
            "Nakuru Town",
            "Nakuru",
            commodities.iter().map(|c| c.to_string()).collect(),
        );
        trader.device_id = device.to_string();
        trader.last_seen = NOW - age_ms;
        trader
    }

    #[test]
    fn test_filter_matching() {
        assert!(matches_filter("Nakuru Market", Some("nakuru")));
        assert!(matches_filter("Nakuru Market", Some("MARKET")));
        assert!(matches_filter("Nakuru Market", None));
        assert!(matches_filter("Nakuru Market", Some("  ")));
        assert!(!matches_filter("Nakuru Market", Some("Kisumu")));
    }

    #[test]
    fn test_freshness_boundary() {
        assert!(is_fresh(NOW - 24 * HOUR, NOW, DAY));
        assert!(!is_fresh(NOW - 24 * HOUR - 1, NOW, DAY));
        assert!(is_fresh(NOW + 1000, NOW, DAY));
    }

    #[test]
    fn test_prices_nearby_filters_and_sorts() {
        let prices = vec![
            price("old", "Maize", "Nakuru Market", "Nakuru", 25 * HOUR),
            price("a", "Maize", "Nakuru Market", "Nakuru", 3 * HOUR),
            price("b", "White Maize", "Gilgil", "Nakuru", HOUR),
            price("c", "Beans", "Nakuru Market", "Nakuru", 0),
            price("d", "Maize", "Kisumu", "Kisumu", 0),
        ];

        let ids: Vec<String> = prices_nearby(prices, Some("maize"), Some("nakuru"), NOW, DAY)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_location_matches_market_field() {
        let mut p = price("m", "Maize", "Town centre", "Nakuru", 0);
        p.market = "Wakulima".to_string();

        assert_eq!(prices_nearby(vec![p], None, Some("wakulima"), NOW, DAY).len(), 1);
    }

    #[test]
    fn test_recent_prices_limit_and_window() {
        let prices = vec![
            price("old", "Maize", "Nakuru", "Nakuru", 2 * HOUR),
            price("p1", "Maize", "Nakuru", "Nakuru", 40 * 60_000),
            price("p2", "Beans", "Nakuru", "Nakuru", 30 * 60_000),
            price("p3", "Maize", "Nakuru", "Nakuru", 20 * 60_000),
            price("p4", "Rice", "Nakuru", "Nakuru", 10 * 60_000),
        ];

        let hour = Duration::from_secs(60 * 60);
        let ids: Vec<String> = recent_prices(prices.clone(), NOW, hour, 3)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p4", "p3", "p2"]);

        assert_eq!(recent_prices(prices, NOW, hour, 10).len(), 4);
    }

    #[test]
    fn test_alerts_nearby() {
        let mut fresh = MarketplaceAlert::new(AlertType::PriceDrop, "Tomatoes", "Karatina", "Nyeri", "Dropped to 30");
        fresh.id = "fresh".into();
        fresh.timestamp = NOW - 5 * HOUR;
        let mut stale = fresh.clone();
        stale.id = "stale".into();
        stale.timestamp = NOW - 7 * HOUR;

        let six_hours = Duration::from_secs(6 * 60 * 60);
        let found = alerts_nearby(vec![fresh, stale], Some("tomato"), Some("nyeri"), NOW, six_hours);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "fresh");
    }

    #[test]
    fn test_traders_by_role_commodity_location() {
        let half_hour = Duration::from_secs(30 * 60);
        let traders = vec![
            trader("s1", TraderRole::Seller, &["Maize", "Beans"], 60_000),
            trader("b1", TraderRole::Buyer, &["Maize"], 60_000),
            trader("s2", TraderRole::Seller, &["Potatoes"], 60_000),
            trader("s3", TraderRole::Seller, &["Maize"], 31 * 60_000),
        ];

        let sellers = traders_matching(traders.clone(), Some(TraderRole::Seller), None, None, NOW, half_hour);
        assert!(sellers.iter().all(|t| t.role == TraderRole::Seller));
        assert_eq!(sellers.len(), 2);

        let maize = traders_matching(traders.clone(), None, Some("MAIZE"), Some("nakuru"), NOW, half_hour);
        let ids: Vec<&str> = maize.iter().map(|t| t.device_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"s1") && ids.contains(&"b1"));

        assert!(traders_matching(traders, None, None, Some("Mombasa"), NOW, half_hour).is_empty());
    }

    proptest! {
        #[test]
        fn prop_filter_is_case_insensitive(value in "[a-zA-Z ]{1,20}", start in 0usize..20, len in 1usize..20) {
            let chars: Vec<char> = value.chars().collect();
            let start = start.min(chars.len() - 1);
            let end = (start + len).min(chars.len());
            let needle: String = chars[start..end].iter().collect();

            prop_assert!(matches_filter(&value, Some(&needle.to_uppercase())));
            prop_assert!(matches_filter(&value.to_uppercase(), Some(&needle.to_lowercase())));
        }

        #[test]
        fn prop_results_sorted_newest_first(ages in proptest::collection::vec(0i64..(24 * HOUR), 0..30)) {
            let prices: Vec<MarketplacePrice> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| price(&i.to_string(), "Maize", "Nakuru", "Nakuru", *age))
                .collect();

            let found = prices_nearby(prices, None, None, NOW, DAY);
            prop_assert_eq!(found.len(), ages.len());
            prop_assert!(found.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        }
    }
}
