use ble_mesh::{LoopbackHub, MeshRouter};
use marketplace::{
    BluetoothTrader, GossipMessage, GossipPayload, MarketplacePrice, MarketplaceService,
    TraderRole,
};
use shared::clock::{Clock, ManualClock, SystemClock};
use shared::config::{GossipConfig, MeshConfig};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Node {
    router: MeshRouter,
    service: MarketplaceService,
    /// Every gossip message delivered to this node, in arrival order
    received: Arc<Mutex<Vec<GossipMessage>>>,
}

impl Node {
    fn price_updates(&self) -> Vec<MarketplacePrice> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match &m.payload {
                GossipPayload::PriceUpdate(price) => Some(price.clone()),
                _ => None,
            })
            .collect()
    }

    async fn stop(self) {
        self.service.shutdown().await;
        self.router.disconnect().await;
    }
}

async fn node(hub: &LoopbackHub, id: &str, gossip: GossipConfig, clock: Arc<dyn Clock>) -> Node {
    let router = MeshRouter::new(
        Arc::new(hub.transport(id)),
        MeshConfig {
            device_id: id.to_string(),
            scan_window: Duration::from_millis(100),
            scan_pause: Duration::from_millis(20),
            write_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
            ..MeshConfig::default()
        },
    );

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    router
        .on_message(move |envelope| {
            if let Ok(message) = GossipMessage::decode(&envelope.content) {
                sink.lock().unwrap().push(message);
            }
        })
        .await;

    let service = MarketplaceService::new(router.clone(), gossip, clock).await;
    assert!(router.initialize().await);

    Node {
        router,
        service,
        received,
    }
}

async fn plain_node(hub: &LoopbackHub, id: &str) -> Node {
    node(hub, id, GossipConfig::default(), Arc::new(SystemClock)).await
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_linked(a: &Node, b: &Node) {
    let (a_id, b_id) = (a.router.device_id().clone(), b.router.device_id().clone());
    eventually("link", || {
        let up = a.router.connected_peers().contains(&b_id)
            && b.router.connected_peers().contains(&a_id);
        async move { up }
    })
    .await;
}

fn maize(price: f64) -> MarketplacePrice {
    MarketplacePrice::new("Maize", price, "kg", "Nakuru Market", "Nakuru")
}

#[tokio::test]
async fn test_price_reaches_connected_peer_once() {
    let hub = LoopbackHub::new();
    hub.link("d1", "d2");
    let d1 = plain_node(&hub, "d1").await;
    let d2 = plain_node(&hub, "d2").await;
    wait_linked(&d1, &d2).await;

    let sent = d1.service.broadcast_price(maize(45.0)).await.unwrap();

    eventually("price at d2", || {
        let service = d2.service.clone();
        async move { !service.get_prices_nearby(Some("maize"), None).await.is_empty() }
    })
    .await;

    let found = d2.service.get_prices_nearby(Some("maize"), None).await;
    assert_eq!(found, vec![sent.clone()]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(d2.price_updates(), vec![sent]);

    d1.stop().await;
    d2.stop().await;
}

#[tokio::test]
async fn test_price_relayed_across_chain() {
    let hub = LoopbackHub::new();
    hub.link("a", "b");
    hub.link("b", "c");
    let a = plain_node(&hub, "a").await;
    let b = plain_node(&hub, "b").await;
    let c = plain_node(&hub, "c").await;
    wait_linked(&a, &b).await;
    wait_linked(&b, &c).await;

    let sent = a.service.broadcast_price(maize(47.5)).await.unwrap();

    eventually("price at c", || {
        let service = c.service.clone();
        async move { !service.get_prices_nearby(Some("maize"), Some("nakuru")).await.is_empty() }
    })
    .await;

    let at_c = c.service.get_prices_nearby(None, None).await;
    assert_eq!(at_c[0].id, sent.id);
    assert_eq!(at_c[0].timestamp, sent.timestamp);

    for n in [a, b, c] {
        n.stop().await;
    }
}

#[tokio::test]
async fn test_price_request_answered_with_at_most_five() {
    let hub = LoopbackHub::new();
    let requester = plain_node(&hub, "requester").await;
    let holder = plain_node(&hub, "holder").await;

    let mut held = HashSet::new();
    for i in 0..7 {
        let price = holder.service.broadcast_price(maize(40.0 + i as f64)).await.unwrap();
        held.insert(price.id);
    }
    holder
        .service
        .broadcast_price(MarketplacePrice::new("Beans", 120.0, "kg", "Nakuru Market", "Nakuru"))
        .await
        .unwrap();

    hub.link("requester", "holder");
    wait_linked(&requester, &holder).await;

    requester.service.request_prices("maize", Some("nakuru")).await.unwrap();

    eventually("replies", || {
        let done = requester.price_updates().len() >= 5;
        async move { done }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let replies = requester.price_updates();
    assert_eq!(replies.len(), 5);
    let ids: HashSet<String> = replies.iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.is_subset(&held));
    assert!(replies.iter().all(|p| p.commodity == "Maize"));

    assert_eq!(requester.service.get_prices_nearby(Some("maize"), None).await.len(), 5);

    requester.stop().await;
    holder.stop().await;
}

#[tokio::test]
async fn test_malformed_content_is_dropped() {
    let hub = LoopbackHub::new();
    hub.link("d1", "d2");
    let d1 = plain_node(&hub, "d1").await;
    let d2 = plain_node(&hub, "d2").await;
    wait_linked(&d1, &d2).await;

    let bad_payloads = [
        "{not json".to_string(),
        r#"{"type":"marketplace","subtype":"price_update","data":{"commodity":"Maize"},"timestamp":1,"sender":"d1"}"#.to_string(),
        r#"{"type":"marketplace","subtype":"price_update","data":{"id":"x","commodity":"Maize","price":-5,"unit":"kg","location":"Nakuru","timestamp":1},"timestamp":1,"sender":"d1"}"#.to_string(),
        r#"{"type":"marketplace","subtype":"auction","data":{},"timestamp":1,"sender":"d1"}"#.to_string(),
    ];
    for content in bad_payloads {
        d1.router.send_message(content, None).await;
    }

    let good = d1.service.broadcast_price(maize(50.0)).await.unwrap();

    eventually("valid price after garbage", || {
        let service = d2.service.clone();
        async move { !service.get_prices_nearby(None, None).await.is_empty() }
    })
    .await;

    assert_eq!(d2.service.get_prices_nearby(None, None).await, vec![good]);
    assert!(d2.service.get_alerts_nearby(None, None).await.is_empty());
    assert!(d2.service.find_traders(None, None, None).await.is_empty());

    d1.stop().await;
    d2.stop().await;
}

#[tokio::test]
async fn test_trader_announcements_replace_per_device() {
    let hub = LoopbackHub::new();
    hub.link("seller", "buyer");
    let seller = plain_node(&hub, "seller").await;
    let buyer = plain_node(&hub, "buyer").await;
    wait_linked(&seller, &buyer).await;

    let profile = BluetoothTrader::new(
        "Kiprono",
        TraderRole::Seller,
        "Eldoret",
        "Uasin Gishu",
        vec!["Maize".to_string()],
    );
    seller.service.announce_trader(profile.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let latest = seller
        .service
        .announce_trader(profile.with_contact("0722000000"))
        .await
        .unwrap();

    eventually("latest announcement", || {
        let service = buyer.service.clone();
        let expected = latest.clone();
        async move { service.find_traders(None, None, None).await == vec![expected] }
    })
    .await;

    assert_eq!(
        buyer
            .service
            .find_traders(Some(TraderRole::Seller), Some("maize"), Some("eldoret"))
            .await
            .len(),
        1
    );
    assert!(buyer
        .service
        .find_traders(Some(TraderRole::Transporter), None, None)
        .await
        .is_empty());

    seller.stop().await;
    buyer.stop().await;
}

#[tokio::test]
async fn test_reshare_timer_spreads_recent_prices() {
    let hub = LoopbackHub::new();
    let clock = Arc::new(ManualClock::starting_now());
    let gossip = GossipConfig {
        reshare_interval: Duration::from_millis(300),
        ..GossipConfig::default()
    };
    let source = node(&hub, "source", gossip, clock.clone()).await;
    let peer = node(&hub, "peer", GossipConfig::default(), clock.clone()).await;

    let stale = source.service.broadcast_price(maize(30.0)).await.unwrap();
    clock.advance(Duration::from_secs(2 * 60 * 60));
    let mut recent = Vec::new();
    for i in 0..4 {
        recent.push(source.service.broadcast_price(maize(40.0 + i as f64)).await.unwrap());
        clock.advance(Duration::from_secs(1));
    }

    hub.link("source", "peer");
    wait_linked(&source, &peer).await;
    source.service.start().await;

    eventually("reshared prices", || {
        let distinct: HashSet<String> = peer.price_updates().into_iter().map(|p| p.id).collect();
        async move { distinct.len() >= 3 }
    })
    .await;

    let ids: HashSet<String> = peer.price_updates().into_iter().map(|p| p.id).collect();
    let newest: HashSet<String> = recent[1..].iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids, newest);
    assert!(!ids.contains(&stale.id));

    source.stop().await;
    peer.stop().await;
}

#[tokio::test]
async fn test_announcement_for_another_device_is_rejected() {
    let hub = LoopbackHub::new();
    hub.link("d1", "d2");
    let d1 = plain_node(&hub, "d1").await;
    let d2 = plain_node(&hub, "d2").await;
    wait_linked(&d1, &d2).await;

    let mut forged = BluetoothTrader::new(
        "Impostor",
        TraderRole::Buyer,
        "Nakuru",
        "Nakuru",
        vec!["Maize".to_string()],
    );
    let now = SystemClock.now_millis();
    forged.device_id = "d3".to_string();
    forged.last_seen = now;
    let content = GossipMessage::new(GossipPayload::TraderAnnouncement(forged), "d1", now)
        .encode()
        .unwrap();
    d1.router.send_message(content, None).await;

    let genuine = d1
        .service
        .announce_trader(BluetoothTrader::new(
            "Wanjiku",
            TraderRole::Seller,
            "Nakuru",
            "Nakuru",
            vec!["Beans".to_string()],
        ))
        .await
        .unwrap();

    eventually("genuine announcement", || {
        let service = d2.service.clone();
        async move { !service.find_traders(None, None, None).await.is_empty() }
    })
    .await;

    assert_eq!(d2.service.find_traders(None, None, None).await, vec![genuine]);

    d1.stop().await;
    d2.stop().await;
}
