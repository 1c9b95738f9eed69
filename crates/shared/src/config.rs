use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub mesh: MeshConfig,
    pub gossip: GossipConfig,
    pub secure_channel: SecureChannelConfig,
    pub profile: Option<ProfileConfig>,
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Identifier this device stamps on envelopes it originates
    pub device_id: String,
    /// Human readable name published on the device-info characteristic
    pub device_name: String,
    /// How long each discovery scan runs (default: 30s)
    pub scan_window: Duration,
    /// Pause between discovery scans (default: 5s)
    pub scan_pause: Duration,
    /// Hop limit stamped on originated envelopes (default: 7)
    pub message_ttl: u8,
    /// Maximum number of envelope ids remembered for deduplication (default: 10000)
    pub seen_cache_size: usize,
    /// How long an envelope id suppresses re-delivery (default: 300s)
    pub seen_window: Duration,
    /// Pending deliveries kept per offline recipient (default: 100)
    pub pending_queue_size: usize,
    /// Age after which a pending delivery is discarded (default: 1h)
    pub pending_max_age: Duration,
    /// Upper bound on a single characteristic write (default: 5s)
    pub write_timeout: Duration,
    /// Upper bound on connecting to and subscribing a discovered peer (default: 10s)
    pub connect_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            device_name: "soko-node".to_string(),
            scan_window: Duration::from_secs(30),
            scan_pause: Duration::from_secs(5),
            message_ttl: 7,
            seen_cache_size: 10_000,
            seen_window: Duration::from_secs(300),
            pending_queue_size: 100,
            pending_max_age: Duration::from_secs(3600),
            write_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Re-announce the local trader profile (default: 5 minutes)
    pub announce_interval: Duration,
    /// Re-share recent prices (default: 10 minutes)
    pub reshare_interval: Duration,
    /// Only prices newer than this are re-shared (default: 1 hour)
    pub reshare_window: Duration,
    /// Prices re-shared per tick (default: 3)
    pub reshare_limit: usize,
    /// Prices sent back in answer to a price request (default: 5)
    pub request_reply_limit: usize,
    pub price_freshness: Duration,
    pub alert_freshness: Duration,
    pub trader_freshness: Duration,
    /// How far in the future a remote timestamp may be (default: 5 minutes)
    pub max_clock_skew: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(5 * 60),
            reshare_interval: Duration::from_secs(10 * 60),
            reshare_window: Duration::from_secs(60 * 60),
            reshare_limit: 3,
            request_reply_limit: 5,
            price_freshness: Duration::from_secs(24 * 60 * 60),
            alert_freshness: Duration::from_secs(6 * 60 * 60),
            trader_freshness: Duration::from_secs(30 * 60),
            max_clock_skew: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecureChannelConfig {
    /// Maximum accepted age of a secure message (default: 5 minutes)
    pub replay_window: Duration,
    /// Nonces remembered to reject duplicates inside the window (default: 1024)
    pub nonce_cache_size: usize,
}

impl Default for SecureChannelConfig {
    fn default() -> Self {
        Self {
            replay_window: Duration::from_secs(5 * 60),
            nonce_cache_size: 1024,
        }
    }
}

/// Local trader profile announced on start
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub name: String,
    pub role: String,
    pub location: String,
    pub county: String,
    pub commodities: Vec<String>,
    pub services: Vec<String>,
    pub contact: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mesh_defaults = MeshConfig::default();
        let gossip_defaults = GossipConfig::default();
        let secure_defaults = SecureChannelConfig::default();

        Ok(Config {
            mesh: MeshConfig {
                device_id: env::var("MESH_DEVICE_ID").unwrap_or(mesh_defaults.device_id),
                device_name: env::var("MESH_DEVICE_NAME").unwrap_or(mesh_defaults.device_name),
                scan_window: Duration::from_secs(env_or("MESH_SCAN_WINDOW_SECS", 30)?),
                scan_pause: Duration::from_secs(env_or("MESH_SCAN_PAUSE_SECS", 5)?),
                message_ttl: env_or("MESH_MESSAGE_TTL", mesh_defaults.message_ttl)?,
                seen_cache_size: env_or("MESH_SEEN_CACHE_SIZE", mesh_defaults.seen_cache_size)?,
                seen_window: Duration::from_secs(env_or("MESH_SEEN_WINDOW_SECS", 300)?),
                pending_queue_size: env_or(
                    "MESH_PENDING_QUEUE_SIZE",
                    mesh_defaults.pending_queue_size,
                )?,
                pending_max_age: Duration::from_secs(env_or("MESH_PENDING_MAX_AGE_SECS", 3600)?),
                write_timeout: Duration::from_millis(env_or("MESH_WRITE_TIMEOUT_MS", 5000)?),
                connect_timeout: Duration::from_millis(env_or("MESH_CONNECT_TIMEOUT_MS", 10_000)?),
            },
            gossip: GossipConfig {
                announce_interval: Duration::from_secs(env_or(
                    "GOSSIP_ANNOUNCE_INTERVAL_SECS",
                    300,
                )?),
                reshare_interval: Duration::from_secs(env_or(
                    "GOSSIP_RESHARE_INTERVAL_SECS",
                    600,
                )?),
                reshare_window: Duration::from_secs(env_or("GOSSIP_RESHARE_WINDOW_SECS", 3600)?),
                reshare_limit: env_or("GOSSIP_RESHARE_LIMIT", gossip_defaults.reshare_limit)?,
                request_reply_limit: env_or(
                    "GOSSIP_REQUEST_REPLY_LIMIT",
                    gossip_defaults.request_reply_limit,
                )?,
                price_freshness: Duration::from_secs(env_or("PRICE_FRESHNESS_SECS", 86_400)?),
                alert_freshness: Duration::from_secs(env_or("ALERT_FRESHNESS_SECS", 21_600)?),
                trader_freshness: Duration::from_secs(env_or("TRADER_FRESHNESS_SECS", 1800)?),
                max_clock_skew: Duration::from_secs(env_or("GOSSIP_MAX_CLOCK_SKEW_SECS", 300)?),
            },
            secure_channel: SecureChannelConfig {
                replay_window: Duration::from_secs(env_or("SECURE_REPLAY_WINDOW_SECS", 300)?),
                nonce_cache_size: env_or(
                    "SECURE_NONCE_CACHE_SIZE",
                    secure_defaults.nonce_cache_size,
                )?,
            },
            profile: ProfileConfig::from_env(),
        })
    }
}

impl ProfileConfig {
    /// Profile is only present when `TRADER_NAME` is set
    fn from_env() -> Option<Self> {
        let name = env::var("TRADER_NAME").ok()?;

        Some(ProfileConfig {
            name,
            role: env::var("TRADER_ROLE").unwrap_or_else(|_| "seller".to_string()),
            location: env::var("TRADER_LOCATION").unwrap_or_default(),
            county: env::var("TRADER_COUNTY").unwrap_or_default(),
            commodities: split_list(&env::var("TRADER_COMMODITIES").unwrap_or_default()),
            services: split_list(&env::var("TRADER_SERVICES").unwrap_or_default()),
            contact: env::var("TRADER_CONTACT").unwrap_or_default(),
        })
    }
}

/// Read `key` from the environment, falling back to `default` when unset
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

/// Comma separated list, blanks dropped
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let mesh = MeshConfig::default();
        assert_eq!(mesh.scan_window, Duration::from_secs(30));
        assert_eq!(mesh.scan_pause, Duration::from_secs(5));

        let gossip = GossipConfig::default();
        assert_eq!(gossip.announce_interval, Duration::from_secs(300));
        assert_eq!(gossip.reshare_interval, Duration::from_secs(600));
        assert_eq!(gossip.reshare_limit, 3);
        assert_eq!(gossip.request_reply_limit, 5);
        assert_eq!(gossip.price_freshness, Duration::from_secs(86_400));
        assert_eq!(gossip.alert_freshness, Duration::from_secs(21_600));
        assert_eq!(gossip.trader_freshness, Duration::from_secs(1800));

        let secure = SecureChannelConfig::default();
        assert_eq!(secure.replay_window, Duration::from_secs(300));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" Maize, beans ,,Sorghum "),
            vec!["Maize".to_string(), "beans".to_string(), "Sorghum".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_env_or_parses_and_defaults() {
        env::set_var("SOKO_TEST_ENV_OR_VALUE", " 42 ");
        let parsed: u64 = env_or("SOKO_TEST_ENV_OR_VALUE", 7).unwrap();
        assert_eq!(parsed, 42);

        let missing: u64 = env_or("SOKO_TEST_ENV_OR_MISSING", 7).unwrap();
        assert_eq!(missing, 7);

        env::set_var("SOKO_TEST_ENV_OR_BAD", "not-a-number");
        let bad: anyhow::Result<u64> = env_or("SOKO_TEST_ENV_OR_BAD", 7);
        assert!(bad.is_err());
    }

    #[test]
    fn test_unique_default_device_ids() {
        assert_ne!(MeshConfig::default().device_id, MeshConfig::default().device_id);
    }
}
