use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Tunables of the duel protocol
#[derive(Debug, Clone)]
pub struct DuelConfig {
    /// Pause between the host switching to playing and the first question
    pub start_delay: Duration,
    /// Pause between a correct answer and the next question
    pub next_question_delay: Duration,
    /// Score lead that ends the game
    pub win_margin: u32,
    /// Chance (percent) that a multiplication uses the wide [1,10] factor range
    pub wide_multiply_percent: u32,
    /// Fixed RNG seed for reproducible questions and codes
    pub rng_seed: Option<u64>,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(1500),
            next_question_delay: Duration::from_millis(600),
            win_margin: 10,
            wide_multiply_percent: 10,
            rng_seed: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

impl DuelConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            start_delay: env_parse("DUEL_START_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.start_delay),
            next_question_delay: env_parse("DUEL_NEXT_QUESTION_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.next_question_delay),
            win_margin: env_parse::<u32>("DUEL_WIN_MARGIN")
                .filter(|margin| *margin > 0)
                .unwrap_or(defaults.win_margin),
            wide_multiply_percent: env_parse::<u32>("DUEL_WIDE_MULTIPLY_PERCENT")
                .map(|percent| percent.min(100))
                .unwrap_or(defaults.wide_multiply_percent),
            rng_seed: env_parse("DUEL_RNG_SEED"),
        }
    }

    /// No delays; useful for tests and bots
    pub fn immediate() -> Self {
        Self {
            start_delay: Duration::ZERO,
            next_question_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Where the relay server listens
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 6574,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env_parse("MATHDUEL_BIND").unwrap_or(defaults.bind),
            port: env_parse("MATHDUEL_PORT").unwrap_or(defaults.port),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}
