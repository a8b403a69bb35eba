//! Server tuning knobs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest message size offered in `Rversion`
pub const DEFAULT_MSIZE: u32 = sigmap::MAX_FRAME as u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsServerConfig {
    pub msize: u32,
    /// Close sessions silent for longer than this; `None` never times out
    #[serde(with = "opt_millis")]
    pub session_timeout: Option<Duration>,
    /// How often the session monitor looks for timed out sessions
    #[serde(with = "millis")]
    pub monitor_interval: Duration,
    /// How often expired leases are swept
    #[serde(with = "millis")]
    pub lease_sweep_interval: Duration,
}

impl Default for FsServerConfig {
    fn default() -> Self {
        Self {
            msize: DEFAULT_MSIZE,
            session_timeout: Some(Duration::from_secs(30)),
            monitor_interval: Duration::from_secs(1),
            lease_sweep_interval: Duration::from_millis(500),
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
