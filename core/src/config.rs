//! Per-connection configuration: timeouts, reconnection policy, write pacing
//! and the transport bring-up policy.

use crate::device::Device;
use crate::transport::CharacteristicRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Timeouts below this are ignored by the setters
pub const MIN_TIMEOUT_MILLIS: u64 = 1000;

/// Sentinel for `try_reconnect_max_times`: never give up
pub const TRY_RECONNECT_TIMES_INFINITE: i32 = -1;

/// Default BLE ATT MTU before negotiation
pub const DEFAULT_MTU: u16 = 23;

/// Default chunk size for long writes (ATT MTU minus the 3 byte header)
pub const DEFAULT_PACKAGE_SIZE: usize = 20;

/// Platform write type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    /// Acknowledged write
    Default,
    /// Best-effort write without response
    NoResponse,
    /// Signed write
    Signed,
}

impl Default for WriteType {
    fn default() -> Self {
        WriteType::Default
    }
}

/// Chunking and pacing policy for characteristic writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Bytes per chunk
    pub package_size: usize,
    /// Use the negotiated MTU minus 3 as chunk size
    pub use_mtu_as_package_size: bool,
    /// Minimum gap between two chunks of one request
    pub package_write_delay_millis: u64,
    /// Gap before the first chunk; falls back to the chunk gap when zero
    pub request_write_delay_millis: u64,
    /// Wait for each chunk's acknowledgment before sending the next
    pub wait_write_result: bool,
    pub write_type: WriteType,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            package_size: DEFAULT_PACKAGE_SIZE,
            use_mtu_as_package_size: false,
            package_write_delay_millis: 0,
            request_write_delay_millis: 0,
            wait_write_result: true,
            write_type: WriteType::Default,
        }
    }
}

impl WriteOptions {
    /// Set the chunk size; zero is ignored
    pub fn with_package_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.package_size = size;
        }
        self
    }

    pub fn with_mtu_as_package_size(mut self, enabled: bool) -> Self {
        self.use_mtu_as_package_size = enabled;
        self
    }

    pub fn with_package_write_delay(mut self, delay: Duration) -> Self {
        self.package_write_delay_millis = delay.as_millis() as u64;
        self
    }

    pub fn with_request_write_delay(mut self, delay: Duration) -> Self {
        self.request_write_delay_millis = delay.as_millis() as u64;
        self
    }

    pub fn with_wait_write_result(mut self, wait: bool) -> Self {
        self.wait_write_result = wait;
        self
    }

    pub fn with_write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    pub fn package_write_delay(&self) -> Duration {
        Duration::from_millis(self.package_write_delay_millis)
    }

    /// Delay before the first chunk of a request
    pub fn request_write_delay(&self) -> Duration {
        if self.request_write_delay_millis > 0 {
            Duration::from_millis(self.request_write_delay_millis)
        } else {
            self.package_write_delay()
        }
    }

    /// Effective chunk size for a link with the given MTU
    pub fn effective_package_size(&self, mtu: u16) -> usize {
        if self.use_mtu_as_package_size {
            (mtu as usize).saturating_sub(3).max(1)
        } else {
            self.package_size.max(1)
        }
    }
}

/// One row of the backoff table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffStep {
    /// Number of backoff waits already served before this row applies
    pub threshold: u32,
    pub delay_millis: u64,
}

/// Staged reconnection schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    steps: Vec<BackoffStep>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new([(0, 2000), (1, 5000), (3, 10000), (5, 30000), (10, 60000)])
    }
}

impl BackoffSchedule {
    /// Build a schedule from `(threshold, delay_millis)` pairs
    pub fn new(pairs: impl IntoIterator<Item = (u32, u64)>) -> Self {
        let mut steps: Vec<BackoffStep> = pairs
            .into_iter()
            .map(|(threshold, delay_millis)| BackoffStep {
                threshold,
                delay_millis,
            })
            .collect();
        steps.sort_by_key(|s| s.threshold);
        Self { steps }
    }

    pub fn steps(&self) -> &[BackoffStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Delay before the next attempt given how many backoff waits were
    /// already served. The row with the largest threshold not above
    /// `waits_served` wins; `None` when no row applies.
    pub fn delay_for(&self, waits_served: u32) -> Option<Duration> {
        self.steps
            .iter()
            .filter(|s| s.threshold <= waits_served)
            .max_by_key(|s| s.threshold)
            .map(|s| Duration::from_millis(s.delay_millis))
    }
}

/// Device to MTU size, `None` to skip negotiation
pub type MtuPolicy = Arc<dyn Fn(&Device) -> Option<u16> + Send + Sync>;

/// Notification frame check, `false` restarts the link
pub type FrameValidator = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// What runs right after services are discovered
#[derive(Clone, Default)]
pub struct BringUpPolicy {
    pub mtu: Option<MtuPolicy>,
    /// Characteristic whose notifications are enabled after MTU negotiation
    pub notify: Option<CharacteristicRef>,
    /// Characteristic read once after notifications are enabled
    pub initial_read: Option<CharacteristicRef>,
    pub frame_validator: Option<FrameValidator>,
}

impl BringUpPolicy {
    pub fn with_mtu_policy(
        mut self,
        policy: impl Fn(&Device) -> Option<u16> + Send + Sync + 'static,
    ) -> Self {
        self.mtu = Some(Arc::new(policy));
        self
    }

    pub fn with_notify(mut self, target: CharacteristicRef) -> Self {
        self.notify = Some(target);
        self
    }

    pub fn with_initial_read(mut self, target: CharacteristicRef) -> Self {
        self.initial_read = Some(target);
        self
    }

    pub fn with_frame_validator(
        mut self,
        validator: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.frame_validator = Some(Arc::new(validator));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mtu.is_none() && self.notify.is_none() && self.initial_read.is_none()
    }
}

impl fmt::Debug for BringUpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BringUpPolicy")
            .field("mtu", &self.mtu.is_some())
            .field("notify", &self.notify)
            .field("initial_read", &self.initial_read)
            .field("frame_validator", &self.frame_validator.is_some())
            .finish()
    }
}

/// Connection configuration. Built with the `with_*` methods and frozen once
/// passed to [`crate::Registry::connect`]. Deserialized values go through
/// the same setters, so the timeout floor holds for loaded files too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredConfiguration")]
pub struct ConnectionConfiguration {
    connect_timeout_millis: u64,
    request_timeout_millis: u64,
    /// Gap between link up and service discovery
    pub discover_services_delay_millis: u64,
    pub auto_reconnect: bool,
    /// Reconnects attempted with no delay before backoff kicks in
    pub reconnect_immediately_max_times: u32,
    /// Total attempt bound, [`TRY_RECONNECT_TIMES_INFINITE`] for none
    pub try_reconnect_max_times: i32,
    pub backoff: BackoffSchedule,
    #[serde(skip)]
    default_write_options: HashMap<CharacteristicRef, WriteOptions>,
    #[serde(skip)]
    pub bring_up: BringUpPolicy,
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self {
            connect_timeout_millis: 10_000,
            request_timeout_millis: 3_000,
            discover_services_delay_millis: 600,
            auto_reconnect: true,
            reconnect_immediately_max_times: 3,
            try_reconnect_max_times: TRY_RECONNECT_TIMES_INFINITE,
            backoff: BackoffSchedule::default(),
            default_write_options: HashMap::new(),
            bring_up: BringUpPolicy::default(),
        }
    }
}

/// Serialized form of [`ConnectionConfiguration`]
#[derive(Deserialize)]
#[serde(default)]
struct StoredConfiguration {
    connect_timeout_millis: u64,
    request_timeout_millis: u64,
    discover_services_delay_millis: u64,
    auto_reconnect: bool,
    reconnect_immediately_max_times: u32,
    try_reconnect_max_times: i32,
    backoff: BackoffSchedule,
}

impl Default for StoredConfiguration {
    fn default() -> Self {
        let config = ConnectionConfiguration::default();
        Self {
            connect_timeout_millis: config.connect_timeout_millis,
            request_timeout_millis: config.request_timeout_millis,
            discover_services_delay_millis: config.discover_services_delay_millis,
            auto_reconnect: config.auto_reconnect,
            reconnect_immediately_max_times: config.reconnect_immediately_max_times,
            try_reconnect_max_times: config.try_reconnect_max_times,
            backoff: config.backoff,
        }
    }
}

impl From<StoredConfiguration> for ConnectionConfiguration {
    fn from(stored: StoredConfiguration) -> Self {
        ConnectionConfiguration::default()
            .with_connect_timeout(Duration::from_millis(stored.connect_timeout_millis))
            .with_request_timeout(Duration::from_millis(stored.request_timeout_millis))
            .with_discover_services_delay(Duration::from_millis(
                stored.discover_services_delay_millis,
            ))
            .with_auto_reconnect(stored.auto_reconnect)
            .with_reconnect_immediately_max_times(stored.reconnect_immediately_max_times)
            .with_try_reconnect_max_times(stored.try_reconnect_max_times)
            .with_backoff(stored.backoff)
    }
}

impl ConnectionConfiguration {
    /// Set the connect timeout; values under one second are ignored
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_millis() as u64;
        if millis >= MIN_TIMEOUT_MILLIS {
            self.connect_timeout_millis = millis;
        } else {
            debug!("connect timeout {}ms ignored", millis);
        }
        self
    }

    /// Set the per-request timeout; values under one second are ignored
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_millis() as u64;
        if millis >= MIN_TIMEOUT_MILLIS {
            self.request_timeout_millis = millis;
        } else {
            debug!("request timeout {}ms ignored", millis);
        }
        self
    }

    pub fn with_discover_services_delay(mut self, delay: Duration) -> Self {
        self.discover_services_delay_millis = delay.as_millis() as u64;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_immediately_max_times(mut self, times: u32) -> Self {
        self.reconnect_immediately_max_times = times;
        self
    }

    /// Bound total reconnect attempts; any negative value means infinite
    pub fn with_try_reconnect_max_times(mut self, times: i32) -> Self {
        self.try_reconnect_max_times = times.max(TRY_RECONNECT_TIMES_INFINITE);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_default_write_options(
        mut self,
        target: CharacteristicRef,
        options: WriteOptions,
    ) -> Self {
        self.default_write_options.insert(target, options);
        self
    }

    pub fn with_bring_up(mut self, policy: BringUpPolicy) -> Self {
        self.bring_up = policy;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }

    pub fn discover_services_delay(&self) -> Duration {
        Duration::from_millis(self.discover_services_delay_millis)
    }

    pub fn default_write_options(&self, target: &CharacteristicRef) -> Option<&WriteOptions> {
        self.default_write_options.get(target)
    }

    /// Whether another attempt is allowed after `attempts` were made
    pub fn may_attempt_reconnect(&self, attempts: u32) -> bool {
        self.try_reconnect_max_times == TRY_RECONNECT_TIMES_INFINITE
            || (attempts as i64) < self.try_reconnect_max_times as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfiguration::default();
        assert_eq!(config.connect_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.request_timeout(), Duration::from_millis(3_000));
        assert_eq!(config.reconnect_immediately_max_times, 3);
        assert!(config.auto_reconnect);
        assert_eq!(config.try_reconnect_max_times, TRY_RECONNECT_TIMES_INFINITE);
        assert_eq!(config.backoff.steps().len(), 5);
    }

    #[test]
    fn test_short_timeouts_are_ignored() {
        let config = ConnectionConfiguration::default()
            .with_connect_timeout(Duration::from_millis(999))
            .with_request_timeout(Duration::from_millis(10));
        assert_eq!(config.connect_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.request_timeout(), Duration::from_millis(3_000));

        let config = config
            .with_connect_timeout(Duration::from_millis(1000))
            .with_request_timeout(Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_millis(1000));
        assert_eq!(config.request_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_deserialized_short_timeouts_are_ignored() {
        let json = r#"{"request_timeout_millis": 5, "connect_timeout_millis": 1}"#;
        let config: ConnectionConfiguration = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.connect_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.request_timeout(), Duration::from_millis(3_000));

        let json = r#"{"request_timeout_millis": 4500, "try_reconnect_max_times": -9}"#;
        let config: ConnectionConfiguration = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.request_timeout(), Duration::from_millis(4500));
        assert_eq!(config.try_reconnect_max_times, TRY_RECONNECT_TIMES_INFINITE);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_backoff_schedule_default_table() {
        let schedule = BackoffSchedule::default();
        // One immediate retry, then attempt n waits per n - 2 served waits
        assert_eq!(schedule.delay_for(0), Some(Duration::from_millis(2000)));
        assert_eq!(schedule.delay_for(2), Some(Duration::from_millis(5000)));
        assert_eq!(schedule.delay_for(4), Some(Duration::from_millis(10000)));
        assert_eq!(schedule.delay_for(7), Some(Duration::from_millis(30000)));
        assert_eq!(schedule.delay_for(500), Some(Duration::from_millis(60000)));
    }

    #[test]
    fn test_backoff_schedule_unsorted_input() {
        let schedule = BackoffSchedule::new([(4, 400), (0, 100), (2, 200)]);
        assert_eq!(schedule.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(schedule.delay_for(3), Some(Duration::from_millis(200)));
        assert_eq!(schedule.steps()[0].threshold, 0);
    }

    #[test]
    fn test_backoff_schedule_without_matching_row() {
        let schedule = BackoffSchedule::new([(2, 100)]);
        assert_eq!(schedule.delay_for(0), None);
        assert!(BackoffSchedule::new([]).delay_for(3).is_none());
    }

    #[test]
    fn test_reconnect_bound() {
        let config = ConnectionConfiguration::default().with_try_reconnect_max_times(2);
        assert!(config.may_attempt_reconnect(0));
        assert!(config.may_attempt_reconnect(1));
        assert!(!config.may_attempt_reconnect(2));

        let infinite = ConnectionConfiguration::default().with_try_reconnect_max_times(-7);
        assert!(infinite.may_attempt_reconnect(u32::MAX));
    }

    #[test]
    fn test_write_options_package_size() {
        let options = WriteOptions::default();
        assert_eq!(options.effective_package_size(185), 20);

        let options = options.with_mtu_as_package_size(true);
        assert_eq!(options.effective_package_size(185), 182);

        let options = WriteOptions::default().with_package_size(0);
        assert_eq!(options.package_size, DEFAULT_PACKAGE_SIZE);
    }

    #[test]
    fn test_request_delay_falls_back_to_package_delay() {
        let options = WriteOptions::default().with_package_write_delay(Duration::from_millis(15));
        assert_eq!(options.request_write_delay(), Duration::from_millis(15));

        let options = options.with_request_write_delay(Duration::from_millis(40));
        assert_eq!(options.request_write_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_default_write_options_lookup() {
        let target = CharacteristicRef::new(Uuid::from_u128(1), Uuid::from_u128(2));
        let config = ConnectionConfiguration::default().with_default_write_options(
            target,
            WriteOptions::default().with_package_size(64),
        );
        assert_eq!(config.default_write_options(&target).map(|o| o.package_size), Some(64));
        let other = CharacteristicRef::new(Uuid::from_u128(1), Uuid::from_u128(3));
        assert!(config.default_write_options(&other).is_none());
    }

    #[test]
    fn test_configuration_json_roundtrip_keeps_policy_fields() {
        let config = ConnectionConfiguration::default()
            .with_auto_reconnect(false)
            .with_backoff(BackoffSchedule::new([(0, 750)]));
        let json = serde_json::to_string(&config).expect("serialize");
        let restored: ConnectionConfiguration = serde_json::from_str(&json).expect("deserialize");
        assert!(!restored.auto_reconnect);
        assert_eq!(restored.backoff.delay_for(3), Some(Duration::from_millis(750)));
    }
}
