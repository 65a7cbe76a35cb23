use serde::Deserialize;

/// What the monitoring pass does when a peeker drifts too far from its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistancePolicy {
    TeleportBack,
    EndSession,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeekConfig {
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_request_cooldown_secs")]
    pub request_cooldown_secs: u64,
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    #[serde(default = "default_per_target_limit")]
    pub max_pending_per_target: usize,
    #[serde(default = "default_per_target_limit")]
    pub max_sessions_per_target: usize,
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
    #[serde(default = "default_true")]
    pub allow_cross_realm: bool,
    /// 0 disables.
    #[serde(default)]
    pub min_peek_distance: f64,
    /// 0 disables.
    #[serde(default)]
    pub max_peek_distance: f64,
    #[serde(default = "default_max_drift_distance")]
    pub max_drift_distance: f64,
    #[serde(default = "default_distance_policy")]
    pub distance_policy: DistancePolicy,
    #[serde(default = "default_true")]
    pub realm_follow_enabled: bool,
    #[serde(default = "default_short_delay_ticks")]
    pub realm_follow_delay_ticks: u64,
    #[serde(default = "default_short_delay_ticks")]
    pub auto_accept_delay_ticks: u64,
    /// 0 disables.
    #[serde(default)]
    pub session_max_duration_secs: u64,
    #[serde(default = "default_monitor_interval_ticks")]
    pub monitor_interval_ticks: u64,
    #[serde(default = "default_consistency_interval_ticks")]
    pub consistency_interval_ticks: u64,
    #[serde(default = "default_short_delay_ticks")]
    pub session_grace_ticks: u64,
    #[serde(default = "default_switch_cooldown_secs")]
    pub switch_cooldown_secs: u64,
    /// 0 disables.
    #[serde(default)]
    pub hostile_check_radius: f64,
    #[serde(default = "default_stationary_epsilon")]
    pub stationary_epsilon: f64,
    #[serde(default = "default_long_session_warn_secs")]
    pub long_session_warn_secs: u64,
}

impl Default for PeekConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            request_timeout_secs: default_request_timeout_secs(),
            request_cooldown_secs: default_request_cooldown_secs(),
            invite_timeout_secs: default_invite_timeout_secs(),
            max_pending_per_target: default_per_target_limit(),
            max_sessions_per_target: default_per_target_limit(),
            max_active_sessions: default_max_active_sessions(),
            allow_cross_realm: true,
            min_peek_distance: 0.0,
            max_peek_distance: 0.0,
            max_drift_distance: default_max_drift_distance(),
            distance_policy: default_distance_policy(),
            realm_follow_enabled: true,
            realm_follow_delay_ticks: default_short_delay_ticks(),
            auto_accept_delay_ticks: default_short_delay_ticks(),
            session_max_duration_secs: 0,
            monitor_interval_ticks: default_monitor_interval_ticks(),
            consistency_interval_ticks: default_consistency_interval_ticks(),
            session_grace_ticks: default_short_delay_ticks(),
            switch_cooldown_secs: default_switch_cooldown_secs(),
            hostile_check_radius: 0.0,
            stationary_epsilon: default_stationary_epsilon(),
            long_session_warn_secs: default_long_session_warn_secs(),
        }
    }
}

impl PeekConfig {
    /// Reads `PEEK__*` variables (e.g. `PEEK__REQUEST_TIMEOUT_SECS=30`), falling back to
    /// defaults when the environment cannot be deserialized.
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("PEEK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(PeekConfig::normalize)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid PEEK__ configuration, using defaults");
                PeekConfig::default().normalize()
            })
    }

    pub fn normalize(mut self) -> Self {
        self.tick_millis = self.tick_millis.max(1);
        self.monitor_interval_ticks = self.monitor_interval_ticks.max(1);
        self.consistency_interval_ticks = self.consistency_interval_ticks.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.invite_timeout_secs = self.invite_timeout_secs.max(1);
        self.max_sessions_per_target = self.max_sessions_per_target.max(1);
        self.max_pending_per_target = self.max_pending_per_target.max(1);
        self.min_peek_distance = non_negative(self.min_peek_distance);
        self.max_peek_distance = non_negative(self.max_peek_distance);
        self.max_drift_distance = non_negative(self.max_drift_distance);
        self.hostile_check_radius = non_negative(self.hostile_check_radius);
        self.stationary_epsilon = non_negative(self.stationary_epsilon);
        self
    }

    /// Whole ticks covering `secs`, rounded up.
    pub fn secs_to_ticks(&self, secs: u64) -> u64 {
        secs.saturating_mul(1_000).div_ceil(self.tick_millis.max(1))
    }

    pub fn ticks_to_secs(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(self.tick_millis.max(1)) / 1_000
    }

    pub fn request_timeout_ticks(&self) -> u64 {
        self.secs_to_ticks(self.request_timeout_secs)
    }

    pub fn request_cooldown_ticks(&self) -> u64 {
        self.secs_to_ticks(self.request_cooldown_secs)
    }

    pub fn invite_timeout_ticks(&self) -> u64 {
        self.secs_to_ticks(self.invite_timeout_secs)
    }

    pub fn switch_cooldown_ticks(&self) -> u64 {
        self.secs_to_ticks(self.switch_cooldown_secs)
    }

    pub fn session_max_duration_ticks(&self) -> Option<u64> {
        (self.session_max_duration_secs > 0)
            .then(|| self.secs_to_ticks(self.session_max_duration_secs))
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn default_tick_millis() -> u64 {
    50
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_request_cooldown_secs() -> u64 {
    5
}

fn default_invite_timeout_secs() -> u64 {
    120
}

fn default_per_target_limit() -> usize {
    5
}

fn default_max_active_sessions() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_max_drift_distance() -> f64 {
    32.0
}

fn default_distance_policy() -> DistancePolicy {
    DistancePolicy::TeleportBack
}

fn default_short_delay_ticks() -> u64 {
    20
}

fn default_monitor_interval_ticks() -> u64 {
    10
}

fn default_consistency_interval_ticks() -> u64 {
    1_200
}

fn default_switch_cooldown_secs() -> u64 {
    10
}

fn default_stationary_epsilon() -> f64 {
    0.01
}

fn default_long_session_warn_secs() -> u64 {
    3_600
}
