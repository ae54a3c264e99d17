use serde::{Deserialize, Serialize};

const DAY_SECS: i64 = 86_400;

/// Size ceilings, time horizons, and optional-field switches applied to every
/// fused record and partial override.
///
/// Constructed once per engine instance; never mutated during a pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectiveLimits {
    pub max_name_size_b: usize,
    pub max_bidding_signals_size_b: usize,
    /// Serialized size of the whole fused record.
    pub max_record_size_b: usize,
    /// Serialized size of the ads list.
    pub max_ads_size_b: usize,
    pub max_num_ads: usize,
    /// Serialized size of the trusted bidding data (uri plus keys).
    pub max_trusted_bidding_data_size_b: usize,
    pub max_activation_delay_secs: i64,
    pub max_expire_in_secs: i64,
    /// Used when neither the response nor an override supplies an expiration.
    pub default_expire_in_secs: i64,
    pub ad_render_id_enabled: bool,
    pub ad_render_id_max_length: usize,
    pub auction_server_request_flags_enabled: bool,
    /// Gates the `priority` field.
    pub seller_configuration_enabled: bool,
    /// Gates per-ad `ad_counter_keys` and the `frequency_cap` ad filter.
    pub frequency_cap_filtering_enabled: bool,
    /// Gates the `app_install` ad filter.
    pub app_install_filtering_enabled: bool,
}

impl Default for DirectiveLimits {
    fn default() -> Self {
        Self {
            max_name_size_b: 200,
            max_bidding_signals_size_b: 10_240,
            max_record_size_b: 100_000,
            max_ads_size_b: 10_000,
            max_num_ads: 100,
            max_trusted_bidding_data_size_b: 10_240,
            max_activation_delay_secs: 60 * DAY_SECS,
            max_expire_in_secs: 60 * DAY_SECS,
            default_expire_in_secs: 60 * DAY_SECS,
            ad_render_id_enabled: true,
            ad_render_id_max_length: 12,
            auction_server_request_flags_enabled: true,
            seller_configuration_enabled: true,
            frequency_cap_filtering_enabled: true,
            app_install_filtering_enabled: true,
        }
    }
}

/// Seconds to milliseconds without overflow.
pub(crate) fn secs_to_ms(secs: i64) -> i64 {
    secs.saturating_mul(1_000)
}
