//! HDHomeRun tuner emulation (SPEC_FULL.md §4.6): `/discover.json`,
//! `/lineup.json`, `/lineup_status.json`. Kept in the teacher's shape
//! (PascalCase serde structs, `hostname`-derived stable DeviceID,
//! `local-ip-address`-derived BaseURL) and re-pointed at the `channels`
//! table instead of the teacher's XMLTV/Xtream join.

use diesel::prelude::*;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::db::models::Channel;
use crate::db::schema::channels;
use crate::db::DbPooledConnection;

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
    #[serde(rename = "GuideURL")]
    pub guide_url: String,
    pub tuner_count: u32,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "HD")]
    pub hd: u8,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatusResponse {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

/// Stable across restarts: a hash of the hostname, not a random value.
pub fn generate_device_id(configured: Option<&str>) -> String {
    if let Some(id) = configured {
        return id.to_string();
    }
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "exstreamtv".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("EXSTREAMTV{:08X}", hasher.finish() as u32)
}

pub fn get_local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn generate_discover_response(
    base_url: &str,
    friendly_name: &str,
    device_id: &str,
    tuner_count: u32,
) -> DiscoverResponse {
    DiscoverResponse {
        friendly_name: friendly_name.to_string(),
        model_number: "HDHR5-4K".to_string(),
        firmware_name: "hdhomerun5_atsc".to_string(),
        firmware_version: "20200101".to_string(),
        device_id: device_id.to_string(),
        device_auth: "exstreamtv".to_string(),
        base_url: base_url.to_string(),
        lineup_url: format!("{base_url}/lineup.json"),
        guide_url: format!("{base_url}/hdhomerun/epg"),
        tuner_count,
    }
}

fn enabled_channels(conn: &mut DbPooledConnection) -> Result<Vec<Channel>, diesel::result::Error> {
    channels::table
        .filter(channels::enabled.eq(1))
        .order(channels::channel_number.asc())
        .load::<Channel>(conn)
}

/// SPEC_FULL.md §8 scenario 6: "if GuideName begins with the guide number,
/// that prefix is stripped to prevent double-display" — e.g. channel
/// `number="7"`, `name="7 News"` -> `GuideName="News"`. The EPG's
/// `<display-name>` entries are unaffected; they keep the numeric form.
fn strip_guide_number_prefix<'a>(number: &str, name: &'a str) -> &'a str {
    name.strip_prefix(number)
        .map(|rest| rest.trim_start())
        .filter(|rest| !rest.is_empty())
        .unwrap_or(name)
}

pub fn generate_lineup(
    conn: &mut DbPooledConnection,
    base_url: &str,
) -> Result<Vec<LineupEntry>, diesel::result::Error> {
    let rows = enabled_channels(conn)?;
    Ok(rows
        .into_iter()
        .map(|channel| LineupEntry {
            guide_name: strip_guide_number_prefix(&channel.channel_number, &channel.name).to_string(),
            url: format!("{base_url}/iptv/channel/{}.ts", channel.channel_number),
            guide_number: channel.channel_number,
            hd: 1,
        })
        .collect())
}

pub fn generate_lineup_status() -> LineupStatusResponse {
    LineupStatusResponse {
        scan_in_progress: 0,
        scan_possible: 0,
        source: "Cable".to_string(),
        source_list: vec!["Cable".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guide_number_prefix_is_stripped_when_present() {
        assert_eq!(strip_guide_number_prefix("7", "7 News"), "News");
    }

    #[test]
    fn guide_name_untouched_when_it_does_not_start_with_the_number() {
        assert_eq!(strip_guide_number_prefix("7", "ESPN HD"), "ESPN HD");
    }

    #[test]
    fn guide_name_untouched_when_stripping_would_leave_it_empty() {
        assert_eq!(strip_guide_number_prefix("7", "7"), "7");
    }

    #[test]
    fn device_id_honors_configured_override() {
        assert_eq!(generate_device_id(Some("FIXED123")), "FIXED123");
    }

    #[test]
    fn device_id_is_stable_across_calls() {
        assert_eq!(generate_device_id(None), generate_device_id(None));
    }

    #[test]
    fn discover_response_links_lineup_and_guide_urls_to_base() {
        let response = generate_discover_response("http://192.168.1.50:7777", "exstreamtv", "ABC123", 4);
        assert_eq!(response.lineup_url, "http://192.168.1.50:7777/lineup.json");
        assert_eq!(response.guide_url, "http://192.168.1.50:7777/hdhomerun/epg");
    }

    #[test]
    fn lineup_status_reports_no_scan_support() {
        let status = generate_lineup_status();
        assert_eq!(status.scan_possible, 0);
        assert_eq!(status.source_list, vec!["Cable"]);
    }
}
