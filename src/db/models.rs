use diesel::prelude::*;

use crate::db::schema::{
    channels, ffmpeg_profiles, media_items, media_libraries, playback_positions, playout_anchors,
    playout_items, playouts, schedule_items, schedules, watermarks,
};

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Channel {
    pub id: i32,
    pub channel_number: String,
    pub name: String,
    pub enabled: i32,
    pub playout_mode: String,
    pub ffmpeg_profile_id: Option<i32>,
    pub watermark_id: Option<i32>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schedules)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Schedule {
    pub id: i32,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schedule_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ScheduleItem {
    pub id: i32,
    pub schedule_id: i32,
    pub position: i32,
    pub collection_type: String,
    pub collection_ref: String,
    pub playback_mode: String,
    pub playback_mode_count: Option<i32>,
    pub playback_mode_duration_seconds: Option<i32>,
    pub playback_order: String,
    pub start_type: String,
    pub fixed_start_time: Option<String>,
    pub fixed_start_behavior: Option<String>,
    pub pre_roll_filler_id: Option<i32>,
    pub mid_roll_filler_id: Option<i32>,
    pub mid_roll_frequency_seconds: Option<i32>,
    pub post_roll_filler_id: Option<i32>,
    pub tail_filler_id: Option<i32>,
    pub fallback_filler_id: Option<i32>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = playout_anchors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PlayoutAnchorRow {
    pub id: i32,
    pub next_start: String,
    pub schedule_index: i32,
    pub collection_cursor: Option<String>,
    pub shuffle_epoch: i32,
}

#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = playout_anchors)]
pub struct PlayoutAnchorUpdate {
    pub next_start: String,
    pub schedule_index: i32,
    pub collection_cursor: Option<String>,
    pub shuffle_epoch: i32,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = playouts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Playout {
    pub id: i32,
    pub channel_id: i32,
    pub schedule_id: Option<i32>,
    pub anchor_id: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = playout_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PlayoutItemRow {
    pub id: i32,
    pub channel_id: i32,
    pub schedule_item_id: Option<i32>,
    pub media_item_id: Option<i32>,
    pub start_time: String,
    pub finish_time: String,
    pub title: String,
    pub filler_kind: Option<String>,
    pub created_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = playout_items)]
pub struct NewPlayoutItem {
    pub channel_id: i32,
    pub schedule_item_id: Option<i32>,
    pub media_item_id: Option<i32>,
    pub start_time: String,
    pub finish_time: String,
    pub title: String,
    pub filler_kind: Option<String>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(primary_key(channel_id))]
#[diesel(table_name = playback_positions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PlaybackPosition {
    pub channel_id: i32,
    pub item_index: i32,
    pub media_item_id: Option<i32>,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = media_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MediaItemRow {
    pub id: i32,
    pub media_library_id: Option<i32>,
    pub source: String,
    pub source_id: String,
    pub url: Option<String>,
    pub title: String,
    pub duration_seconds: Option<i32>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub show_title: Option<String>,
    pub genres: Option<String>,
    pub cast_members: Option<String>,
    pub air_date: Option<String>,
    pub rating: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = media_libraries)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MediaLibrary {
    pub id: i32,
    pub name: String,
    pub source: String,
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password_encrypted: Option<Vec<u8>>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = ffmpeg_profiles)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FfmpegProfile {
    pub id: i32,
    pub name: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub extra_args: Option<String>,
    pub hwaccel: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = watermarks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Watermark {
    pub id: i32,
    pub name: String,
    pub image_path: String,
    pub position: String,
    pub opacity: f64,
    pub horizontal_margin: i32,
    pub vertical_margin: i32,
    pub width_percent: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}
